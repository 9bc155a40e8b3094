//! Active Directory DirSync change-polling cursor.

use crate::client::LdapClient;
use crate::controls::dirsync::{
    DIR_SYNC_ANCESTORS_FIRST_ORDER, DIR_SYNC_INCREMENTAL_VALUES, DIR_SYNC_OBJECT_SECURITY,
};
use crate::controls::{Control, ControlValue, Controls, DirSyncResponseValue, OID_DIR_SYNC};
use crate::dn::Dn;
use crate::entry::Entries;
use crate::error::LdapError;
use crate::filter::FilterNode;
use crate::message::{SearchRequest, SearchScope};
use crate::result_code::ResultCode;
use tracing::debug;

/// Polls a directory for changes with the DirSync control. Each advance
/// re-sends the search with the stored cookie and updates the cookie and
/// more-data flag from the response control.
///
/// The search base defaults to the server's `defaultNamingContext`, resolved
/// from the root DSE once on first use and cached for the cursor's lifetime.
pub struct DirSync<'a> {
    client: &'a mut LdapClient,
    naming_context: Option<Dn>,
    filter: FilterNode,
    attributes: Vec<String>,
    flags: i64,
    max_bytes: i64,
    cookie: Vec<u8>,
    response: Option<DirSyncResponseValue>,
}

impl<'a> DirSync<'a> {
    pub fn new(client: &'a mut LdapClient) -> Self {
        Self {
            client,
            naming_context: None,
            filter: FilterNode::present("objectClass"),
            attributes: Vec::new(),
            flags: DIR_SYNC_INCREMENTAL_VALUES,
            max_bytes: 0,
            cookie: Vec::new(),
            response: None,
        }
    }

    /// Search under this naming context instead of resolving the server's
    /// default one.
    pub fn use_naming_context(&mut self, naming_context: impl Into<Dn>) -> &mut Self {
        self.naming_context = Some(naming_context.into());
        self
    }

    /// Narrow the synchronized set with a filter. Defaults to
    /// `(objectClass=*)`.
    pub fn use_filter(&mut self, filter: FilterNode) -> &mut Self {
        self.filter = filter;
        self
    }

    /// The attributes to return for changed entries.
    pub fn select_attributes<S: Into<String>>(
        &mut self,
        attributes: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Resume from a cookie saved by an earlier cursor.
    pub fn use_cookie(&mut self, cookie: impl Into<Vec<u8>>) -> &mut Self {
        self.cookie = cookie.into();
        self
    }

    /// The cookie to persist for resuming later. Empty until the first
    /// response arrives.
    pub fn get_cookie(&self) -> &[u8] {
        &self.cookie
    }

    /// Only receive changed values of multi-valued attributes. On by default.
    pub fn use_incremental_values(&mut self, enabled: bool) -> &mut Self {
        self.toggle(DIR_SYNC_INCREMENTAL_VALUES, enabled)
    }

    /// Only receive objects and attributes the bound identity has rights to.
    pub fn use_object_security(&mut self, enabled: bool) -> &mut Self {
        self.toggle(DIR_SYNC_OBJECT_SECURITY, enabled)
    }

    /// Receive parent objects before their children.
    pub fn use_ancestor_first_order(&mut self, enabled: bool) -> &mut Self {
        self.toggle(DIR_SYNC_ANCESTORS_FIRST_ORDER, enabled)
    }

    /// Cap the size of one change batch; zero leaves it to the server.
    pub fn max_bytes(&mut self, max_bytes: i64) -> &mut Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Whether the server holds further changes for the stored cookie.
    /// False until the first `get_changes` call has seen a response.
    pub fn has_changes(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|response| response.more_results)
    }

    /// The next batch of changed entries.
    pub async fn get_changes(&mut self) -> Result<Entries, LdapError> {
        let base = self.naming_context().await?;
        let request = SearchRequest::new(self.filter.clone())
            .base(base)
            .scope(SearchScope::WholeSubtree)
            .attributes(self.attributes.clone());
        let control =
            Control::dir_sync(self.flags, self.max_bytes, self.cookie.clone()).critical();
        let outcome = self
            .client
            .search_with_controls(request, Controls::from_vec(vec![control]))
            .await?;
        if !outcome.result.is_success() {
            return Err(LdapError::Operation {
                code: outcome.result.code,
                message: outcome.result.diagnostics,
                referrals: outcome.result.referrals,
            });
        }
        let response = match outcome.controls.get(OID_DIR_SYNC).map(|c| &c.value) {
            Some(ControlValue::DirSyncResponse(value)) => value.clone(),
            Some(_) => {
                return Err(LdapError::Protocol(
                    "expected a DirSync response control".into(),
                ))
            }
            None => {
                return Err(LdapError::Protocol(
                    "the server returned no DirSync response control".into(),
                ))
            }
        };
        self.cookie = response.cookie.clone();
        self.response = Some(response);
        Ok(outcome.entries)
    }

    fn toggle(&mut self, flag: i64, enabled: bool) -> &mut Self {
        if enabled {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
        self
    }

    /// The caller-supplied naming context, or the server's default one,
    /// read from the root DSE once and cached.
    async fn naming_context(&mut self) -> Result<Dn, LdapError> {
        if let Some(context) = &self.naming_context {
            return Ok(context.clone());
        }
        debug!("resolving the default naming context from the root DSE");
        let root_dse = self
            .client
            .read_or_fail(Dn::root_dse(), vec!["defaultNamingContext".into()])
            .await?;
        let context = root_dse
            .get("defaultNamingContext")
            .and_then(|attribute| attribute.first_value())
            .map(|value| Dn::new(String::from_utf8_lossy(value).into_owned()))
            .ok_or_else(|| {
                LdapError::operation(
                    ResultCode::NoSuchAttribute,
                    "The root DSE advertises no default naming context.",
                )
            })?;
        self.naming_context = Some(context.clone());
        Ok(context)
    }
}
