//! Simple paged search cursor (RFC 2696).

use crate::client::LdapClient;
use crate::controls::{Control, ControlValue, Controls, PagingValue, OID_PAGING};
use crate::entry::Entries;
use crate::error::LdapError;
use crate::message::SearchRequest;
use std::time::Instant;
use tracing::debug;

/// Pages a search operation: each advance re-sends the search with the
/// stored cookie and requested size, then stores the control the server
/// returned.
pub struct Paging<'a> {
    client: &'a mut LdapClient,
    search: SearchRequest,
    size: u32,
    is_critical: bool,
    control: Option<PagingValue>,
    ended: bool,
    created_at: Instant,
    last_processed: Option<Instant>,
}

impl<'a> Paging<'a> {
    pub fn new(client: &'a mut LdapClient, search: SearchRequest, size: u32) -> Self {
        Self {
            client,
            search,
            size,
            is_critical: false,
            control: None,
            ended: false,
            created_at: Instant::now(),
            last_processed: None,
        }
    }

    /// Mark the paging control critical: the server must fail the search if
    /// it cannot page.
    pub fn critical(mut self, is_critical: bool) -> Self {
        self.is_critical = is_critical;
        self
    }

    /// Start over with a new search. Resets the cookie state; call this
    /// first when reusing the cursor.
    pub fn start(&mut self, search: SearchRequest, size: Option<u32>) {
        if let Some(size) = size {
            self.size = size;
        }
        self.search = search;
        self.control = None;
        self.ended = false;
        self.created_at = Instant::now();
        self.last_processed = None;
    }

    /// End the paging operation. Can be triggered at any time; tells the
    /// server to discard its paging state by sending size zero.
    pub async fn end(&mut self) -> Result<(), LdapError> {
        self.send(Some(0)).await?;
        self.ended = true;
        Ok(())
    }

    /// The next page of results.
    pub async fn get_entries(&mut self, size: Option<u32>) -> Result<Entries, LdapError> {
        self.send(size).await
    }

    pub fn has_entries(&self) -> bool {
        if self.ended {
            return false;
        }
        match &self.control {
            None => true,
            Some(control) => !control.cookie.is_empty(),
        }
    }

    /// The server's estimate of the full result size, once a response has
    /// been seen. Servers that cannot estimate report zero.
    pub fn size_estimate(&self) -> Option<u32> {
        self.control.as_ref().map(|control| control.size)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_processed(&self) -> Option<Instant> {
        self.last_processed
    }

    async fn send(&mut self, size: Option<u32>) -> Result<Entries, LdapError> {
        let size = size.unwrap_or(self.size);
        let cookie = self
            .control
            .as_ref()
            .map(|control| control.cookie.clone())
            .unwrap_or_default();
        let request_control = Control::paging(size, cookie).with_criticality(self.is_critical);
        let outcome = self
            .client
            .search_with_controls(self.search.clone(), Controls::from_vec(vec![request_control]))
            .await?;
        if !outcome.result.is_success() {
            return Err(LdapError::Operation {
                code: outcome.result.code,
                message: outcome.result.diagnostics,
                referrals: outcome.result.referrals,
            });
        }

        let control = match outcome.controls.get(OID_PAGING) {
            Some(control) => match &control.value {
                ControlValue::Paging(value) => Some(value.clone()),
                _ => {
                    return Err(LdapError::Protocol(
                        "expected a paging control in the search response".into(),
                    ))
                }
            },
            None => None,
        };
        // OpenLDAP omits the response control after an abandoned paging
        // request while Active Directory returns one; the paging RFC does
        // not settle which is correct, so both branches stay.
        if control.is_none() && size != 0 && self.is_critical {
            return Err(LdapError::Protocol(
                "expected a paging control, but received none".into(),
            ));
        }
        if control.is_none() && size != 0 && !self.is_critical {
            debug!("the server ignored the non-critical paging control");
            self.ended = true;
        }
        self.control = control;
        self.last_processed = Some(Instant::now());
        Ok(outcome.entries)
    }
}
