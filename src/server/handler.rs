//! The seams an embedding server implements: the request dispatcher and the
//! optional root-DSE collaborator.

use crate::controls::Controls;
use crate::dn::Dn;
use crate::entry::{Entries, Entry};
use crate::error::LdapError;
use crate::message::{
    AddRequest, CompareRequest, DeleteRequest, ExtendedRequest, ModifyDnRequest, ModifyRequest,
    SearchRequest,
};
use crate::result_code::ResultCode;
use crate::server::auth::Token;
use async_trait::async_trait;

/// What a handler learns about the request besides its operation: the
/// promoted control set and the connection's token.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub controls: Controls,
    pub token: Token,
}

/// A server-side search result: the entries plus the terminal code.
#[derive(Debug, Clone)]
pub struct SearchResult {
    entries: Entries,
    base_dn: Dn,
    result_code: ResultCode,
    diagnostics: String,
}

impl SearchResult {
    pub fn success(entries: Entries) -> Self {
        Self {
            entries,
            base_dn: Dn::root_dse(),
            result_code: ResultCode::Success,
            diagnostics: String::new(),
        }
    }

    /// An error result, such as a base DN that does not exist. The result
    /// code must not be a success code.
    pub fn error(result_code: ResultCode, diagnostics: impl Into<String>) -> Self {
        debug_assert!(
            !result_code.is_success(),
            "a search error must not carry a success result code"
        );
        Self {
            entries: Entries::default(),
            base_dn: Dn::root_dse(),
            result_code,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn with_base_dn(mut self, base_dn: impl Into<Dn>) -> Self {
        self.base_dn = base_dn.into();
        self
    }

    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    pub fn into_entries(self) -> Entries {
        self.entries
    }

    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    pub fn result_code(&self) -> ResultCode {
        self.result_code
    }

    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }
}

fn unwilling(operation: &str) -> LdapError {
    LdapError::operation(
        ResultCode::UnwillingToPerform,
        format!("The {operation} operation is not supported."),
    )
}

/// The external dispatcher a router hands requests to. Every method has a
/// refusing default, so an implementation only overrides what its directory
/// supports. Returned operation errors become per-message error responses;
/// the connection stays up.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Credential check for simple binds.
    async fn bind(&self, _username: &str, _password: &str) -> Result<bool, LdapError> {
        Ok(false)
    }

    async fn search(
        &self,
        _context: &RequestContext,
        _request: &SearchRequest,
    ) -> Result<SearchResult, LdapError> {
        Err(unwilling("search"))
    }

    async fn add(&self, _context: &RequestContext, _request: &AddRequest) -> Result<(), LdapError> {
        Err(unwilling("add"))
    }

    async fn delete(
        &self,
        _context: &RequestContext,
        _request: &DeleteRequest,
    ) -> Result<(), LdapError> {
        Err(unwilling("delete"))
    }

    async fn modify(
        &self,
        _context: &RequestContext,
        _request: &ModifyRequest,
    ) -> Result<(), LdapError> {
        Err(unwilling("modify"))
    }

    async fn modify_dn(
        &self,
        _context: &RequestContext,
        _request: &ModifyDnRequest,
    ) -> Result<(), LdapError> {
        Err(unwilling("modify DN"))
    }

    async fn compare(
        &self,
        _context: &RequestContext,
        _request: &CompareRequest,
    ) -> Result<bool, LdapError> {
        Err(unwilling("compare"))
    }

    /// Extended operations the engine does not answer itself (StartTLS and
    /// WhoAmI are handled before this is consulted). Returns the response
    /// value, if any.
    async fn extended(
        &self,
        _context: &RequestContext,
        request: &ExtendedRequest,
    ) -> Result<Option<Vec<u8>>, LdapError> {
        Err(LdapError::operation(
            ResultCode::ProtocolError,
            format!("The extended operation {} is not supported.", request.name),
        ))
    }
}

/// Post-processes the synthesized root DSE before it is sent, e.g. to add
/// deployment-specific attributes.
pub trait RootDseHandler: Send + Sync {
    fn root_dse(&self, context: &RequestContext, request: &SearchRequest, entry: Entry) -> Entry;
}
