//! The LDAP message envelope and its protocol operations.
//!
//! LDAPMessage ::= SEQUENCE {
//!     messageID  MessageID,
//!     protocolOp CHOICE { ... },
//!     controls   [0] Controls OPTIONAL }

use crate::controls::Controls;
use crate::dn::Dn;
use crate::entry::{Attribute, Change, Changes, Entry};
use crate::filter::FilterNode;
use crate::result_code::ResultCode;

/// StartTLS extended operation (RFC 4511).
pub const OID_START_TLS: &str = "1.3.6.1.4.1.1466.20037";
/// Notice of Disconnection unsolicited notification (RFC 4511, 4.4.1).
pub const OID_NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";
/// WhoAmI extended operation (RFC 4532).
pub const OID_WHOAMI: &str = "1.3.6.1.4.1.4203.1.11.3";

/// One message on the wire: id, operation and control set. Owned by the
/// session that produced or received it; immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub id: u32,
    pub op: ProtocolOp,
    pub controls: Controls,
}

impl LdapMessage {
    pub fn new(id: u32, op: ProtocolOp) -> Self {
        Self {
            id,
            op,
            controls: Controls::new(),
        }
    }

    pub fn with_controls(id: u32, op: ProtocolOp, controls: Controls) -> Self {
        Self { id, op, controls }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DeleteRequest(DeleteRequest),
    DeleteResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(u32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ProtocolOp::BindRequest(_)
                | ProtocolOp::UnbindRequest
                | ProtocolOp::SearchRequest(_)
                | ProtocolOp::ModifyRequest(_)
                | ProtocolOp::AddRequest(_)
                | ProtocolOp::DeleteRequest(_)
                | ProtocolOp::ModifyDnRequest(_)
                | ProtocolOp::CompareRequest(_)
                | ProtocolOp::AbandonRequest(_)
                | ProtocolOp::ExtendedRequest(_)
        )
    }

    /// The terminal result carried by a response operation, if any.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r) => Some(&r.result),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DeleteResponse(r)
            | ProtocolOp::ModifyDnResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            _ => None,
        }
    }
}

/// The LDAPResult fields shared by every terminal response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub diagnostics: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            diagnostics: String::new(),
            referrals: Vec::new(),
        }
    }

    pub fn with_diagnostics(code: ResultCode, diagnostics: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            diagnostics: diagnostics.into(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success)
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: u32,
    pub name: Dn,
    pub auth: BindAuth,
}

impl BindRequest {
    pub fn simple(name: impl Into<Dn>, password: impl Into<String>) -> Self {
        Self {
            version: 3,
            name: name.into(),
            auth: BindAuth::Simple(password.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            version: 3,
            name: Dn::root_dse(),
            auth: BindAuth::Simple(String::new()),
        }
    }

    pub fn sasl(mechanism: impl Into<String>, credentials: Option<Vec<u8>>) -> Self {
        Self {
            version: 3,
            name: Dn::root_dse(),
            auth: BindAuth::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }

    /// A simple bind with an empty password is an anonymous bind
    /// (RFC 4513, 5.1.2).
    pub fn is_anonymous(&self) -> bool {
        matches!(&self.auth, BindAuth::Simple(password) if password.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuth {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

impl BindResponse {
    pub fn new(result: LdapResult) -> Self {
        Self {
            result,
            server_sasl_creds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    #[default]
    WholeSubtree,
}

impl SearchScope {
    pub fn code(&self) -> i64 {
        match self {
            SearchScope::BaseObject => 0,
            SearchScope::SingleLevel => 1,
            SearchScope::WholeSubtree => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SearchScope::BaseObject),
            1 => Some(SearchScope::SingleLevel),
            2 => Some(SearchScope::WholeSubtree),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    #[default]
    Never,
    InSearching,
    FindingBaseObj,
    Always,
}

impl DerefAliases {
    pub fn code(&self) -> i64 {
        match self {
            DerefAliases::Never => 0,
            DerefAliases::InSearching => 1,
            DerefAliases::FindingBaseObj => 2,
            DerefAliases::Always => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DerefAliases::Never),
            1 => Some(DerefAliases::InSearching),
            2 => Some(DerefAliases::FindingBaseObj),
            3 => Some(DerefAliases::Always),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: Dn,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: FilterNode,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(filter: FilterNode) -> Self {
        Self {
            base: Dn::root_dse(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }

    pub fn base(mut self, base: impl Into<Dn>) -> Self {
        self.base = base.into();
        self
    }

    pub fn scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn attributes<S: Into<String>>(mut self, attributes: impl IntoIterator<Item = S>) -> Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn size_limit(mut self, limit: u32) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn types_only(mut self, types_only: bool) -> Self {
        self.types_only = types_only;
        self
    }

    /// A base-scope search against the empty DN reads the root DSE.
    pub fn is_root_dse(&self) -> bool {
        self.base.is_root_dse() && self.scope == SearchScope::BaseObject
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub dn: Dn,
    pub attributes: Vec<Attribute>,
}

impl SearchResultEntry {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            dn: entry.dn().clone(),
            attributes: entry.attributes().to_vec(),
        }
    }

    pub fn into_entry(self) -> Entry {
        Entry::new(self.dn, self.attributes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Add,
    Delete,
    Replace,
}

impl ChangeType {
    pub fn code(&self) -> i64 {
        match self {
            ChangeType::Add => 0,
            ChangeType::Delete => 1,
            ChangeType::Replace => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ChangeType::Add),
            1 => Some(ChangeType::Delete),
            2 => Some(ChangeType::Replace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub change_type: ChangeType,
    pub attribute: Attribute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: Dn,
    pub changes: Vec<ModifyChange>,
}

impl ModifyRequest {
    /// Build a modify request from an entry's accumulated change log.
    pub fn from_changes(dn: impl Into<Dn>, changes: Changes) -> Self {
        Self {
            dn: dn.into(),
            changes: changes
                .into_vec()
                .into_iter()
                .map(|change| match change {
                    Change::Add(attribute) => ModifyChange {
                        change_type: ChangeType::Add,
                        attribute,
                    },
                    Change::Delete(attribute) => ModifyChange {
                        change_type: ChangeType::Delete,
                        attribute,
                    },
                    Change::Replace(attribute) => ModifyChange {
                        change_type: ChangeType::Replace,
                        attribute,
                    },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub dn: Dn,
    pub attributes: Vec<Attribute>,
}

impl AddRequest {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            dn: entry.dn().clone(),
            attributes: entry.attributes().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub dn: Dn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: Dn,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<Dn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: Dn,
    pub attribute: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

impl ExtendedRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn start_tls() -> Self {
        Self::new(OID_START_TLS)
    }

    pub fn who_am_i() -> Self {
        Self::new(OID_WHOAMI)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub fn new(result: LdapResult) -> Self {
        Self {
            result,
            name: None,
            value: None,
        }
    }

    pub fn is_notice_of_disconnection(&self) -> bool {
        self.name.as_deref() == Some(OID_NOTICE_OF_DISCONNECTION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_bind_with_empty_password_is_anonymous() {
        assert!(BindRequest::anonymous().is_anonymous());
        assert!(BindRequest::simple("cn=x", "").is_anonymous());
        assert!(!BindRequest::simple("cn=x", "secret").is_anonymous());
        assert!(!BindRequest::sasl("EXTERNAL", None).is_anonymous());
    }

    #[test]
    fn root_dse_detection() {
        let request = SearchRequest::new(FilterNode::present("objectClass"))
            .scope(SearchScope::BaseObject);
        assert!(request.is_root_dse());
        let request = SearchRequest::new(FilterNode::present("objectClass"))
            .base("dc=example,dc=com")
            .scope(SearchScope::BaseObject);
        assert!(!request.is_root_dse());
    }

    #[test]
    fn modify_request_from_change_log() {
        let mut entry = Entry::from_attributes("cn=x,dc=y", [("cn", vec!["x"])]);
        entry.set("mail", ["x@y"]);
        entry.delete("phone", Vec::<String>::new());
        let request = ModifyRequest::from_changes(entry.dn().clone(), entry.take_changes());
        assert_eq!(request.changes.len(), 2);
        assert_eq!(request.changes[0].change_type, ChangeType::Replace);
        assert_eq!(request.changes[1].change_type, ChangeType::Delete);
    }
}
