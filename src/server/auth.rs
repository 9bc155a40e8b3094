//! Authorization state for one server connection: the token produced by a
//! bind, the state machine around it, and the bind handlers themselves.

use crate::error::LdapError;
use crate::message::{BindAuth, BindRequest, LdapMessage, ProtocolOp};
use crate::result_code::ResultCode;
use crate::server::handler::RequestHandler;
use crate::server::response;
use crate::session::ServerSession;
use async_trait::async_trait;

/// The identity a connection operates under. Created by a bind handler,
/// held for the connection's lifetime, replaced only by a later successful
/// bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Anonymous { username: String, version: u32 },
    Bound {
        username: String,
        password: String,
        version: u32,
    },
    Sasl {
        username: String,
        mechanism: String,
        version: u32,
    },
}

impl Token {
    pub fn anonymous() -> Self {
        Token::Anonymous {
            username: String::new(),
            version: 3,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Token::Anonymous { username, .. }
            | Token::Bound { username, .. }
            | Token::Sasl { username, .. } => username,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Token::Anonymous { .. })
    }
}

/// Unauthenticated → Authenticating → Authenticated. Authenticating is
/// transient: it collapses back to Unauthenticated when the bind fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

/// Gates requests on the connection's authorization state.
pub struct Authorizer {
    allow_anonymous: bool,
    require_authentication: bool,
    state: AuthState,
    token: Token,
}

impl Authorizer {
    pub fn new(allow_anonymous: bool, require_authentication: bool) -> Self {
        Self {
            allow_anonymous,
            require_authentication,
            state: AuthState::Unauthenticated,
            token: Token::anonymous(),
        }
    }

    pub fn is_authentication_request(op: &ProtocolOp) -> bool {
        matches!(op, ProtocolOp::BindRequest(_))
    }

    /// Whether this engine can route the requested authentication choice.
    /// Anonymous binds depend on configuration; only simple binds are
    /// dispatched beyond that.
    pub fn is_supported(&self, request: &BindRequest) -> bool {
        if request.is_anonymous() {
            return self.allow_anonymous;
        }
        matches!(request.auth, BindAuth::Simple(_))
    }

    /// Whether the request kind is gated behind authentication. Bind,
    /// unbind, abandon, StartTLS, WhoAmI and root DSE reads stay open.
    pub fn requires_authentication(&self, op: &ProtocolOp) -> bool {
        if !self.require_authentication {
            return false;
        }
        match op {
            ProtocolOp::BindRequest(_)
            | ProtocolOp::UnbindRequest
            | ProtocolOp::AbandonRequest(_) => false,
            ProtocolOp::ExtendedRequest(request) => {
                request.name != crate::message::OID_START_TLS
                    && request.name != crate::message::OID_WHOAMI
            }
            ProtocolOp::SearchRequest(request) => !request.is_root_dse(),
            _ => true,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn begin(&mut self) {
        self.state = AuthState::Authenticating;
    }

    /// Store the token a bind handler produced. An anonymous token leaves
    /// the connection unauthenticated.
    pub fn accept(&mut self, token: Token) {
        self.state = if token.is_authenticated() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };
        self.token = token;
    }

    pub fn fail(&mut self) {
        self.state = AuthState::Unauthenticated;
        self.token = Token::anonymous();
    }
}

/// Handles one bind variant and produces the connection token.
#[async_trait]
pub trait BindHandler: Send + Sync {
    async fn handle_bind(
        &self,
        message: &LdapMessage,
        request: &BindRequest,
        dispatcher: &dyn RequestHandler,
        session: &mut ServerSession,
    ) -> Result<Token, LdapError>;
}

/// Select the bind handler for a request variant.
pub fn bind_handler_for(request: &BindRequest) -> &'static dyn BindHandler {
    if request.is_anonymous() {
        &AnonBindHandler
    } else {
        &SimpleBindHandler
    }
}

fn validate_version(request: &BindRequest) -> Result<(), LdapError> {
    if request.version != 3 {
        return Err(LdapError::operation(
            ResultCode::ProtocolError,
            "Only LDAP version 3 is supported.",
        ));
    }
    Ok(())
}

/// Simple bind: credential check against the external dispatcher.
pub struct SimpleBindHandler;

#[async_trait]
impl BindHandler for SimpleBindHandler {
    async fn handle_bind(
        &self,
        message: &LdapMessage,
        request: &BindRequest,
        dispatcher: &dyn RequestHandler,
        session: &mut ServerSession,
    ) -> Result<Token, LdapError> {
        validate_version(request)?;
        let password = match &request.auth {
            BindAuth::Simple(password) => password.clone(),
            BindAuth::Sasl { .. } => {
                return Err(LdapError::operation(
                    ResultCode::AuthMethodNotSupported,
                    "The requested authentication type is not supported.",
                ))
            }
        };
        let username = request.name.as_str().to_string();
        // "0" is a legal username and password; only truly empty is not
        if username.is_empty() || password.is_empty() {
            return Err(LdapError::Bind(
                "the username and password must not be empty".into(),
            ));
        }
        if !dispatcher.bind(&username, &password).await? {
            return Err(LdapError::operation(
                ResultCode::InvalidCredentials,
                "Invalid credentials.",
            ));
        }
        session
            .send(&[response::standard_response(
                message,
                ResultCode::Success,
                "",
            )])
            .await?;
        Ok(Token::Bound {
            username,
            password,
            version: request.version,
        })
    }
}

/// Anonymous bind: always succeeds once the authorizer allowed it.
pub struct AnonBindHandler;

#[async_trait]
impl BindHandler for AnonBindHandler {
    async fn handle_bind(
        &self,
        message: &LdapMessage,
        request: &BindRequest,
        _dispatcher: &dyn RequestHandler,
        session: &mut ServerSession,
    ) -> Result<Token, LdapError> {
        validate_version(request)?;
        session
            .send(&[response::standard_response(
                message,
                ResultCode::Success,
                "",
            )])
            .await?;
        Ok(Token::Anonymous {
            username: request.name.as_str().to_string(),
            version: request.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BindRequest;

    #[test]
    fn anonymous_token_does_not_authenticate() {
        let mut authorizer = Authorizer::new(true, true);
        assert!(!authorizer.is_authenticated());
        authorizer.begin();
        authorizer.accept(Token::Anonymous {
            username: String::new(),
            version: 3,
        });
        assert!(!authorizer.is_authenticated());
        authorizer.begin();
        authorizer.accept(Token::Bound {
            username: "cn=admin".into(),
            password: "x".into(),
            version: 3,
        });
        assert!(authorizer.is_authenticated());
        authorizer.fail();
        assert!(!authorizer.is_authenticated());
    }

    #[test]
    fn anonymous_support_follows_configuration() {
        let closed = Authorizer::new(false, true);
        let open = Authorizer::new(true, true);
        let anon = BindRequest::anonymous();
        assert!(!closed.is_supported(&anon));
        assert!(open.is_supported(&anon));
        let sasl = BindRequest::sasl("EXTERNAL", None);
        assert!(!closed.is_supported(&sasl));
        assert!(!open.is_supported(&sasl));
        assert!(closed.is_supported(&BindRequest::simple("cn=a", "b")));
    }

    #[test]
    fn gate_exemptions() {
        use crate::filter::FilterNode;
        use crate::message::{ExtendedRequest, SearchRequest, SearchScope};

        let authorizer = Authorizer::new(false, true);
        assert!(!authorizer.requires_authentication(&ProtocolOp::UnbindRequest));
        assert!(!authorizer.requires_authentication(&ProtocolOp::ExtendedRequest(
            ExtendedRequest::start_tls()
        )));
        assert!(!authorizer.requires_authentication(&ProtocolOp::ExtendedRequest(
            ExtendedRequest::who_am_i()
        )));
        let root_dse = SearchRequest::new(FilterNode::present("objectClass"))
            .scope(SearchScope::BaseObject);
        assert!(!authorizer.requires_authentication(&ProtocolOp::SearchRequest(root_dse)));
        let subtree = SearchRequest::new(FilterNode::present("objectClass"))
            .base("dc=example,dc=com");
        assert!(authorizer.requires_authentication(&ProtocolOp::SearchRequest(subtree)));

        let relaxed = Authorizer::new(false, false);
        let subtree = SearchRequest::new(FilterNode::present("objectClass"))
            .base("dc=example,dc=com");
        assert!(!relaxed.requires_authentication(&ProtocolOp::SearchRequest(subtree)));
    }
}
