//! Server-side request router: per-connection loop, message-id validation,
//! authorization gating and dispatch to the operation handlers.

pub mod auth;
pub mod handler;
pub mod response;
mod rootdse;

use crate::controls::{ControlRegistry, Controls};
use crate::error::LdapError;
use crate::message::{LdapMessage, ProtocolOp, OID_WHOAMI};
use crate::result_code::ResultCode;
use crate::session::ServerSession;
use auth::{bind_handler_for, Authorizer, Token};
use handler::{RequestContext, RequestHandler, RootDseHandler};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Read-only startup configuration for one listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Accept anonymous binds.
    pub allow_anonymous: bool,
    /// Gate non-exempt requests behind a successful bind.
    pub require_authentication: bool,
    /// Naming contexts advertised by the root DSE.
    pub naming_contexts: Vec<String>,
    pub vendor_name: String,
    pub vendor_version: Option<String>,
    /// Advertised as altServer on the root DSE.
    pub alt_server: Option<String>,
    /// Advertise the StartTLS extension.
    pub supports_start_tls: bool,
    /// Advertise the paging control.
    pub supports_paging: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            allow_anonymous: false,
            require_authentication: true,
            naming_contexts: vec!["dc=example,dc=com".to_string()],
            vendor_name: "ldapkit".to_string(),
            vendor_version: None,
            alt_server: None,
            supports_start_tls: false,
            supports_paging: false,
        }
    }
}

/// Routes one connection's requests. Owns the session, the authorization
/// state and the set of message ids the connection has used.
pub struct ServerRouter {
    session: ServerSession,
    options: ServerOptions,
    handler: Arc<dyn RequestHandler>,
    root_dse_handler: Option<Arc<dyn RootDseHandler>>,
    registry: ControlRegistry,
    authorizer: Authorizer,
    seen_ids: HashSet<u32>,
}

impl ServerRouter {
    pub fn new(
        session: ServerSession,
        options: ServerOptions,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let authorizer = Authorizer::new(options.allow_anonymous, options.require_authentication);
        Self {
            session,
            options,
            handler,
            root_dse_handler: None,
            registry: ControlRegistry::standard(),
            authorizer,
            seen_ids: HashSet::new(),
        }
    }

    pub fn with_root_dse_handler(mut self, handler: Arc<dyn RootDseHandler>) -> Self {
        self.root_dse_handler = Some(handler);
        self
    }

    pub fn with_registry(mut self, registry: ControlRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn token(&self) -> &Token {
        self.authorizer.token()
    }

    /// Run the connection until the client leaves, the transport fails, or
    /// a protocol violation forces a disconnect.
    pub async fn handle(&mut self) -> Result<(), LdapError> {
        loop {
            let message = match self.session.next_request().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("client closed the connection");
                    break;
                }
                // Per RFC 4511, 4.1.1: an unparseable PDU gets a notice of
                // disconnection with protocolError, then the connection ends.
                Err(LdapError::Protocol(reason)) => {
                    error!(%reason, "malformed request, terminating the connection");
                    self.disconnect_with_notice(
                        ResultCode::ProtocolError,
                        "The message encoding is malformed.",
                    )
                    .await;
                    return Ok(());
                }
                Err(error) => {
                    info!(%error, "ending the client connection");
                    break;
                }
            };

            match self.dispatch(&message).await {
                Ok(()) => {
                    if !self.session.is_connected() {
                        break;
                    }
                }
                // Per-message failures: answer on the request's id, keep going.
                Err(
                    error @ (LdapError::Operation { .. } | LdapError::Bind(_)),
                ) => {
                    let code = error.result_code();
                    let diagnostics = match &error {
                        LdapError::Operation { message, .. } => message.clone(),
                        other => other.to_string(),
                    };
                    if self
                        .session
                        .send(&[response::standard_response(&message, code, &diagnostics)])
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(LdapError::Connection(reason)) => {
                    info!(%reason, "connection lost while handling a request");
                    break;
                }
                // Anything else is an internal invariant violation.
                Err(error) => {
                    error!(%error, "unexpected failure, terminating the connection");
                    self.disconnect_with_notice(ResultCode::ProtocolError, "").await;
                    return Ok(());
                }
            }
        }
        if self.session.is_connected() {
            self.session.close().await;
        }
        Ok(())
    }

    /// End the connection because the hosting process is going away.
    pub async fn shutdown(&mut self) {
        self.disconnect_with_notice(ResultCode::Unavailable, "The server is shutting down.")
            .await;
    }

    async fn disconnect_with_notice(&mut self, code: ResultCode, diagnostics: &str) {
        if self.session.is_connected() {
            let _ = self
                .session
                .send(&[response::notice_of_disconnection(code, diagnostics)])
                .await;
            self.session.close().await;
        }
    }

    async fn dispatch(&mut self, message: &LdapMessage) -> Result<(), LdapError> {
        if !self.validate_message_id(message).await? {
            return Ok(());
        }
        self.seen_ids.insert(message.id);

        let controls = self.promote_controls(&message.controls)?;

        if Authorizer::is_authentication_request(&message.op) {
            let request = match &message.op {
                ProtocolOp::BindRequest(request) => request,
                _ => unreachable!("is_authentication_request matched a bind"),
            };
            self.authorizer.begin();
            if !self.authorizer.is_supported(request) {
                self.authorizer.fail();
                return Err(LdapError::operation(
                    ResultCode::AuthMethodNotSupported,
                    "The requested authentication type is not supported.",
                ));
            }
            let outcome = bind_handler_for(request)
                .handle_bind(message, request, self.handler.as_ref(), &mut self.session)
                .await;
            return match outcome {
                Ok(token) => {
                    debug!(username = token.username(), "bind accepted");
                    self.authorizer.accept(token);
                    Ok(())
                }
                Err(error) => {
                    self.authorizer.fail();
                    Err(error)
                }
            };
        }

        self.route(message, controls).await
    }

    /// Message id 0 and ids reused within the connection's lifetime are
    /// answered with a protocol error; the connection stays open.
    async fn validate_message_id(&mut self, message: &LdapMessage) -> Result<bool, LdapError> {
        if message.id == 0 {
            warn!("rejecting message id 0");
            self.session
                .send(&[response::extended_error(
                    ResultCode::ProtocolError,
                    "The message ID 0 cannot be used in a client request.",
                    None,
                )])
                .await?;
            return Ok(false);
        }
        if self.seen_ids.contains(&message.id) {
            warn!(id = message.id, "rejecting reused message id");
            self.session
                .send(&[response::extended_error(
                    ResultCode::ProtocolError,
                    &format!("The message ID {} is not valid.", message.id),
                    None,
                )])
                .await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Promote the request's controls. An unknown critical control is
    /// answered per-message (unavailableCriticalExtension); a registered
    /// control that fails to decode is a hard protocol error.
    fn promote_controls(&self, controls: &Controls) -> Result<Controls, LdapError> {
        let mut promoted = Controls::new();
        for control in controls.iter() {
            match self.registry.promote(control.clone()) {
                Ok(control) => promoted.push(control),
                Err(error) => {
                    if self.registry.is_registered(&control.oid) {
                        return Err(error);
                    }
                    return Err(LdapError::operation(
                        ResultCode::UnavailableCriticalExtension,
                        format!("The control {} is not supported.", control.oid),
                    ));
                }
            }
        }
        Ok(promoted)
    }

    async fn route(&mut self, message: &LdapMessage, controls: Controls) -> Result<(), LdapError> {
        match &message.op {
            ProtocolOp::UnbindRequest => {
                debug!("unbind, closing the connection");
                self.session.close().await;
                return Ok(());
            }
            // no response, per RFC 4511
            ProtocolOp::AbandonRequest(abandoned) => {
                debug!(abandoned = *abandoned, "abandon request ignored");
                return Ok(());
            }
            _ => {}
        }

        if self.authorizer.requires_authentication(&message.op)
            && !self.authorizer.is_authenticated()
        {
            debug!(id = message.id, "rejecting unauthenticated request");
            self.session
                .send(&[response::standard_response(
                    message,
                    ResultCode::InsufficientAccessRights,
                    "Authentication required.",
                )])
                .await?;
            return Ok(());
        }

        let context = RequestContext {
            controls,
            token: self.authorizer.token().clone(),
        };

        match &message.op {
            ProtocolOp::SearchRequest(request) if request.is_root_dse() => {
                rootdse::handle_request(
                    message,
                    request,
                    &context,
                    &self.options,
                    self.root_dse_handler.as_deref(),
                    &mut self.session,
                )
                .await
            }
            ProtocolOp::SearchRequest(request) => {
                let result = self.handler.search(&context, request).await?;
                let mut responses: Vec<LdapMessage> = result
                    .entries()
                    .iter()
                    .map(|entry| {
                        LdapMessage::new(
                            message.id,
                            ProtocolOp::SearchResultEntry(
                                crate::message::SearchResultEntry::from_entry(entry),
                            ),
                        )
                    })
                    .collect();
                let mut done = crate::message::LdapResult::with_diagnostics(
                    result.result_code(),
                    result.diagnostics(),
                );
                done.matched_dn = result.base_dn().to_string();
                responses.push(LdapMessage::new(
                    message.id,
                    ProtocolOp::SearchResultDone(done),
                ));
                self.session.send(&responses).await
            }
            ProtocolOp::AddRequest(request) => {
                self.handler.add(&context, request).await?;
                self.respond_success(message).await
            }
            ProtocolOp::DeleteRequest(request) => {
                self.handler.delete(&context, request).await?;
                self.respond_success(message).await
            }
            ProtocolOp::ModifyRequest(request) => {
                self.handler.modify(&context, request).await?;
                self.respond_success(message).await
            }
            ProtocolOp::ModifyDnRequest(request) => {
                self.handler.modify_dn(&context, request).await?;
                self.respond_success(message).await
            }
            ProtocolOp::CompareRequest(request) => {
                let matched = self.handler.compare(&context, request).await?;
                let code = if matched {
                    ResultCode::CompareTrue
                } else {
                    ResultCode::CompareFalse
                };
                self.session
                    .send(&[response::standard_response(message, code, "")])
                    .await
            }
            ProtocolOp::ExtendedRequest(request) if request.name == OID_WHOAMI => {
                let authzid = match self.authorizer.token() {
                    Token::Anonymous { .. } => String::new(),
                    Token::Bound { username, .. } => format!("dn:{username}"),
                    Token::Sasl { username, .. } => format!("u:{username}"),
                };
                let mut response = response::standard_response(message, ResultCode::Success, "");
                if let ProtocolOp::ExtendedResponse(extended) = &mut response.op {
                    extended.value = Some(authzid.into_bytes());
                }
                self.session.send(&[response]).await
            }
            ProtocolOp::ExtendedRequest(request) => {
                let value = self.handler.extended(&context, request).await?;
                let mut response = response::standard_response(message, ResultCode::Success, "");
                if let ProtocolOp::ExtendedResponse(extended) = &mut response.op {
                    extended.name = Some(request.name.clone());
                    extended.value = value;
                }
                self.session.send(&[response]).await
            }
            // a client must not send response kinds
            _ => Err(LdapError::operation(
                ResultCode::ProtocolError,
                "The request kind cannot be routed.",
            )),
        }
    }

    async fn respond_success(&mut self, message: &LdapMessage) -> Result<(), LdapError> {
        self.session
            .send(&[response::standard_response(
                message,
                ResultCode::Success,
                "",
            )])
            .await
    }
}
