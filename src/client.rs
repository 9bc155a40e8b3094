//! Client dispatch pipeline: a response strategy per request kind, resolved
//! from a static table, plus the convenience operations built on it.

use crate::controls::Controls;
use crate::dn::Dn;
use crate::entry::{Entries, Entry};
use crate::error::LdapError;
use crate::message::*;
use crate::result_code::ResultCode;
use crate::session::ClientSession;
use crate::controls::ControlRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Client behavior knobs, built once and passed by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Default search base applied when a non-base search has none.
    pub base_dn: Option<Dn>,
    /// Chase referral results instead of surfacing them.
    pub follow_referrals: bool,
    /// Maximum referral hops before the chase gives up.
    pub referral_limit: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_dn: None,
            follow_referrals: false,
            referral_limit: 10,
        }
    }
}

/// Opens a connection to a referral target URL and returns a bound client
/// for it. Transport setup stays outside the engine.
#[async_trait]
pub trait ReferralConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<LdapClient, LdapError>;
}

/// Per-URL veto for referral chasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferralChoice {
    Follow,
    Skip,
}

pub type ReferralChooser = dyn Fn(&str) -> ReferralChoice + Send + Sync;

/// A pluggable SASL mechanism: produces the next client response from the
/// previous server challenge. Cryptography stays outside the engine.
pub trait SaslMechanism: Send {
    fn name(&self) -> &str;
    /// The next response to send, or None when the round needs no payload.
    fn respond(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, LdapError>;
    fn is_complete(&self) -> bool;
}

/// One streamed element of a search in progress.
pub enum SearchEvent<'a> {
    Entry(&'a Entry, &'a Controls),
    Reference(&'a [String]),
    Intermediate(&'a IntermediateResponse),
}

/// Everything a finished search produced. The terminal result code is
/// reported here rather than raised, so a partial result stays usable.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub entries: Entries,
    pub references: Vec<Vec<String>>,
    pub intermediates: Vec<IntermediateResponse>,
    pub result: LdapResult,
    /// Controls from the terminal SearchResultDone, already promoted.
    pub controls: Controls,
}

/// Response-handling strategy, keyed by request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Basic,
    Search,
    StartTls,
    OneWay,
}

fn strategy_for(op: &ProtocolOp) -> Strategy {
    match op {
        ProtocolOp::SearchRequest(_) => Strategy::Search,
        ProtocolOp::ExtendedRequest(request) if request.name == OID_START_TLS => {
            Strategy::StartTls
        }
        ProtocolOp::UnbindRequest | ProtocolOp::AbandonRequest(_) => Strategy::OneWay,
        _ => Strategy::Basic,
    }
}

enum Outcome {
    Message(LdapMessage),
    Search(Box<SearchOutcome>),
}

type EventHandler<'h> = dyn FnMut(SearchEvent<'_>) -> ControlFlow<()> + Send + 'h;

/// An LDAP client over one session.
pub struct LdapClient {
    session: ClientSession,
    options: ClientOptions,
    registry: ControlRegistry,
    referral_connector: Option<Arc<dyn ReferralConnector>>,
    referral_chooser: Option<Arc<ReferralChooser>>,
}

impl LdapClient {
    pub fn new(session: ClientSession) -> Self {
        Self {
            session,
            options: ClientOptions::default(),
            registry: ControlRegistry::standard(),
            referral_connector: None,
            referral_chooser: None,
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_registry(mut self, registry: ControlRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_referral_connector(mut self, connector: Arc<dyn ReferralConnector>) -> Self {
        self.referral_connector = Some(connector);
        self
    }

    pub fn with_referral_chooser(mut self, chooser: Arc<ReferralChooser>) -> Self {
        self.referral_chooser = Some(chooser);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn registry(&self) -> &ControlRegistry {
        &self.registry
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Simple bind. Empty credentials are rejected here rather than sent;
    /// the literal string "0" is a valid username and password.
    pub async fn bind(
        &mut self,
        name: impl Into<Dn>,
        password: impl Into<String>,
    ) -> Result<LdapMessage, LdapError> {
        let name = name.into();
        let password = password.into();
        if name.as_str().is_empty() || password.is_empty() {
            return Err(LdapError::Bind(
                "the username and password must not be empty".into(),
            ));
        }
        self.require_message(
            ProtocolOp::BindRequest(BindRequest::simple(name, password)),
            Controls::new(),
        )
        .await
    }

    pub async fn bind_anonymously(&mut self) -> Result<LdapMessage, LdapError> {
        self.require_message(
            ProtocolOp::BindRequest(BindRequest::anonymous()),
            Controls::new(),
        )
        .await
    }

    /// SASL bind: loop the mechanism against server challenges until the
    /// mechanism completes or the server fails the bind.
    pub async fn sasl_bind(
        &mut self,
        mechanism: &mut dyn SaslMechanism,
    ) -> Result<LdapMessage, LdapError> {
        let mut challenge: Option<Vec<u8>> = None;
        loop {
            let credentials = mechanism.respond(challenge.as_deref())?;
            let message = self
                .require_message(
                    ProtocolOp::BindRequest(BindRequest::sasl(mechanism.name(), credentials)),
                    Controls::new(),
                )
                .await?;
            let response = match &message.op {
                ProtocolOp::BindResponse(response) => response,
                _ => {
                    return Err(LdapError::Protocol(
                        "expected a bind response during the SASL exchange".into(),
                    ))
                }
            };
            match response.result.code {
                ResultCode::Success => {
                    if let Some(final_data) = &response.server_sasl_creds {
                        mechanism.respond(Some(final_data))?;
                    }
                    if !mechanism.is_complete() {
                        return Err(LdapError::Bind(format!(
                            "the server completed the bind but {} did not",
                            mechanism.name()
                        )));
                    }
                    return Ok(message);
                }
                ResultCode::SaslBindInProgress => {
                    challenge = response.server_sasl_creds.clone();
                }
                // any other code was already raised by the basic strategy
                code => {
                    return Err(LdapError::operation(code, response.result.diagnostics.clone()))
                }
            }
        }
    }

    /// Search, aggregating every entry until the terminal done arrives.
    pub async fn search(&mut self, request: SearchRequest) -> Result<SearchOutcome, LdapError> {
        self.search_with_controls(request, Controls::new()).await
    }

    pub async fn search_with_controls(
        &mut self,
        request: SearchRequest,
        controls: Controls,
    ) -> Result<SearchOutcome, LdapError> {
        match self
            .execute(ProtocolOp::SearchRequest(request), controls, 0, None)
            .await?
        {
            Some(Outcome::Search(outcome)) => Ok(*outcome),
            _ => Err(LdapError::Protocol("the search produced no outcome".into())),
        }
    }

    /// Search, streaming each entry through `handler` as it arrives instead
    /// of aggregating. Returning `ControlFlow::Break` abandons the search.
    pub async fn search_streamed(
        &mut self,
        request: SearchRequest,
        controls: Controls,
        handler: &mut EventHandler<'_>,
    ) -> Result<SearchOutcome, LdapError> {
        match self
            .execute(ProtocolOp::SearchRequest(request), controls, 0, Some(handler))
            .await?
        {
            Some(Outcome::Search(outcome)) => Ok(*outcome),
            _ => Err(LdapError::Protocol("the search produced no outcome".into())),
        }
    }

    /// Read one entry by DN. None when the server reports no such object.
    pub async fn read(
        &mut self,
        dn: impl Into<Dn>,
        attributes: Vec<String>,
    ) -> Result<Option<Entry>, LdapError> {
        let request = SearchRequest::new(crate::filter::FilterNode::present("objectClass"))
            .base(dn)
            .scope(SearchScope::BaseObject)
            .attributes(attributes);
        let outcome = self.search(request).await?;
        match outcome.result.code {
            ResultCode::Success => Ok(outcome.entries.into_iter().next()),
            ResultCode::NoSuchObject => Ok(None),
            code => Err(LdapError::Operation {
                code,
                message: outcome.result.diagnostics,
                referrals: outcome.result.referrals,
            }),
        }
    }

    pub async fn read_or_fail(
        &mut self,
        dn: impl Into<Dn>,
        attributes: Vec<String>,
    ) -> Result<Entry, LdapError> {
        let dn = dn.into();
        self.read(dn.clone(), attributes).await?.ok_or_else(|| {
            LdapError::operation(
                ResultCode::NoSuchObject,
                format!("the entry {dn} does not exist"),
            )
        })
    }

    pub async fn add(&mut self, request: AddRequest) -> Result<LdapMessage, LdapError> {
        self.require_message(ProtocolOp::AddRequest(request), Controls::new())
            .await
    }

    pub async fn delete(&mut self, dn: impl Into<Dn>) -> Result<LdapMessage, LdapError> {
        self.require_message(
            ProtocolOp::DeleteRequest(DeleteRequest { dn: dn.into() }),
            Controls::new(),
        )
        .await
    }

    pub async fn modify(&mut self, request: ModifyRequest) -> Result<LdapMessage, LdapError> {
        self.require_message(ProtocolOp::ModifyRequest(request), Controls::new())
            .await
    }

    /// Apply an entry's accumulated change log as a modify operation.
    pub async fn update(&mut self, entry: &mut Entry) -> Result<Option<LdapMessage>, LdapError> {
        let changes = entry.take_changes();
        if changes.is_empty() {
            return Ok(None);
        }
        let request = ModifyRequest::from_changes(entry.dn().clone(), changes);
        Ok(Some(self.modify(request).await?))
    }

    pub async fn modify_dn(&mut self, request: ModifyDnRequest) -> Result<LdapMessage, LdapError> {
        self.require_message(ProtocolOp::ModifyDnRequest(request), Controls::new())
            .await
    }

    pub async fn compare(
        &mut self,
        dn: impl Into<Dn>,
        attribute: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Result<bool, LdapError> {
        let message = self
            .require_message(
                ProtocolOp::CompareRequest(CompareRequest {
                    dn: dn.into(),
                    attribute: attribute.into(),
                    value: value.into(),
                }),
                Controls::new(),
            )
            .await?;
        match message.op.result() {
            Some(result) if result.code == ResultCode::CompareTrue => Ok(true),
            Some(result) if result.code == ResultCode::CompareFalse => Ok(false),
            _ => Err(LdapError::Protocol(
                "expected a compare result from the server".into(),
            )),
        }
    }

    pub async fn extended(
        &mut self,
        request: ExtendedRequest,
    ) -> Result<LdapMessage, LdapError> {
        self.require_message(ProtocolOp::ExtendedRequest(request), Controls::new())
            .await
    }

    /// WhoAmI (RFC 4532): the authorization identity the server holds for
    /// this connection.
    pub async fn who_am_i(&mut self) -> Result<String, LdapError> {
        let message = self.extended(ExtendedRequest::who_am_i()).await?;
        match &message.op {
            ProtocolOp::ExtendedResponse(response) => Ok(response
                .value
                .as_deref()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default()),
            _ => Err(LdapError::Protocol("expected an extended response".into())),
        }
    }

    /// StartTLS: on SUCCESS the session is encrypted in place, exactly once.
    /// Any other result code raises a connection error and leaves the
    /// session untouched.
    pub async fn start_tls(&mut self) -> Result<(), LdapError> {
        self.require_message(
            ProtocolOp::ExtendedRequest(ExtendedRequest::start_tls()),
            Controls::new(),
        )
        .await?;
        Ok(())
    }

    /// One-way: tell the server to drop the search with the given id.
    pub async fn abandon(&mut self, id: u32) -> Result<(), LdapError> {
        self.session
            .send(ProtocolOp::AbandonRequest(id), Controls::new())
            .await?;
        Ok(())
    }

    /// One-way: no response is expected, then the connection closes.
    pub async fn unbind(&mut self) -> Result<(), LdapError> {
        self.session
            .send(ProtocolOp::UnbindRequest, Controls::new())
            .await?;
        self.session.close().await;
        Ok(())
    }

    /// A paged cursor over the given search.
    pub fn paging(&mut self, search: SearchRequest, size: u32) -> crate::search::Paging<'_> {
        crate::search::Paging::new(self, search, size)
    }

    /// A VLV window cursor over the given search, sorted by `sort_attribute`.
    pub fn vlv(
        &mut self,
        search: SearchRequest,
        sort_attribute: impl Into<String>,
    ) -> crate::search::Vlv<'_> {
        crate::search::Vlv::new(self, search, sort_attribute)
    }

    /// A DirSync change-polling cursor.
    pub fn dir_sync(&mut self) -> crate::search::DirSync<'_> {
        crate::search::DirSync::new(self)
    }

    /// A content-synchronization cursor (RFC 4533).
    pub fn sync_repl(&mut self) -> crate::search::SyncRepl<'_> {
        crate::search::SyncRepl::new(self)
    }

    /// Send a request and post-process its response per the strategy table.
    /// One-way requests return None.
    pub async fn send_and_receive(
        &mut self,
        op: ProtocolOp,
        controls: Controls,
    ) -> Result<Option<LdapMessage>, LdapError> {
        match self.execute(op, controls, 0, None).await? {
            None => Ok(None),
            Some(Outcome::Message(message)) => Ok(Some(message)),
            Some(Outcome::Search(outcome)) => Ok(Some(LdapMessage::with_controls(
                0,
                ProtocolOp::SearchResultDone(outcome.result.clone()),
                outcome.controls.clone(),
            ))),
        }
    }

    async fn require_message(
        &mut self,
        op: ProtocolOp,
        controls: Controls,
    ) -> Result<LdapMessage, LdapError> {
        match self.execute(op, controls, 0, None).await? {
            Some(Outcome::Message(message)) => Ok(message),
            _ => Err(LdapError::Protocol("the operation produced no response".into())),
        }
    }

    fn execute<'a>(
        &'a mut self,
        op: ProtocolOp,
        controls: Controls,
        hops: u32,
        handler: Option<&'a mut EventHandler<'_>>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Outcome>, LdapError>> + Send + 'a>> {
        Box::pin(async move {
            match strategy_for(&op) {
                Strategy::OneWay => {
                    self.session.send(op, controls).await?;
                    Ok(None)
                }
                Strategy::StartTls => {
                    let message = self.session.send_and_receive(op, controls).await?;
                    let result = message.op.result().ok_or_else(|| {
                        LdapError::Protocol("expected an extended response to StartTLS".into())
                    })?;
                    if result.code != ResultCode::Success {
                        return Err(LdapError::Connection(format!(
                            "unable to start TLS: {}",
                            result.diagnostics
                        )));
                    }
                    self.session.encrypt().await?;
                    Ok(Some(Outcome::Message(message)))
                }
                Strategy::Basic => {
                    let request = op.clone();
                    let mut message = self.session.send_and_receive(op, controls.clone()).await?;
                    message.controls = message.controls.promote(&self.registry)?;
                    let result = message.op.result().cloned().ok_or_else(|| {
                        LdapError::Protocol("the response carries no result".into())
                    })?;
                    match result.code {
                        ResultCode::Success
                        | ResultCode::CompareTrue
                        | ResultCode::CompareFalse
                        | ResultCode::SaslBindInProgress => Ok(Some(Outcome::Message(message))),
                        ResultCode::Referral => {
                            self.chase(request, controls, result, hops, handler).await
                        }
                        code => Err(LdapError::Operation {
                            code,
                            message: result.diagnostics,
                            referrals: result.referrals,
                        }),
                    }
                }
                Strategy::Search => {
                    let request = op.clone();
                    let outcome = self.run_search(op, controls.clone(), handler).await?;
                    let outcome = match outcome {
                        Some(outcome) => outcome,
                        // the handler abandoned the search mid-flight
                        None => {
                            return Ok(Some(Outcome::Search(Box::new(SearchOutcome {
                                entries: Entries::default(),
                                references: Vec::new(),
                                intermediates: Vec::new(),
                                result: LdapResult::new(ResultCode::Canceled),
                                controls: Controls::new(),
                            }))))
                        }
                    };
                    if outcome.result.code == ResultCode::Referral {
                        let result = outcome.result.clone();
                        return self.chase(request, controls, result, hops, None).await;
                    }
                    Ok(Some(Outcome::Search(Box::new(outcome))))
                }
            }
        })
    }

    /// Aggregate one search: entries and references share the request id
    /// until the terminal done. None means the caller's handler broke off
    /// and the search was abandoned.
    async fn run_search(
        &mut self,
        op: ProtocolOp,
        controls: Controls,
        mut handler: Option<&mut EventHandler<'_>>,
    ) -> Result<Option<SearchOutcome>, LdapError> {
        let op = self.apply_default_base(op);
        let id = self.session.send(op, controls).await?;
        let mut entries = Entries::default();
        let mut references = Vec::new();
        let mut intermediates = Vec::new();
        loop {
            let message = self.session.receive(id).await?;
            let message_controls = message.controls.promote(&self.registry)?;
            match message.op {
                ProtocolOp::SearchResultEntry(entry) => {
                    let entry = entry.into_entry();
                    if let Some(h) = handler.as_mut() {
                        if h(SearchEvent::Entry(&entry, &message_controls)).is_break() {
                            debug!(id, "search handler requested cancellation");
                            self.session
                                .send(ProtocolOp::AbandonRequest(id), Controls::new())
                                .await?;
                            return Ok(None);
                        }
                    } else {
                        entries.push(entry);
                    }
                }
                ProtocolOp::SearchResultReference(uris) => {
                    if let Some(h) = handler.as_mut() {
                        if h(SearchEvent::Reference(&uris)).is_break() {
                            self.session
                                .send(ProtocolOp::AbandonRequest(id), Controls::new())
                                .await?;
                            return Ok(None);
                        }
                    }
                    references.push(uris);
                }
                ProtocolOp::IntermediateResponse(response) => {
                    if let Some(h) = handler.as_mut() {
                        if h(SearchEvent::Intermediate(&response)).is_break() {
                            self.session
                                .send(ProtocolOp::AbandonRequest(id), Controls::new())
                                .await?;
                            return Ok(None);
                        }
                    }
                    intermediates.push(response);
                }
                ProtocolOp::SearchResultDone(result) => {
                    return Ok(Some(SearchOutcome {
                        entries,
                        references,
                        intermediates,
                        result,
                        controls: message_controls,
                    }));
                }
                _ => {
                    return Err(LdapError::Protocol(
                        "unexpected response kind during a search".into(),
                    ))
                }
            }
        }
    }

    fn apply_default_base(&self, op: ProtocolOp) -> ProtocolOp {
        match op {
            ProtocolOp::SearchRequest(mut request) => {
                if request.base.is_empty()
                    && request.scope != SearchScope::BaseObject
                {
                    if let Some(base) = &self.options.base_dn {
                        request.base = base.clone();
                    }
                }
                ProtocolOp::SearchRequest(request)
            }
            other => other,
        }
    }

    /// Re-issue the original request against a referral target, bounded by
    /// the configured hop count. The chooser may skip individual targets.
    async fn chase<'a>(
        &'a mut self,
        request: ProtocolOp,
        controls: Controls,
        result: LdapResult,
        hops: u32,
        mut handler: Option<&'a mut EventHandler<'_>>,
    ) -> Result<Option<Outcome>, LdapError> {
        let connector = match (&self.options.follow_referrals, &self.referral_connector) {
            (true, Some(connector)) => connector.clone(),
            _ => {
                return Err(LdapError::Operation {
                    code: ResultCode::Referral,
                    message: "the server returned a referral".into(),
                    referrals: result.referrals,
                })
            }
        };
        if hops >= self.options.referral_limit {
            return Err(LdapError::Operation {
                code: ResultCode::Referral,
                message: format!(
                    "the referral limit of {} hops was reached",
                    self.options.referral_limit
                ),
                referrals: result.referrals,
            });
        }
        let mut last_error = None;
        for url in &result.referrals {
            if let Some(chooser) = &self.referral_chooser {
                if chooser(url) == ReferralChoice::Skip {
                    debug!(%url, "skipping referral");
                    continue;
                }
            }
            match connector.connect(url).await {
                Ok(mut target) => {
                    debug!(%url, hops, "following referral");
                    let reborrowed = handler.as_deref_mut();
                    match target
                        .execute(request.clone(), controls.clone(), hops + 1, reborrowed)
                        .await
                    {
                        Ok(outcome) => return Ok(outcome),
                        Err(error) => last_error = Some(error),
                    }
                }
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.unwrap_or_else(|| LdapError::Operation {
            code: ResultCode::Referral,
            message: "every referral was skipped or unreachable".into(),
            referrals: result.referrals,
        }))
    }
}
