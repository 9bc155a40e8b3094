//! Client and server ends wired together over in-memory duplex pipes:
//! authentication gating, message-id validation, SASL rounds, StartTLS and
//! referral chasing.

use async_trait::async_trait;
use ldapkit::client::{ReferralChoice, ReferralConnector, SaslMechanism};
use ldapkit::codec::{decode_message, encode_message};
use ldapkit::message::{BindRequest, BindResponse, ExtendedResponse, LdapResult, OID_START_TLS};
use ldapkit::server::handler::{RequestContext, RequestHandler, SearchResult};
use ldapkit::session::{BoxStream, SecurityLayer};
use ldapkit::{
    ClientOptions, ClientSession, Dn, Entries, Entry, FilterNode, LdapClient, LdapError,
    LdapMessage, ProtocolOp, ResultCode, SearchRequest, SearchScope, ServerOptions, ServerRouter,
    ServerSession,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const ADMIN_DN: &str = "cn=admin,dc=example,dc=com";

struct TestDirectory;

#[async_trait]
impl RequestHandler for TestDirectory {
    async fn bind(&self, username: &str, password: &str) -> Result<bool, LdapError> {
        Ok(username == ADMIN_DN && password == "secret")
    }

    async fn search(
        &self,
        _context: &RequestContext,
        request: &SearchRequest,
    ) -> Result<SearchResult, LdapError> {
        let entries = Entries::new(vec![
            Entry::from_attributes("cn=jane,dc=example,dc=com", [("cn", vec!["jane"])]),
            Entry::from_attributes("cn=joe,dc=example,dc=com", [("cn", vec!["joe"])]),
        ]);
        Ok(SearchResult::success(entries).with_base_dn(request.base.clone()))
    }
}

fn spawn_router(options: ServerOptions) -> DuplexStream {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let mut router =
            ServerRouter::new(ServerSession::new(server_io), options, Arc::new(TestDirectory));
        let _ = router.handle().await;
    });
    client_io
}

fn client(options: ServerOptions) -> LdapClient {
    LdapClient::new(ClientSession::new(spawn_router(options)))
}

#[tokio::test]
async fn bind_search_whoami_unbind() {
    let mut client = client(ServerOptions::default());
    client.bind(ADMIN_DN, "secret").await.unwrap();

    let outcome = client
        .search(SearchRequest::new(FilterNode::present("objectClass")).base("dc=example,dc=com"))
        .await
        .unwrap();
    assert_eq!(outcome.result.code, ResultCode::Success);
    assert_eq!(outcome.entries.len(), 2);
    assert!(outcome.entries.get("cn=jane,dc=example,dc=com").is_some());

    assert_eq!(client.who_am_i().await.unwrap(), format!("dn:{ADMIN_DN}"));
    client.unbind().await.unwrap();
}

#[tokio::test]
async fn failed_bind_keeps_the_connection_usable() {
    let mut client = client(ServerOptions::default());
    let err = client.bind(ADMIN_DN, "wrong").await.unwrap_err();
    assert!(matches!(
        err,
        LdapError::Operation {
            code: ResultCode::InvalidCredentials,
            ..
        }
    ));
    // the gate is still closed after the failure
    let outcome = client
        .search(SearchRequest::new(FilterNode::present("objectClass")).base("dc=example,dc=com"))
        .await
        .unwrap();
    assert_eq!(outcome.result.code, ResultCode::InsufficientAccessRights);
    // and a correct bind still goes through
    client.bind(ADMIN_DN, "secret").await.unwrap();
}

#[tokio::test]
async fn unauthenticated_requests_are_gated_but_root_dse_is_open() {
    let mut client = client(ServerOptions {
        vendor_version: Some("0.1.0".into()),
        ..ServerOptions::default()
    });

    let outcome = client
        .search(SearchRequest::new(FilterNode::present("objectClass")).base("dc=example,dc=com"))
        .await
        .unwrap();
    assert_eq!(outcome.result.code, ResultCode::InsufficientAccessRights);

    let root_dse = client
        .read_or_fail(Dn::root_dse(), Vec::new())
        .await
        .unwrap();
    assert_eq!(
        root_dse.get("namingContexts").unwrap().string_values(),
        vec!["dc=example,dc=com"]
    );
    assert_eq!(
        root_dse.get("vendorVersion").unwrap().string_values(),
        vec!["0.1.0"]
    );
}

#[tokio::test]
async fn empty_credentials_never_reach_the_wire_but_zero_does() {
    let mut client = client(ServerOptions::default());
    assert!(matches!(
        client.bind("", "secret").await,
        Err(LdapError::Bind(_))
    ));
    assert!(matches!(
        client.bind(ADMIN_DN, "").await,
        Err(LdapError::Bind(_))
    ));
    // "0" is a legal username and password; the server rejects it as a
    // wrong credential, not as a malformed one
    assert!(matches!(
        client.bind("0", "0").await,
        Err(LdapError::Operation {
            code: ResultCode::InvalidCredentials,
            ..
        })
    ));
}

/// Read one BER frame off a raw stream and decode it.
async fn read_response(io: &mut DuplexStream, buffer: &mut Vec<u8>) -> LdapMessage {
    loop {
        if let Some(frame_len) = ldapkit::asn1::frame_length(buffer).unwrap() {
            if buffer.len() >= frame_len {
                let frame: Vec<u8> = buffer.drain(..frame_len).collect();
                return decode_message(&frame).unwrap();
            }
        }
        let mut chunk = [0u8; 1024];
        let n = io.read(&mut chunk).await.unwrap();
        assert!(n > 0, "the server closed the connection early");
        buffer.extend_from_slice(&chunk[..n]);
    }
}

async fn write_request(io: &mut DuplexStream, message: &LdapMessage) {
    io.write_all(&encode_message(message).unwrap()).await.unwrap();
}

#[tokio::test]
async fn message_id_violations_get_an_error_without_a_disconnect() {
    let mut io = spawn_router(ServerOptions::default());
    let mut buffer = Vec::new();

    // id 0 is reserved for unsolicited notifications
    write_request(
        &mut io,
        &LdapMessage::new(0, ProtocolOp::BindRequest(BindRequest::simple(ADMIN_DN, "secret"))),
    )
    .await;
    let response = read_response(&mut io, &mut buffer).await;
    assert_eq!(response.id, 0);
    assert_eq!(
        response.op.result().unwrap().code,
        ResultCode::ProtocolError
    );

    // the connection is still alive for a valid id
    write_request(
        &mut io,
        &LdapMessage::new(5, ProtocolOp::BindRequest(BindRequest::simple(ADMIN_DN, "secret"))),
    )
    .await;
    let response = read_response(&mut io, &mut buffer).await;
    assert_eq!(response.id, 5);
    assert_eq!(response.op.result().unwrap().code, ResultCode::Success);

    // a reused id is rejected the same way
    write_request(
        &mut io,
        &LdapMessage::new(5, ProtocolOp::BindRequest(BindRequest::simple(ADMIN_DN, "secret"))),
    )
    .await;
    let response = read_response(&mut io, &mut buffer).await;
    assert_eq!(response.id, 0);
    assert_eq!(
        response.op.result().unwrap().code,
        ResultCode::ProtocolError
    );

    // and the connection still answers the next fresh id
    write_request(
        &mut io,
        &LdapMessage::new(
            6,
            ProtocolOp::SearchRequest(
                SearchRequest::new(FilterNode::present("objectClass"))
                    .scope(SearchScope::BaseObject),
            ),
        ),
    )
    .await;
    let entry = read_response(&mut io, &mut buffer).await;
    assert!(matches!(entry.op, ProtocolOp::SearchResultEntry(_)));
    let done = read_response(&mut io, &mut buffer).await;
    assert_eq!(done.op.result().unwrap().code, ResultCode::Success);
}

#[tokio::test]
async fn malformed_pdu_triggers_a_notice_of_disconnection() {
    let mut io = spawn_router(ServerOptions::default());
    let mut buffer = Vec::new();

    io.write_all(&[0x30, 0x03, 0xFF, 0xFF, 0xFF]).await.unwrap();
    let notice = read_response(&mut io, &mut buffer).await;
    assert_eq!(notice.id, 0);
    match notice.op {
        ProtocolOp::ExtendedResponse(response) => {
            assert!(response.is_notice_of_disconnection());
            assert_eq!(response.result.code, ResultCode::ProtocolError);
        }
        other => panic!("expected a notice of disconnection, got {other:?}"),
    }
    // the server closes after the notice
    let mut chunk = [0u8; 16];
    assert_eq!(io.read(&mut chunk).await.unwrap(), 0);
}

struct CountingLayer {
    upgrades: Arc<AtomicUsize>,
}

#[async_trait]
impl SecurityLayer for CountingLayer {
    async fn secure(&self, stream: BoxStream) -> Result<BoxStream, LdapError> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }
}

fn scripted_client(upgrades: Arc<AtomicUsize>) -> (LdapClient, ServerSession) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let session =
        ClientSession::new(client_io).with_security(Arc::new(CountingLayer { upgrades }));
    (LdapClient::new(session), ServerSession::new(server_io))
}

#[tokio::test]
async fn start_tls_success_encrypts_exactly_once() {
    let upgrades = Arc::new(AtomicUsize::new(0));
    let (mut client, mut server) = scripted_client(upgrades.clone());

    let script = tokio::spawn(async move {
        let request = server.next_request().await.unwrap().unwrap();
        let mut response = ExtendedResponse::new(LdapResult::success());
        response.name = Some(OID_START_TLS.to_string());
        server
            .send(&[LdapMessage::new(request.id, ProtocolOp::ExtendedResponse(response))])
            .await
            .unwrap();
        server
    });

    client.start_tls().await.unwrap();
    assert_eq!(upgrades.load(Ordering::SeqCst), 1);
    assert!(client.session().is_encrypted());
    script.await.unwrap();
}

#[tokio::test]
async fn start_tls_failure_never_encrypts() {
    let upgrades = Arc::new(AtomicUsize::new(0));
    let (mut client, mut server) = scripted_client(upgrades.clone());

    let script = tokio::spawn(async move {
        let request = server.next_request().await.unwrap().unwrap();
        let response = ExtendedResponse::new(LdapResult::with_diagnostics(
            ResultCode::UnwillingToPerform,
            "TLS is not available",
        ));
        server
            .send(&[LdapMessage::new(request.id, ProtocolOp::ExtendedResponse(response))])
            .await
            .unwrap();
        server
    });

    let err = client.start_tls().await.unwrap_err();
    assert!(matches!(err, LdapError::Connection(_)));
    assert_eq!(upgrades.load(Ordering::SeqCst), 0);
    assert!(!client.session().is_encrypted());
    script.await.unwrap();
}

struct TwoStepMechanism {
    rounds: usize,
}

impl SaslMechanism for TwoStepMechanism {
    fn name(&self) -> &str {
        "X-TWO-STEP"
    }

    fn respond(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, LdapError> {
        self.rounds += 1;
        match self.rounds {
            1 => {
                assert!(challenge.is_none());
                Ok(Some(b"first".to_vec()))
            }
            _ => {
                assert_eq!(challenge, Some(&b"challenge"[..]));
                Ok(Some(b"second".to_vec()))
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.rounds >= 2
    }
}

fn sasl_credentials(message: &LdapMessage) -> Vec<u8> {
    match &message.op {
        ProtocolOp::BindRequest(BindRequest {
            auth: ldapkit::message::BindAuth::Sasl { credentials, .. },
            ..
        }) => credentials.clone().unwrap_or_default(),
        other => panic!("expected a SASL bind request, got {other:?}"),
    }
}

#[tokio::test]
async fn sasl_bind_loops_until_the_mechanism_completes() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut client = LdapClient::new(ClientSession::new(client_io));
    let mut server = ServerSession::new(server_io);

    let script = tokio::spawn(async move {
        let request = server.next_request().await.unwrap().unwrap();
        assert_eq!(sasl_credentials(&request), b"first");
        let mut challenge = BindResponse::new(LdapResult::new(ResultCode::SaslBindInProgress));
        challenge.server_sasl_creds = Some(b"challenge".to_vec());
        server
            .send(&[LdapMessage::new(request.id, ProtocolOp::BindResponse(challenge))])
            .await
            .unwrap();

        let request = server.next_request().await.unwrap().unwrap();
        assert_eq!(sasl_credentials(&request), b"second");
        server
            .send(&[LdapMessage::new(
                request.id,
                ProtocolOp::BindResponse(BindResponse::new(LdapResult::success())),
            )])
            .await
            .unwrap();
        server
    });

    let mut mechanism = TwoStepMechanism { rounds: 0 };
    let message = client.sasl_bind(&mut mechanism).await.unwrap();
    assert_eq!(message.op.result().unwrap().code, ResultCode::Success);
    assert!(mechanism.is_complete());
    script.await.unwrap();
}

#[tokio::test]
async fn sasl_bind_failure_surfaces_the_server_result() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut client = LdapClient::new(ClientSession::new(client_io));
    let mut server = ServerSession::new(server_io);

    let script = tokio::spawn(async move {
        let request = server.next_request().await.unwrap().unwrap();
        server
            .send(&[LdapMessage::new(
                request.id,
                ProtocolOp::BindResponse(BindResponse::new(LdapResult::with_diagnostics(
                    ResultCode::InvalidCredentials,
                    "rejected",
                ))),
            )])
            .await
            .unwrap();
        server
    });

    let mut mechanism = TwoStepMechanism { rounds: 0 };
    let err = client.sasl_bind(&mut mechanism).await.unwrap_err();
    assert!(matches!(
        err,
        LdapError::Operation {
            code: ResultCode::InvalidCredentials,
            ..
        }
    ));
    script.await.unwrap();
}

/// Answers any search with one entry and a success done.
async fn referral_target_script(mut server: ServerSession) {
    let request = server.next_request().await.unwrap().unwrap();
    let entry = Entry::from_attributes("cn=moved,dc=other,dc=com", [("cn", vec!["moved"])]);
    server
        .send(&[
            LdapMessage::new(
                request.id,
                ProtocolOp::SearchResultEntry(
                    ldapkit::message::SearchResultEntry::from_entry(&entry),
                ),
            ),
            LdapMessage::new(
                request.id,
                ProtocolOp::SearchResultDone(LdapResult::success()),
            ),
        ])
        .await
        .unwrap();
}

struct TargetConnector;

#[async_trait]
impl ReferralConnector for TargetConnector {
    async fn connect(&self, url: &str) -> Result<LdapClient, LdapError> {
        assert_eq!(url, "ldap://other.example.com/");
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(referral_target_script(ServerSession::new(server_io)));
        Ok(LdapClient::new(ClientSession::new(client_io)))
    }
}

fn referral_client(follow: bool) -> LdapClient {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let mut server = ServerSession::new(server_io);
        let request = server.next_request().await.unwrap().unwrap();
        let mut result = LdapResult::new(ResultCode::Referral);
        result.referrals = vec!["ldap://other.example.com/".to_string()];
        server
            .send(&[LdapMessage::new(request.id, ProtocolOp::SearchResultDone(result))])
            .await
            .unwrap();
    });
    LdapClient::new(ClientSession::new(client_io))
        .with_options(ClientOptions {
            follow_referrals: follow,
            ..ClientOptions::default()
        })
        .with_referral_connector(Arc::new(TargetConnector))
}

#[tokio::test]
async fn referrals_are_chased_when_configured() {
    let mut client = referral_client(true);
    let outcome = client
        .search(SearchRequest::new(FilterNode::present("objectClass")).base("dc=other,dc=com"))
        .await
        .unwrap();
    assert_eq!(outcome.result.code, ResultCode::Success);
    assert_eq!(outcome.entries.len(), 1);
}

#[tokio::test]
async fn referrals_surface_when_chasing_is_off() {
    let mut client = referral_client(false);
    let err = client
        .search(SearchRequest::new(FilterNode::present("objectClass")).base("dc=other,dc=com"))
        .await
        .unwrap_err();
    match err {
        LdapError::Operation {
            code: ResultCode::Referral,
            referrals,
            ..
        } => assert_eq!(referrals, vec!["ldap://other.example.com/".to_string()]),
        other => panic!("expected a referral result, got {other:?}"),
    }
}

#[tokio::test]
async fn a_chooser_can_skip_every_referral() {
    let mut client = referral_client(true)
        .with_referral_chooser(Arc::new(|_url: &str| ReferralChoice::Skip));
    let err = client
        .search(SearchRequest::new(FilterNode::present("objectClass")).base("dc=other,dc=com"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LdapError::Operation {
            code: ResultCode::Referral,
            ..
        }
    ));
}
