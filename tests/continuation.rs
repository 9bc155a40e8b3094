//! Continuation protocols against scripted servers: paging cookie
//! sequences, VLV window movement, DirSync naming-context resolution and
//! SyncRepl polling with cookie checkpointing.

use ldapkit::controls::{
    Control, Controls, DirSyncRequestValue, DirSyncResponseValue, EntryState, SyncDoneValue,
    SyncInfo, SyncMode, SyncRequestValue, SyncStateValue, VlvResponseValue, OID_DIR_SYNC,
    OID_PAGING, OID_SYNC_DONE, OID_SYNC_INFO, OID_SYNC_REQUEST, OID_SYNC_STATE, OID_VLV,
    OID_VLV_RESPONSE,
};
use ldapkit::controls::ControlValue;
use ldapkit::message::{IntermediateResponse, LdapResult, SearchResultEntry};
use ldapkit::{
    ClientSession, Entry, FilterNode, LdapClient, LdapError, LdapMessage, ProtocolOp,
    SearchRequest, ServerSession,
};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn scripted() -> (LdapClient, ServerSession) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    (
        LdapClient::new(ClientSession::new(client_io)),
        ServerSession::new(server_io),
    )
}

fn entry_message(id: u32, dn: &str) -> LdapMessage {
    let entry = Entry::from_attributes(dn, [("cn", vec!["x"])]);
    LdapMessage::new(
        id,
        ProtocolOp::SearchResultEntry(SearchResultEntry::from_entry(&entry)),
    )
}

fn done_message(id: u32, controls: Controls) -> LdapMessage {
    LdapMessage::with_controls(id, ProtocolOp::SearchResultDone(LdapResult::success()), controls)
}

fn opaque_value(control: &Control) -> Vec<u8> {
    match &control.value {
        ControlValue::Opaque(bytes) => bytes.clone(),
        other => panic!("expected an opaque control value, got {other:?}"),
    }
}

fn search() -> SearchRequest {
    SearchRequest::new(FilterNode::present("objectClass")).base("dc=example,dc=com")
}

/// Answers each search with one entry and a done carrying the next paging
/// cookie from the script.
async fn paging_script(mut server: ServerSession, cookies: Vec<&'static [u8]>) {
    for cookie in cookies {
        let request = server.next_request().await.unwrap().unwrap();
        let mut controls = Controls::new();
        controls.push(Control::paging(0, cookie.to_vec()));
        server
            .send(&[
                entry_message(request.id, "cn=x,dc=example,dc=com"),
                done_message(request.id, controls),
            ])
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn paging_cookie_sequence_drives_has_entries() {
    let (mut client, server) = scripted();
    let script = tokio::spawn(paging_script(
        server,
        vec![b"c1".as_slice(), b"c2".as_slice(), b"".as_slice()],
    ));

    let mut paging = client.paging(search(), 2);
    assert!(paging.has_entries());
    paging.get_entries(None).await.unwrap();
    assert!(paging.has_entries());
    assert_eq!(paging.size_estimate(), Some(0));
    paging.get_entries(None).await.unwrap();
    assert!(paging.has_entries());
    paging.get_entries(None).await.unwrap();
    assert!(!paging.has_entries());
    script.await.unwrap();
}

#[tokio::test]
async fn paging_end_discards_the_server_state() {
    let (mut client, server) = scripted();
    let script = tokio::spawn(async move {
        let mut server = server;
        let request = server.next_request().await.unwrap().unwrap();
        let mut controls = Controls::new();
        controls.push(Control::paging(0, b"c1".to_vec()));
        server
            .send(&[
                entry_message(request.id, "cn=x,dc=example,dc=com"),
                done_message(request.id, controls),
            ])
            .await
            .unwrap();

        // the end request asks for a zero page with the stored cookie
        let request = server.next_request().await.unwrap().unwrap();
        let control = request.controls.get(OID_PAGING).unwrap();
        let value = ldapkit::controls::PagingValue::from_bytes(&opaque_value(control)).unwrap();
        assert_eq!(value.size, 0);
        assert_eq!(value.cookie, b"c1");
        let mut controls = Controls::new();
        controls.push(Control::paging(0, Vec::new()));
        server
            .send(&[done_message(request.id, controls)])
            .await
            .unwrap();
    });

    let mut paging = client.paging(search(), 2);
    paging.get_entries(None).await.unwrap();
    assert!(paging.has_entries());
    paging.end().await.unwrap();
    assert!(!paging.has_entries());
    script.await.unwrap();
}

#[tokio::test]
async fn paging_without_a_response_control_depends_on_criticality() {
    // critical: a missing response control is a protocol violation
    let (mut client, server) = scripted();
    let script = tokio::spawn(async move {
        let mut server = server;
        let request = server.next_request().await.unwrap().unwrap();
        server
            .send(&[done_message(request.id, Controls::new())])
            .await
            .unwrap();
    });
    let mut paging = client.paging(search(), 2).critical(true);
    assert!(matches!(
        paging.get_entries(None).await,
        Err(LdapError::Protocol(_))
    ));
    script.await.unwrap();

    // non-critical: the server ignored paging, the result is complete
    let (mut client, server) = scripted();
    let script = tokio::spawn(async move {
        let mut server = server;
        let request = server.next_request().await.unwrap().unwrap();
        server
            .send(&[
                entry_message(request.id, "cn=x,dc=example,dc=com"),
                done_message(request.id, Controls::new()),
            ])
            .await
            .unwrap();
    });
    let mut paging = client.paging(search(), 2);
    let entries = paging.get_entries(None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!paging.has_entries());
    script.await.unwrap();
}

/// Answers each search with a VLV response control confirming the requested
/// offset against a fixed list of 100 entries.
async fn vlv_script(mut server: ServerSession, rounds: usize) {
    for _ in 0..rounds {
        let request = server.next_request().await.unwrap().unwrap();
        let vlv_request = request.controls.get(OID_VLV).expect("a VLV control");
        let value =
            ldapkit::controls::VlvValue::from_bytes(&opaque_value(vlv_request)).unwrap();
        let offset = match value.target {
            ldapkit::controls::VlvTarget::Offset { offset, .. } => offset.min(100),
            other => panic!("expected an offset target, got {other:?}"),
        };
        let mut controls = Controls::new();
        controls.push(Control::new(
            OID_VLV_RESPONSE,
            ControlValue::VlvResponse(VlvResponseValue {
                target_position: offset,
                content_count: 100,
                result: 0,
                context_id: None,
            }),
        ));
        server
            .send(&[
                entry_message(request.id, "cn=x,dc=example,dc=com"),
                done_message(request.id, controls),
            ])
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn vlv_window_moves_and_clamps() {
    let (mut client, server) = scripted();
    let script = tokio::spawn(vlv_script(server, 3));

    let mut vlv = client.vlv(search(), "sn").after_position(9);
    vlv.get_entries().await.unwrap();
    assert_eq!(vlv.list_size(), Some(100));
    assert_eq!(vlv.list_offset(), Some(1));
    assert!(vlv.is_at_start_of_list());
    assert!(!vlv.is_at_end_of_list());

    // clamped at the server's content count
    vlv.move_forward(500);
    vlv.get_entries().await.unwrap();
    assert_eq!(vlv.list_offset(), Some(100));
    assert!(vlv.is_at_end_of_list());

    // and at 1 on the way back
    vlv.move_backward(500);
    vlv.get_entries().await.unwrap();
    assert_eq!(vlv.list_offset(), Some(1));
    script.await.unwrap();
}

#[tokio::test]
async fn vlv_percentage_mode_scales_against_the_content_count() {
    let (mut client, server) = scripted();
    let script = tokio::spawn(vlv_script(server, 2));

    let mut vlv = client.vlv(search(), "sn").as_percentage(true);
    vlv.get_entries().await.unwrap();
    vlv.move_to(50);
    vlv.get_entries().await.unwrap();
    // 50% of a 100 entry list
    assert_eq!(vlv.list_offset(), Some(50));
    assert_eq!(vlv.position(), Some(50));
    script.await.unwrap();
}

/// Root DSE reads are counted; DirSync searches get the scripted
/// (more_results, cookie) pairs in order.
async fn dirsync_script(
    mut server: ServerSession,
    root_dse_reads: Arc<AtomicUsize>,
    batches: Vec<(bool, &'static [u8])>,
) {
    let mut batches = batches.into_iter();
    loop {
        let request = match server.next_request().await.unwrap() {
            Some(request) => request,
            None => return,
        };
        let search = match &request.op {
            ProtocolOp::SearchRequest(search) => search.clone(),
            ProtocolOp::UnbindRequest => return,
            other => panic!("unexpected request {other:?}"),
        };
        if search.is_root_dse() {
            root_dse_reads.fetch_add(1, Ordering::SeqCst);
            assert_eq!(search.attributes, vec!["defaultNamingContext"]);
            let entry =
                Entry::from_attributes("", [("defaultNamingContext", vec!["dc=example,dc=com"])]);
            server
                .send(&[
                    LdapMessage::new(
                        request.id,
                        ProtocolOp::SearchResultEntry(SearchResultEntry::from_entry(&entry)),
                    ),
                    done_message(request.id, Controls::new()),
                ])
                .await
                .unwrap();
            continue;
        }

        assert_eq!(search.base.as_str(), "dc=example,dc=com");
        let control = request.controls.get(OID_DIR_SYNC).expect("a DirSync control");
        assert!(control.criticality);
        DirSyncRequestValue::from_bytes(&opaque_value(control)).unwrap();
        let (more_results, cookie) = batches.next().expect("an unscripted DirSync batch");
        let mut controls = Controls::new();
        controls.push(Control::new(
            OID_DIR_SYNC,
            ControlValue::DirSyncResponse(DirSyncResponseValue {
                more_results,
                unused: 0,
                cookie: cookie.to_vec(),
            }),
        ));
        server
            .send(&[
                entry_message(request.id, "cn=changed,dc=example,dc=com"),
                done_message(request.id, controls),
            ])
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn dirsync_resolves_the_naming_context_once() {
    let (mut client, server) = scripted();
    let root_dse_reads = Arc::new(AtomicUsize::new(0));
    let script = tokio::spawn(dirsync_script(
        server,
        root_dse_reads.clone(),
        vec![(true, b"c1".as_slice()), (false, b"c2".as_slice())],
    ));

    let mut dirsync = client.dir_sync();
    assert!(!dirsync.has_changes());
    assert!(dirsync.get_cookie().is_empty());

    let changes = dirsync.get_changes().await.unwrap();
    assert_eq!(changes.len(), 1);
    assert!(dirsync.has_changes());
    assert_eq!(dirsync.get_cookie(), b"c1");

    let changes = dirsync.get_changes().await.unwrap();
    assert_eq!(changes.len(), 1);
    assert!(!dirsync.has_changes());
    assert_eq!(dirsync.get_cookie(), b"c2");

    assert_eq!(root_dse_reads.load(Ordering::SeqCst), 1);
    drop(dirsync);
    client.unbind().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn dirsync_skips_the_lookup_when_a_context_is_supplied() {
    let (mut client, server) = scripted();
    let root_dse_reads = Arc::new(AtomicUsize::new(0));
    let script = tokio::spawn(dirsync_script(
        server,
        root_dse_reads.clone(),
        vec![(false, b"c1".as_slice())],
    ));

    let mut dirsync = client.dir_sync();
    dirsync.use_naming_context("dc=example,dc=com");
    dirsync.get_changes().await.unwrap();
    assert_eq!(root_dse_reads.load(Ordering::SeqCst), 0);
    drop(dirsync);
    client.unbind().await.unwrap();
    script.await.unwrap();
}

fn sync_state_control(state: EntryState, uuid: u8, cookie: Option<&[u8]>) -> Control {
    Control::new(
        OID_SYNC_STATE,
        ControlValue::SyncState(SyncStateValue {
            state,
            entry_uuid: vec![uuid; 16],
            cookie: cookie.map(<[u8]>::to_vec),
        }),
    )
}

#[tokio::test]
async fn syncrepl_poll_collects_entries_and_checkpoints_cookies() {
    let (mut client, mut server) = scripted();
    let script = tokio::spawn(async move {
        let request = server.next_request().await.unwrap().unwrap();
        let control = request.controls.get(OID_SYNC_REQUEST).expect("a sync request control");
        let value = SyncRequestValue::from_bytes(&opaque_value(control)).unwrap();
        assert_eq!(value.mode, SyncMode::RefreshOnly);
        assert!(value.cookie.is_none());

        let mut entry = entry_message(request.id, "cn=added,dc=example,dc=com");
        entry
            .controls
            .push(sync_state_control(EntryState::Add, 1, Some(b"ck1")));
        let info = SyncInfo::RefreshDelete {
            cookie: Some(b"ck2".to_vec()),
            refresh_done: true,
        };
        let intermediate = LdapMessage::new(
            request.id,
            ProtocolOp::IntermediateResponse(IntermediateResponse {
                name: Some(OID_SYNC_INFO.to_string()),
                value: Some(info.to_bytes()),
            }),
        );
        let mut done_controls = Controls::new();
        done_controls.push(Control::new(
            OID_SYNC_DONE,
            ControlValue::SyncDone(SyncDoneValue {
                cookie: Some(b"ck3".to_vec()),
                refresh_deletes: true,
            }),
        ));
        server
            .send(&[entry, intermediate, done_message(request.id, done_controls)])
            .await
            .unwrap();
        server
    });

    let checkpoints: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = checkpoints.clone();
    let mut syncrepl = client.sync_repl();
    syncrepl.use_cookie_handler(move |cookie| {
        recorded.lock().unwrap().push(cookie.to_vec());
    });

    let poll = syncrepl.poll().await.unwrap();
    assert_eq!(poll.entries.len(), 1);
    let state = poll.entries[0].state.as_ref().unwrap();
    assert_eq!(state.state, EntryState::Add);
    assert!(poll.refresh_done);
    assert!(poll.refresh_deletes);
    assert!(!poll.changes_pending());
    assert_eq!(syncrepl.cookie(), Some(&b"ck3"[..]));
    assert_eq!(
        *checkpoints.lock().unwrap(),
        vec![b"ck1".to_vec(), b"ck2".to_vec(), b"ck3".to_vec()]
    );
    script.await.unwrap();
}

#[tokio::test]
async fn syncrepl_listen_stops_on_handler_break() {
    let (mut client, mut server) = scripted();
    let script = tokio::spawn(async move {
        let request = server.next_request().await.unwrap().unwrap();
        let control = request.controls.get(OID_SYNC_REQUEST).expect("a sync request control");
        let value = SyncRequestValue::from_bytes(&opaque_value(control)).unwrap();
        assert_eq!(value.mode, SyncMode::RefreshAndPersist);

        let mut responses = Vec::new();
        for (i, dn) in ["cn=a,dc=x", "cn=b,dc=x", "cn=c,dc=x", "cn=d,dc=x"]
            .iter()
            .enumerate()
        {
            let mut entry = entry_message(request.id, dn);
            entry
                .controls
                .push(sync_state_control(EntryState::Modify, i as u8, None));
            responses.push(entry);
        }
        server.send(&responses).await.unwrap();

        // the break turns into an abandon for the search id
        let abandon = server.next_request().await.unwrap().unwrap();
        assert_eq!(abandon.op, ProtocolOp::AbandonRequest(request.id));
    });

    let mut seen = 0;
    let mut syncrepl = client.sync_repl();
    syncrepl
        .listen(|_entry| {
            seen += 1;
            if seen == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await
        .unwrap();
    assert_eq!(seen, 3);
    script.await.unwrap();
}
