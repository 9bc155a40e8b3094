//! Content synchronization client (RFC 4533): single refresh polls and a
//! persistent listen loop with cooperative cancellation.

use crate::client::{LdapClient, SearchEvent};
use crate::controls::{
    Control, ControlValue, Controls, SyncInfo, SyncMode, SyncStateValue, OID_SYNC_DONE,
    OID_SYNC_INFO, OID_SYNC_STATE,
};
use crate::entry::Entry;
use crate::error::LdapError;
use crate::filter::FilterNode;
use crate::message::{LdapResult, SearchRequest};
use crate::result_code::ResultCode;
use std::ops::ControlFlow;
use tracing::debug;

/// One synchronized entry together with its sync state control, when the
/// server attached one.
#[derive(Debug, Clone)]
pub struct SyncEntry {
    pub entry: Entry,
    pub state: Option<SyncStateValue>,
}

/// What one refresh cycle produced.
#[derive(Debug, Clone)]
pub struct SyncPoll {
    /// Entries collected during the cycle; empty when a handler consumed
    /// them as they arrived.
    pub entries: Vec<SyncEntry>,
    /// The refresh phase completed during this cycle.
    pub refresh_done: bool,
    /// The server signalled deletes-by-omission on the sync done control.
    pub refresh_deletes: bool,
    /// The terminal result of the underlying search.
    pub result: LdapResult,
}

impl SyncPoll {
    /// Whether the server holds changes this cycle did not deliver.
    pub fn changes_pending(&self) -> bool {
        !self.refresh_done
    }
}

/// Receives each synchronized entry; `Break` abandons the search after the
/// current invocation.
pub type SyncHandler<'h> = dyn FnMut(SyncEntry) -> ControlFlow<()> + Send + 'h;

/// Fires whenever the stored cookie advances, for external checkpointing.
pub type CookieHandler = dyn FnMut(&[u8]) + Send;

/// A sync cursor over one search. `poll` runs one refresh cycle; `listen`
/// stays in refresh-and-persist mode until the handler breaks.
pub struct SyncRepl<'a> {
    client: &'a mut LdapClient,
    search: SearchRequest,
    cookie: Option<Vec<u8>>,
    cookie_handler: Option<Box<CookieHandler>>,
    reload_hint: bool,
}

impl<'a> SyncRepl<'a> {
    pub fn new(client: &'a mut LdapClient) -> Self {
        Self::with_search(client, SearchRequest::new(FilterNode::present("objectClass")))
    }

    pub fn with_search(client: &'a mut LdapClient, search: SearchRequest) -> Self {
        Self {
            client,
            search,
            cookie: None,
            cookie_handler: None,
            reload_hint: false,
        }
    }

    /// Narrow the synchronized set with a filter.
    pub fn use_filter(&mut self, filter: FilterNode) -> &mut Self {
        self.search.filter = filter;
        self
    }

    /// Resume from a cookie saved by an earlier session.
    pub fn use_cookie(&mut self, cookie: impl Into<Vec<u8>>) -> &mut Self {
        self.cookie = Some(cookie.into());
        self
    }

    /// Register a callback fired whenever the stored cookie advances. Use it
    /// to persist the cookie for a later resume.
    pub fn use_cookie_handler(&mut self, handler: impl FnMut(&[u8]) + Send + 'static) -> &mut Self {
        self.cookie_handler = Some(Box::new(handler));
        self
    }

    /// Ask the server to resend full entries instead of a delta refresh.
    pub fn use_reload_hint(&mut self, reload_hint: bool) -> &mut Self {
        self.reload_hint = reload_hint;
        self
    }

    pub fn cookie(&self) -> Option<&[u8]> {
        self.cookie.as_deref()
    }

    /// One refresh cycle, aggregating the synchronized entries.
    pub async fn poll(&mut self) -> Result<SyncPoll, LdapError> {
        let poll = self.run(SyncMode::RefreshOnly, None).await?;
        self.require_clean(poll)
    }

    /// One refresh cycle, streaming each entry through `handler` as it
    /// arrives. `Break` abandons the cycle; the poll reports a canceled
    /// result and whatever cookie had been stored by then.
    pub async fn poll_with_handler(
        &mut self,
        handler: &mut SyncHandler<'_>,
    ) -> Result<SyncPoll, LdapError> {
        let poll = self.run(SyncMode::RefreshOnly, Some(handler)).await?;
        self.require_clean(poll)
    }

    /// Refresh-and-persist: stream changes until the handler breaks. A
    /// server that requires a new refresh restarts the cycle without the
    /// stale cookie.
    pub async fn listen(
        &mut self,
        mut handler: impl FnMut(SyncEntry) -> ControlFlow<()> + Send,
    ) -> Result<(), LdapError> {
        loop {
            let poll = self
                .run(SyncMode::RefreshAndPersist, Some(&mut handler))
                .await?;
            match poll.result.code {
                ResultCode::Canceled => return Ok(()),
                ResultCode::SyncRefreshRequired => {
                    debug!("the server requires a full refresh, discarding the cookie");
                    self.cookie = None;
                }
                ResultCode::Success => {
                    debug!("the persist stage ended, reconnecting the sync search");
                }
                code => {
                    return Err(LdapError::Operation {
                        code,
                        message: poll.result.diagnostics,
                        referrals: poll.result.referrals,
                    })
                }
            }
        }
    }

    async fn run(
        &mut self,
        mode: SyncMode,
        mut handler: Option<&mut SyncHandler<'_>>,
    ) -> Result<SyncPoll, LdapError> {
        let controls = Controls::from_vec(vec![Control::sync_request(
            mode,
            self.cookie.clone(),
            self.reload_hint,
        )
        .critical()]);
        let search = self.search.clone();

        let mut entries = Vec::new();
        let mut refresh_done = false;
        let mut info_error: Option<LdapError> = None;
        // split the borrows so the event closure can update the cookie
        // while the client drives the search
        let client = &mut *self.client;
        let cookie = &mut self.cookie;
        let cookie_handler = &mut self.cookie_handler;

        let mut on_event = |event: SearchEvent<'_>| -> ControlFlow<()> {
            match event {
                SearchEvent::Entry(entry, entry_controls) => {
                    let state = match entry_controls.get(OID_SYNC_STATE).map(|c| &c.value) {
                        Some(ControlValue::SyncState(value)) => Some(value.clone()),
                        _ => None,
                    };
                    if let Some(new_cookie) = state.as_ref().and_then(|s| s.cookie.as_deref()) {
                        note_cookie(cookie, cookie_handler, new_cookie);
                    }
                    let sync_entry = SyncEntry {
                        entry: entry.clone(),
                        state,
                    };
                    match handler.as_mut() {
                        Some(handler) => handler(sync_entry),
                        None => {
                            entries.push(sync_entry);
                            ControlFlow::Continue(())
                        }
                    }
                }
                SearchEvent::Intermediate(response)
                    if response.name.as_deref() == Some(OID_SYNC_INFO) =>
                {
                    let info =
                        match SyncInfo::from_bytes(response.value.as_deref().unwrap_or_default()) {
                            Ok(info) => info,
                            Err(error) => {
                                info_error = Some(error);
                                return ControlFlow::Break(());
                            }
                        };
                    if let Some(new_cookie) = info.cookie() {
                        note_cookie(cookie, cookie_handler, new_cookie);
                    }
                    match info {
                        SyncInfo::RefreshDelete { refresh_done: done, .. }
                        | SyncInfo::RefreshPresent { refresh_done: done, .. } => {
                            refresh_done = done;
                        }
                        _ => {}
                    }
                    ControlFlow::Continue(())
                }
                _ => ControlFlow::Continue(()),
            }
        };

        let outcome = client.search_streamed(search, controls, &mut on_event).await?;
        if let Some(error) = info_error {
            return Err(error);
        }

        let mut refresh_deletes = false;
        match outcome.controls.get(OID_SYNC_DONE).map(|c| &c.value) {
            Some(ControlValue::SyncDone(done)) => {
                if let Some(new_cookie) = &done.cookie {
                    note_cookie(&mut self.cookie, &mut self.cookie_handler, new_cookie);
                }
                refresh_deletes = done.refresh_deletes;
                refresh_done = true;
            }
            Some(_) => {
                return Err(LdapError::Protocol(
                    "expected a sync done control on the search result".into(),
                ))
            }
            None => {}
        }

        Ok(SyncPoll {
            entries,
            refresh_done,
            refresh_deletes,
            result: outcome.result,
        })
    }

    /// Raise a terminal failure as an operation error; cancellation is a
    /// clean outcome for a poll.
    fn require_clean(&self, poll: SyncPoll) -> Result<SyncPoll, LdapError> {
        match poll.result.code {
            ResultCode::Success | ResultCode::Canceled => Ok(poll),
            code => Err(LdapError::Operation {
                code,
                message: poll.result.diagnostics,
                referrals: poll.result.referrals,
            }),
        }
    }
}

fn note_cookie(
    stored: &mut Option<Vec<u8>>,
    handler: &mut Option<Box<CookieHandler>>,
    new_cookie: &[u8],
) {
    if stored.as_deref() == Some(new_cookie) {
        return;
    }
    *stored = Some(new_cookie.to_vec());
    if let Some(handler) = handler {
        handler(new_cookie);
    }
}
