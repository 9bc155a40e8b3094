//! Content synchronization control values and the SyncInfo message
//! (RFC 4533).

use crate::asn1::{self, Asn1, TagPayload};
use crate::controls::ControlValue;
use crate::error::LdapError;

/// Refresh mode of a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    RefreshOnly,
    RefreshAndPersist,
}

impl SyncMode {
    pub fn code(&self) -> i64 {
        match self {
            SyncMode::RefreshOnly => 1,
            SyncMode::RefreshAndPersist => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, LdapError> {
        match code {
            1 => Ok(SyncMode::RefreshOnly),
            3 => Ok(SyncMode::RefreshAndPersist),
            _ => Err(LdapError::Protocol(format!("invalid sync mode {code}"))),
        }
    }
}

/// syncRequestValue ::= SEQUENCE {
///     mode       ENUMERATED { refreshOnly (1), refreshAndPersist (3) },
///     cookie     syncCookie OPTIONAL,
///     reloadHint BOOLEAN DEFAULT FALSE }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequestValue {
    pub mode: SyncMode,
    pub cookie: Option<Vec<u8>>,
    pub reload_hint: bool,
}

impl SyncRequestValue {
    pub fn to_asn1(&self) -> Asn1 {
        let mut parts = vec![Asn1::Enumerated(self.mode.code())];
        if let Some(cookie) = &self.cookie {
            parts.push(Asn1::OctetString(cookie.clone()));
        }
        if self.reload_hint {
            parts.push(Asn1::Boolean(true));
        }
        Asn1::Sequence(parts)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let node = asn1::decode(bytes)?;
        let parts = node.expect_sequence()?;
        let mode = SyncMode::from_code(
            parts
                .first()
                .ok_or_else(|| LdapError::Protocol("empty sync request value".into()))?
                .expect_enumerated()?,
        )?;
        let mut cookie = None;
        let mut reload_hint = false;
        for part in &parts[1..] {
            match part {
                Asn1::OctetString(bytes) => cookie = Some(bytes.clone()),
                Asn1::Boolean(hint) => reload_hint = *hint,
                _ => return Err(LdapError::Protocol("malformed sync request value".into())),
            }
        }
        Ok(SyncRequestValue {
            mode,
            cookie,
            reload_hint,
        })
    }
}

/// State of an entry in a sync response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Present,
    Add,
    Modify,
    Delete,
}

impl EntryState {
    pub fn code(&self) -> i64 {
        match self {
            EntryState::Present => 0,
            EntryState::Add => 1,
            EntryState::Modify => 2,
            EntryState::Delete => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, LdapError> {
        match code {
            0 => Ok(EntryState::Present),
            1 => Ok(EntryState::Add),
            2 => Ok(EntryState::Modify),
            3 => Ok(EntryState::Delete),
            _ => Err(LdapError::Protocol(format!("invalid sync state {code}"))),
        }
    }
}

/// syncStateValue ::= SEQUENCE {
///     state     ENUMERATED { present (0), add (1), modify (2), delete (3) },
///     entryUUID syncUUID,
///     cookie    syncCookie OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateValue {
    pub state: EntryState,
    pub entry_uuid: Vec<u8>,
    pub cookie: Option<Vec<u8>>,
}

impl SyncStateValue {
    pub fn to_asn1(&self) -> Asn1 {
        let mut parts = vec![
            Asn1::Enumerated(self.state.code()),
            Asn1::OctetString(self.entry_uuid.clone()),
        ];
        if let Some(cookie) = &self.cookie {
            parts.push(Asn1::OctetString(cookie.clone()));
        }
        Asn1::Sequence(parts)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let node = asn1::decode(bytes)?;
        let parts = node.expect_sequence()?;
        if parts.len() < 2 || parts.len() > 3 {
            return Err(LdapError::Protocol("malformed sync state value".into()));
        }
        Ok(SyncStateValue {
            state: EntryState::from_code(parts[0].expect_enumerated()?)?,
            entry_uuid: parts[1].expect_octet_string()?.to_vec(),
            cookie: match parts.get(2) {
                Some(node) => Some(node.expect_octet_string()?.to_vec()),
                None => None,
            },
        })
    }
}

/// syncDoneValue ::= SEQUENCE {
///     cookie         syncCookie OPTIONAL,
///     refreshDeletes BOOLEAN DEFAULT FALSE }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDoneValue {
    pub cookie: Option<Vec<u8>>,
    pub refresh_deletes: bool,
}

impl SyncDoneValue {
    pub fn to_asn1(&self) -> Asn1 {
        let mut parts = Vec::new();
        if let Some(cookie) = &self.cookie {
            parts.push(Asn1::OctetString(cookie.clone()));
        }
        if self.refresh_deletes {
            parts.push(Asn1::Boolean(true));
        }
        Asn1::Sequence(parts)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let node = asn1::decode(bytes)?;
        let parts = node.expect_sequence()?;
        let mut cookie = None;
        let mut refresh_deletes = false;
        for part in parts {
            match part {
                Asn1::OctetString(bytes) => cookie = Some(bytes.clone()),
                Asn1::Boolean(flag) => refresh_deletes = *flag,
                _ => return Err(LdapError::Protocol("malformed sync done value".into())),
            }
        }
        Ok(SyncDoneValue {
            cookie,
            refresh_deletes,
        })
    }
}

/// The SyncInfo intermediate response value.
///
/// syncInfoValue ::= CHOICE {
///     newcookie      [0] syncCookie,
///     refreshDelete  [1] SEQUENCE { cookie OPTIONAL, refreshDone BOOLEAN DEFAULT TRUE },
///     refreshPresent [2] SEQUENCE { cookie OPTIONAL, refreshDone BOOLEAN DEFAULT TRUE },
///     syncIdSet      [3] SEQUENCE { cookie OPTIONAL, refreshDeletes BOOLEAN DEFAULT FALSE,
///                                   syncUUIDs SET OF syncUUID } }
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInfo {
    NewCookie(Vec<u8>),
    RefreshDelete {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    RefreshPresent {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    IdSet {
        cookie: Option<Vec<u8>>,
        refresh_deletes: bool,
        uuids: Vec<Vec<u8>>,
    },
}

impl SyncInfo {
    pub fn cookie(&self) -> Option<&[u8]> {
        match self {
            SyncInfo::NewCookie(cookie) => Some(cookie),
            SyncInfo::RefreshDelete { cookie, .. }
            | SyncInfo::RefreshPresent { cookie, .. }
            | SyncInfo::IdSet { cookie, .. } => cookie.as_deref(),
        }
    }

    pub fn to_asn1(&self) -> Asn1 {
        match self {
            SyncInfo::NewCookie(cookie) => Asn1::context_primitive(0, cookie.clone()),
            SyncInfo::RefreshDelete {
                cookie,
                refresh_done,
            } => refresh_phase_to_asn1(1, cookie, *refresh_done),
            SyncInfo::RefreshPresent {
                cookie,
                refresh_done,
            } => refresh_phase_to_asn1(2, cookie, *refresh_done),
            SyncInfo::IdSet {
                cookie,
                refresh_deletes,
                uuids,
            } => {
                let mut parts = Vec::new();
                if let Some(cookie) = cookie {
                    parts.push(Asn1::OctetString(cookie.clone()));
                }
                if *refresh_deletes {
                    parts.push(Asn1::Boolean(true));
                }
                parts.push(Asn1::Set(
                    uuids.iter().map(|u| Asn1::OctetString(u.clone())).collect(),
                ));
                Asn1::context(3, parts)
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        asn1::encode(&self.to_asn1())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let node = asn1::decode(bytes)?;
        let (tag, payload) = match &node {
            Asn1::Context(tag, payload) => (*tag, payload),
            _ => return Err(LdapError::Protocol("SyncInfo is not context-tagged".into())),
        };
        match (tag, payload) {
            (0, TagPayload::Primitive(cookie)) => Ok(SyncInfo::NewCookie(cookie.clone())),
            (1, TagPayload::Constructed(parts)) => {
                let (cookie, refresh_done) = refresh_phase_from_parts(parts)?;
                Ok(SyncInfo::RefreshDelete {
                    cookie,
                    refresh_done,
                })
            }
            (2, TagPayload::Constructed(parts)) => {
                let (cookie, refresh_done) = refresh_phase_from_parts(parts)?;
                Ok(SyncInfo::RefreshPresent {
                    cookie,
                    refresh_done,
                })
            }
            (3, TagPayload::Constructed(parts)) => {
                let mut cookie = None;
                let mut refresh_deletes = false;
                let mut uuids = Vec::new();
                for part in parts {
                    match part {
                        Asn1::OctetString(bytes) => cookie = Some(bytes.clone()),
                        Asn1::Boolean(flag) => refresh_deletes = *flag,
                        Asn1::Set(items) => {
                            for item in items {
                                uuids.push(item.expect_octet_string()?.to_vec());
                            }
                        }
                        _ => return Err(LdapError::Protocol("malformed syncIdSet".into())),
                    }
                }
                Ok(SyncInfo::IdSet {
                    cookie,
                    refresh_deletes,
                    uuids,
                })
            }
            _ => Err(LdapError::Protocol(format!("unknown SyncInfo choice {tag}"))),
        }
    }
}

fn refresh_phase_to_asn1(tag: u8, cookie: &Option<Vec<u8>>, refresh_done: bool) -> Asn1 {
    let mut parts = Vec::new();
    if let Some(cookie) = cookie {
        parts.push(Asn1::OctetString(cookie.clone()));
    }
    if !refresh_done {
        parts.push(Asn1::Boolean(false));
    }
    Asn1::context(tag, parts)
}

fn refresh_phase_from_parts(parts: &[Asn1]) -> Result<(Option<Vec<u8>>, bool), LdapError> {
    let mut cookie = None;
    let mut refresh_done = true;
    for part in parts {
        match part {
            Asn1::OctetString(bytes) => cookie = Some(bytes.clone()),
            Asn1::Boolean(done) => refresh_done = *done,
            _ => return Err(LdapError::Protocol("malformed SyncInfo refresh phase".into())),
        }
    }
    Ok((cookie, refresh_done))
}

pub(super) fn decode_request(bytes: &[u8]) -> Result<ControlValue, LdapError> {
    Ok(ControlValue::SyncRequest(SyncRequestValue::from_bytes(
        bytes,
    )?))
}

pub(super) fn decode_state(bytes: &[u8]) -> Result<ControlValue, LdapError> {
    Ok(ControlValue::SyncState(SyncStateValue::from_bytes(bytes)?))
}

pub(super) fn decode_done(bytes: &[u8]) -> Result<ControlValue, LdapError> {
    Ok(ControlValue::SyncDone(SyncDoneValue::from_bytes(bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let value = SyncRequestValue {
            mode: SyncMode::RefreshAndPersist,
            cookie: Some(b"rid=000".to_vec()),
            reload_hint: true,
        };
        let bytes = asn1::encode(&value.to_asn1());
        assert_eq!(SyncRequestValue::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn request_defaults() {
        let bytes = asn1::encode(&Asn1::Sequence(vec![Asn1::Enumerated(1)]));
        let value = SyncRequestValue::from_bytes(&bytes).unwrap();
        assert_eq!(value.mode, SyncMode::RefreshOnly);
        assert!(value.cookie.is_none());
        assert!(!value.reload_hint);
    }

    #[test]
    fn state_roundtrip() {
        let value = SyncStateValue {
            state: EntryState::Modify,
            entry_uuid: vec![0xAA; 16],
            cookie: Some(b"c".to_vec()),
        };
        let bytes = asn1::encode(&value.to_asn1());
        assert_eq!(SyncStateValue::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn done_roundtrip() {
        let value = SyncDoneValue {
            cookie: Some(b"done".to_vec()),
            refresh_deletes: true,
        };
        let bytes = asn1::encode(&value.to_asn1());
        assert_eq!(SyncDoneValue::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn sync_info_choices_roundtrip() {
        for info in [
            SyncInfo::NewCookie(b"nc".to_vec()),
            SyncInfo::RefreshDelete {
                cookie: Some(b"c".to_vec()),
                refresh_done: false,
            },
            SyncInfo::RefreshPresent {
                cookie: None,
                refresh_done: true,
            },
            SyncInfo::IdSet {
                cookie: Some(b"c".to_vec()),
                refresh_deletes: true,
                uuids: vec![vec![1; 16], vec![2; 16]],
            },
        ] {
            assert_eq!(SyncInfo::from_bytes(&info.to_bytes()).unwrap(), info);
        }
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let bytes = asn1::encode(&Asn1::Sequence(vec![Asn1::Enumerated(2)]));
        assert!(SyncRequestValue::from_bytes(&bytes).is_err());
    }
}
