//! Request/response controls: the generic envelope, the per-OID value
//! codecs, and the registry that promotes opaque values to typed ones.
//!
//! Control ::= SEQUENCE {
//!     controlType  LDAPOID,
//!     criticality  BOOLEAN DEFAULT FALSE,
//!     controlValue OCTET STRING OPTIONAL }
//!
//! The control value wraps an embedded encoded SEQUENCE specific to the
//! control's OID. Unknown OIDs stay opaque and are never dropped.

pub mod dirsync;
pub mod paging;
pub mod sync;
pub mod vlv;

use crate::asn1::{self, Asn1};
use crate::error::LdapError;
use std::collections::HashMap;

pub use dirsync::{DirSyncRequestValue, DirSyncResponseValue};
pub use paging::PagingValue;
pub use sync::{EntryState, SyncDoneValue, SyncInfo, SyncMode, SyncRequestValue, SyncStateValue};
pub use vlv::{SortKey, SortingResultValue, SortingValue, VlvResponseValue, VlvTarget, VlvValue};

/// Simple paged results (RFC 2696).
pub const OID_PAGING: &str = "1.2.840.113556.1.4.319";
/// Server-side sorting request / response (RFC 2891).
pub const OID_SORTING: &str = "1.2.840.113556.1.4.473";
pub const OID_SORTING_RESPONSE: &str = "1.2.840.113556.1.4.474";
/// Virtual list view request / response.
pub const OID_VLV: &str = "2.16.840.1.113730.3.4.9";
pub const OID_VLV_RESPONSE: &str = "2.16.840.1.113730.3.4.10";
/// Active Directory DirSync (request and response share the OID).
pub const OID_DIR_SYNC: &str = "1.2.840.113556.1.4.841";
/// Content synchronization (RFC 4533).
pub const OID_SYNC_REQUEST: &str = "1.3.6.1.4.1.4203.1.9.1.1";
pub const OID_SYNC_STATE: &str = "1.3.6.1.4.1.4203.1.9.1.2";
pub const OID_SYNC_DONE: &str = "1.3.6.1.4.1.4203.1.9.1.3";
/// SyncInfo intermediate response name (not a control, but lives with its
/// sibling OIDs).
pub const OID_SYNC_INFO: &str = "1.3.6.1.4.1.4203.1.9.1.4";

/// A control attached to a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub criticality: bool,
    pub value: ControlValue,
}

impl Control {
    pub fn new(oid: impl Into<String>, value: ControlValue) -> Self {
        Self {
            oid: oid.into(),
            criticality: false,
            value,
        }
    }

    pub fn critical(mut self) -> Self {
        self.criticality = true;
        self
    }

    pub fn with_criticality(mut self, criticality: bool) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn paging(size: u32, cookie: impl Into<Vec<u8>>) -> Self {
        Control::new(
            OID_PAGING,
            ControlValue::Paging(PagingValue {
                size,
                cookie: cookie.into(),
            }),
        )
    }

    pub fn sort(keys: Vec<SortKey>) -> Self {
        Control::new(OID_SORTING, ControlValue::Sorting(SortingValue { keys }))
    }

    pub fn vlv(before: u32, after: u32, offset: u32, content_count: u32) -> Self {
        Control::new(
            OID_VLV,
            ControlValue::Vlv(VlvValue {
                before,
                after,
                target: VlvTarget::Offset {
                    offset,
                    content_count,
                },
            }),
        )
    }

    pub fn dir_sync(flags: i64, max_bytes: i64, cookie: impl Into<Vec<u8>>) -> Self {
        Control::new(
            OID_DIR_SYNC,
            ControlValue::DirSyncRequest(DirSyncRequestValue {
                flags,
                max_bytes,
                cookie: cookie.into(),
            }),
        )
    }

    pub fn sync_request(mode: SyncMode, cookie: Option<Vec<u8>>, reload_hint: bool) -> Self {
        Control::new(
            OID_SYNC_REQUEST,
            ControlValue::SyncRequest(SyncRequestValue {
                mode,
                cookie,
                reload_hint,
            }),
        )
    }

    pub fn to_asn1(&self) -> Result<Asn1, LdapError> {
        let mut parts = vec![
            Asn1::octet_string(self.oid.as_bytes()),
            Asn1::Boolean(self.criticality),
        ];
        if let Some(bytes) = self.value.to_bytes()? {
            parts.push(Asn1::OctetString(bytes));
        }
        Ok(Asn1::Sequence(parts))
    }

    /// Decode the generic envelope. The value stays opaque; promotion to a
    /// typed value happens at the dispatch layer via [`ControlRegistry`].
    pub fn from_asn1(node: &Asn1) -> Result<Control, LdapError> {
        let parts = node.expect_sequence()?;
        let oid = parts
            .first()
            .ok_or_else(|| LdapError::Protocol("control envelope is empty".into()))?
            .expect_string()?;
        let mut criticality = false;
        let mut value = ControlValue::Absent;
        for part in &parts[1..] {
            match part {
                Asn1::Boolean(critical) => criticality = *critical,
                Asn1::OctetString(bytes) => value = ControlValue::Opaque(bytes.clone()),
                _ => {
                    return Err(LdapError::Protocol(format!(
                        "unexpected element in the control envelope for {oid}"
                    )))
                }
            }
        }
        Ok(Control {
            oid,
            criticality,
            value,
        })
    }
}

/// A control's value: absent, opaque octets, or one of the typed values the
/// registry knows how to promote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlValue {
    Absent,
    Opaque(Vec<u8>),
    Paging(PagingValue),
    Sorting(SortingValue),
    SortingResult(SortingResultValue),
    Vlv(VlvValue),
    VlvResponse(VlvResponseValue),
    DirSyncRequest(DirSyncRequestValue),
    DirSyncResponse(DirSyncResponseValue),
    SyncRequest(SyncRequestValue),
    SyncState(SyncStateValue),
    SyncDone(SyncDoneValue),
}

impl ControlValue {
    /// The embedded encoded form carried inside the envelope's value octet
    /// string, or None when the control has no value.
    pub fn to_bytes(&self) -> Result<Option<Vec<u8>>, LdapError> {
        let node = match self {
            ControlValue::Absent => return Ok(None),
            ControlValue::Opaque(bytes) => return Ok(Some(bytes.clone())),
            ControlValue::Paging(v) => v.to_asn1(),
            ControlValue::Sorting(v) => v.to_asn1(),
            ControlValue::SortingResult(v) => v.to_asn1(),
            ControlValue::Vlv(v) => v.to_asn1(),
            ControlValue::VlvResponse(v) => v.to_asn1(),
            ControlValue::DirSyncRequest(v) => v.to_asn1(),
            ControlValue::DirSyncResponse(v) => v.to_asn1(),
            ControlValue::SyncRequest(v) => v.to_asn1(),
            ControlValue::SyncState(v) => v.to_asn1(),
            ControlValue::SyncDone(v) => v.to_asn1(),
        };
        Ok(Some(asn1::encode(&node)))
    }
}

type EncodeFn = fn(&ControlValue) -> Result<Option<Vec<u8>>, LdapError>;
type DecodeFn = fn(&[u8]) -> Result<ControlValue, LdapError>;

/// Maps OIDs to value codecs. The standard registry knows the controls this
/// engine implements; callers may register further OIDs.
#[derive(Clone)]
pub struct ControlRegistry {
    codecs: HashMap<String, (EncodeFn, DecodeFn)>,
}

impl ControlRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(OID_PAGING, encode_value, paging::decode);
        registry.register(OID_SORTING, encode_value, vlv::decode_sorting);
        registry.register(OID_SORTING_RESPONSE, encode_value, vlv::decode_sorting_result);
        registry.register(OID_VLV, encode_value, vlv::decode_request);
        registry.register(OID_VLV_RESPONSE, encode_value, vlv::decode_response);
        registry.register(OID_DIR_SYNC, encode_value, dirsync::decode_response);
        registry.register(OID_SYNC_REQUEST, encode_value, sync::decode_request);
        registry.register(OID_SYNC_STATE, encode_value, sync::decode_state);
        registry.register(OID_SYNC_DONE, encode_value, sync::decode_done);
        registry
    }

    pub fn register(&mut self, oid: impl Into<String>, encode: EncodeFn, decode: DecodeFn) {
        self.codecs.insert(oid.into(), (encode, decode));
    }

    pub fn is_registered(&self, oid: &str) -> bool {
        self.codecs.contains_key(oid)
    }

    /// Promote an opaque control to its typed value.
    ///
    /// Unregistered non-critical controls pass through unchanged. A critical
    /// control with no registered decoder, or a registered value that fails
    /// to decode, is a protocol error; the caller decides whether that is
    /// fatal.
    pub fn promote(&self, control: Control) -> Result<Control, LdapError> {
        let bytes = match &control.value {
            ControlValue::Opaque(bytes) => bytes.clone(),
            _ => return Ok(control),
        };
        match self.codecs.get(&control.oid) {
            Some((_, decode)) => {
                let value = decode(&bytes)?;
                Ok(Control {
                    value,
                    ..control
                })
            }
            None if control.criticality => Err(LdapError::Protocol(format!(
                "no decoder registered for critical control {}",
                control.oid
            ))),
            None => Ok(control),
        }
    }

    pub fn encode_value(
        &self,
        oid: &str,
        value: &ControlValue,
    ) -> Result<Option<Vec<u8>>, LdapError> {
        match self.codecs.get(oid) {
            Some((encode, _)) => encode(value),
            None => value.to_bytes(),
        }
    }
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn encode_value(value: &ControlValue) -> Result<Option<Vec<u8>>, LdapError> {
    value.to_bytes()
}

/// An ordered set of controls, keyed by OID. Pushing a control with an OID
/// already present replaces it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Controls {
    items: Vec<Control>,
}

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(controls: Vec<Control>) -> Self {
        let mut set = Self::new();
        for control in controls {
            set.push(control);
        }
        set
    }

    pub fn push(&mut self, control: Control) {
        match self.items.iter_mut().find(|c| c.oid == control.oid) {
            Some(existing) => *existing = control,
            None => self.items.push(control),
        }
    }

    pub fn get(&self, oid: &str) -> Option<&Control> {
        self.items.iter().find(|c| c.oid == oid)
    }

    pub fn remove(&mut self, oid: &str) -> Option<Control> {
        let index = self.items.iter().position(|c| c.oid == oid)?;
        Some(self.items.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Control> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Promote every control through the registry.
    pub fn promote(self, registry: &ControlRegistry) -> Result<Controls, LdapError> {
        let mut promoted = Controls::new();
        for control in self.items {
            promoted.push(registry.promote(control)?);
        }
        Ok(promoted)
    }
}

impl IntoIterator for Controls {
    type Item = Control;
    type IntoIter = std::vec::IntoIter<Control>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl From<Vec<Control>> for Controls {
    fn from(controls: Vec<Control>) -> Self {
        Controls::from_vec(controls)
    }
}
