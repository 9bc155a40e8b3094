//! Active Directory DirSync control values (MS-ADTS 3.1.1.3.4.1.3).
//!
//! Request and response share one OID and one shape:
//! SEQUENCE { flags INTEGER, maxBytes INTEGER, cookie OCTET STRING }.
//! On the response the first integer is the more-results indicator.

use crate::asn1::{self, Asn1};
use crate::controls::ControlValue;
use crate::error::LdapError;

/// Return parent objects before their children.
pub const DIR_SYNC_ANCESTORS_FIRST_ORDER: i64 = 0x0000_0800;
/// Only return objects and attributes the caller has rights to.
pub const DIR_SYNC_OBJECT_SECURITY: i64 = 0x0000_0001;
/// Only return changed values of multi-valued attributes.
pub const DIR_SYNC_INCREMENTAL_VALUES: i64 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSyncRequestValue {
    pub flags: i64,
    pub max_bytes: i64,
    pub cookie: Vec<u8>,
}

impl DirSyncRequestValue {
    pub fn to_asn1(&self) -> Asn1 {
        Asn1::Sequence(vec![
            Asn1::Integer(self.flags),
            Asn1::Integer(self.max_bytes),
            Asn1::OctetString(self.cookie.clone()),
        ])
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let (first, second, cookie) = decode_triple(bytes)?;
        Ok(DirSyncRequestValue {
            flags: first,
            max_bytes: second,
            cookie,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSyncResponseValue {
    /// Non-zero when the server holds further changes for this cookie.
    pub more_results: bool,
    pub unused: i64,
    pub cookie: Vec<u8>,
}

impl DirSyncResponseValue {
    pub fn to_asn1(&self) -> Asn1 {
        Asn1::Sequence(vec![
            Asn1::Integer(self.more_results as i64),
            Asn1::Integer(self.unused),
            Asn1::OctetString(self.cookie.clone()),
        ])
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let (first, second, cookie) = decode_triple(bytes)?;
        Ok(DirSyncResponseValue {
            more_results: first != 0,
            unused: second,
            cookie,
        })
    }
}

fn decode_triple(bytes: &[u8]) -> Result<(i64, i64, Vec<u8>), LdapError> {
    let node = asn1::decode(bytes)?;
    let parts = node.expect_sequence()?;
    if parts.len() != 3 {
        return Err(LdapError::Protocol("malformed DirSync control value".into()));
    }
    Ok((
        parts[0].expect_integer()?,
        parts[1].expect_integer()?,
        parts[2].expect_octet_string()?.to_vec(),
    ))
}

/// Responses are what a client promotes; requests are decoded explicitly by
/// servers that route the control.
pub(super) fn decode_response(bytes: &[u8]) -> Result<ControlValue, LdapError> {
    Ok(ControlValue::DirSyncResponse(
        DirSyncResponseValue::from_bytes(bytes)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let value = DirSyncRequestValue {
            flags: DIR_SYNC_INCREMENTAL_VALUES | DIR_SYNC_OBJECT_SECURITY,
            max_bytes: 0,
            cookie: b"ad-cookie".to_vec(),
        };
        let bytes = asn1::encode(&value.to_asn1());
        assert_eq!(DirSyncRequestValue::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn response_roundtrip() {
        let value = DirSyncResponseValue {
            more_results: true,
            unused: 0,
            cookie: b"next".to_vec(),
        };
        let bytes = asn1::encode(&value.to_asn1());
        assert_eq!(DirSyncResponseValue::from_bytes(&bytes).unwrap(), value);
    }
}
