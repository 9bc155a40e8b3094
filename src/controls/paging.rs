//! Simple paged results control value (RFC 2696).
//!
//! realSearchControlValue ::= SEQUENCE {
//!     size   INTEGER,
//!     cookie OCTET STRING }

use crate::asn1::{self, Asn1};
use crate::controls::ControlValue;
use crate::error::LdapError;

/// On a request: the requested page size plus the cookie from the previous
/// response (empty on the first page). On a response: the server's size
/// estimate plus the continuation cookie (empty when the result is
/// complete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingValue {
    pub size: u32,
    pub cookie: Vec<u8>,
}

impl PagingValue {
    pub fn to_asn1(&self) -> Asn1 {
        Asn1::Sequence(vec![
            Asn1::Integer(self.size as i64),
            Asn1::OctetString(self.cookie.clone()),
        ])
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let node = asn1::decode(bytes)?;
        let parts = node.expect_sequence()?;
        if parts.len() != 2 {
            return Err(LdapError::Protocol("malformed paging control value".into()));
        }
        let size = parts[0].expect_integer()?;
        if size < 0 {
            return Err(LdapError::Protocol("negative paging size".into()));
        }
        Ok(PagingValue {
            size: size as u32,
            cookie: parts[1].expect_octet_string()?.to_vec(),
        })
    }
}

pub(super) fn decode(bytes: &[u8]) -> Result<ControlValue, LdapError> {
    Ok(ControlValue::Paging(PagingValue::from_bytes(bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_roundtrip() {
        let value = PagingValue {
            size: 500,
            cookie: b"opaque".to_vec(),
        };
        let bytes = asn1::encode(&value.to_asn1());
        assert_eq!(PagingValue::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn rejects_short_sequences() {
        let bytes = asn1::encode(&Asn1::Sequence(vec![Asn1::Integer(1)]));
        assert!(PagingValue::from_bytes(&bytes).is_err());
    }
}
