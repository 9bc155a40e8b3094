//! Virtual list view request/response control values, plus the server-side
//! sorting control a VLV search must be paired with (RFC 2891).

use crate::asn1::{self, Asn1, TagPayload};
use crate::controls::ControlValue;
use crate::error::LdapError;

const TARGET_BY_OFFSET: u8 = 0;
const TARGET_GREATER_OR_EQUAL: u8 = 1;

/// One key of a server-side sort:
///
/// SortKey ::= SEQUENCE {
///     attributeType AttributeDescription,
///     orderingRule  [0] MatchingRuleId OPTIONAL,
///     reverseOrder  [1] BOOLEAN DEFAULT FALSE }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub ordering_rule: Option<String>,
    pub reverse: bool,
}

impl SortKey {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ordering_rule: None,
            reverse: false,
        }
    }
}

/// Sort request value: SEQUENCE OF SortKey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortingValue {
    pub keys: Vec<SortKey>,
}

impl SortingValue {
    pub fn to_asn1(&self) -> Asn1 {
        Asn1::Sequence(
            self.keys
                .iter()
                .map(|key| {
                    let mut parts = vec![Asn1::octet_string(key.attribute.as_bytes())];
                    if let Some(rule) = &key.ordering_rule {
                        parts.push(Asn1::context_primitive(0, rule.as_bytes()));
                    }
                    if key.reverse {
                        parts.push(Asn1::context_primitive(1, vec![0xFF]));
                    }
                    Asn1::Sequence(parts)
                })
                .collect(),
        )
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let node = asn1::decode(bytes)?;
        let mut keys = Vec::new();
        for key_node in node.expect_sequence()? {
            let parts = key_node.expect_sequence()?;
            let attribute = parts
                .first()
                .ok_or_else(|| LdapError::Protocol("empty sort key".into()))?
                .expect_string()?;
            let mut key = SortKey::new(attribute);
            for part in &parts[1..] {
                match part {
                    Asn1::Context(0, TagPayload::Primitive(rule)) => {
                        key.ordering_rule = Some(String::from_utf8_lossy(rule).into_owned());
                    }
                    Asn1::Context(1, TagPayload::Primitive(flag)) => {
                        key.reverse = flag.first().is_some_and(|b| *b != 0);
                    }
                    _ => return Err(LdapError::Protocol("malformed sort key".into())),
                }
            }
            keys.push(key);
        }
        Ok(SortingValue { keys })
    }
}

/// Sort response value:
///
/// SortResult ::= SEQUENCE {
///     sortResult    ENUMERATED,
///     attributeType [0] AttributeDescription OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortingResultValue {
    pub result: u32,
    pub attribute: Option<String>,
}

impl SortingResultValue {
    pub fn to_asn1(&self) -> Asn1 {
        let mut parts = vec![Asn1::Enumerated(self.result as i64)];
        if let Some(attribute) = &self.attribute {
            parts.push(Asn1::context_primitive(0, attribute.as_bytes()));
        }
        Asn1::Sequence(parts)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let node = asn1::decode(bytes)?;
        let parts = node.expect_sequence()?;
        let result = parts
            .first()
            .ok_or_else(|| LdapError::Protocol("empty sort result".into()))?
            .expect_enumerated()?;
        let attribute = match parts.get(1) {
            Some(Asn1::Context(0, TagPayload::Primitive(attr))) => {
                Some(String::from_utf8_lossy(attr).into_owned())
            }
            None => None,
            _ => return Err(LdapError::Protocol("malformed sort result".into())),
        };
        Ok(SortingResultValue {
            result: result as u32,
            attribute,
        })
    }
}

/// The window target of a VLV request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlvTarget {
    /// byOffset [0] SEQUENCE { offset INTEGER, contentCount INTEGER }
    Offset { offset: u32, content_count: u32 },
    /// greaterThanOrEqual [1] AssertionValue
    GreaterOrEqual(Vec<u8>),
}

/// VirtualListViewRequest ::= SEQUENCE {
///     beforeCount INTEGER,
///     afterCount  INTEGER,
///     target      CHOICE { byOffset [0] ..., greaterThanOrEqual [1] ... } }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvValue {
    pub before: u32,
    pub after: u32,
    pub target: VlvTarget,
}

impl VlvValue {
    pub fn to_asn1(&self) -> Asn1 {
        let target = match &self.target {
            VlvTarget::Offset {
                offset,
                content_count,
            } => Asn1::context(
                TARGET_BY_OFFSET,
                vec![
                    Asn1::Integer(*offset as i64),
                    Asn1::Integer(*content_count as i64),
                ],
            ),
            VlvTarget::GreaterOrEqual(value) => {
                Asn1::context_primitive(TARGET_GREATER_OR_EQUAL, value.clone())
            }
        };
        Asn1::Sequence(vec![
            Asn1::Integer(self.before as i64),
            Asn1::Integer(self.after as i64),
            target,
        ])
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let node = asn1::decode(bytes)?;
        let parts = node.expect_sequence()?;
        if parts.len() != 3 {
            return Err(LdapError::Protocol("malformed VLV request value".into()));
        }
        let before = parts[0].expect_integer()?;
        let after = parts[1].expect_integer()?;
        let target = match &parts[2] {
            Asn1::Context(TARGET_BY_OFFSET, TagPayload::Constructed(children)) => {
                if children.len() != 2 {
                    return Err(LdapError::Protocol("malformed VLV byOffset target".into()));
                }
                VlvTarget::Offset {
                    offset: children[0].expect_integer()? as u32,
                    content_count: children[1].expect_integer()? as u32,
                }
            }
            Asn1::Context(TARGET_GREATER_OR_EQUAL, TagPayload::Primitive(value)) => {
                VlvTarget::GreaterOrEqual(value.clone())
            }
            _ => return Err(LdapError::Protocol("malformed VLV target".into())),
        };
        Ok(VlvValue {
            before: before as u32,
            after: after as u32,
            target,
        })
    }
}

/// VirtualListViewResponse ::= SEQUENCE {
///     targetPosition INTEGER,
///     contentCount   INTEGER,
///     virtualListViewResult ENUMERATED,
///     contextID      OCTET STRING OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvResponseValue {
    pub target_position: u32,
    pub content_count: u32,
    pub result: u32,
    pub context_id: Option<Vec<u8>>,
}

impl VlvResponseValue {
    pub fn to_asn1(&self) -> Asn1 {
        let mut parts = vec![
            Asn1::Integer(self.target_position as i64),
            Asn1::Integer(self.content_count as i64),
            Asn1::Enumerated(self.result as i64),
        ];
        if let Some(context_id) = &self.context_id {
            parts.push(Asn1::OctetString(context_id.clone()));
        }
        Asn1::Sequence(parts)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LdapError> {
        let node = asn1::decode(bytes)?;
        let parts = node.expect_sequence()?;
        if parts.len() < 3 || parts.len() > 4 {
            return Err(LdapError::Protocol("malformed VLV response value".into()));
        }
        Ok(VlvResponseValue {
            target_position: parts[0].expect_integer()? as u32,
            content_count: parts[1].expect_integer()? as u32,
            result: parts[2].expect_enumerated()? as u32,
            context_id: match parts.get(3) {
                Some(node) => Some(node.expect_octet_string()?.to_vec()),
                None => None,
            },
        })
    }
}

pub(super) fn decode_sorting(bytes: &[u8]) -> Result<ControlValue, LdapError> {
    Ok(ControlValue::Sorting(SortingValue::from_bytes(bytes)?))
}

pub(super) fn decode_sorting_result(bytes: &[u8]) -> Result<ControlValue, LdapError> {
    Ok(ControlValue::SortingResult(SortingResultValue::from_bytes(
        bytes,
    )?))
}

pub(super) fn decode_request(bytes: &[u8]) -> Result<ControlValue, LdapError> {
    Ok(ControlValue::Vlv(VlvValue::from_bytes(bytes)?))
}

pub(super) fn decode_response(bytes: &[u8]) -> Result<ControlValue, LdapError> {
    Ok(ControlValue::VlvResponse(VlvResponseValue::from_bytes(
        bytes,
    )?))
}
