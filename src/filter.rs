//! Search filter grammar: RFC 4515 string form, RFC 4511 wire form, and the
//! AST between them.
//!
//! Filter ::= CHOICE {
//!     and             [0] SET SIZE (1..MAX) OF filter Filter,
//!     or              [1] SET SIZE (1..MAX) OF filter Filter,
//!     not             [2] Filter,
//!     equalityMatch   [3] AttributeValueAssertion,
//!     substrings      [4] SubstringFilter,
//!     greaterOrEqual  [5] AttributeValueAssertion,
//!     lessOrEqual     [6] AttributeValueAssertion,
//!     present         [7] AttributeDescription,
//!     approxMatch     [8] AttributeValueAssertion,
//!     extensibleMatch [9] MatchingRuleAssertion }

use crate::asn1::{Asn1, TagPayload};
use crate::error::{FilterParseError, LdapError};
use std::fmt;
use std::str::FromStr;

const TAG_AND: u8 = 0;
const TAG_OR: u8 = 1;
const TAG_NOT: u8 = 2;
const TAG_EQUALITY: u8 = 3;
const TAG_SUBSTRINGS: u8 = 4;
const TAG_GREATER_OR_EQUAL: u8 = 5;
const TAG_LESS_OR_EQUAL: u8 = 6;
const TAG_PRESENT: u8 = 7;
const TAG_APPROX: u8 = 8;
const TAG_EXTENSIBLE: u8 = 9;

const SUBSTRING_INITIAL: u8 = 0;
const SUBSTRING_ANY: u8 = 1;
const SUBSTRING_FINAL: u8 = 2;

const EXT_MATCHING_RULE: u8 = 1;
const EXT_ATTRIBUTE: u8 = 2;
const EXT_VALUE: u8 = 3;
const EXT_DN_ATTRIBUTES: u8 = 4;

/// A search filter AST node. Assertion values are raw octets; the string
/// form escapes them as `\XX` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Equality {
        attribute: String,
        value: Vec<u8>,
    },
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        r#final: Option<Vec<u8>>,
    },
    GreaterOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    LessOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    Approx {
        attribute: String,
        value: Vec<u8>,
    },
    Present {
        attribute: String,
    },
    Extensible {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl FilterNode {
    pub fn equality(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        FilterNode::Equality {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        FilterNode::Present {
            attribute: attribute.into(),
        }
    }

    pub fn and(filters: Vec<FilterNode>) -> Self {
        FilterNode::And(filters)
    }

    pub fn or(filters: Vec<FilterNode>) -> Self {
        FilterNode::Or(filters)
    }

    pub fn not(filter: FilterNode) -> Self {
        FilterNode::Not(Box::new(filter))
    }

    pub fn greater_or_equal(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        FilterNode::GreaterOrEqual {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn less_or_equal(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        FilterNode::LessOrEqual {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn starts_with(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        FilterNode::Substrings {
            attribute: attribute.into(),
            initial: Some(value.into()),
            any: Vec::new(),
            r#final: None,
        }
    }

    /// Parse the RFC 4515 string form.
    pub fn parse(input: &str) -> Result<FilterNode, FilterParseError> {
        Parser::new(input).parse()
    }

    /// Encode to the RFC 4511 wire choice.
    pub fn to_asn1(&self) -> Asn1 {
        match self {
            FilterNode::And(filters) => {
                Asn1::context(TAG_AND, filters.iter().map(FilterNode::to_asn1).collect())
            }
            FilterNode::Or(filters) => {
                Asn1::context(TAG_OR, filters.iter().map(FilterNode::to_asn1).collect())
            }
            FilterNode::Not(filter) => Asn1::context(TAG_NOT, vec![filter.to_asn1()]),
            FilterNode::Equality { attribute, value } => {
                assertion_to_asn1(TAG_EQUALITY, attribute, value)
            }
            FilterNode::GreaterOrEqual { attribute, value } => {
                assertion_to_asn1(TAG_GREATER_OR_EQUAL, attribute, value)
            }
            FilterNode::LessOrEqual { attribute, value } => {
                assertion_to_asn1(TAG_LESS_OR_EQUAL, attribute, value)
            }
            FilterNode::Approx { attribute, value } => {
                assertion_to_asn1(TAG_APPROX, attribute, value)
            }
            FilterNode::Present { attribute } => {
                Asn1::context_primitive(TAG_PRESENT, attribute.as_bytes())
            }
            FilterNode::Substrings {
                attribute,
                initial,
                any,
                r#final,
            } => {
                let mut parts = Vec::new();
                if let Some(initial) = initial {
                    parts.push(Asn1::context_primitive(SUBSTRING_INITIAL, initial.clone()));
                }
                for part in any {
                    parts.push(Asn1::context_primitive(SUBSTRING_ANY, part.clone()));
                }
                if let Some(fin) = r#final {
                    parts.push(Asn1::context_primitive(SUBSTRING_FINAL, fin.clone()));
                }
                Asn1::context(
                    TAG_SUBSTRINGS,
                    vec![
                        Asn1::octet_string(attribute.as_bytes()),
                        Asn1::Sequence(parts),
                    ],
                )
            }
            FilterNode::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                let mut parts = Vec::new();
                if let Some(rule) = matching_rule {
                    parts.push(Asn1::context_primitive(EXT_MATCHING_RULE, rule.as_bytes()));
                }
                if let Some(attribute) = attribute {
                    parts.push(Asn1::context_primitive(EXT_ATTRIBUTE, attribute.as_bytes()));
                }
                parts.push(Asn1::context_primitive(EXT_VALUE, value.clone()));
                if *dn_attributes {
                    parts.push(Asn1::context_primitive(EXT_DN_ATTRIBUTES, vec![0xFF]));
                }
                Asn1::context(TAG_EXTENSIBLE, parts)
            }
        }
    }

    /// Decode from the RFC 4511 wire choice.
    pub fn from_asn1(node: &Asn1) -> Result<FilterNode, LdapError> {
        let (tag, payload) = match node {
            Asn1::Context(tag, payload) => (*tag, payload),
            _ => return Err(LdapError::Protocol("filter is not context-tagged".into())),
        };
        match tag {
            TAG_AND | TAG_OR => {
                let children = constructed(payload, "and/or filter")?;
                let filters = children
                    .iter()
                    .map(FilterNode::from_asn1)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if tag == TAG_AND {
                    FilterNode::And(filters)
                } else {
                    FilterNode::Or(filters)
                })
            }
            TAG_NOT => {
                let children = constructed(payload, "not filter")?;
                if children.len() != 1 {
                    return Err(LdapError::Protocol(
                        "a not filter must wrap exactly one filter".into(),
                    ));
                }
                Ok(FilterNode::not(FilterNode::from_asn1(&children[0])?))
            }
            TAG_EQUALITY | TAG_GREATER_OR_EQUAL | TAG_LESS_OR_EQUAL | TAG_APPROX => {
                let (attribute, value) = assertion_from_asn1(payload)?;
                Ok(match tag {
                    TAG_EQUALITY => FilterNode::Equality { attribute, value },
                    TAG_GREATER_OR_EQUAL => FilterNode::GreaterOrEqual { attribute, value },
                    TAG_LESS_OR_EQUAL => FilterNode::LessOrEqual { attribute, value },
                    _ => FilterNode::Approx { attribute, value },
                })
            }
            TAG_SUBSTRINGS => substrings_from_asn1(payload),
            TAG_PRESENT => match payload {
                TagPayload::Primitive(bytes) => Ok(FilterNode::Present {
                    attribute: String::from_utf8(bytes.clone()).map_err(|_| {
                        LdapError::Protocol("present filter attribute is not UTF-8".into())
                    })?,
                }),
                TagPayload::Constructed(_) => {
                    Err(LdapError::Protocol("present filter must be primitive".into()))
                }
            },
            TAG_EXTENSIBLE => extensible_from_asn1(payload),
            _ => Err(LdapError::Protocol(format!("unknown filter tag {tag}"))),
        }
    }
}

fn assertion_to_asn1(tag: u8, attribute: &str, value: &[u8]) -> Asn1 {
    Asn1::context(
        tag,
        vec![
            Asn1::octet_string(attribute.as_bytes()),
            Asn1::octet_string(value),
        ],
    )
}

fn constructed<'a>(payload: &'a TagPayload, what: &str) -> Result<&'a [Asn1], LdapError> {
    match payload {
        TagPayload::Constructed(children) => Ok(children),
        TagPayload::Primitive(_) => {
            Err(LdapError::Protocol(format!("{what} must be constructed")))
        }
    }
}

fn assertion_from_asn1(payload: &TagPayload) -> Result<(String, Vec<u8>), LdapError> {
    let children = constructed(payload, "attribute value assertion")?;
    if children.len() != 2 {
        return Err(LdapError::Protocol(
            "an attribute value assertion has exactly two elements".into(),
        ));
    }
    let attribute = children[0].expect_string()?;
    let value = children[1].expect_octet_string()?.to_vec();
    Ok((attribute, value))
}

fn substrings_from_asn1(payload: &TagPayload) -> Result<FilterNode, LdapError> {
    let children = constructed(payload, "substring filter")?;
    if children.len() != 2 {
        return Err(LdapError::Protocol("the substring filter is malformed".into()));
    }
    let attribute = children[0].expect_string()?;
    let parts = children[1].expect_sequence()?;
    if parts.is_empty() {
        return Err(LdapError::Protocol(
            "the substring sequence must not be empty".into(),
        ));
    }

    let mut initial = None;
    let mut any = Vec::new();
    let mut fin = None;
    for (index, part) in parts.iter().enumerate() {
        let (tag, bytes) = match part {
            Asn1::Context(tag, TagPayload::Primitive(bytes)) => (*tag, bytes.clone()),
            _ => return Err(LdapError::Protocol("the substring filter is malformed".into())),
        };
        match tag {
            // initial can occur at most once and only as the first element
            SUBSTRING_INITIAL => {
                if index != 0 || initial.is_some() {
                    return Err(LdapError::Protocol(
                        "the substring filter is malformed".into(),
                    ));
                }
                initial = Some(bytes);
            }
            SUBSTRING_ANY => any.push(bytes),
            SUBSTRING_FINAL => {
                if fin.is_some() {
                    return Err(LdapError::Protocol(
                        "the substring filter is malformed".into(),
                    ));
                }
                fin = Some(bytes);
            }
            _ => {
                return Err(LdapError::Protocol(
                    "the substring filter is malformed".into(),
                ))
            }
        }
    }
    Ok(FilterNode::Substrings {
        attribute,
        initial,
        any,
        r#final: fin,
    })
}

fn extensible_from_asn1(payload: &TagPayload) -> Result<FilterNode, LdapError> {
    let children = constructed(payload, "extensible filter")?;
    let mut matching_rule = None;
    let mut attribute = None;
    let mut value = None;
    let mut dn_attributes = false;
    for child in children {
        let (tag, bytes) = match child {
            Asn1::Context(tag, TagPayload::Primitive(bytes)) => (*tag, bytes),
            _ => return Err(LdapError::Protocol("the extensible filter is malformed".into())),
        };
        match tag {
            EXT_MATCHING_RULE => {
                matching_rule = Some(String::from_utf8(bytes.clone()).map_err(|_| {
                    LdapError::Protocol("matching rule is not UTF-8".into())
                })?)
            }
            EXT_ATTRIBUTE => {
                attribute = Some(String::from_utf8(bytes.clone()).map_err(|_| {
                    LdapError::Protocol("extensible attribute is not UTF-8".into())
                })?)
            }
            EXT_VALUE => value = Some(bytes.clone()),
            EXT_DN_ATTRIBUTES => dn_attributes = bytes.first().is_some_and(|b| *b != 0),
            _ => return Err(LdapError::Protocol("the extensible filter is malformed".into())),
        }
    }
    let value =
        value.ok_or_else(|| LdapError::Protocol("extensible filter has no value".into()))?;
    if matching_rule.is_none() && attribute.is_none() {
        return Err(LdapError::Protocol(
            "extensible filter needs a matching rule or an attribute".into(),
        ));
    }
    Ok(FilterNode::Extensible {
        matching_rule,
        attribute,
        value,
        dn_attributes,
    })
}

impl fmt::Display for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterNode::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            FilterNode::Or(filters) => {
                write!(f, "(|")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            FilterNode::Not(filter) => write!(f, "(!{filter})"),
            FilterNode::Equality { attribute, value } => {
                write!(f, "({attribute}={})", escape_bytes(value))
            }
            FilterNode::GreaterOrEqual { attribute, value } => {
                write!(f, "({attribute}>={})", escape_bytes(value))
            }
            FilterNode::LessOrEqual { attribute, value } => {
                write!(f, "({attribute}<={})", escape_bytes(value))
            }
            FilterNode::Approx { attribute, value } => {
                write!(f, "({attribute}~={})", escape_bytes(value))
            }
            FilterNode::Present { attribute } => write!(f, "({attribute}=*)"),
            FilterNode::Substrings {
                attribute,
                initial,
                any,
                r#final,
            } => {
                let mut value = String::new();
                if !any.is_empty() {
                    value.push('*');
                    for (i, part) in any.iter().enumerate() {
                        if i > 0 {
                            value.push('*');
                        }
                        value.push_str(&escape_bytes(part));
                    }
                    value.push('*');
                }
                if let Some(initial) = initial {
                    let initial = escape_bytes(initial);
                    value = if value.is_empty() {
                        format!("{initial}*")
                    } else {
                        format!("{initial}{value}")
                    };
                }
                if let Some(fin) = r#final {
                    let fin = escape_bytes(fin);
                    value = if value.is_empty() {
                        format!("*{fin}")
                    } else {
                        format!("{value}{fin}")
                    };
                }
                write!(f, "({attribute}={value})")
            }
            FilterNode::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                write!(f, "(")?;
                if let Some(attribute) = attribute {
                    write!(f, "{attribute}")?;
                }
                if *dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(rule) = matching_rule {
                    write!(f, ":{rule}")?;
                }
                write!(f, ":={})", escape_bytes(value))
            }
        }
    }
}

impl FromStr for FilterNode {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterNode::parse(s)
    }
}

/// Escape an assertion value for the string form of a filter. A value that
/// is already entirely `\XX` hex pairs passes through unchanged.
pub fn escape(value: &str) -> String {
    if is_fully_hex_escaped(value) {
        return value.to_string();
    }
    escape_bytes(value.as_bytes())
}

fn escape_bytes(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value {
        match b {
            b'(' | b')' | b'\\' | b'*' | 0x00 => out.push_str(&format!("\\{b:02x}")),
            0x01..=0x1F | 0x7F..=0xFF => out.push_str(&format!("\\{b:02x}")),
            _ => out.push(b as char),
        }
    }
    out
}

fn is_fully_hex_escaped(value: &str) -> bool {
    if value.is_empty() || value.len() % 3 != 0 {
        return false;
    }
    value.as_bytes().chunks(3).all(|chunk| {
        chunk[0] == b'\\' && chunk[1].is_ascii_hexdigit() && chunk[2].is_ascii_hexdigit()
    })
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.trim().as_bytes(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<FilterNode, FilterParseError> {
        if self.bytes.is_empty() {
            return Err(FilterParseError::new(0, "empty filter"));
        }
        let node = self.parse_filter()?;
        if self.pos != self.bytes.len() {
            return Err(FilterParseError::new(
                self.pos,
                "unexpected characters after the filter",
            ));
        }
        Ok(node)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), FilterParseError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(FilterParseError::new(
                self.pos,
                format!("expected '{}'", byte as char),
            ))
        }
    }

    fn parse_filter(&mut self) -> Result<FilterNode, FilterParseError> {
        self.expect(b'(')?;
        let node = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                FilterNode::And(self.parse_filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                FilterNode::Or(self.parse_filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                FilterNode::not(self.parse_filter()?)
            }
            Some(b')') => return Err(FilterParseError::new(self.pos, "empty filter component")),
            Some(_) => self.parse_item()?,
            None => return Err(FilterParseError::new(self.pos, "unbalanced parentheses")),
        };
        self.expect(b')')
            .map_err(|e| FilterParseError::new(e.offset, "unbalanced parentheses"))?;
        Ok(node)
    }

    fn parse_filter_list(&mut self) -> Result<Vec<FilterNode>, FilterParseError> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.parse_filter()?);
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> Result<FilterNode, FilterParseError> {
        let start = self.pos;
        let end = self.bytes[self.pos..]
            .iter()
            .position(|&b| b == b')')
            .map(|i| self.pos + i)
            .ok_or_else(|| FilterParseError::new(self.pos, "unbalanced parentheses"))?;
        let item = &self.bytes[start..end];
        if item.iter().any(|&b| b == b'(') {
            return Err(FilterParseError::new(start, "nesting must use parentheses"));
        }
        self.pos = end;

        let eq = item
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| FilterParseError::new(start, "missing '=' in filter component"))?;
        if eq == 0 {
            return Err(FilterParseError::new(start, "missing attribute description"));
        }

        let value = &item[eq + 1..];
        let node = match item[eq - 1] {
            b'>' => FilterNode::GreaterOrEqual {
                attribute: self.attribute(&item[..eq - 1], start)?,
                value: unescape(value, start + eq + 1)?,
            },
            b'<' => FilterNode::LessOrEqual {
                attribute: self.attribute(&item[..eq - 1], start)?,
                value: unescape(value, start + eq + 1)?,
            },
            b'~' => FilterNode::Approx {
                attribute: self.attribute(&item[..eq - 1], start)?,
                value: unescape(value, start + eq + 1)?,
            },
            b':' => self.parse_extensible(&item[..eq - 1], value, start)?,
            _ => self.parse_value_match(&item[..eq], value, start, start + eq + 1)?,
        };
        Ok(node)
    }

    fn attribute(&self, bytes: &[u8], offset: usize) -> Result<String, FilterParseError> {
        if bytes.is_empty() {
            return Err(FilterParseError::new(offset, "missing attribute description"));
        }
        if bytes.iter().any(|&b| b == b'*' || b == b'\\') {
            return Err(FilterParseError::new(offset, "malformed attribute description"));
        }
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Equality, present or substring, depending on where `*` appears.
    fn parse_value_match(
        &self,
        attribute: &[u8],
        value: &[u8],
        start: usize,
        value_offset: usize,
    ) -> Result<FilterNode, FilterParseError> {
        let attribute = self.attribute(attribute, start)?;
        if value == b"*" {
            return Ok(FilterNode::Present { attribute });
        }
        if !value.contains(&b'*') {
            return Ok(FilterNode::Equality {
                attribute,
                value: unescape(value, value_offset)?,
            });
        }
        // Literal '*' must be written \2a, so every raw '*' is a separator.
        let segments: Vec<&[u8]> = value.split(|&b| b == b'*').collect();
        let initial = match segments[0] {
            b"" => None,
            seg => Some(unescape(seg, value_offset)?),
        };
        let fin = match segments[segments.len() - 1] {
            b"" => None,
            seg => Some(unescape(seg, value_offset)?),
        };
        let mut any = Vec::new();
        for seg in &segments[1..segments.len() - 1] {
            if seg.is_empty() {
                return Err(FilterParseError::new(value_offset, "empty substring component"));
            }
            any.push(unescape(seg, value_offset)?);
        }
        Ok(FilterNode::Substrings {
            attribute,
            initial,
            any,
            r#final: fin,
        })
    }

    /// `attr:dn:rule:=value` and its abbreviations. The trailing ':' of
    /// ':=' has already been stripped by the caller.
    fn parse_extensible(
        &self,
        spec: &[u8],
        value: &[u8],
        start: usize,
    ) -> Result<FilterNode, FilterParseError> {
        let spec = String::from_utf8_lossy(spec);
        let mut parts = spec.split(':');
        let attribute = match parts.next() {
            Some("") | None => None,
            Some(attr) => Some(attr.to_string()),
        };
        let mut dn_attributes = false;
        let mut matching_rule = None;
        for part in parts {
            if part.eq_ignore_ascii_case("dn") {
                if dn_attributes {
                    return Err(FilterParseError::new(start, "duplicate ':dn' marker"));
                }
                dn_attributes = true;
            } else if matching_rule.is_none() {
                matching_rule = Some(part.to_string());
            } else {
                return Err(FilterParseError::new(start, "more than one matching rule"));
            }
        }
        if attribute.is_none() && matching_rule.is_none() {
            return Err(FilterParseError::new(
                start,
                "extensible match needs an attribute or a matching rule",
            ));
        }
        Ok(FilterNode::Extensible {
            matching_rule,
            attribute,
            value: unescape(value, start)?,
            dn_attributes,
        })
    }
}

fn unescape(segment: &[u8], offset: usize) -> Result<Vec<u8>, FilterParseError> {
    let mut out = Vec::with_capacity(segment.len());
    let mut i = 0;
    while i < segment.len() {
        let b = segment[i];
        if b == b'\\' {
            let hex = segment
                .get(i + 1..i + 3)
                .ok_or_else(|| FilterParseError::new(offset + i, "truncated escape sequence"))?;
            let hi = hex_digit(hex[0]).ok_or_else(|| {
                FilterParseError::new(offset + i, "invalid hex digit in escape sequence")
            })?;
            let lo = hex_digit(hex[1]).ok_or_else(|| {
                FilterParseError::new(offset + i, "invalid hex digit in escape sequence")
            })?;
            out.push((hi << 4) | lo);
            i += 3;
        } else {
            out.push(b);
            i += 1;
        }
    }
    Ok(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(text: &str) -> FilterNode {
        let parsed = FilterNode::parse(text).unwrap();
        let reparsed = FilterNode::parse(&parsed.to_string()).unwrap();
        assert_eq!(parsed, reparsed, "text roundtrip for {text}");
        let wire = crate::asn1::encode(&parsed.to_asn1());
        let from_wire = FilterNode::from_asn1(&crate::asn1::decode(&wire).unwrap()).unwrap();
        assert_eq!(parsed, from_wire, "wire roundtrip for {text}");
        parsed
    }

    #[test]
    fn parses_the_composite_example() {
        let text = "(&(objectClass=inetOrgPerson)(cn=A*))";
        let node = FilterNode::parse(text).unwrap();
        assert_eq!(
            node,
            FilterNode::And(vec![
                FilterNode::equality("objectClass", "inetOrgPerson"),
                FilterNode::starts_with("cn", "A"),
            ])
        );
        assert_eq!(node.to_string(), text);
    }

    #[test]
    fn roundtrips_every_shape() {
        roundtrip("(cn=jane)");
        roundtrip("(cn=*)");
        roundtrip("(cn=A*)");
        roundtrip("(cn=*son)");
        roundtrip("(cn=A*mi*son)");
        roundtrip("(cn=*mi*)");
        roundtrip("(age>=21)");
        roundtrip("(age<=65)");
        roundtrip("(cn~=jane)");
        roundtrip("(!(cn=jane))");
        roundtrip("(|(cn=a)(cn=b)(cn=c))");
        roundtrip("(&(objectClass=person)(|(sn=a)(sn=b))(!(uid=x)))");
        roundtrip("(cn:caseExactMatch:=Jane)");
        roundtrip("(cn:dn:2.5.13.5:=Jane)");
        roundtrip("(:2.5.13.5:=Jane)");
    }

    #[test]
    fn escaped_values_roundtrip() {
        let node = roundtrip(r"(cn=\28paren\29\2a\5c)");
        assert_eq!(node, FilterNode::equality("cn", &b"(paren)*\\"[..]));
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(FilterNode::parse("").is_err());
        assert!(FilterNode::parse("()").is_err());
        assert!(FilterNode::parse("(cn=jane").is_err());
        assert!(FilterNode::parse("(cn=jane))").is_err());
        assert!(FilterNode::parse("(=jane)").is_err());
        assert!(FilterNode::parse("(cn)").is_err());
        assert!(FilterNode::parse("(cn=a)(cn=b)").is_err());
        assert!(FilterNode::parse("(&cn=a)").is_err());
        assert!(FilterNode::parse(r"(cn=\2)").is_err());
        assert!(FilterNode::parse(r"(cn=\zz)").is_err());
    }

    #[test]
    fn substring_wire_rules() {
        // empty substring sequence
        let node = Asn1::context(
            TAG_SUBSTRINGS,
            vec![Asn1::octet_string("cn"), Asn1::Sequence(vec![])],
        );
        assert!(FilterNode::from_asn1(&node).is_err());

        // two initial components
        let node = Asn1::context(
            TAG_SUBSTRINGS,
            vec![
                Asn1::octet_string("cn"),
                Asn1::Sequence(vec![
                    Asn1::context_primitive(0, "a"),
                    Asn1::context_primitive(0, "b"),
                ]),
            ],
        );
        assert!(FilterNode::from_asn1(&node).is_err());

        // initial not first
        let node = Asn1::context(
            TAG_SUBSTRINGS,
            vec![
                Asn1::octet_string("cn"),
                Asn1::Sequence(vec![
                    Asn1::context_primitive(1, "a"),
                    Asn1::context_primitive(0, "b"),
                ]),
            ],
        );
        assert!(FilterNode::from_asn1(&node).is_err());

        // two final components
        let node = Asn1::context(
            TAG_SUBSTRINGS,
            vec![
                Asn1::octet_string("cn"),
                Asn1::Sequence(vec![
                    Asn1::context_primitive(2, "a"),
                    Asn1::context_primitive(2, "b"),
                ]),
            ],
        );
        assert!(FilterNode::from_asn1(&node).is_err());

        // unknown component tag
        let node = Asn1::context(
            TAG_SUBSTRINGS,
            vec![
                Asn1::octet_string("cn"),
                Asn1::Sequence(vec![Asn1::context_primitive(3, "a")]),
            ],
        );
        assert!(FilterNode::from_asn1(&node).is_err());

        // repeatable any components, in any position
        let node = Asn1::context(
            TAG_SUBSTRINGS,
            vec![
                Asn1::octet_string("cn"),
                Asn1::Sequence(vec![
                    Asn1::context_primitive(0, "a"),
                    Asn1::context_primitive(1, "b"),
                    Asn1::context_primitive(1, "c"),
                    Asn1::context_primitive(2, "d"),
                ]),
            ],
        );
        let parsed = FilterNode::from_asn1(&node).unwrap();
        assert_eq!(
            parsed,
            FilterNode::Substrings {
                attribute: "cn".into(),
                initial: Some(b"a".to_vec()),
                any: vec![b"b".to_vec(), b"c".to_vec()],
                r#final: Some(b"d".to_vec()),
            }
        );
    }

    #[test]
    fn wire_tags_are_fixed() {
        let cases: Vec<(FilterNode, u8)> = vec![
            (FilterNode::and(vec![FilterNode::present("a")]), 0xA0),
            (FilterNode::or(vec![FilterNode::present("a")]), 0xA1),
            (FilterNode::not(FilterNode::present("a")), 0xA2),
            (FilterNode::equality("a", "b"), 0xA3),
            (FilterNode::starts_with("a", "b"), 0xA4),
            (FilterNode::greater_or_equal("a", "b"), 0xA5),
            (FilterNode::less_or_equal("a", "b"), 0xA6),
            (FilterNode::present("a"), 0x87),
            (
                FilterNode::Approx {
                    attribute: "a".into(),
                    value: b"b".to_vec(),
                },
                0xA8,
            ),
            (
                FilterNode::Extensible {
                    matching_rule: None,
                    attribute: Some("a".into()),
                    value: b"b".to_vec(),
                    dn_attributes: false,
                },
                0xA9,
            ),
        ];
        for (node, first_byte) in cases {
            assert_eq!(crate::asn1::encode(&node.to_asn1())[0], first_byte);
        }
    }

    #[test]
    fn escape_passes_hex_escaped_values_through() {
        assert_eq!(escape(r"\4a\61"), r"\4a\61");
        assert_eq!(escape("(jane)"), r"\28jane\29");
        assert_eq!(escape("jane"), "jane");
    }
}
