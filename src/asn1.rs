//! BER typed-node codec for the LDAP wire grammar.
//!
//! LDAP uses a restricted subset of BER: definite lengths only, implicit
//! tagging throughout. This module exposes the subset as a node tree so the
//! protocol layers never touch raw tag/length bytes.

use crate::error::LdapError;

const TAG_CLASS_MASK: u8 = 0xC0;
const TAG_CLASS_UNIVERSAL: u8 = 0x00;
const TAG_CLASS_APPLICATION: u8 = 0x40;
const TAG_CLASS_CONTEXT: u8 = 0x80;
const TAG_CONSTRUCTED: u8 = 0x20;
const TAG_NUMBER_MASK: u8 = 0x1F;

/// A decoded BER node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asn1 {
    Boolean(bool),
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    Enumerated(i64),
    Sequence(Vec<Asn1>),
    Set(Vec<Asn1>),
    /// Context-specific tag. LDAP tags implicitly, so the payload shape is
    /// only known to the caller.
    Context(u8, TagPayload),
    /// Application-class tag (the LDAP protocolOp envelope).
    Application(u8, TagPayload),
}

/// Payload of an implicitly tagged node: raw content bytes when the
/// primitive bit is set, child nodes otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagPayload {
    Primitive(Vec<u8>),
    Constructed(Vec<Asn1>),
}

impl Asn1 {
    pub fn octet_string(value: impl Into<Vec<u8>>) -> Self {
        Asn1::OctetString(value.into())
    }

    pub fn context(tag: u8, children: Vec<Asn1>) -> Self {
        Asn1::Context(tag, TagPayload::Constructed(children))
    }

    pub fn context_primitive(tag: u8, content: impl Into<Vec<u8>>) -> Self {
        Asn1::Context(tag, TagPayload::Primitive(content.into()))
    }

    pub fn application(tag: u8, children: Vec<Asn1>) -> Self {
        Asn1::Application(tag, TagPayload::Constructed(children))
    }

    pub fn application_primitive(tag: u8, content: impl Into<Vec<u8>>) -> Self {
        Asn1::Application(tag, TagPayload::Primitive(content.into()))
    }

    pub fn as_sequence(&self) -> Option<&[Asn1]> {
        match self {
            Asn1::Sequence(children) => Some(children),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&[Asn1]> {
        match self {
            Asn1::Set(children) => Some(children),
            _ => None,
        }
    }

    pub fn as_octet_string(&self) -> Option<&[u8]> {
        match self {
            Asn1::OctetString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Asn1::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_enumerated(&self) -> Option<i64> {
        match self {
            Asn1::Enumerated(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Asn1::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Sequence accessor with a protocol error on mismatch, for codec code
    /// that expects a specific shape.
    pub fn expect_sequence(&self) -> Result<&[Asn1], LdapError> {
        self.as_sequence()
            .ok_or_else(|| LdapError::Protocol("expected a SEQUENCE".into()))
    }

    pub fn expect_octet_string(&self) -> Result<&[u8], LdapError> {
        self.as_octet_string()
            .ok_or_else(|| LdapError::Protocol("expected an OCTET STRING".into()))
    }

    pub fn expect_string(&self) -> Result<String, LdapError> {
        let bytes = self.expect_octet_string()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| LdapError::Protocol("string value is not valid UTF-8".into()))
    }

    pub fn expect_integer(&self) -> Result<i64, LdapError> {
        self.as_integer()
            .ok_or_else(|| LdapError::Protocol("expected an INTEGER".into()))
    }

    pub fn expect_enumerated(&self) -> Result<i64, LdapError> {
        self.as_enumerated()
            .ok_or_else(|| LdapError::Protocol("expected an ENUMERATED".into()))
    }

    pub fn expect_boolean(&self) -> Result<bool, LdapError> {
        self.as_boolean()
            .ok_or_else(|| LdapError::Protocol("expected a BOOLEAN".into()))
    }
}

/// Encode a node to its BER byte form.
pub fn encode(node: &Asn1) -> Vec<u8> {
    let mut out = Vec::new();
    write_node(&mut out, node);
    out
}

/// Decode exactly one node from `data`. Trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<Asn1, LdapError> {
    let mut reader = Reader::new(data);
    let node = reader.read_node()?;
    if reader.remaining() != 0 {
        return Err(LdapError::Protocol(format!(
            "{} trailing bytes after BER element",
            reader.remaining()
        )));
    }
    Ok(node)
}

/// Total byte length of the first TLV in `buf`, or `None` when more data is
/// needed to know. Used by the sessions to frame messages off a socket
/// without attempting a full decode of a partial buffer.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, LdapError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[1];
    if first & 0x80 == 0 {
        return Ok(Some(2 + first as usize));
    }
    let length_bytes = (first & 0x7F) as usize;
    if length_bytes == 0 {
        return Err(LdapError::Protocol("indefinite BER length".into()));
    }
    if length_bytes > 4 {
        return Err(LdapError::Protocol(format!(
            "BER length of {length_bytes} bytes exceeds the 4 byte bound"
        )));
    }
    if buf.len() < 2 + length_bytes {
        return Ok(None);
    }
    let mut length = 0usize;
    for &b in &buf[2..2 + length_bytes] {
        length = (length << 8) | b as usize;
    }
    Ok(Some(2 + length_bytes + length))
}

fn write_node(out: &mut Vec<u8>, node: &Asn1) {
    match node {
        Asn1::Boolean(v) => {
            out.push(0x01);
            out.push(1);
            out.push(if *v { 0xFF } else { 0x00 });
        }
        Asn1::Integer(v) => write_integer(out, 0x02, *v),
        Asn1::Enumerated(v) => write_integer(out, 0x0A, *v),
        Asn1::OctetString(bytes) => {
            out.push(0x04);
            write_length(out, bytes.len());
            out.extend_from_slice(bytes);
        }
        Asn1::Null => {
            out.push(0x05);
            out.push(0);
        }
        Asn1::Sequence(children) => write_constructed(out, 0x30, children),
        Asn1::Set(children) => write_constructed(out, 0x31, children),
        Asn1::Context(tag, payload) => write_tagged(out, TAG_CLASS_CONTEXT, *tag, payload),
        Asn1::Application(tag, payload) => write_tagged(out, TAG_CLASS_APPLICATION, *tag, payload),
    }
}

fn write_constructed(out: &mut Vec<u8>, tag: u8, children: &[Asn1]) {
    let mut content = Vec::new();
    for child in children {
        write_node(&mut content, child);
    }
    out.push(tag);
    write_length(out, content.len());
    out.extend_from_slice(&content);
}

fn write_tagged(out: &mut Vec<u8>, class: u8, tag: u8, payload: &TagPayload) {
    match payload {
        TagPayload::Primitive(bytes) => {
            out.push(class | (tag & TAG_NUMBER_MASK));
            write_length(out, bytes.len());
            out.extend_from_slice(bytes);
        }
        TagPayload::Constructed(children) => {
            let mut content = Vec::new();
            for child in children {
                write_node(&mut content, child);
            }
            out.push(class | TAG_CONSTRUCTED | (tag & TAG_NUMBER_MASK));
            write_length(out, content.len());
            out.extend_from_slice(&content);
        }
    }
}

fn write_length(out: &mut Vec<u8>, length: usize) {
    if length < 128 {
        out.push(length as u8);
    } else {
        let mut bytes = Vec::new();
        let mut len = length;
        while len > 0 {
            bytes.push((len & 0xFF) as u8);
            len >>= 8;
        }
        bytes.reverse();
        out.push(0x80 | bytes.len() as u8);
        out.extend_from_slice(&bytes);
    }
}

/// Minimal two's complement integer content, as INTEGER or ENUMERATED.
fn write_integer(out: &mut Vec<u8>, tag: u8, value: i64) {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let cur = bytes[start];
        let next = bytes[start + 1];
        // Drop leading bytes that carry no information: 0x00 before a byte
        // without the sign bit, 0xFF before a byte with it.
        if (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    out.push(tag);
    write_length(out, 8 - start);
    out.extend_from_slice(&bytes[start..]);
}

/// Encode the content octets of an INTEGER without tag or length. Used for
/// primitive application tags that carry a bare integer (AbandonRequest).
pub fn integer_content(value: i64) -> Vec<u8> {
    let mut tmp = Vec::new();
    write_integer(&mut tmp, 0x02, value);
    // tag + single length byte precede the content for any i64
    tmp.split_off(2)
}

/// Decode the content octets of an INTEGER (no tag/length).
pub fn integer_from_content(content: &[u8]) -> Result<i64, LdapError> {
    if content.is_empty() || content.len() > 8 {
        return Err(LdapError::Protocol(format!(
            "integer content of {} bytes",
            content.len()
        )));
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in content {
        value = (value << 8) | b as i64;
    }
    Ok(value)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_byte(&mut self) -> Result<u8, LdapError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| LdapError::Protocol("truncated BER element".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_length(&mut self) -> Result<usize, LdapError> {
        let first = self.read_byte()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let length_bytes = (first & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(LdapError::Protocol("indefinite BER length".into()));
        }
        if length_bytes > 4 {
            return Err(LdapError::Protocol(format!(
                "BER length of {length_bytes} bytes exceeds the 4 byte bound"
            )));
        }
        let mut length = 0usize;
        for _ in 0..length_bytes {
            length = (length << 8) | self.read_byte()? as usize;
        }
        Ok(length)
    }

    fn read_content(&mut self, length: usize) -> Result<&'a [u8], LdapError> {
        if self.remaining() < length {
            return Err(LdapError::Protocol(format!(
                "BER truncated: need {} bytes, {} remaining",
                length,
                self.remaining()
            )));
        }
        let content = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok(content)
    }

    fn read_node(&mut self) -> Result<Asn1, LdapError> {
        let tag = self.read_byte()?;
        let number = tag & TAG_NUMBER_MASK;
        if number == TAG_NUMBER_MASK {
            return Err(LdapError::Protocol("high tag numbers are not used by LDAP".into()));
        }
        let constructed = tag & TAG_CONSTRUCTED != 0;
        let length = self.read_length()?;
        let content = self.read_content(length)?;

        match tag & TAG_CLASS_MASK {
            TAG_CLASS_UNIVERSAL => decode_universal(number, constructed, content),
            TAG_CLASS_APPLICATION => Ok(Asn1::Application(
                number,
                decode_payload(constructed, content)?,
            )),
            TAG_CLASS_CONTEXT => Ok(Asn1::Context(number, decode_payload(constructed, content)?)),
            _ => Err(LdapError::Protocol(format!(
                "private tag class (tag 0x{tag:02X}) is not used by LDAP"
            ))),
        }
    }
}

fn decode_universal(number: u8, constructed: bool, content: &[u8]) -> Result<Asn1, LdapError> {
    match number {
        0x01 => {
            if constructed || content.len() != 1 {
                return Err(LdapError::Protocol("malformed BOOLEAN".into()));
            }
            Ok(Asn1::Boolean(content[0] != 0))
        }
        0x02 => Ok(Asn1::Integer(integer_from_content(content)?)),
        0x04 => {
            if constructed {
                return Err(LdapError::Protocol("constructed OCTET STRING".into()));
            }
            Ok(Asn1::OctetString(content.to_vec()))
        }
        0x05 => {
            if !content.is_empty() {
                return Err(LdapError::Protocol("malformed NULL".into()));
            }
            Ok(Asn1::Null)
        }
        0x0A => Ok(Asn1::Enumerated(integer_from_content(content)?)),
        0x10 => {
            if !constructed {
                return Err(LdapError::Protocol("primitive SEQUENCE".into()));
            }
            Ok(Asn1::Sequence(decode_children(content)?))
        }
        0x11 => {
            if !constructed {
                return Err(LdapError::Protocol("primitive SET".into()));
            }
            Ok(Asn1::Set(decode_children(content)?))
        }
        _ => Err(LdapError::Protocol(format!(
            "unsupported universal tag 0x{number:02X}"
        ))),
    }
}

fn decode_payload(constructed: bool, content: &[u8]) -> Result<TagPayload, LdapError> {
    if constructed {
        Ok(TagPayload::Constructed(decode_children(content)?))
    } else {
        Ok(TagPayload::Primitive(content.to_vec()))
    }
}

fn decode_children(content: &[u8]) -> Result<Vec<Asn1>, LdapError> {
    let mut reader = Reader::new(content);
    let mut children = Vec::new();
    while reader.remaining() > 0 {
        children.push(reader.read_node()?);
    }
    Ok(children)
}
