//! Wire codec: [`LdapMessage`] to and from BER bytes.
//!
//! Application tag numbers follow RFC 4511: bind=0/1, unbind=2, search
//! request/entry/done=3/4/5 (references=19), modify=6/7, add=8/9,
//! delete=10/11, modifyDn=12/13, compare=14/15, abandon=16, extended=23/24,
//! intermediate=25.

use crate::asn1::{self, Asn1, TagPayload};
use crate::controls::{Control, Controls};
use crate::dn::Dn;
use crate::entry::Attribute;
use crate::error::LdapError;
use crate::filter::FilterNode;
use crate::message::*;
use crate::result_code::ResultCode;

const TAG_BIND_REQUEST: u8 = 0;
const TAG_BIND_RESPONSE: u8 = 1;
const TAG_UNBIND_REQUEST: u8 = 2;
const TAG_SEARCH_REQUEST: u8 = 3;
const TAG_SEARCH_RESULT_ENTRY: u8 = 4;
const TAG_SEARCH_RESULT_DONE: u8 = 5;
const TAG_MODIFY_REQUEST: u8 = 6;
const TAG_MODIFY_RESPONSE: u8 = 7;
const TAG_ADD_REQUEST: u8 = 8;
const TAG_ADD_RESPONSE: u8 = 9;
const TAG_DELETE_REQUEST: u8 = 10;
const TAG_DELETE_RESPONSE: u8 = 11;
const TAG_MODIFY_DN_REQUEST: u8 = 12;
const TAG_MODIFY_DN_RESPONSE: u8 = 13;
const TAG_COMPARE_REQUEST: u8 = 14;
const TAG_COMPARE_RESPONSE: u8 = 15;
const TAG_ABANDON_REQUEST: u8 = 16;
const TAG_SEARCH_RESULT_REFERENCE: u8 = 19;
const TAG_EXTENDED_REQUEST: u8 = 23;
const TAG_EXTENDED_RESPONSE: u8 = 24;
const TAG_INTERMEDIATE_RESPONSE: u8 = 25;

/// Controls attach as [0] on the message envelope.
const TAG_MESSAGE_CONTROLS: u8 = 0;

const TAG_BIND_SIMPLE: u8 = 0;
const TAG_BIND_SASL: u8 = 3;
const TAG_BIND_SERVER_SASL_CREDS: u8 = 7;
const TAG_RESULT_REFERRAL: u8 = 3;
const TAG_MODIFY_DN_NEW_SUPERIOR: u8 = 0;
const TAG_EXTENDED_REQUEST_NAME: u8 = 0;
const TAG_EXTENDED_REQUEST_VALUE: u8 = 1;
const TAG_EXTENDED_RESPONSE_NAME: u8 = 10;
const TAG_EXTENDED_RESPONSE_VALUE: u8 = 11;
const TAG_INTERMEDIATE_NAME: u8 = 0;
const TAG_INTERMEDIATE_VALUE: u8 = 1;

pub fn encode_message(message: &LdapMessage) -> Result<Vec<u8>, LdapError> {
    let mut parts = vec![Asn1::Integer(message.id as i64), encode_op(&message.op)?];
    if !message.controls.is_empty() {
        let controls = message
            .controls
            .iter()
            .map(Control::to_asn1)
            .collect::<Result<Vec<_>, _>>()?;
        parts.push(Asn1::context(TAG_MESSAGE_CONTROLS, controls));
    }
    Ok(asn1::encode(&Asn1::Sequence(parts)))
}

pub fn decode_message(data: &[u8]) -> Result<LdapMessage, LdapError> {
    let node = asn1::decode(data)?;
    let parts = node.expect_sequence()?;
    if parts.len() < 2 || parts.len() > 3 {
        return Err(LdapError::Protocol("malformed LDAP message envelope".into()));
    }
    let id = parts[0].expect_integer()?;
    if !(0..=i64::from(u32::MAX)).contains(&id) {
        return Err(LdapError::Protocol(format!("message id {id} out of range")));
    }
    let op = decode_op(&parts[1])?;
    let controls = match parts.get(2) {
        Some(Asn1::Context(TAG_MESSAGE_CONTROLS, TagPayload::Constructed(children))) => {
            let mut controls = Controls::new();
            for child in children {
                controls.push(Control::from_asn1(child)?);
            }
            controls
        }
        Some(_) => {
            return Err(LdapError::Protocol(
                "unexpected trailing element in LDAP message".into(),
            ))
        }
        None => Controls::new(),
    };
    Ok(LdapMessage {
        id: id as u32,
        op,
        controls,
    })
}

fn encode_op(op: &ProtocolOp) -> Result<Asn1, LdapError> {
    let node = match op {
        ProtocolOp::BindRequest(request) => {
            let auth = match &request.auth {
                BindAuth::Simple(password) => {
                    Asn1::context_primitive(TAG_BIND_SIMPLE, password.as_bytes())
                }
                BindAuth::Sasl {
                    mechanism,
                    credentials,
                } => {
                    let mut parts = vec![Asn1::octet_string(mechanism.as_bytes())];
                    if let Some(credentials) = credentials {
                        parts.push(Asn1::OctetString(credentials.clone()));
                    }
                    Asn1::context(TAG_BIND_SASL, parts)
                }
            };
            Asn1::application(
                TAG_BIND_REQUEST,
                vec![
                    Asn1::Integer(request.version as i64),
                    Asn1::octet_string(request.name.as_str().as_bytes()),
                    auth,
                ],
            )
        }
        ProtocolOp::BindResponse(response) => {
            let mut parts = result_parts(&response.result);
            if let Some(creds) = &response.server_sasl_creds {
                parts.push(Asn1::context_primitive(
                    TAG_BIND_SERVER_SASL_CREDS,
                    creds.clone(),
                ));
            }
            Asn1::application(TAG_BIND_RESPONSE, parts)
        }
        ProtocolOp::UnbindRequest => Asn1::application_primitive(TAG_UNBIND_REQUEST, Vec::new()),
        ProtocolOp::SearchRequest(request) => Asn1::application(
            TAG_SEARCH_REQUEST,
            vec![
                Asn1::octet_string(request.base.as_str().as_bytes()),
                Asn1::Enumerated(request.scope.code()),
                Asn1::Enumerated(request.deref_aliases.code()),
                Asn1::Integer(request.size_limit as i64),
                Asn1::Integer(request.time_limit as i64),
                Asn1::Boolean(request.types_only),
                request.filter.to_asn1(),
                Asn1::Sequence(
                    request
                        .attributes
                        .iter()
                        .map(|a| Asn1::octet_string(a.as_bytes()))
                        .collect(),
                ),
            ],
        ),
        ProtocolOp::SearchResultEntry(entry) => Asn1::application(
            TAG_SEARCH_RESULT_ENTRY,
            vec![
                Asn1::octet_string(entry.dn.as_str().as_bytes()),
                encode_attribute_list(&entry.attributes),
            ],
        ),
        ProtocolOp::SearchResultReference(uris) => Asn1::application(
            TAG_SEARCH_RESULT_REFERENCE,
            uris.iter().map(|u| Asn1::octet_string(u.as_bytes())).collect(),
        ),
        ProtocolOp::SearchResultDone(result) => {
            Asn1::application(TAG_SEARCH_RESULT_DONE, result_parts(result))
        }
        ProtocolOp::ModifyRequest(request) => Asn1::application(
            TAG_MODIFY_REQUEST,
            vec![
                Asn1::octet_string(request.dn.as_str().as_bytes()),
                Asn1::Sequence(
                    request
                        .changes
                        .iter()
                        .map(|change| {
                            Asn1::Sequence(vec![
                                Asn1::Enumerated(change.change_type.code()),
                                encode_attribute(&change.attribute),
                            ])
                        })
                        .collect(),
                ),
            ],
        ),
        ProtocolOp::ModifyResponse(result) => {
            Asn1::application(TAG_MODIFY_RESPONSE, result_parts(result))
        }
        ProtocolOp::AddRequest(request) => Asn1::application(
            TAG_ADD_REQUEST,
            vec![
                Asn1::octet_string(request.dn.as_str().as_bytes()),
                encode_attribute_list(&request.attributes),
            ],
        ),
        ProtocolOp::AddResponse(result) => Asn1::application(TAG_ADD_RESPONSE, result_parts(result)),
        ProtocolOp::DeleteRequest(request) => {
            Asn1::application_primitive(TAG_DELETE_REQUEST, request.dn.as_str().as_bytes())
        }
        ProtocolOp::DeleteResponse(result) => {
            Asn1::application(TAG_DELETE_RESPONSE, result_parts(result))
        }
        ProtocolOp::ModifyDnRequest(request) => {
            let mut parts = vec![
                Asn1::octet_string(request.dn.as_str().as_bytes()),
                Asn1::octet_string(request.new_rdn.as_bytes()),
                Asn1::Boolean(request.delete_old_rdn),
            ];
            if let Some(new_superior) = &request.new_superior {
                parts.push(Asn1::context_primitive(
                    TAG_MODIFY_DN_NEW_SUPERIOR,
                    new_superior.as_str().as_bytes(),
                ));
            }
            Asn1::application(TAG_MODIFY_DN_REQUEST, parts)
        }
        ProtocolOp::ModifyDnResponse(result) => {
            Asn1::application(TAG_MODIFY_DN_RESPONSE, result_parts(result))
        }
        ProtocolOp::CompareRequest(request) => Asn1::application(
            TAG_COMPARE_REQUEST,
            vec![
                Asn1::octet_string(request.dn.as_str().as_bytes()),
                Asn1::Sequence(vec![
                    Asn1::octet_string(request.attribute.as_bytes()),
                    Asn1::OctetString(request.value.clone()),
                ]),
            ],
        ),
        ProtocolOp::CompareResponse(result) => {
            Asn1::application(TAG_COMPARE_RESPONSE, result_parts(result))
        }
        ProtocolOp::AbandonRequest(id) => {
            Asn1::application_primitive(TAG_ABANDON_REQUEST, asn1::integer_content(*id as i64))
        }
        ProtocolOp::ExtendedRequest(request) => {
            let mut parts = vec![Asn1::context_primitive(
                TAG_EXTENDED_REQUEST_NAME,
                request.name.as_bytes(),
            )];
            if let Some(value) = &request.value {
                parts.push(Asn1::context_primitive(
                    TAG_EXTENDED_REQUEST_VALUE,
                    value.clone(),
                ));
            }
            Asn1::application(TAG_EXTENDED_REQUEST, parts)
        }
        ProtocolOp::ExtendedResponse(response) => {
            let mut parts = result_parts(&response.result);
            if let Some(name) = &response.name {
                parts.push(Asn1::context_primitive(
                    TAG_EXTENDED_RESPONSE_NAME,
                    name.as_bytes(),
                ));
            }
            if let Some(value) = &response.value {
                parts.push(Asn1::context_primitive(
                    TAG_EXTENDED_RESPONSE_VALUE,
                    value.clone(),
                ));
            }
            Asn1::application(TAG_EXTENDED_RESPONSE, parts)
        }
        ProtocolOp::IntermediateResponse(response) => {
            let mut parts = Vec::new();
            if let Some(name) = &response.name {
                parts.push(Asn1::context_primitive(
                    TAG_INTERMEDIATE_NAME,
                    name.as_bytes(),
                ));
            }
            if let Some(value) = &response.value {
                parts.push(Asn1::context_primitive(
                    TAG_INTERMEDIATE_VALUE,
                    value.clone(),
                ));
            }
            Asn1::application(TAG_INTERMEDIATE_RESPONSE, parts)
        }
    };
    Ok(node)
}

fn decode_op(node: &Asn1) -> Result<ProtocolOp, LdapError> {
    let (tag, payload) = match node {
        Asn1::Application(tag, payload) => (*tag, payload),
        _ => {
            return Err(LdapError::Protocol(
                "protocol op is not application-tagged".into(),
            ))
        }
    };
    match tag {
        TAG_BIND_REQUEST => decode_bind_request(expect_constructed(payload)?),
        TAG_BIND_RESPONSE => decode_bind_response(expect_constructed(payload)?),
        TAG_UNBIND_REQUEST => Ok(ProtocolOp::UnbindRequest),
        TAG_SEARCH_REQUEST => decode_search_request(expect_constructed(payload)?),
        TAG_SEARCH_RESULT_ENTRY => decode_search_result_entry(expect_constructed(payload)?),
        TAG_SEARCH_RESULT_REFERENCE => {
            let parts = expect_constructed(payload)?;
            let uris = parts
                .iter()
                .map(Asn1::expect_string)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ProtocolOp::SearchResultReference(uris))
        }
        TAG_SEARCH_RESULT_DONE => Ok(ProtocolOp::SearchResultDone(decode_result(
            expect_constructed(payload)?,
        )?)),
        TAG_MODIFY_REQUEST => decode_modify_request(expect_constructed(payload)?),
        TAG_MODIFY_RESPONSE => Ok(ProtocolOp::ModifyResponse(decode_result(
            expect_constructed(payload)?,
        )?)),
        TAG_ADD_REQUEST => decode_add_request(expect_constructed(payload)?),
        TAG_ADD_RESPONSE => Ok(ProtocolOp::AddResponse(decode_result(expect_constructed(
            payload,
        )?)?)),
        TAG_DELETE_REQUEST => match payload {
            TagPayload::Primitive(dn) => Ok(ProtocolOp::DeleteRequest(DeleteRequest {
                dn: Dn::new(String::from_utf8_lossy(dn).into_owned()),
            })),
            TagPayload::Constructed(_) => {
                Err(LdapError::Protocol("delete request must be primitive".into()))
            }
        },
        TAG_DELETE_RESPONSE => Ok(ProtocolOp::DeleteResponse(decode_result(
            expect_constructed(payload)?,
        )?)),
        TAG_MODIFY_DN_REQUEST => decode_modify_dn_request(expect_constructed(payload)?),
        TAG_MODIFY_DN_RESPONSE => Ok(ProtocolOp::ModifyDnResponse(decode_result(
            expect_constructed(payload)?,
        )?)),
        TAG_COMPARE_REQUEST => decode_compare_request(expect_constructed(payload)?),
        TAG_COMPARE_RESPONSE => Ok(ProtocolOp::CompareResponse(decode_result(
            expect_constructed(payload)?,
        )?)),
        TAG_ABANDON_REQUEST => match payload {
            TagPayload::Primitive(content) => {
                let id = asn1::integer_from_content(content)?;
                if !(0..=i64::from(u32::MAX)).contains(&id) {
                    return Err(LdapError::Protocol(format!(
                        "abandoned message id {id} out of range"
                    )));
                }
                Ok(ProtocolOp::AbandonRequest(id as u32))
            }
            TagPayload::Constructed(_) => {
                Err(LdapError::Protocol("abandon request must be primitive".into()))
            }
        },
        TAG_EXTENDED_REQUEST => decode_extended_request(expect_constructed(payload)?),
        TAG_EXTENDED_RESPONSE => decode_extended_response(expect_constructed(payload)?),
        TAG_INTERMEDIATE_RESPONSE => decode_intermediate_response(expect_constructed(payload)?),
        _ => Err(LdapError::Protocol(format!(
            "unsupported LDAP operation tag {tag}"
        ))),
    }
}

fn expect_constructed(payload: &TagPayload) -> Result<&[Asn1], LdapError> {
    match payload {
        TagPayload::Constructed(children) => Ok(children),
        TagPayload::Primitive(_) => Err(LdapError::Protocol(
            "expected a constructed protocol op".into(),
        )),
    }
}

fn result_parts(result: &LdapResult) -> Vec<Asn1> {
    let mut parts = vec![
        Asn1::Enumerated(result.code.code() as i64),
        Asn1::octet_string(result.matched_dn.as_bytes()),
        Asn1::octet_string(result.diagnostics.as_bytes()),
    ];
    if !result.referrals.is_empty() {
        parts.push(Asn1::context(
            TAG_RESULT_REFERRAL,
            result
                .referrals
                .iter()
                .map(|r| Asn1::octet_string(r.as_bytes()))
                .collect(),
        ));
    }
    parts
}

fn decode_result(parts: &[Asn1]) -> Result<LdapResult, LdapError> {
    if parts.len() < 3 {
        return Err(LdapError::Protocol("truncated LDAPResult".into()));
    }
    let code = parts[0].expect_enumerated()?;
    if code < 0 {
        return Err(LdapError::Protocol("negative result code".into()));
    }
    let mut referrals = Vec::new();
    if let Some(Asn1::Context(TAG_RESULT_REFERRAL, TagPayload::Constructed(children))) =
        parts.get(3)
    {
        for child in children {
            referrals.push(child.expect_string()?);
        }
    }
    Ok(LdapResult {
        code: ResultCode::from_code(code as u32),
        matched_dn: parts[1].expect_string()?,
        diagnostics: parts[2].expect_string()?,
        referrals,
    })
}

fn decode_bind_request(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    if parts.len() != 3 {
        return Err(LdapError::Protocol("malformed bind request".into()));
    }
    let version = parts[0].expect_integer()?;
    if !(1..=127).contains(&version) {
        return Err(LdapError::Protocol(format!(
            "bind version {version} out of range"
        )));
    }
    let name = Dn::new(parts[1].expect_string()?);
    let auth = match &parts[2] {
        Asn1::Context(TAG_BIND_SIMPLE, TagPayload::Primitive(password)) => BindAuth::Simple(
            String::from_utf8(password.clone())
                .map_err(|_| LdapError::Protocol("bind password is not valid UTF-8".into()))?,
        ),
        Asn1::Context(TAG_BIND_SASL, TagPayload::Constructed(sasl)) => {
            if sasl.is_empty() || sasl.len() > 2 {
                return Err(LdapError::Protocol("malformed SASL credentials".into()));
            }
            BindAuth::Sasl {
                mechanism: sasl[0].expect_string()?,
                credentials: match sasl.get(1) {
                    Some(node) => Some(node.expect_octet_string()?.to_vec()),
                    None => None,
                },
            }
        }
        _ => {
            return Err(LdapError::Protocol(
                "unsupported bind authentication choice".into(),
            ))
        }
    };
    Ok(ProtocolOp::BindRequest(BindRequest {
        version: version as u32,
        name,
        auth,
    }))
}

fn decode_bind_response(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    let result = decode_result(parts)?;
    let creds_index = if result.referrals.is_empty() { 3 } else { 4 };
    let server_sasl_creds = match parts.get(creds_index) {
        Some(Asn1::Context(TAG_BIND_SERVER_SASL_CREDS, TagPayload::Primitive(creds))) => {
            Some(creds.clone())
        }
        None => None,
        Some(_) => {
            return Err(LdapError::Protocol(
                "unexpected element in bind response".into(),
            ))
        }
    };
    Ok(ProtocolOp::BindResponse(BindResponse {
        result,
        server_sasl_creds,
    }))
}

fn decode_search_request(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    if parts.len() != 8 {
        return Err(LdapError::Protocol("malformed search request".into()));
    }
    let scope = SearchScope::from_code(parts[1].expect_enumerated()?)
        .ok_or_else(|| LdapError::Protocol("invalid search scope".into()))?;
    let deref_aliases = DerefAliases::from_code(parts[2].expect_enumerated()?)
        .ok_or_else(|| LdapError::Protocol("invalid alias dereferencing policy".into()))?;
    let attributes = parts[7]
        .expect_sequence()?
        .iter()
        .map(Asn1::expect_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ProtocolOp::SearchRequest(SearchRequest {
        base: Dn::new(parts[0].expect_string()?),
        scope,
        deref_aliases,
        size_limit: parts[3].expect_integer()?.max(0) as u32,
        time_limit: parts[4].expect_integer()?.max(0) as u32,
        types_only: parts[5].expect_boolean()?,
        filter: FilterNode::from_asn1(&parts[6])?,
        attributes,
    }))
}

fn encode_attribute_list(attributes: &[Attribute]) -> Asn1 {
    Asn1::Sequence(attributes.iter().map(encode_attribute).collect())
}

fn encode_attribute(attribute: &Attribute) -> Asn1 {
    Asn1::Sequence(vec![
        Asn1::octet_string(attribute.description().as_bytes()),
        Asn1::Set(
            attribute
                .values()
                .iter()
                .map(|v| Asn1::OctetString(v.clone()))
                .collect(),
        ),
    ])
}

fn decode_attribute(node: &Asn1) -> Result<Attribute, LdapError> {
    let parts = node.expect_sequence()?;
    if parts.len() != 2 {
        return Err(LdapError::Protocol("malformed attribute".into()));
    }
    let name = parts[0].expect_string()?;
    let values = parts[1]
        .as_set()
        .or_else(|| parts[1].as_sequence())
        .ok_or_else(|| LdapError::Protocol("malformed attribute value set".into()))?
        .iter()
        .map(|v| v.expect_octet_string().map(<[u8]>::to_vec))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Attribute::new(name, values))
}

fn decode_attribute_list(node: &Asn1) -> Result<Vec<Attribute>, LdapError> {
    node.expect_sequence()?
        .iter()
        .map(decode_attribute)
        .collect()
}

fn decode_search_result_entry(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    if parts.len() != 2 {
        return Err(LdapError::Protocol("malformed search result entry".into()));
    }
    Ok(ProtocolOp::SearchResultEntry(SearchResultEntry {
        dn: Dn::new(parts[0].expect_string()?),
        attributes: decode_attribute_list(&parts[1])?,
    }))
}

fn decode_modify_request(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    if parts.len() != 2 {
        return Err(LdapError::Protocol("malformed modify request".into()));
    }
    let dn = Dn::new(parts[0].expect_string()?);
    let mut changes = Vec::new();
    for change_node in parts[1].expect_sequence()? {
        let change_parts = change_node.expect_sequence()?;
        if change_parts.len() != 2 {
            return Err(LdapError::Protocol("malformed modify change".into()));
        }
        let change_type = ChangeType::from_code(change_parts[0].expect_enumerated()?)
            .ok_or_else(|| LdapError::Protocol("invalid modify operation".into()))?;
        changes.push(ModifyChange {
            change_type,
            attribute: decode_attribute(&change_parts[1])?,
        });
    }
    Ok(ProtocolOp::ModifyRequest(ModifyRequest { dn, changes }))
}

fn decode_add_request(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    if parts.len() != 2 {
        return Err(LdapError::Protocol("malformed add request".into()));
    }
    Ok(ProtocolOp::AddRequest(AddRequest {
        dn: Dn::new(parts[0].expect_string()?),
        attributes: decode_attribute_list(&parts[1])?,
    }))
}

fn decode_modify_dn_request(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    if parts.len() < 3 || parts.len() > 4 {
        return Err(LdapError::Protocol("malformed modify DN request".into()));
    }
    let new_superior = match parts.get(3) {
        Some(Asn1::Context(TAG_MODIFY_DN_NEW_SUPERIOR, TagPayload::Primitive(dn))) => {
            Some(Dn::new(String::from_utf8_lossy(dn).into_owned()))
        }
        None => None,
        Some(_) => {
            return Err(LdapError::Protocol(
                "unexpected element in modify DN request".into(),
            ))
        }
    };
    Ok(ProtocolOp::ModifyDnRequest(ModifyDnRequest {
        dn: Dn::new(parts[0].expect_string()?),
        new_rdn: parts[1].expect_string()?,
        delete_old_rdn: parts[2].expect_boolean()?,
        new_superior,
    }))
}

fn decode_compare_request(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    if parts.len() != 2 {
        return Err(LdapError::Protocol("malformed compare request".into()));
    }
    let ava = parts[1].expect_sequence()?;
    if ava.len() != 2 {
        return Err(LdapError::Protocol("malformed attribute value assertion".into()));
    }
    Ok(ProtocolOp::CompareRequest(CompareRequest {
        dn: Dn::new(parts[0].expect_string()?),
        attribute: ava[0].expect_string()?,
        value: ava[1].expect_octet_string()?.to_vec(),
    }))
}

fn decode_extended_request(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    let mut name = None;
    let mut value = None;
    for part in parts {
        match part {
            Asn1::Context(TAG_EXTENDED_REQUEST_NAME, TagPayload::Primitive(bytes)) => {
                name = Some(String::from_utf8_lossy(bytes).into_owned());
            }
            Asn1::Context(TAG_EXTENDED_REQUEST_VALUE, TagPayload::Primitive(bytes)) => {
                value = Some(bytes.clone());
            }
            _ => {
                return Err(LdapError::Protocol(
                    "unexpected element in extended request".into(),
                ))
            }
        }
    }
    let name =
        name.ok_or_else(|| LdapError::Protocol("extended request has no request name".into()))?;
    Ok(ProtocolOp::ExtendedRequest(ExtendedRequest { name, value }))
}

fn decode_extended_response(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    let result = decode_result(parts)?;
    let tail_start = if result.referrals.is_empty() { 3 } else { 4 };
    let mut name = None;
    let mut value = None;
    for part in &parts[tail_start.min(parts.len())..] {
        match part {
            Asn1::Context(TAG_EXTENDED_RESPONSE_NAME, TagPayload::Primitive(bytes)) => {
                name = Some(String::from_utf8_lossy(bytes).into_owned());
            }
            Asn1::Context(TAG_EXTENDED_RESPONSE_VALUE, TagPayload::Primitive(bytes)) => {
                value = Some(bytes.clone());
            }
            _ => {
                return Err(LdapError::Protocol(
                    "unexpected element in extended response".into(),
                ))
            }
        }
    }
    Ok(ProtocolOp::ExtendedResponse(ExtendedResponse {
        result,
        name,
        value,
    }))
}

fn decode_intermediate_response(parts: &[Asn1]) -> Result<ProtocolOp, LdapError> {
    let mut name = None;
    let mut value = None;
    for part in parts {
        match part {
            Asn1::Context(TAG_INTERMEDIATE_NAME, TagPayload::Primitive(bytes)) => {
                name = Some(String::from_utf8_lossy(bytes).into_owned());
            }
            Asn1::Context(TAG_INTERMEDIATE_VALUE, TagPayload::Primitive(bytes)) => {
                value = Some(bytes.clone());
            }
            _ => {
                return Err(LdapError::Protocol(
                    "unexpected element in intermediate response".into(),
                ))
            }
        }
    }
    Ok(ProtocolOp::IntermediateResponse(IntermediateResponse {
        name,
        value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{Control, ControlValue};

    fn roundtrip(message: LdapMessage) -> LdapMessage {
        let encoded = encode_message(&message).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded.id, message.id);
        decoded
    }

    #[test]
    fn bind_request_roundtrip() {
        let message = LdapMessage::new(
            1,
            ProtocolOp::BindRequest(BindRequest::simple("cn=admin,dc=example,dc=com", "secret")),
        );
        let decoded = roundtrip(message.clone());
        assert_eq!(decoded.op, message.op);

        let message = LdapMessage::new(
            2,
            ProtocolOp::BindRequest(BindRequest::sasl("EXTERNAL", Some(b"proof".to_vec()))),
        );
        let decoded = roundtrip(message.clone());
        assert_eq!(decoded.op, message.op);
    }

    #[test]
    fn bind_request_wire_bytes_match_rfc4511() {
        let message = LdapMessage::new(
            1,
            ProtocolOp::BindRequest(BindRequest::simple("cn=admin,dc=example,dc=com", "secret")),
        );
        let encoded = encode_message(&message).unwrap();
        let expected = vec![
            0x30, 0x2a, // SEQUENCE length 42
            0x02, 0x01, 0x01, // messageID 1
            0x60, 0x25, // [APPLICATION 0] length 37
            0x02, 0x01, 0x03, // version 3
            0x04, 0x18, 0x63, 0x6e, 0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63, 0x3d,
            0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d,
            0x80, 0x06, 0x73, 0x65, 0x63, 0x72, 0x65, 0x74, // [0] simple "secret"
        ];
        assert_eq!(encoded, expected);
    }

    #[test]
    fn search_request_roundtrip() {
        let request = SearchRequest::new(
            FilterNode::parse("(&(objectClass=inetOrgPerson)(cn=A*))").unwrap(),
        )
        .base("dc=example,dc=com")
        .scope(SearchScope::WholeSubtree)
        .attributes(["cn", "sn"]);
        let message = LdapMessage::new(7, ProtocolOp::SearchRequest(request.clone()));
        let decoded = roundtrip(message);
        assert_eq!(decoded.op, ProtocolOp::SearchRequest(request));
    }

    #[test]
    fn search_responses_roundtrip() {
        let entry = SearchResultEntry {
            dn: Dn::new("cn=test,dc=example,dc=com"),
            attributes: vec![
                Attribute::from_strings("cn", ["test"]),
                Attribute::from_strings("mail", ["test@example.com"]),
            ],
        };
        let decoded = roundtrip(LdapMessage::new(3, ProtocolOp::SearchResultEntry(entry.clone())));
        assert_eq!(decoded.op, ProtocolOp::SearchResultEntry(entry));

        let reference = vec!["ldap://other.example.com/dc=example,dc=com".to_string()];
        let decoded = roundtrip(LdapMessage::new(
            3,
            ProtocolOp::SearchResultReference(reference.clone()),
        ));
        assert_eq!(decoded.op, ProtocolOp::SearchResultReference(reference));

        let mut result = LdapResult::success();
        result.referrals = vec!["ldap://a.example.com".to_string()];
        let decoded = roundtrip(LdapMessage::new(3, ProtocolOp::SearchResultDone(result.clone())));
        assert_eq!(decoded.op, ProtocolOp::SearchResultDone(result));
    }

    #[test]
    fn modify_request_roundtrip() {
        let request = ModifyRequest {
            dn: Dn::new("cn=x,dc=example"),
            changes: vec![
                ModifyChange {
                    change_type: ChangeType::Replace,
                    attribute: Attribute::from_strings("mail", ["new@example.com"]),
                },
                ModifyChange {
                    change_type: ChangeType::Delete,
                    attribute: Attribute::from_strings("phone", Vec::<String>::new()),
                },
            ],
        };
        let decoded = roundtrip(LdapMessage::new(4, ProtocolOp::ModifyRequest(request.clone())));
        assert_eq!(decoded.op, ProtocolOp::ModifyRequest(request));
    }

    #[test]
    fn remaining_requests_roundtrip() {
        let ops = vec![
            ProtocolOp::UnbindRequest,
            ProtocolOp::AddRequest(AddRequest {
                dn: Dn::new("cn=new,dc=example"),
                attributes: vec![Attribute::from_strings("cn", ["new"])],
            }),
            ProtocolOp::DeleteRequest(DeleteRequest {
                dn: Dn::new("cn=old,dc=example"),
            }),
            ProtocolOp::ModifyDnRequest(ModifyDnRequest {
                dn: Dn::new("cn=a,dc=example"),
                new_rdn: "cn=b".into(),
                delete_old_rdn: true,
                new_superior: Some(Dn::new("ou=people,dc=example")),
            }),
            ProtocolOp::CompareRequest(CompareRequest {
                dn: Dn::new("cn=a,dc=example"),
                attribute: "mail".into(),
                value: b"a@example.com".to_vec(),
            }),
            ProtocolOp::AbandonRequest(9),
            ProtocolOp::ExtendedRequest(ExtendedRequest::start_tls()),
        ];
        for op in ops {
            let decoded = roundtrip(LdapMessage::new(5, op.clone()));
            assert_eq!(decoded.op, op);
        }
    }

    #[test]
    fn responses_roundtrip() {
        let ops = vec![
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::with_diagnostics(ResultCode::InvalidCredentials, "no"),
                server_sasl_creds: Some(b"challenge".to_vec()),
            }),
            ProtocolOp::ModifyResponse(LdapResult::success()),
            ProtocolOp::AddResponse(LdapResult::success()),
            ProtocolOp::DeleteResponse(LdapResult::new(ResultCode::NoSuchObject)),
            ProtocolOp::ModifyDnResponse(LdapResult::success()),
            ProtocolOp::CompareResponse(LdapResult::new(ResultCode::CompareTrue)),
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::success(),
                name: Some(OID_WHOAMI.to_string()),
                value: Some(b"dn:cn=admin".to_vec()),
            }),
            ProtocolOp::IntermediateResponse(IntermediateResponse {
                name: Some(crate::controls::OID_SYNC_INFO.to_string()),
                value: Some(vec![0x80, 0x01, 0x61]),
            }),
        ];
        for op in ops {
            let decoded = roundtrip(LdapMessage::new(6, op.clone()));
            assert_eq!(decoded.op, op);
        }
    }

    #[test]
    fn controls_travel_on_the_envelope() {
        let mut message = LdapMessage::new(
            8,
            ProtocolOp::SearchRequest(SearchRequest::new(FilterNode::present("objectClass"))),
        );
        message.controls.push(Control::paging(100, Vec::new()).critical());
        let encoded = encode_message(&message).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        let control = decoded.controls.get(crate::controls::OID_PAGING).unwrap();
        assert!(control.criticality);
        assert!(matches!(control.value, ControlValue::Opaque(_)));
    }

    #[test]
    fn rejects_malformed_envelopes() {
        assert!(decode_message(&[0x30, 0x00]).is_err());
        // message id must be non-negative
        let bad = asn1::encode(&Asn1::Sequence(vec![
            Asn1::Integer(-1),
            Asn1::application_primitive(TAG_UNBIND_REQUEST, Vec::new()),
        ]));
        assert!(decode_message(&bad).is_err());
        // unknown application tag
        let bad = asn1::encode(&Asn1::Sequence(vec![
            Asn1::Integer(1),
            Asn1::application_primitive(30, Vec::new()),
        ]));
        assert!(decode_message(&bad).is_err());
    }

    #[test]
    fn unbind_is_the_two_byte_primitive() {
        let encoded =
            encode_message(&LdapMessage::new(2, ProtocolOp::UnbindRequest)).unwrap();
        assert_eq!(encoded, vec![0x30, 0x05, 0x02, 0x01, 0x02, 0x42, 0x00]);
    }
}
