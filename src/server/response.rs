//! Builds the standard response for a request kind, and the extended error
//! forms used for id violations and disconnection notices.

use crate::message::{
    BindResponse, ExtendedResponse, LdapMessage, LdapResult, ProtocolOp,
    OID_NOTICE_OF_DISCONNECTION,
};
use crate::result_code::ResultCode;

/// The response variant matching the request's kind, carrying the given
/// result, correlated to the request's message id.
pub fn standard_response(
    request: &LdapMessage,
    code: ResultCode,
    diagnostics: &str,
) -> LdapMessage {
    let result = LdapResult::with_diagnostics(code, diagnostics);
    let op = match &request.op {
        ProtocolOp::BindRequest(_) => ProtocolOp::BindResponse(BindResponse::new(result)),
        ProtocolOp::SearchRequest(_) => ProtocolOp::SearchResultDone(result),
        ProtocolOp::ModifyRequest(_) => ProtocolOp::ModifyResponse(result),
        ProtocolOp::AddRequest(_) => ProtocolOp::AddResponse(result),
        ProtocolOp::DeleteRequest(_) => ProtocolOp::DeleteResponse(result),
        ProtocolOp::ModifyDnRequest(_) => ProtocolOp::ModifyDnResponse(result),
        ProtocolOp::CompareRequest(_) => ProtocolOp::CompareResponse(result),
        // extended requests, and anything with no dedicated response kind
        _ => ProtocolOp::ExtendedResponse(ExtendedResponse::new(result)),
    };
    LdapMessage::new(request.id, op)
}

/// An extended error outside any request/response pairing (message id 0).
pub fn extended_error(code: ResultCode, diagnostics: &str, name: Option<&str>) -> LdapMessage {
    let mut response = ExtendedResponse::new(LdapResult::with_diagnostics(code, diagnostics));
    response.name = name.map(str::to_string);
    LdapMessage::new(0, ProtocolOp::ExtendedResponse(response))
}

/// The RFC 4511 4.4.1 Notice of Disconnection, sent before the server
/// drops a misbehaving or unlucky connection.
pub fn notice_of_disconnection(code: ResultCode, diagnostics: &str) -> LdapMessage {
    extended_error(code, diagnostics, Some(OID_NOTICE_OF_DISCONNECTION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BindRequest, SearchRequest, SearchScope};
    use crate::filter::FilterNode;

    #[test]
    fn response_kind_matches_request_kind() {
        let request = LdapMessage::new(
            4,
            ProtocolOp::BindRequest(BindRequest::simple("cn=a", "b")),
        );
        let response = standard_response(&request, ResultCode::InvalidCredentials, "no");
        assert_eq!(response.id, 4);
        assert!(matches!(response.op, ProtocolOp::BindResponse(_)));

        let request = LdapMessage::new(
            5,
            ProtocolOp::SearchRequest(
                SearchRequest::new(FilterNode::present("objectClass"))
                    .scope(SearchScope::BaseObject),
            ),
        );
        let response = standard_response(&request, ResultCode::Success, "");
        assert!(matches!(response.op, ProtocolOp::SearchResultDone(_)));
    }

    #[test]
    fn notices_use_message_id_zero() {
        let notice = notice_of_disconnection(ResultCode::ProtocolError, "malformed");
        assert_eq!(notice.id, 0);
        match notice.op {
            ProtocolOp::ExtendedResponse(response) => {
                assert!(response.is_notice_of_disconnection());
                assert_eq!(response.result.code, ResultCode::ProtocolError);
            }
            _ => panic!("expected an extended response"),
        }
    }
}
