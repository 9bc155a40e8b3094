//! Synthesizes the root DSE entry from the server options and answers
//! base-scope searches against the empty DN.

use crate::controls;
use crate::entry::Entry;
use crate::error::LdapError;
use crate::message::{
    LdapMessage, LdapResult, ProtocolOp, SearchRequest, SearchResultEntry, OID_START_TLS,
    OID_WHOAMI,
};
use crate::server::handler::{RequestContext, RootDseHandler};
use crate::server::ServerOptions;
use crate::session::ServerSession;

/// Answer a root DSE read: build the synthetic entry, trim it to the
/// requested attributes, let the collaborator reshape it, then send the
/// entry and its done as one write.
pub async fn handle_request(
    message: &LdapMessage,
    request: &SearchRequest,
    context: &RequestContext,
    options: &ServerOptions,
    collaborator: Option<&dyn RootDseHandler>,
    session: &mut ServerSession,
) -> Result<(), LdapError> {
    let mut entry = build_entry(options);
    filter_attributes(request, &mut entry);
    if let Some(collaborator) = collaborator {
        entry = collaborator.root_dse(context, request, entry);
    }
    session
        .send(&[
            LdapMessage::new(
                message.id,
                ProtocolOp::SearchResultEntry(SearchResultEntry::from_entry(&entry)),
            ),
            LdapMessage::new(message.id, ProtocolOp::SearchResultDone(LdapResult::success())),
        ])
        .await
}

fn build_entry(options: &ServerOptions) -> Entry {
    let mut entry = Entry::from_attributes(
        "",
        [
            ("namingContexts", options.naming_contexts.clone()),
            ("supportedLDAPVersion", vec!["3".to_string()]),
            ("vendorName", vec![options.vendor_name.clone()]),
        ],
    );
    entry.add("supportedExtension", [OID_WHOAMI]);
    if options.supports_start_tls {
        entry.add("supportedExtension", [OID_START_TLS]);
    }
    if options.supports_paging {
        entry.add("supportedControl", [controls::OID_PAGING]);
    }
    if let Some(version) = &options.vendor_version {
        entry.set("vendorVersion", [version.clone()]);
    }
    if let Some(alt_server) = &options.alt_server {
        entry.set("altServer", [alt_server.clone()]);
    }
    // synthesis is not a mutation anyone needs to replay
    entry.take_changes();
    entry
}

/// An explicit attribute list keeps only matching names; a types-only
/// request strips values.
fn filter_attributes(request: &SearchRequest, entry: &mut Entry) {
    if !request.attributes.is_empty() {
        entry
            .attributes_mut()
            .retain(|attribute| {
                request
                    .attributes
                    .iter()
                    .any(|requested| attribute.matches(requested))
            });
    }
    if request.types_only {
        for attribute in entry.attributes_mut() {
            attribute.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterNode;
    use crate::message::SearchScope;

    fn options() -> ServerOptions {
        ServerOptions {
            naming_contexts: vec!["dc=example,dc=com".into()],
            vendor_name: "ldapkit".into(),
            vendor_version: Some("0.1.0".into()),
            supports_start_tls: true,
            supports_paging: true,
            ..ServerOptions::default()
        }
    }

    fn root_dse_request() -> SearchRequest {
        SearchRequest::new(FilterNode::present("objectClass")).scope(SearchScope::BaseObject)
    }

    #[test]
    fn builds_the_advertised_capabilities() {
        let entry = build_entry(&options());
        assert!(entry.dn().is_root_dse());
        assert_eq!(
            entry.get("namingContexts").unwrap().string_values(),
            vec!["dc=example,dc=com"]
        );
        let extensions = entry.get("supportedExtension").unwrap().string_values();
        assert!(extensions.contains(&OID_WHOAMI.to_string()));
        assert!(extensions.contains(&OID_START_TLS.to_string()));
        assert_eq!(
            entry.get("supportedControl").unwrap().string_values(),
            vec![controls::OID_PAGING]
        );
        assert_eq!(entry.get("vendorVersion").unwrap().string_values(), vec!["0.1.0"]);
        assert!(entry.changes().is_empty());
    }

    #[test]
    fn explicit_attribute_list_keeps_only_matches() {
        let mut entry = build_entry(&options());
        let request = root_dse_request();
        let request = SearchRequest {
            attributes: vec!["namingContexts".into(), "vendorname".into()],
            ..request
        };
        filter_attributes(&request, &mut entry);
        assert!(entry.has("namingContexts"));
        assert!(entry.has("vendorName"));
        assert!(!entry.has("supportedExtension"));
    }

    #[test]
    fn types_only_strips_values() {
        let mut entry = build_entry(&options());
        let request = SearchRequest {
            types_only: true,
            ..root_dse_request()
        };
        filter_attributes(&request, &mut entry);
        assert!(entry.has("namingContexts"));
        assert!(entry.get("namingContexts").unwrap().values().is_empty());
    }
}
