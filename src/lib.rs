//! An RFC 4511 LDAP protocol engine for building clients and servers.
//!
//! The crate covers the protocol session layer: message envelope
//! correlation, the control codec framework, the search-filter grammar,
//! the client dispatch pipeline (search aggregation, SASL rounds, StartTLS,
//! referral chasing, sync polling), the authorization-gated server router,
//! and the continuation protocols built on a session (paging, VLV, DirSync,
//! SyncRepl). BER framing rides on the typed node codec in [`asn1`];
//! sockets, TLS handshakes and SASL mechanism internals stay outside,
//! injected through the seams in [`session`] and [`client`].

pub mod asn1;
pub mod client;
pub mod codec;
pub mod controls;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod message;
pub mod result_code;
pub mod search;
pub mod server;
pub mod session;
pub mod tls;

pub use client::{ClientOptions, LdapClient, SearchOutcome};
pub use dn::Dn;
pub use entry::{Attribute, Entries, Entry};
pub use error::{FilterParseError, LdapError};
pub use filter::FilterNode;
pub use message::{LdapMessage, LdapResult, ProtocolOp, SearchRequest, SearchScope};
pub use result_code::ResultCode;
pub use search::{DirSync, Paging, SyncRepl, Vlv};
pub use server::{ServerOptions, ServerRouter};
pub use session::{ClientSession, ServerSession};
