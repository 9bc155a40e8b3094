//! Error taxonomy of the protocol engine.
//!
//! The fatality rules differ per kind: a `Protocol` error tears a server
//! connection down (notice of disconnection first), an `Operation` error is
//! answered per-message and the connection lives on, a `Connection` error
//! ends the loop with no response attempted, and a `Bind` error is an
//! operation error specialized for credential shape problems.

use crate::result_code::ResultCode;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LdapError {
    /// The wire structure violated the protocol grammar.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-formed operation failed with an LDAP result code.
    #[error("operation failed ({}): {message}", code.code())]
    Operation {
        code: ResultCode,
        message: String,
        referrals: Vec<String>,
    },

    /// Transport-level failure; the connection is no longer usable.
    #[error("connection error: {0}")]
    Connection(String),

    /// Credential shape violation during a bind.
    #[error("bind error: {0}")]
    Bind(String),

    #[error(transparent)]
    FilterParse(#[from] FilterParseError),
}

impl LdapError {
    pub fn operation(code: ResultCode, message: impl Into<String>) -> Self {
        LdapError::Operation {
            code,
            message: message.into(),
            referrals: Vec::new(),
        }
    }

    /// The LDAP result code an error response for this failure should carry.
    pub fn result_code(&self) -> ResultCode {
        match self {
            LdapError::Protocol(_) => ResultCode::ProtocolError,
            LdapError::Operation { code, .. } => *code,
            LdapError::Connection(_) => ResultCode::Unavailable,
            LdapError::Bind(_) => ResultCode::InvalidCredentials,
            LdapError::FilterParse(_) => ResultCode::ProtocolError,
        }
    }
}

impl From<io::Error> for LdapError {
    fn from(err: io::Error) -> Self {
        LdapError::Connection(err.to_string())
    }
}

/// Failure to parse the RFC 4515 string form of a search filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("filter parse error at offset {offset}: {message}")]
pub struct FilterParseError {
    pub offset: usize,
    pub message: String,
}

impl FilterParseError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_error_carries_its_code() {
        let err = LdapError::operation(ResultCode::InvalidCredentials, "bad password");
        assert_eq!(err.result_code(), ResultCode::InvalidCredentials);
        assert!(err.to_string().contains("49"));
    }

    #[test]
    fn io_errors_become_connection_errors() {
        let err: LdapError = io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe").into();
        assert!(matches!(err, LdapError::Connection(_)));
    }
}
