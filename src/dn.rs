//! Distinguished name model.

use crate::error::LdapError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A distinguished name. Stored in its string form; split into RDNs on
/// demand. The empty DN names the root DSE.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dn(String);

impl Dn {
    pub fn new(dn: impl Into<String>) -> Self {
        Dn(dn.into())
    }

    /// The root DSE DN (the empty string).
    pub fn root_dse() -> Self {
        Dn(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root_dse(&self) -> bool {
        self.0.is_empty()
    }

    /// RDN components, leftmost first. Commas escaped with a backslash do
    /// not split.
    pub fn rdns(&self) -> Vec<&str> {
        if self.0.is_empty() {
            return Vec::new();
        }
        let mut parts = Vec::new();
        let bytes = self.0.as_bytes();
        let mut start = 0;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate() {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b',' {
                parts.push(self.0[start..i].trim());
                start = i + 1;
            }
        }
        parts.push(self.0[start..].trim());
        parts
    }

    pub fn len(&self) -> usize {
        self.rdns().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The parent DN, or None at the root.
    pub fn parent(&self) -> Option<Dn> {
        let rdns = self.rdns();
        if rdns.len() < 2 {
            return None;
        }
        Some(Dn(rdns[1..].join(",")))
    }

    /// The leading RDN split into its attribute and value.
    pub fn rdn(&self) -> Result<(String, String), LdapError> {
        let rdns = self.rdns();
        let first = rdns
            .first()
            .ok_or_else(|| LdapError::Protocol("the root DSE has no RDN".into()))?;
        let (attr, value) = first
            .split_once('=')
            .ok_or_else(|| LdapError::Protocol(format!("malformed RDN: {first}")))?;
        Ok((attr.trim().to_string(), value.trim().to_string()))
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dn {
    fn from(dn: &str) -> Self {
        Dn(dn.to_string())
    }
}

impl From<String> for Dn {
    fn from(dn: String) -> Self {
        Dn(dn)
    }
}
