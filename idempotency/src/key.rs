//! Idempotency keys, scopes and request fingerprints

use crate::{Error, Result};
use ledger_core::TenantId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Client-supplied idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    const MAX_LENGTH: usize = 128;

    /// Validate and wrap a raw header value (stored trimmed)
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into().trim().to_string();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Key as text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidKey("key cannot be empty".into()));
        }
        if key.len() > Self::MAX_LENGTH {
            return Err(Error::InvalidKey(format!(
                "key exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidKey("key contains invalid characters".into()));
        }
        Ok(())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uniqueness scope of a key: one tenant, one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Logical endpoint, e.g. `documents.create`
    pub endpoint: String,
}

impl Scope {
    /// Build a scope
    pub fn new(tenant_id: TenantId, endpoint: impl Into<String>) -> Self {
        Self {
            tenant_id,
            endpoint: endpoint.into(),
        }
    }

    /// Storage key: tenant bytes || endpoint || 0x00 || key
    pub(crate) fn record_key(&self, key: &IdempotencyKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.endpoint.len() + 1 + key.as_str().len());
        out.extend_from_slice(self.tenant_id.as_bytes());
        out.extend_from_slice(self.endpoint.as_bytes());
        out.push(0);
        out.extend_from_slice(key.as_str().as_bytes());
        out
    }
}

/// Hex SHA-256 over method, path and body
pub fn fingerprint(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(body);
    hex::encode(hasher.finalize())
}
