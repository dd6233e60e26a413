//! Artifact handles.
//!
//! A handle names exactly one immutable blob in the artifact store. Handles
//! are content addresses (SHA256 of the payload), so two different payloads
//! can never share a handle.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix used when a handle is embedded in a JSON task value
const HANDLE_PREFIX: &str = "artifact:";

/// Opaque identifier of a blob in the artifact store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactHandle(String);

impl ArtifactHandle {
    /// Derive the handle for a payload
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest without the `artifact:` prefix
    pub fn digest(&self) -> &str {
        &self.0
    }

    /// Short form for log lines (first 12 hex chars)
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Encode the handle as a JSON value so it can travel through task outputs
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::String(self.to_string())
    }

    /// Recover a handle from a JSON task value
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value.as_str().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", HANDLE_PREFIX, self.0)
    }
}

/// Error returned when a string is not a valid handle
#[derive(Debug, Clone, Error)]
#[error("not an artifact handle: {0}")]
pub struct InvalidHandle(String);

impl FromStr for ArtifactHandle {
    type Err = InvalidHandle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digest = s.strip_prefix(HANDLE_PREFIX).unwrap_or(s);
        let valid = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(InvalidHandle(s.to_string()));
        }
        Ok(Self(digest.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for ArtifactHandle {
    type Error = InvalidHandle;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactHandle> for String {
    fn from(handle: ArtifactHandle) -> Self {
        handle.to_string()
    }
}
