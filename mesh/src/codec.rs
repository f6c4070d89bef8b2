//! Mutation wire format
//!
//! A [`MutationMessage`] is the only payload replicated between nodes. It is
//! encoded as JSON:
//!
//! ```json
//! {"operation":"set","key":"x","value":"1","timestamp":"2024-01-01T00:00:00Z"}
//! ```
//!
//! `timestamp` is optional and additive: peers that do not send it are still
//! understood, and their mutations are stamped on arrival.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

/// Kind of mutation carried by a [`MutationMessage`].
///
/// Tags this version does not know about are preserved as [`Operation::Unknown`]
/// instead of failing the decode, so a mixed-version cluster keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    Set,
    Delete,
    Unknown(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Set => "set",
            Operation::Delete => "delete",
            Operation::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "set" => Operation::Set,
            "delete" => Operation::Delete,
            _ => Operation::Unknown(tag),
        })
    }
}

/// A single key-value mutation as it travels through the broadcast queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationMessage {
    pub operation: Operation,
    pub key: String,
    /// Empty for deletes.
    #[serde(default)]
    pub value: String,
    /// Time the mutation was made on the originating node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MutationMessage {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            operation: Operation::Set,
            key: key.into(),
            value: value.into(),
            timestamp: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            key: key.into(),
            value: String::new(),
            timestamp: None,
        }
    }

    /// Attach the origination time of the mutation.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Serialize to the JSON wire format.
    ///
    /// Encoding failures yield an empty payload, which every receiver rejects
    /// as malformed.
    pub fn encode(&self) -> Vec<u8> {
        match serde_json::to_vec(self) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to encode mutation, dropping payload");
                Vec::new()
            }
        }
    }

    /// Parse a wire payload. Returns `None` for empty, truncated or non-JSON input.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        match serde_json::from_slice(bytes) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!(len = bytes.len(), error = %e, "Rejected malformed mutation payload");
                None
            }
        }
    }
}
