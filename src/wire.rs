//! Envelope used by transports to tell single changes from digests.
//!
//! The envelope carries a type tag and opaque payload bytes. Payloads are
//! JSON-encoded here; a transport may carry the envelope itself in any
//! framing it likes.

use crate::error::{ChangeError, Result};
use crate::types::Change;
use serde::{Deserialize, Serialize};

/// Payload type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapperType {
    /// A single change.
    Change,
    /// A batch of changes.
    ChangeDigest,
}

/// A batch of changes sent as one message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDigest {
    pub changes: Vec<Change>,
}

/// Tagged payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wrapper {
    #[serde(rename = "type")]
    pub kind: WrapperType,
    pub payload: Vec<u8>,
}

/// Decoded envelope contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WirePayload {
    Change(Change),
    Digest(ChangeDigest),
}

impl Wrapper {
    /// Wrap a single change.
    pub fn change(change: &Change) -> Result<Self> {
        Ok(Self {
            kind: WrapperType::Change,
            payload: serde_json::to_vec(change)?,
        })
    }

    /// Wrap a batch of changes.
    pub fn digest(changes: &[Change]) -> Result<Self> {
        let digest = ChangeDigest {
            changes: changes.to_vec(),
        };
        Ok(Self {
            kind: WrapperType::ChangeDigest,
            payload: serde_json::to_vec(&digest)?,
        })
    }

    /// Decode the payload according to the type tag.
    pub fn decode(&self) -> Result<WirePayload> {
        match self.kind {
            WrapperType::Change => serde_json::from_slice(&self.payload)
                .map(WirePayload::Change)
                .map_err(|e| ChangeError::Deserialization(e.to_string())),
            WrapperType::ChangeDigest => serde_json::from_slice(&self.payload)
                .map(WirePayload::Digest)
                .map_err(|e| ChangeError::Deserialization(e.to_string())),
        }
    }

    /// Encode the envelope itself.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ChangeError::Deserialization(e.to_string()))
    }
}
