use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoding or decoding a snapshot failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("codec error: {0}")]
pub struct CodecError(String);

impl From<String> for CodecError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Encodes a value with postcard.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError(e.to_string()))
}

/// Decodes a postcard value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError(e.to_string()))
}

/// Serialized form of an entity as held in the cluster cache.
///
/// The cache never sees typed values; nodes exchange snapshots so that a
/// value written by one node is independent of any other node's memory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot(Vec<u8>);

impl Snapshot {
    /// Encodes `value` into a snapshot.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        encode(value).map(Self)
    }

    /// Decodes the snapshot.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        decode(&self.0)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot({} bytes)", self.0.len())
    }
}
