//! State-change records and the decoder seam.
//!
//! A [`StateChangeRecord`] is the unit moved from a source (binary log or
//! remote API) into the replica. Its `key_bytes` is the identity declared by
//! the source and is never recomputed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    Block,
    Transaction,
    Entity { encoder_type: u16 },
}

impl RecordKind {
    /// Column label stored in the replica.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Transaction => "transaction",
            Self::Entity { .. } => "entity",
        }
    }

    /// Encoder type discriminator; 0 for non-entity kinds.
    #[must_use]
    pub const fn encoder_type(self) -> u16 {
        match self {
            Self::Entity { encoder_type } => encoder_type,
            Self::Block | Self::Transaction => 0,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity { encoder_type } => write!(f, "entity:{encoder_type}"),
            other => f.write_str(other.label()),
        }
    }
}

/// How a record is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Upsert,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        })
    }
}

/// Decoded block header plus raw transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockPayload {
    pub version: u32,
    #[serde(with = "hex_bytes")]
    pub prev_block_hash: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub txn_merkle_root: Vec<u8>,
    pub timestamp_nanos: i64,
    pub height: u64,
    pub nonce: u64,
    pub extra_nonce: u64,
    pub proposed_in_view: u64,
    #[serde(with = "hex_list")]
    pub transactions: Vec<Vec<u8>>,
}

/// One state change at one height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeRecord {
    pub record_kind: RecordKind,
    pub operation_kind: OperationKind,
    #[serde(with = "hex_bytes")]
    pub key_bytes: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub payload: Vec<u8>,
    #[serde(with = "hex_opt", default, skip_serializing_if = "Option::is_none")]
    pub ancestral_payload: Option<Vec<u8>>,
    #[serde(default)]
    pub flush_id: String,
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockPayload>,
}

impl StateChangeRecord {
    /// Build a block upsert from a source-declared hash and decoded header.
    #[must_use]
    pub fn block(key_bytes: Vec<u8>, block: BlockPayload) -> Self {
        Self {
            record_kind: RecordKind::Block,
            operation_kind: OperationKind::Upsert,
            key_bytes,
            payload: Vec::new(),
            ancestral_payload: None,
            flush_id: String::new(),
            height: block.height,
            block: Some(block),
        }
    }

    #[must_use]
    pub fn is_block(&self) -> bool {
        self.record_kind == RecordKind::Block
    }

    /// Hex form of the identity, for logs.
    #[must_use]
    pub fn key_hex(&self) -> String {
        hex::encode(&self.key_bytes)
    }
}

/// Failure to decode one record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

/// Pure `bytes -> record` conversion for binary-log payloads.
pub trait RecordDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<StateChangeRecord, DecodeError>;
}

/// Decodes payloads written as JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordDecoder;

impl RecordDecoder for JsonRecordDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<StateChangeRecord, DecodeError> {
        serde_json::from_slice(bytes).map_err(|err| DecodeError(err.to_string()))
    }
}

/// Encode a record the way [`JsonRecordDecoder`] expects it.
pub fn encode_json(record: &StateChangeRecord) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(record)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| hex::decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod hex_list {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&hex::encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|text| hex::decode(text).map_err(serde::de::Error::custom))
            .collect()
    }
}
