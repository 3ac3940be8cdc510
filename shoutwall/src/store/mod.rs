//! Durable log of accepted messages.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐   append(text, country)   ┌──────────────────┐
//! │ Pipeline       │ ─────────────────────────►│ dyn MessageLog   │
//! │                │ ◄─────────────────────────│                  │
//! └────────────────┘   Message{id,created_at}  │  RocksLog (disk) │
//!         │                                    │  MemoryLog (RAM) │
//!         │ recent(limit) — history replay     └──────────────────┘
//! ```
//!
//! The log is the single point of total order: ids are assigned in append
//! order under one writer, and `created_at` never goes backward within a
//! process lifetime. An append must be durable before it returns — the
//! pipeline broadcasts only what this layer has acknowledged.

pub mod memory;
pub mod rocks;

pub use memory::MemoryLog;
pub use rocks::{RocksLog, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::{Country, Message};

/// Append-only store of accepted messages.
pub trait MessageLog: Send + Sync {
    /// Assign the next id and timestamp, persist, and return the full
    /// message. Durable before returning.
    fn append(&self, text: &str, country: Option<Country>) -> Result<Message, StoreError>;

    /// Up to `limit` most recently appended messages, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError>;

    /// Total number of messages ever appended.
    fn len(&self) -> Result<u64, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// On-disk record shape.
///
/// Distinct from the wire [`Message`]: the wire type omits `country` from
/// JSON when absent, which bincode (not self-describing) cannot round-trip.
/// Here the option is always encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredMessage {
    pub id: u64,
    pub created_at: u64,
    pub text: String,
    pub country: Option<Country>,
}

impl StoredMessage {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            created_at: self.created_at,
            text: self.text,
            country: self.country,
        }
    }
}

/// Wall clock in millisecond epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
