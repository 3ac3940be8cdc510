//! In-memory message log.
//!
//! Used when the server runs without a storage path, and as the backend of
//! choice in tests. Same contract as the persistent log, minus crash
//! durability ("durable" here means the append is visible to every later
//! `recent` call within this process).

use std::sync::Mutex;

use super::{now_millis, MessageLog, StoreError};
use crate::protocol::{Country, Message};

struct Inner {
    messages: Vec<Message>,
    next_id: u64,
    last_created_at: u64,
}

/// Volatile, process-local message log.
pub struct MemoryLog {
    inner: Mutex<Inner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                next_id: 1,
                last_created_at: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog for MemoryLog {
    fn append(&self, text: &str, country: Option<Country>) -> Result<Message, StoreError> {
        let mut inner = self.lock();

        let id = inner.next_id;
        let created_at = now_millis().max(inner.last_created_at);

        let message = Message {
            id,
            created_at,
            text: text.to_string(),
            country,
        };

        inner.messages.push(message.clone());
        inner.next_id = id + 1;
        inner.last_created_at = created_at;

        Ok(message)
    }

    fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let inner = self.lock();
        let start = inner.messages.len().saturating_sub(limit);
        Ok(inner.messages[start..].to_vec())
    }

    fn len(&self) -> Result<u64, StoreError> {
        Ok(self.lock().messages.len() as u64)
    }
}
