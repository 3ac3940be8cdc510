//! Live connection set and fan-out.
//!
//! Each connection owns a bounded outbound channel; its task drains the
//! channel into the WebSocket sink. Broadcast serializes the frame once,
//! snapshots the current connection set, and pushes the shared payload into
//! every channel:
//!
//! - a connection registered after the snapshot does not receive that frame;
//! - a closed channel (task gone) gets the connection unregistered;
//! - a full channel (client not keeping up) drops the frame for that
//!   connection only.
//!
//! One misbehaving connection can never stall or fail delivery to the rest,
//! and nothing on this path reports an error to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{Message, ServerFrame};

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_connections: usize,
}

/// Delivery counters — atomics so broadcast never takes a write lock
/// just to count.
struct AtomicRegistryStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicRegistryStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// The set of live subscriber connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, mpsc::Sender<Arc<str>>>>,
    /// Outbound channel capacity per connection
    capacity: usize,
    stats: AtomicRegistryStats,
}

impl ConnectionRegistry {
    /// `capacity` bounds how many frames may queue per connection before a
    /// slow client starts losing broadcasts (backpressure).
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicRegistryStats::new(),
        }
    }

    /// Add a connection to the live set, effective for all future
    /// broadcasts. Returns its id and the receiving end of its outbound
    /// channel.
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        self.connections.write().await.insert(id, tx);
        (id, rx)
    }

    /// Remove a connection. Idempotent: unknown or already-removed ids are
    /// a no-op. Returns whether the connection was present.
    pub async fn unregister(&self, id: &Uuid) -> bool {
        self.connections.write().await.remove(id).is_some()
    }

    /// Deliver a message to every connection in the current set.
    ///
    /// Returns the number of connections the frame was queued for. Never
    /// errors: serialization failure is logged and delivers to nobody.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let frame = ServerFrame::message(message.clone());
        let payload: Arc<str> = match frame.encode() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                log::error!("failed to encode broadcast frame: {e}");
                return 0;
            }
        };
        self.broadcast_raw(payload).await
    }

    /// Fan a pre-serialized payload out to the snapshot of connections.
    pub async fn broadcast_raw(&self, payload: Arc<str>) -> usize {
        // Snapshot under the read lock; senders are cheap to clone and the
        // lock is released before any delivery attempt.
        let snapshot: Vec<(Uuid, mpsc::Sender<Arc<str>>)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut stale = Vec::new();

        for (id, tx) in snapshot {
            match tx.try_send(payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Best-effort: the lagging connection loses this frame,
                    // everyone else is unaffected.
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("connection {id} lagging, dropped broadcast frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    stale.push(id);
                }
            }
        }

        if !stale.is_empty() {
            let mut connections = self.connections.write().await;
            for id in &stale {
                connections.remove(id);
                log::debug!("unregistered dead connection {id}");
            }
        }

        delivered
    }

    /// Number of currently registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether a connection is currently registered.
    pub async fn contains(&self, id: &Uuid) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Delivery statistics snapshot.
    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }
}
