//! Ingestion pipeline: the per-frame state machine.
//!
//! ```text
//! raw frame ──► Received ──► Validated ──► RateChecked ──► Enriched
//!                  │             │              │              │
//!                  ▼             ▼              ▼              ▼
//!               Dropped       Dropped        Dropped       Persisted ──► Broadcast
//!             (malformed)     (empty)       (cooling)         │
//!                                                             ▼
//!                                                          Dropped
//!                                                       (store failed)
//! ```
//!
//! Every gate failure is contained here: the transport layer drops the
//! frame silently (the protocol is fire-and-forget), while the returned
//! [`DropReason`] keeps each gate observable to callers and tests. A
//! message is broadcast only after the durable log has acknowledged it.
//!
//! The pipeline owns nothing ambient: sanitizer, limiter, log, and registry
//! are injected at construction, one set per server instance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::identity::SenderIdentity;
use crate::protocol::{ClientFrame, Country, Message};
use crate::rate_limit::{Gate, RateLimiter};
use crate::registry::ConnectionRegistry;
use crate::sanitize::Sanitizer;
use crate::store::{MessageLog, StoreError};

/// Immutable per-connection facts the pipeline needs for each frame.
///
/// The country annotation is resolved once at handshake (connection-scoped
/// enrichment) and rides along here.
#[derive(Debug, Clone)]
pub struct SenderContext {
    pub identity: SenderIdentity,
    pub country: Option<Country>,
}

/// Why a frame was dropped. Never sent back to the client.
#[derive(Debug)]
pub enum DropReason {
    /// Unparseable, wrong `type`, or non-textual `text`.
    MalformedFrame,
    /// Empty after trimming.
    EmptyText,
    /// Sender identity still cooling down.
    RateLimited { remaining: Duration },
    /// Durable append failed; the message was not broadcast.
    Persistence(StoreError),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedFrame => write!(f, "malformed frame"),
            Self::EmptyText => write!(f, "empty text"),
            Self::RateLimited { remaining } => {
                write!(f, "rate limited ({}ms remaining)", remaining.as_millis())
            }
            Self::Persistence(e) => write!(f, "persistence failure: {e}"),
        }
    }
}

/// Orchestrates sanitizer → rate limiter → enrichment → log → fan-out.
pub struct Pipeline {
    sanitizer: Sanitizer,
    limiter: Arc<RateLimiter>,
    log: Arc<dyn MessageLog>,
    registry: Arc<ConnectionRegistry>,
}

impl Pipeline {
    pub fn new(
        sanitizer: Sanitizer,
        limiter: Arc<RateLimiter>,
        log: Arc<dyn MessageLog>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            sanitizer,
            limiter,
            log,
            registry,
        }
    }

    /// Run one inbound frame through the state machine.
    ///
    /// Returns the accepted, already-broadcast message, or the gate that
    /// dropped it.
    pub async fn ingest(
        &self,
        sender: &SenderContext,
        raw: &str,
    ) -> Result<Message, DropReason> {
        // Received
        let ClientFrame::Post { text } =
            ClientFrame::decode(raw).map_err(|_| DropReason::MalformedFrame)?;

        // Validated
        let text = self
            .sanitizer
            .sanitize(&text)
            .map_err(|_| DropReason::EmptyText)?;

        // RateChecked — check and record are one atomic step
        if let Gate::Cooling { remaining } =
            self.limiter.check_and_record(&sender.identity, Instant::now())
        {
            return Err(DropReason::RateLimited { remaining });
        }

        // Enriched — connection-scoped annotation, resolved at handshake
        let country = sender.country;

        // Persisted — durability before delivery, always
        let message = self.log.append(&text, country).map_err(|e| {
            log::error!("failed to persist message from {}: {e}", sender.identity);
            DropReason::Persistence(e)
        })?;

        // Broadcast
        let delivered = self.registry.broadcast(&message).await;
        log::debug!(
            "message {} from {} fanned out to {delivered} connections",
            message.id,
            sender.identity
        );

        Ok(message)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }
}
