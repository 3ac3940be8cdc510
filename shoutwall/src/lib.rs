//! # shoutwall — real-time message relay
//!
//! Clients submit short text posts over a persistent WebSocket; the server
//! validates, rate-limits, optionally annotates each post with a country,
//! appends it to a durable log, and rebroadcasts it to every connected
//! client. Newly connecting clients receive the recent history first.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer                  │
//! │ (per user)  │     JSON frames     │   per-connection task        │
//! └─────────────┘                     └──────────────┬───────────────┘
//!                                                    │
//!                                          IngestionPipeline
//!                                   Sanitizer → RateLimiter → Enricher
//!                                                    │
//!                                        MessageLog (RocksDB / memory)
//!                                                    │
//!                                         ConnectionRegistry (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames and the [`Message`] model
//! - [`sanitize`] — input trimming, bounding, rejection
//! - [`identity`] — salted, non-reversible sender identities
//! - [`rate_limit`] — per-identity cooldown gate with eviction
//! - [`enrich`] — best-effort country lookup capability
//! - [`store`] — append-only durable log (RocksDB or in-memory)
//! - [`registry`] — live connection set and fan-out
//! - [`pipeline`] — the per-frame ingestion state machine
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket relay client

pub mod client;
pub mod enrich;
pub mod identity;
pub mod pipeline;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod sanitize;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use client::{ConnectionState, RelayClient, RelayEvent};
pub use enrich::{ConnContext, CountryLookup, Enricher, HeaderLookup, HttpLookup, LookupError};
pub use identity::{IdentitySalt, SenderIdentity};
pub use pipeline::{DropReason, Pipeline, SenderContext};
pub use protocol::{ClientFrame, Country, CountryCode, Message, ProtocolError, ServerFrame};
pub use rate_limit::{Gate, RateLimiter};
pub use registry::{ConnectionRegistry, RegistryStats};
pub use sanitize::{Rejected, Sanitizer};
pub use server::{GeoConfig, GeoMode, RelayServer, ServerConfig, ServerStats};
pub use store::{MemoryLog, MessageLog, RocksLog, StoreConfig, StoreError};
