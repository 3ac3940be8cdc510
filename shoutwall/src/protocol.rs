//! JSON wire protocol for the relay.
//!
//! Wire format (JSON text frames over WebSocket):
//! ```text
//! Client → Server   {"type":"post","text":"hello"}
//! Server → Clients  {"type":"message","id":7,"created_at":1719324000123,
//!                    "text":"hello","country":"DE"}
//! ```
//!
//! The inbound side is fire-and-forget: frames that fail to parse, carry an
//! unknown `type`, or lack a textual `text` field are dropped without a
//! response. The outbound `country` field is omitted entirely when
//! enrichment is disabled.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// ISO 3166-1 alpha-2 country code (two uppercase ASCII letters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CountryCode([u8; 2]);

impl CountryCode {
    /// Parse a two-letter code, normalizing case. Returns `None` for
    /// anything that is not exactly two ASCII letters.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let bytes = s.as_bytes();
        if bytes.len() != 2 || !bytes.iter().all(|b| b.is_ascii_alphabetic()) {
            return None;
        }
        Some(Self([
            bytes[0].to_ascii_uppercase(),
            bytes[1].to_ascii_uppercase(),
        ]))
    }

    pub fn as_str(&self) -> &str {
        // Always valid: constructed from two ASCII letters
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl std::fmt::Display for CountryCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CountryCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ProtocolError::InvalidCountryCode(s.to_string()))
    }
}

/// Enrichment result attached to a message.
///
/// `Unknown` is a first-class value, not an error: it is what a message
/// carries when the lookup collaborator failed, timed out, or returned
/// garbage. Messages from deployments without enrichment carry no country
/// at all (`Option<Country>::None` on [`Message`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Country {
    Code(CountryCode),
    Unknown,
}

impl Country {
    /// Lenient parse: anything that is not a valid two-letter code
    /// (including the literal `"UNKNOWN"`) collapses to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match CountryCode::parse(s) {
            Some(code) => Country::Code(code),
            None => Country::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Country::Code(code) => code.as_str(),
            Country::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Country {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Country {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Country {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Country::parse(&s))
    }
}

/// An accepted, durably logged message. Immutable once created.
///
/// `id` and `created_at` are assigned by the durable log at accept time;
/// the sender identity is deliberately not part of this type and never
/// reaches other clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Strictly increasing, never reused.
    pub id: u64,
    /// Millisecond epoch, non-decreasing across appends.
    pub created_at: u64,
    pub text: String,
    /// Absent when enrichment is disabled.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub country: Option<Country>,
}

/// Client → Server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Post { text: String },
}

impl ClientFrame {
    pub fn post(text: impl Into<String>) -> Self {
        ClientFrame::Post { text: text.into() }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Server → Client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Message(Message),
}

impl ServerFrame {
    pub fn message(msg: Message) -> Self {
        ServerFrame::Message(msg)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidCountryCode(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidCountryCode(s) => write!(f, "Invalid country code: {s:?}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
