//! Best-effort country enrichment.
//!
//! The lookup collaborator is a capability: a function from connection
//! context to a country code, behind a timeout. Two real implementations
//! cover the deployment variants seen in practice:
//!
//! - [`HeaderLookup`] — a trusted reverse proxy already resolved the
//!   country and passed it in a request header; no network call.
//! - [`HttpLookup`] — reverse-lookup against an ipapi-style JSON endpoint
//!   keyed by the client IP.
//!
//! Failure of either degrades the annotation to [`Country::Unknown`];
//! nothing on this path can reject a message or block acceptance beyond
//! the configured timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;

use crate::protocol::{Country, CountryCode};

/// Default lookup timeout.
pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 1500;

/// What the transport layer knows about a connection at handshake time.
#[derive(Debug, Clone)]
pub struct ConnContext {
    /// Socket peer address.
    pub remote_addr: SocketAddr,
    /// Raw `X-Forwarded-For` value, when a proxy supplied one.
    pub forwarded_for: Option<String>,
    /// Value of the configured country header, when present.
    pub country_header: Option<String>,
}

impl ConnContext {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            forwarded_for: None,
            country_header: None,
        }
    }

    /// The client address used for identity hashing and geo lookup:
    /// first `X-Forwarded-For` hop when present, else the socket peer.
    pub fn client_ip(&self) -> String {
        self.forwarded_for
            .as_deref()
            .and_then(|raw| raw.split(',').next())
            .map(|hop| hop.trim().to_string())
            .filter(|hop| !hop.is_empty())
            .unwrap_or_else(|| self.remote_addr.ip().to_string())
    }
}

/// Lookup failures. Only ever observed as `Country::Unknown` downstream.
#[derive(Debug, Clone)]
pub enum LookupError {
    /// Collaborator unreachable or returned a failure status.
    Unavailable(String),
    /// Collaborator responded with something we could not use.
    Malformed(String),
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "lookup unavailable: {e}"),
            Self::Malformed(e) => write!(f, "lookup response malformed: {e}"),
        }
    }
}

impl std::error::Error for LookupError {}

/// Capability: resolve a connection to a country code.
pub trait CountryLookup: Send + Sync {
    fn lookup<'a>(
        &'a self,
        ctx: &'a ConnContext,
    ) -> BoxFuture<'a, Result<CountryCode, LookupError>>;
}

/// Country taken from a trusted proxy header (e.g. `CF-IPCountry`).
pub struct HeaderLookup;

impl CountryLookup for HeaderLookup {
    fn lookup<'a>(
        &'a self,
        ctx: &'a ConnContext,
    ) -> BoxFuture<'a, Result<CountryCode, LookupError>> {
        async move {
            let raw = ctx
                .country_header
                .as_deref()
                .ok_or_else(|| LookupError::Unavailable("country header missing".into()))?;
            CountryCode::parse(raw)
                .ok_or_else(|| LookupError::Malformed(format!("not a country code: {raw:?}")))
        }
        .boxed()
    }
}

/// Shape of an ipapi-style JSON response. Extra fields are ignored.
#[derive(Debug, Deserialize)]
struct GeoResponse {
    country_code: Option<String>,
}

/// Reverse-lookup against an external HTTP geolocation service.
///
/// The endpoint template contains an `{ip}` placeholder, e.g.
/// `https://ipapi.co/{ip}/json/`.
pub struct HttpLookup {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLookup {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl CountryLookup for HttpLookup {
    fn lookup<'a>(
        &'a self,
        ctx: &'a ConnContext,
    ) -> BoxFuture<'a, Result<CountryCode, LookupError>> {
        async move {
            let url = self.endpoint.replace("{ip}", &ctx.client_ip());
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| LookupError::Unavailable(e.to_string()))?;

            if !response.status().is_success() {
                return Err(LookupError::Unavailable(format!(
                    "status {}",
                    response.status()
                )));
            }

            let body: GeoResponse = response
                .json()
                .await
                .map_err(|e| LookupError::Malformed(e.to_string()))?;

            let raw = body
                .country_code
                .ok_or_else(|| LookupError::Malformed("country_code missing".into()))?;
            CountryCode::parse(&raw)
                .ok_or_else(|| LookupError::Malformed(format!("not a country code: {raw:?}")))
        }
        .boxed()
    }
}

/// Wraps the lookup capability with the degradation policy.
///
/// Enrichment runs once per connection at handshake and the result is
/// cached for the connection's lifetime (the amortized variant; per-message
/// lookup would hit the collaborator on every accepted post for no fresher
/// an answer).
pub struct Enricher {
    lookup: Option<Arc<dyn CountryLookup>>,
    timeout: Duration,
}

impl Enricher {
    pub fn new(lookup: Arc<dyn CountryLookup>, timeout: Duration) -> Self {
        Self {
            lookup: Some(lookup),
            timeout,
        }
    }

    /// Enrichment switched off: messages carry no country at all.
    pub fn disabled() -> Self {
        Self {
            lookup: None,
            timeout: Duration::from_millis(DEFAULT_LOOKUP_TIMEOUT_MS),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lookup.is_some()
    }

    /// Annotate a connection. `None` when enrichment is disabled;
    /// `Some(Country::Unknown)` on any failure or timeout.
    pub async fn annotate(&self, ctx: &ConnContext) -> Option<Country> {
        let lookup = self.lookup.as_ref()?;

        match tokio::time::timeout(self.timeout, lookup.lookup(ctx)).await {
            Ok(Ok(code)) => Some(Country::Code(code)),
            Ok(Err(e)) => {
                log::debug!("country lookup failed for {}: {e}", ctx.client_ip());
                Some(Country::Unknown)
            }
            Err(_) => {
                log::debug!(
                    "country lookup timed out after {:?} for {}",
                    self.timeout,
                    ctx.client_ip()
                );
                Some(Country::Unknown)
            }
        }
    }
}
