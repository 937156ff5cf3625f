//! HTTP client that performs one delivery attempt and classifies it.
//!
//! A delivery never fails from the caller's point of view. Every outcome,
//! from a 200 to an unresolvable host, is folded into a
//! [`TransportOutcome`] and then into the [`WebhookState`] recorded on the
//! event. The client does not touch storage.

use std::{
    collections::HashMap,
    error::Error as StdError,
    time::{Duration, Instant},
};

use bytes::Bytes;
use httpq_core::{DeliveryResponse, EventId, PendingDelivery, WebhookState};
use reqwest::{header::HeaderMap, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    DEFAULT_DELIVERY_TIMEOUT_MS,
};

/// Largest response body kept on the event.
pub const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Hard timeout of a whole request, connect included.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            user_agent: "httpq/1.0.0".to_string(),
        }
    }
}

/// HTTP client shared by all delivery workers.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// A single outbound delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Event being delivered.
    pub event_id: EventId,
    /// Destination URL, as stored on the subscription.
    pub url: String,
    /// Host parsed from the URL, if it parses.
    pub host: Option<String>,
    /// Port parsed from the URL, or the scheme default.
    pub port: Option<u16>,
    /// Whether the URL uses https.
    pub use_tls: bool,
    /// Captured headers forwarded with the payload.
    pub headers: HashMap<String, String>,
    /// JSON payload.
    pub body: Bytes,
}

impl DeliveryRequest {
    /// Builds a request for `event_id` to `url`.
    pub fn new(
        event_id: EventId,
        url: impl Into<String>,
        headers: HashMap<String, String>,
        body: impl Into<Bytes>,
    ) -> Self {
        let url = url.into();
        let parsed = Url::parse(&url).ok();

        Self {
            event_id,
            host: parsed.as_ref().and_then(|u| u.host_str().map(str::to_string)),
            port: parsed.as_ref().and_then(Url::port_or_known_default),
            use_tls: parsed.as_ref().is_some_and(|u| u.scheme() == "https"),
            url,
            headers,
            body: body.into(),
        }
    }
}

impl From<PendingDelivery> for DeliveryRequest {
    fn from(pending: PendingDelivery) -> Self {
        let headers = pending.request_headers.map(|h| h.0).unwrap_or_default();
        let body = pending.request_body.unwrap_or_default();
        Self::new(pending.event_id, pending.url, headers, body)
    }
}

/// What the transport observed for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    /// A response arrived with this status.
    Success(u16),
    /// The host name did not resolve.
    HostUnresolved,
    /// The connection closed before the response completed.
    Closed,
    /// The deadline elapsed.
    TimedOut,
    /// The TLS handshake or certificate check failed.
    TlsFailed,
    /// Anything else, with its cause.
    Other(String),
}

impl TransportOutcome {
    /// Classifies a transport error.
    ///
    /// Checks run in a fixed order: timeout, host resolution, TLS, closed
    /// connection, then everything else.
    pub fn from_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::TimedOut;
        }

        // The top-level message repeats the URL, so only the causes are matched
        let mut messages = Vec::new();
        let mut source: Option<&(dyn StdError + 'static)> = error.source();
        while let Some(current) = source {
            if let Some(io) = current.downcast_ref::<std::io::Error>() {
                match io.kind() {
                    std::io::ErrorKind::TimedOut => return Self::TimedOut,
                    std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe => return Self::Closed,
                    _ => {},
                }
            }
            messages.push(current.to_string().to_lowercase());
            source = current.source();
        }

        let chain = messages.join(": ");
        if ["dns error", "failed to lookup address", "name or service not known", "no such host"]
            .iter()
            .any(|needle| chain.contains(needle))
        {
            return Self::HostUnresolved;
        }
        if ["certificate", "tls", "handshake"].iter().any(|needle| chain.contains(needle)) {
            return Self::TlsFailed;
        }
        if ["connection closed before message completed", "incomplete message", "connection reset"]
            .iter()
            .any(|needle| chain.contains(needle))
        {
            return Self::Closed;
        }

        if chain.is_empty() {
            return Self::Other(error.to_string());
        }
        Self::Other(chain)
    }

    /// State recorded for this outcome.
    pub fn state(&self) -> WebhookState {
        match self {
            Self::Success(200) => WebhookState::Delivered,
            Self::Success(429) => WebhookState::Backoff,
            Self::Success(_) => WebhookState::HttpError,
            Self::HostUnresolved => WebhookState::UnknownHost,
            Self::Closed | Self::TimedOut => WebhookState::Timeout,
            Self::TlsFailed => WebhookState::TlsError,
            Self::Other(_) => WebhookState::Other,
        }
    }

    /// Status code for outcomes that produced a response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Success(status) => Some(*status),
            _ => None,
        }
    }
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the timeout is zero or the
    /// HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("delivery timeout must be positive"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one POST and classifies the result.
    pub async fn deliver(&self, request: DeliveryRequest) -> DeliveryResponse {
        let span = info_span!(
            "webhook_delivery",
            event_id = %request.event_id,
            url = %request.url,
            use_tls = request.use_tls,
        );

        async move {
            let start = Instant::now();

            let mut http_request = self
                .client
                .post(&request.url)
                .header("content-type", "application/json")
                .body(request.body.clone());
            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            let (outcome, headers, body) = match http_request.send().await {
                Ok(response) => read_response(response).await,
                Err(error) => {
                    let outcome = TransportOutcome::from_error(&error);
                    warn!(error = %error, ?outcome, "delivery request failed");
                    (outcome, HashMap::new(), None)
                },
            };

            let duration = start.elapsed();
            let state = outcome.state();
            debug!(%state, status = ?outcome.status_code(), duration_ms = duration.as_millis(), "delivery attempt classified");

            DeliveryResponse {
                event_id: request.event_id,
                state,
                status_code: outcome.status_code(),
                headers,
                body,
                duration,
                url: request.url,
            }
        }
        .instrument(span)
        .await
    }
}

async fn read_response(
    response: Response,
) -> (TransportOutcome, HashMap<String, String>, Option<String>) {
    let status = response.status();
    let headers = extract_headers(response.headers());

    if status == StatusCode::TOO_MANY_REQUESTS {
        return (TransportOutcome::Success(status.as_u16()), headers, None);
    }

    match response.bytes().await {
        Ok(bytes) => (TransportOutcome::Success(status.as_u16()), headers, Some(truncate_body(&bytes))),
        Err(error) if error.is_timeout() => (TransportOutcome::TimedOut, headers, None),
        Err(error) => {
            warn!(error = %error, "failed to read response body");
            (TransportOutcome::Success(status.as_u16()), headers, None)
        },
    }
}

fn truncate_body(bytes: &[u8]) -> String {
    let kept = &bytes[..bytes.len().min(MAX_RESPONSE_BODY_SIZE)];
    String::from_utf8_lossy(kept).into_owned()
}

/// Extracts headers from reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}

/// Checks if a header is set by the client itself and must not be copied
/// from the captured request.
pub fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
