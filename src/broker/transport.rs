// =============================================================================
// Broker transport — the opaque request/response channel to the brokerage
// =============================================================================
//
// `BrokerTransport` is the one seam between this crate and the outside
// world's command endpoint. It knows nothing about trading semantics: it
// posts a named operation with a JSON payload and returns whatever JSON
// envelope came back, or a transport-level failure. Everything about what
// the envelope *means* is decoded by `BrokerGateway`, one level up.
//
// `HttpBrokerTransport` is the concrete implementation used in production,
// modeled on the request/response and error-context style of the exchange
// client this crate started from. `MockBrokerTransport` is a scriptable
// in-memory stand-in used by tests and by the demo/paper-trading path,
// grounded in the same crate's local-simulation execution branch.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::GatewayError;

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Invoke a named operation (e.g. `"market_buy"`, `"get_positions"`)
    /// with a JSON payload of parameters, returning the raw JSON envelope
    /// the broker sent back. Decoding/validation of that envelope is the
    /// gateway's job, not the transport's.
    async fn call(&self, op: &str, params: Value) -> Result<Value, GatewayError>;
}

/// Production transport: one HTTP POST per operation against a local
/// command bridge endpoint (`{base_url}/{op}`). `api_key`, when present, is
/// never logged or serialized — `Debug` is hand-implemented below to redact
/// it, matching this crate's handling of the broker credential everywhere
/// else it is held.
pub struct HttpBrokerTransport {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBrokerTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self::with_api_key(base_url, timeout, None)
    }

    pub fn with_api_key(base_url: impl Into<String>, timeout: Duration, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            api_key,
            client,
        }
    }
}

impl std::fmt::Debug for HttpBrokerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBrokerTransport")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl BrokerTransport for HttpBrokerTransport {
    #[instrument(skip(self, params), name = "broker::call")]
    async fn call(&self, op: &str, params: Value) -> Result<Value, GatewayError> {
        let url = format!("{}/{}", self.base_url, op);

        let mut request = self.client.post(&url).json(&params);
        if let Some(api_key) = &self.api_key {
            request = request.header("X-API-Key", api_key);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(Duration::from_secs(0))
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let body: Value = resp.json().await.map_err(|e| GatewayError::Malformed {
            detail: format!("non-JSON response body: {e}"),
        })?;

        if !status.is_success() {
            let reason = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("no error detail provided")
                .to_string();
            warn!(op, %status, reason, "broker rejected request");
            return Err(GatewayError::BrokerRejected { reason });
        }

        let success = body.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        if !success {
            let reason = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("success=false with no error detail")
                .to_string();
            return Err(GatewayError::BrokerRejected { reason });
        }

        debug!(op, "broker call succeeded");
        Ok(body)
    }
}

/// Scriptable in-memory transport for tests and demo/paper trading. Queue a
/// response per operation with `push_response`; calls are served FIFO per
/// operation name, with `push_error` letting tests script a failure.
#[derive(Default)]
pub struct MockBrokerTransport {
    queued: Mutex<std::collections::HashMap<String, VecDeque<Result<Value, GatewayError>>>>,
}

impl MockBrokerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, op: impl Into<String>, value: Value) {
        self.queued
            .lock()
            .entry(op.into())
            .or_default()
            .push_back(Ok(value));
    }

    pub fn push_error(&self, op: impl Into<String>, err: GatewayError) {
        self.queued
            .lock()
            .entry(op.into())
            .or_default()
            .push_back(Err(err));
    }
}

#[async_trait]
impl BrokerTransport for MockBrokerTransport {
    async fn call(&self, op: &str, _params: Value) -> Result<Value, GatewayError> {
        let mut queued = self.queued.lock();
        match queued.get_mut(op).and_then(|q| q.pop_front()) {
            Some(result) => result,
            None => Err(GatewayError::Transport(format!(
                "no scripted response queued for operation '{op}'"
            ))),
        }
    }
}
