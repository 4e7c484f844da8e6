//! Backend (C2): one upstream endpoint — transport, rate/size/timeout
//! limits, health windows, and ban state.
//!
//! Generalizes the teacher's `Web3Connection` (`rpcs/connection.rs`, not
//! itself in the retrieval pack) and `OpenRequestHandle` request path
//! (`rpcs/request.rs`) onto the spec's `Backend`/`BackendState` split: this
//! struct owns the transport and its own sliding windows; the consensus
//! poller (`rpcs::consensus`) owns the cross-backend `BackendState` view.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ratelimiter::TokenBucketLimiter;
use tracing::{debug, trace, warn};
use window::{Clock, LatencyEma, SlidingWindow};

use crate::config::BackendConfig;
use crate::errors::{ProxydError, ProxydResult};
use crate::jsonrpc::{JsonRpcErrorData, JsonRpcForwardedResponse, JsonRpcRequest};
use crate::metrics::BackendMeter;
use crate::rpcs::provider::Transport;

/// `ErrBackendBadResponse` and friends are "transient infrastructure", not
/// client mistakes — callers use this to decide whether to retry and
/// whether to bump the error window.
fn is_retryable(err: &ProxydError) -> bool {
    matches!(
        err,
        ProxydError::BackendRequestTimeout
            | ProxydError::BackendBadResponse(_)
            | ProxydError::BackendResponseTooLarge
            | ProxydError::Http(_)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    Alive,
    OutOfService,
}

pub struct Backend {
    pub name: String,
    pub transport: Arc<dyn Transport>,
    pub timeout: Duration,
    pub max_request_body_bytes: usize,
    pub max_response_body_bytes: usize,
    pub max_retries: u32,
    pub out_of_service: Duration,
    pub max_latency_ms: f64,
    pub max_degraded_latency_ms: f64,
    pub max_error_rate: f64,
    pub strip_trailing_xff: bool,
    pub skip_peer_count_check: bool,
    pub skip_is_syncing_check: bool,
    pub forced_candidate: bool,
    pub headers_passthrough: bool,

    rate_limiter: TokenBucketLimiter<()>,
    latency: LatencyEma,
    error_window: SlidingWindow,
    active_ws_conns: AtomicU64,
    max_ws_conns: u32,
    banned_until: Mutex<Option<std::time::Instant>>,
    out_of_service_flag: AtomicBool,
    last_request_time: Mutex<Option<std::time::Instant>>,
    pub meter: BackendMeter,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("health", &self.health())
            .field("latency_ms", &self.latency.value_ms())
            .finish()
    }
}

impl Backend {
    pub fn new(
        name: impl Into<String>,
        config: &BackendConfig,
        defaults: &crate::config::BackendDefaults,
        transport: Arc<dyn Transport>,
        clock_for_rate_limit: Box<dyn Clock>,
        clock_for_error_window: Box<dyn Clock>,
    ) -> Self {
        let max_rps = config.max_rps.unwrap_or(defaults.max_rps);

        Self {
            name: name.into(),
            transport,
            timeout: Duration::from_millis(config.timeout_ms.unwrap_or(defaults.timeout_ms)),
            max_request_body_bytes: defaults.max_request_body_bytes,
            max_response_body_bytes: defaults.max_response_body_bytes,
            max_retries: config.max_retries.unwrap_or(defaults.max_retries),
            out_of_service: Duration::from_secs(
                config.out_of_service_seconds.unwrap_or(defaults.out_of_service_seconds),
            ),
            max_latency_ms: defaults.max_latency_ms,
            max_degraded_latency_ms: defaults.max_degraded_latency_ms,
            max_error_rate: defaults.max_error_rate,
            strip_trailing_xff: config.strip_trailing_xff,
            skip_peer_count_check: config.skip_peer_count_check,
            skip_is_syncing_check: config.skip_is_syncing_check,
            forced_candidate: config.forced_candidate,
            headers_passthrough: config.headers_passthrough,
            rate_limiter: TokenBucketLimiter::new(max_rps, Duration::from_secs(1), clock_for_rate_limit),
            latency: LatencyEma::new(0.2),
            error_window: SlidingWindow::new(Duration::from_secs(60), Duration::from_secs(1), clock_for_error_window),
            active_ws_conns: AtomicU64::new(0),
            max_ws_conns: config.max_ws_conns.unwrap_or(defaults.max_ws_conns),
            banned_until: Mutex::new(None),
            out_of_service_flag: AtomicBool::new(false),
            last_request_time: Mutex::new(None),
            meter: BackendMeter::default(),
        }
    }

    pub fn health(&self) -> BackendHealth {
        if self.out_of_service_flag.load(Ordering::Relaxed) {
            BackendHealth::OutOfService
        } else {
            BackendHealth::Alive
        }
    }

    pub fn is_banned(&self, now: std::time::Instant) -> bool {
        matches!(*self.banned_until.lock(), Some(until) if now < until)
    }

    pub fn ban_until(&self, until: std::time::Instant) {
        *self.banned_until.lock() = Some(until);
    }

    pub fn unban(&self) {
        *self.banned_until.lock() = None;
        self.out_of_service_flag.store(false, Ordering::Relaxed);
    }

    pub fn error_rate(&self) -> f64 {
        self.error_window.avg()
    }

    /// Try to reserve a websocket connection slot. Returns `false` (and
    /// reserves nothing) if `max_ws_conns` is already in use.
    pub fn try_acquire_ws_conn(&self) -> bool {
        loop {
            let current = self.active_ws_conns.load(Ordering::Relaxed);
            if current >= self.max_ws_conns as u64 {
                return false;
            }
            if self
                .active_ws_conns
                .compare_exchange(current, current + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_ws_conn(&self) {
        self.active_ws_conns.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1))).ok();
    }

    pub fn is_degraded(&self) -> bool {
        self.latency.value_ms() > self.max_degraded_latency_ms
    }

    fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed);
        if self.latency.value_ms() > self.max_latency_ms || self.error_rate() > self.max_error_rate {
            self.out_of_service_flag.store(true, Ordering::Relaxed);
        }
    }

    fn record_transient_error(&self) {
        self.error_window.incr();
        if self.error_rate() > self.max_error_rate {
            self.out_of_service_flag.store(true, Ordering::Relaxed);
        }
    }

    /// Forward a single or batch JSON-RPC payload. Responses are reordered
    /// to match `reqs` by id, regardless of upstream ordering.
    pub async fn forward(&self, reqs: &[JsonRpcRequest]) -> ProxydResult<Vec<JsonRpcForwardedResponse>> {
        if self.is_banned(std::time::Instant::now()) || self.health() == BackendHealth::OutOfService {
            return Err(ProxydError::BackendOffline);
        }

        self.rate_limiter
            .check(())
            .map_err(|_| ProxydError::BackendOverCapacity)?;

        *self.last_request_time.lock() = Some(std::time::Instant::now());

        let body = if reqs.len() == 1 {
            serde_json::to_vec(&reqs[0])
        } else {
            serde_json::to_vec(reqs)
        }
        .map_err(ProxydError::ParseError)?;

        if body.len() > self.max_request_body_bytes {
            return Err(ProxydError::BodyTooLarge(self.max_request_body_bytes));
        }

        let mut attempt = 0;
        loop {
            let started = std::time::Instant::now();
            let result = self.transport.post(body.clone(), self.timeout).await;

            match result {
                Ok(bytes) => {
                    self.record_latency(started.elapsed());

                    if bytes.len() > self.max_response_body_bytes {
                        return Err(ProxydError::BackendResponseTooLarge);
                    }

                    return self.parse_and_order(&bytes, reqs);
                }
                Err(err) if is_retryable(&err) && attempt < self.max_retries => {
                    self.record_transient_error();
                    self.meter.record_retry();
                    attempt += 1;
                    let backoff = Duration::from_millis(50 * 2u64.pow(attempt.min(6)));
                    debug!(backend = %self.name, attempt, ?backoff, "retrying after transient error");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(err) if is_retryable(&err) => {
                    self.record_transient_error();
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn parse_and_order(
        &self,
        bytes: &[u8],
        reqs: &[JsonRpcRequest],
    ) -> ProxydResult<Vec<JsonRpcForwardedResponse>> {
        let value: Value = serde_json::from_slice(bytes).map_err(ProxydError::ParseError)?;

        let mut responses: Vec<JsonRpcForwardedResponse> = match value {
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<_, _>>()
                .map_err(ProxydError::ParseError)?,
            single => vec![serde_json::from_value(single).map_err(ProxydError::ParseError)?],
        };

        if responses.len() != reqs.len() {
            warn!(backend = %self.name, expected = reqs.len(), got = responses.len(), "unexpected jsonrpc envelope");
            return Err(ProxydError::BackendUnexpectedJsonRpc);
        }

        // reorder by id to match request order
        let mut ordered = Vec::with_capacity(reqs.len());
        for req in reqs {
            let req_id = serde_json::to_string(&req.id).unwrap_or_default();
            let pos = responses.iter().position(|r| r.id.get() == req_id);

            match pos {
                Some(pos) => ordered.push(responses.remove(pos)),
                None => return Err(ProxydError::BackendUnexpectedJsonRpc),
            }
        }

        trace!(backend = %self.name, count = ordered.len(), "forwarded request");
        Ok(ordered)
    }
}

/// Fixed table of application-level (user-fault) JSON-RPC error codes used
/// by the multicall strategy to tell "this backend answered, the call
/// itself reverted" from "this backend is broken".
pub fn is_application_error(error: &JsonRpcErrorData) -> bool {
    matches!(
        error.code,
        -32000..=-32099 // generic server error range, incl. nonce/underpriced/insufficient funds conventions
    ) && !matches!(error.code, -32011 | -32015 | -32019 | -32020)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendDefaults;
    use crate::rpcs::provider::MockTransport;
    use serde_json::json;
    use window::ManualClock;

    #[derive(Debug)]
    struct TestClock(Arc<ManualClock>);
    impl Clock for TestClock {
        fn now(&self) -> std::time::Instant {
            self.0.now()
        }
    }

    fn test_backend(transport: Arc<MockTransport>) -> Backend {
        let defaults = BackendDefaults::default();
        let config = BackendConfig {
            http_url: "http://node".to_string(),
            ws_url: None,
            username: None,
            password: None,
            bearer_token: None,
            max_rps: Some(1000),
            max_ws_conns: None,
            timeout_ms: Some(1000),
            max_retries: Some(2),
            out_of_service_seconds: None,
            strip_trailing_xff: false,
            skip_peer_count_check: false,
            skip_is_syncing_check: false,
            forced_candidate: false,
            headers_passthrough: false,
        };
        let clock = Arc::new(ManualClock::new());
        Backend::new(
            "node1",
            &config,
            &defaults,
            transport,
            Box::new(TestClock(clock.clone())),
            Box::new(TestClock(clock)),
        )
    }

    #[tokio::test]
    async fn forwards_and_returns_single_response() {
        let transport = Arc::new(MockTransport::new());
        transport.set_response(
            "eth_chainId",
            serde_json::to_vec(&json!({"jsonrpc":"2.0","id":1,"result":"0x1"})).unwrap(),
        );
        let backend = test_backend(transport.clone());

        let req = JsonRpcRequest::new("eth_chainId", Some(json!([])));
        let mut req = req;
        req.id = json!(1);

        let resp = backend.forward(&[req]).await.unwrap();
        assert_eq!(resp.len(), 1);
        assert_eq!(resp[0].result, Some(json!("0x1")));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn banned_backend_rejects_immediately() {
        let transport = Arc::new(MockTransport::new());
        let backend = test_backend(transport.clone());
        backend.ban_until(std::time::Instant::now() + Duration::from_secs(60));

        let mut req = JsonRpcRequest::new("eth_chainId", Some(json!([])));
        req.id = json!(1);
        let err = backend.forward(&[req]).await.unwrap_err();
        assert!(matches!(err, ProxydError::BackendOffline));
        assert_eq!(transport.call_count(), 0);
    }
}
