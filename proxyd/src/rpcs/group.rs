//! Backend group (C5): an ordered collection of backends plus a routing
//! strategy, special method-routing overrides, and sticky filter-id
//! tracking.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{BackendGroupConfig, RoutingStrategy};
use crate::errors::{ProxydError, ProxydResult};
use crate::jsonrpc::{JsonRpcForwardedResponse, JsonRpcRequest};
use crate::rpcs::backend::{is_application_error, Backend};
use crate::rpcs::consensus::ConsensusView;

/// Which backend actually produced a response, for the `X-Served-By`
/// header.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub backend_name: String,
    pub response: JsonRpcForwardedResponse,
}

/// TTL map from filter id to the backend that created it. 15 minute
/// default inactivity timeout, renewed on each successful use.
pub struct StickyFilterMap {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl StickyFilterMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, filter_id: String, backend_name: String, now: Instant) {
        self.entries.lock().insert(filter_id, (backend_name, now));
    }

    pub fn lookup(&self, filter_id: &str, now: Instant) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(filter_id) {
            Some((backend, last_used)) if now.duration_since(*last_used) <= self.ttl => {
                let backend = backend.clone();
                entries.insert(filter_id.to_string(), (backend.clone(), now));
                Some(backend)
            }
            _ => {
                entries.remove(filter_id);
                None
            }
        }
    }
}

/// Per-backend health-aware round robin state: last-observed health and
/// per-backend unhealthiness deadline.
struct HealthAwareState {
    cursor: Mutex<usize>,
    unhealthy_until: Mutex<HashMap<String, Instant>>,
    unhealthiness_timeout: Duration,
}

pub struct BackendGroup {
    pub name: String,
    pub backends: Vec<Arc<Backend>>,
    pub strategy: RoutingStrategy,
    pub method_mappings: HashMap<String, String>,
    pub max_batch_size: usize,
    pub allowed_methods: Option<Vec<String>>,
    pub denied_methods: Vec<String>,
    pub sticky_filters: StickyFilterMap,
    health_aware: HealthAwareState,
}

impl BackendGroup {
    pub fn new(name: impl Into<String>, config: &BackendGroupConfig, backends: Vec<Arc<Backend>>) -> Self {
        Self {
            name: name.into(),
            backends,
            strategy: config.strategy,
            method_mappings: config.method_mappings.clone(),
            max_batch_size: config.max_batch_size,
            allowed_methods: config.allowed_methods.clone(),
            denied_methods: config.denied_methods.clone(),
            sticky_filters: StickyFilterMap::new(Duration::from_secs(15 * 60)),
            health_aware: HealthAwareState {
                cursor: Mutex::new(0),
                unhealthy_until: Mutex::new(HashMap::new()),
                unhealthiness_timeout: Duration::from_secs(30),
            },
        }
    }

    pub fn method_allowed(&self, method: &str) -> bool {
        if self.denied_methods.iter().any(|m| m == method) {
            return false;
        }
        match &self.allowed_methods {
            Some(allowed) => allowed.iter().any(|m| m == method),
            None => true,
        }
    }

    fn backend_by_name(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Dispatch one already-validated sub-request according to the group's
    /// strategy (or a special-method override), against the given
    /// consensus view (ignored unless the strategy is consensus-aware).
    pub async fn dispatch(
        &self,
        req: &JsonRpcRequest,
        consensus: Option<&ConsensusView>,
        sticky_key: Option<&str>,
    ) -> ProxydResult<RoutedResponse> {
        if let Some(target) = self.method_mappings.get(&req.method) {
            if let Some(backend) = self.backend_by_name(target) {
                return self.send_to_one(backend, req).await;
            }
        }

        if crate::block_tag::is_filter_reference_method(&req.method) {
            if let Some(filter_id) = sticky_key {
                if let Some(backend_name) = self.sticky_filters.lookup(filter_id, Instant::now()) {
                    if let Some(backend) = self.backend_by_name(&backend_name) {
                        return self.send_to_one(backend, req).await;
                    }
                }
            }
        }

        match self.strategy {
            RoutingStrategy::Fallback => self.dispatch_fallback(req).await,
            RoutingStrategy::Multicall => self.dispatch_multicall(req).await,
            RoutingStrategy::ConsensusAware => self.dispatch_consensus_aware(req, consensus).await,
            RoutingStrategy::HealthAware => self.dispatch_health_aware(req).await,
        }
    }

    async fn send_to_one(&self, backend: &Arc<Backend>, req: &JsonRpcRequest) -> ProxydResult<RoutedResponse> {
        let responses = backend.forward(std::slice::from_ref(req)).await?;
        let response = responses.into_iter().next().ok_or(ProxydError::BackendUnexpectedJsonRpc)?;

        if crate::block_tag::is_filter_creating_method(&req.method) {
            if let Some(Value::String(id)) = &response.result {
                self.sticky_filters.insert(id.clone(), backend.name.clone(), Instant::now());
            }
        }

        Ok(RoutedResponse {
            backend_name: backend.name.clone(),
            response,
        })
    }

    async fn dispatch_fallback(&self, req: &JsonRpcRequest) -> ProxydResult<RoutedResponse> {
        let mut last_err = ProxydError::NoBackends;
        for backend in &self.backends {
            if backend.is_banned(Instant::now()) {
                continue;
            }
            match self.send_to_one(backend, req).await {
                Ok(routed) => return Ok(routed),
                Err(err) => {
                    debug!(backend = %backend.name, ?err, "fallback candidate failed, advancing");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Send the request to every non-banned candidate concurrently and take
    /// the first healthy response, regardless of which candidate was listed
    /// first. Slower candidates are not awaited further once a winner is
    /// found, but they've already been polled (and so have already issued
    /// their upstream call) by the time `FuturesUnordered` yields a winner.
    async fn dispatch_multicall(&self, req: &JsonRpcRequest) -> ProxydResult<RoutedResponse> {
        let candidates: Vec<Arc<Backend>> = self
            .backends
            .iter()
            .filter(|b| !b.is_banned(Instant::now()))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(ProxydError::NoBackends);
        }

        let mut pending: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|backend| {
                let req = req.clone();
                async move {
                    let result = backend.forward(std::slice::from_ref(&req)).await;
                    (backend.name.clone(), result)
                }
            })
            .collect();

        let mut last_err = ProxydError::NoBackends;
        while let Some((backend_name, result)) = pending.next().await {
            match result {
                Ok(responses) => {
                    let response = responses[0].clone();
                    let healthy = match &response.error {
                        None => true,
                        Some(err) => is_application_error(err),
                    };
                    if healthy {
                        return Ok(RoutedResponse { backend_name, response });
                    }
                }
                Err(err) => last_err = err,
            }
        }

        trace!(group = %self.name, "multicall: all candidates returned infrastructure errors");
        Err(last_err)
    }

    async fn dispatch_consensus_aware(
        &self,
        req: &JsonRpcRequest,
        consensus: Option<&ConsensusView>,
    ) -> ProxydResult<RoutedResponse> {
        let consensus = consensus.ok_or(ProxydError::NoBackends)?;
        if consensus.consensus_group.is_empty() {
            return Err(ProxydError::NoBackends);
        }

        // sticky-per-client distribution is handled by the caller hashing
        // the client identity to an index before calling dispatch; here we
        // default to the first candidate.
        let backend_name = &consensus.consensus_group[0];
        let backend = self
            .backend_by_name(backend_name)
            .ok_or(ProxydError::NoBackends)?;

        self.send_to_one(backend, req).await
    }

    async fn dispatch_health_aware(&self, req: &JsonRpcRequest) -> ProxydResult<RoutedResponse> {
        let now = Instant::now();
        let n = self.backends.len();
        if n == 0 {
            return Err(ProxydError::NoBackends);
        }

        let start = {
            let mut cursor = self.health_aware.cursor.lock();
            let start = *cursor;
            *cursor = (*cursor + 1) % n;
            start
        };

        for offset in 0..n {
            let idx = (start + offset) % n;
            let backend = &self.backends[idx];

            let unhealthy_until = self.health_aware.unhealthy_until.lock().get(&backend.name).copied();
            if let Some(until) = unhealthy_until {
                if now < until {
                    continue;
                }
            }

            match self.send_to_one(backend, req).await {
                Ok(routed) => {
                    self.health_aware.unhealthy_until.lock().remove(&backend.name);
                    return Ok(routed);
                }
                Err(err) => {
                    self.health_aware.unhealthy_until.lock().insert(
                        backend.name.clone(),
                        now + self.health_aware.unhealthiness_timeout,
                    );
                    debug!(backend = %backend.name, ?err, "health-aware candidate unhealthy");
                }
            }
        }

        Err(ProxydError::NoBackends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendDefaults;
    use crate::jsonrpc::JsonRpcRequest;
    use crate::rpcs::provider::MockTransport;
    use serde_json::json;
    use window::{Clock, ManualClock};

    #[derive(Debug)]
    struct TestClock(Arc<ManualClock>);
    impl Clock for TestClock {
        fn now(&self) -> std::time::Instant {
            self.0.now()
        }
    }

    fn mock_backend(name: &str, response_json: Value) -> (Arc<Backend>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        transport.set_response("eth_call", serde_json::to_vec(&response_json).unwrap());

        let defaults = BackendDefaults::default();
        let config = crate::config::BackendConfig {
            http_url: "http://node".to_string(),
            ws_url: None,
            username: None,
            password: None,
            bearer_token: None,
            max_rps: Some(1000),
            max_ws_conns: None,
            timeout_ms: Some(1000),
            max_retries: Some(0),
            out_of_service_seconds: None,
            strip_trailing_xff: false,
            skip_peer_count_check: false,
            skip_is_syncing_check: false,
            forced_candidate: false,
            headers_passthrough: false,
        };
        let clock = Arc::new(ManualClock::new());
        let backend = Arc::new(Backend::new(
            name,
            &config,
            &defaults,
            transport.clone(),
            Box::new(TestClock(clock.clone())),
            Box::new(TestClock(clock)),
        ));
        (backend, transport)
    }

    fn test_req(id: i64) -> JsonRpcRequest {
        let mut req = JsonRpcRequest::new("eth_call", Some(json!([])));
        req.id = json!(id);
        req
    }

    #[tokio::test]
    async fn fallback_advances_past_failing_backend() {
        let (good, _) = mock_backend("good", json!({"jsonrpc":"2.0","id":1,"result":"0x1"}));
        let bad_transport = Arc::new(MockTransport::new()); // no responses configured -> always errors
        let defaults = BackendDefaults::default();
        let config = crate::config::BackendConfig {
            http_url: "http://bad".to_string(),
            ws_url: None,
            username: None,
            password: None,
            bearer_token: None,
            max_rps: Some(1000),
            max_ws_conns: None,
            timeout_ms: Some(1000),
            max_retries: Some(0),
            out_of_service_seconds: None,
            strip_trailing_xff: false,
            skip_peer_count_check: false,
            skip_is_syncing_check: false,
            forced_candidate: false,
            headers_passthrough: false,
        };
        let clock = Arc::new(ManualClock::new());
        let bad = Arc::new(Backend::new(
            "bad",
            &config,
            &defaults,
            bad_transport,
            Box::new(TestClock(clock.clone())),
            Box::new(TestClock(clock)),
        ));

        let group_config = BackendGroupConfig {
            backends: vec!["bad".to_string(), "good".to_string()],
            strategy: RoutingStrategy::Fallback,
            consensus_async_handler: true,
            consensus_min_peer_count: 1,
            consensus_max_update_threshold_ms: 10_000,
            consensus_max_block_lag: 10,
            consensus_max_block_range: 100,
            consensus_ban_period_secs: 60,
            safe_block_drift_threshold: 10,
            finalized_block_drift_threshold: 10,
            method_mappings: HashMap::new(),
            max_batch_size: 100,
            allowed_methods: None,
            denied_methods: Vec::new(),
        };

        let group = BackendGroup::new("main", &group_config, vec![bad, good]);
        let routed = group.dispatch(&test_req(1), None, None).await.unwrap();
        assert_eq!(routed.backend_name, "good");
    }

    #[tokio::test(start_paused = true)]
    async fn multicall_returns_first_good_response_not_first_listed() {
        let (slow, slow_transport) = mock_backend("node1", json!({"jsonrpc":"2.0","id":1,"result":"0x2"}));
        slow_transport.set_delay(Duration::from_millis(300));
        let (fast, fast_transport) = mock_backend("node2", json!({"jsonrpc":"2.0","id":1,"result":"0x1"}));

        let group_config = BackendGroupConfig {
            backends: vec!["node1".to_string(), "node2".to_string()],
            strategy: RoutingStrategy::Multicall,
            consensus_async_handler: true,
            consensus_min_peer_count: 1,
            consensus_max_update_threshold_ms: 10_000,
            consensus_max_block_lag: 10,
            consensus_max_block_range: 100,
            consensus_ban_period_secs: 60,
            safe_block_drift_threshold: 10,
            finalized_block_drift_threshold: 10,
            method_mappings: HashMap::new(),
            max_batch_size: 100,
            allowed_methods: None,
            denied_methods: Vec::new(),
        };

        // node1 is listed first but is slower; the client must still see
        // node2's response, and node1 must still have been sent the request.
        let group = BackendGroup::new("main", &group_config, vec![slow, fast]);
        let routed = group.dispatch(&test_req(1), None, None).await.unwrap();

        assert_eq!(routed.backend_name, "node2");
        assert_eq!(routed.response.result, Some(json!("0x1")));
        assert_eq!(fast_transport.call_count(), 1);
        assert_eq!(slow_transport.call_count(), 1);
    }

    fn mock_backend_for_method(name: &str, method: &str, response_json: Value) -> Arc<Backend> {
        let transport = Arc::new(MockTransport::new());
        transport.set_response(method, serde_json::to_vec(&response_json).unwrap());

        let defaults = BackendDefaults::default();
        let config = crate::config::BackendConfig {
            http_url: "http://node".to_string(),
            ws_url: None,
            username: None,
            password: None,
            bearer_token: None,
            max_rps: Some(1000),
            max_ws_conns: None,
            timeout_ms: Some(1000),
            max_retries: Some(0),
            out_of_service_seconds: None,
            strip_trailing_xff: false,
            skip_peer_count_check: false,
            skip_is_syncing_check: false,
            forced_candidate: false,
            headers_passthrough: false,
        };
        let clock = Arc::new(ManualClock::new());
        Arc::new(Backend::new(
            name,
            &config,
            &defaults,
            transport,
            Box::new(TestClock(clock.clone())),
            Box::new(TestClock(clock)),
        ))
    }

    fn default_group_config(strategy: RoutingStrategy, backends: Vec<String>) -> BackendGroupConfig {
        BackendGroupConfig {
            backends,
            strategy,
            consensus_async_handler: true,
            consensus_min_peer_count: 1,
            consensus_max_update_threshold_ms: 10_000,
            consensus_max_block_lag: 10,
            consensus_max_block_range: 100,
            consensus_ban_period_secs: 60,
            safe_block_drift_threshold: 10,
            finalized_block_drift_threshold: 10,
            method_mappings: HashMap::new(),
            max_batch_size: 100,
            allowed_methods: None,
            denied_methods: Vec::new(),
        }
    }

    /// `eth_newBlockFilter` creates a filter id that a later
    /// `eth_getFilterChanges` on that id must be routed back to the same
    /// backend, even under `Fallback` strategy where the "first" backend
    /// would otherwise win.
    #[tokio::test]
    async fn filter_created_on_one_backend_is_referenced_on_the_same_backend() {
        let creator = mock_backend_for_method(
            "node1",
            "eth_newBlockFilter",
            json!({"jsonrpc":"2.0","id":1,"result":"0xfeed"}),
        );
        let other = mock_backend_for_method(
            "node2",
            "eth_getFilterChanges",
            json!({"jsonrpc":"2.0","id":2,"result":[]}),
        );

        let group_config = default_group_config(
            RoutingStrategy::Fallback,
            vec!["node1".to_string(), "node2".to_string()],
        );
        let group = BackendGroup::new("main", &group_config, vec![creator, other]);

        let mut create_req = JsonRpcRequest::new("eth_newBlockFilter", Some(json!([])));
        create_req.id = json!(1);
        let routed = group.dispatch(&create_req, None, None).await.unwrap();
        assert_eq!(routed.backend_name, "node1");

        let mut changes_req = JsonRpcRequest::new("eth_getFilterChanges", Some(json!(["0xfeed"])));
        changes_req.id = json!(2);
        let routed = group.dispatch(&changes_req, None, Some("0xfeed")).await;
        // node1 has no mock response configured for eth_getFilterChanges, so
        // routing back to it (rather than falling through to node2) must
        // surface as an error rather than node2's canned empty result.
        assert!(routed.is_err());
    }

    /// `eth_getLogs` must never be treated as filter-creating: its string
    /// results (e.g. a block hash embedded in a log) must not get inserted
    /// into the sticky filter map.
    #[tokio::test]
    async fn get_logs_does_not_create_a_sticky_filter_entry() {
        let backend = mock_backend_for_method(
            "node1",
            "eth_getLogs",
            json!({"jsonrpc":"2.0","id":1,"result":"0xfeed"}),
        );
        let group_config = default_group_config(RoutingStrategy::Fallback, vec!["node1".to_string()]);
        let group = BackendGroup::new("main", &group_config, vec![backend]);

        let mut req = JsonRpcRequest::new("eth_getLogs", Some(json!([{"fromBlock": "0x0", "toBlock": "0x1"}])));
        req.id = json!(1);
        group.dispatch(&req, None, None).await.unwrap();

        assert!(group.sticky_filters.lookup("0xfeed", Instant::now()).is_none());
    }

    #[test]
    fn method_allowed_respects_denylist() {
        let group_config = BackendGroupConfig {
            backends: vec![],
            strategy: RoutingStrategy::Fallback,
            consensus_async_handler: true,
            consensus_min_peer_count: 1,
            consensus_max_update_threshold_ms: 10_000,
            consensus_max_block_lag: 10,
            consensus_max_block_range: 100,
            consensus_ban_period_secs: 60,
            safe_block_drift_threshold: 10,
            finalized_block_drift_threshold: 10,
            method_mappings: HashMap::new(),
            max_batch_size: 100,
            allowed_methods: None,
            denied_methods: vec!["admin_nodeInfo".to_string()],
        };
        let group = BackendGroup::new("main", &group_config, vec![]);
        assert!(!group.method_allowed("admin_nodeInfo"));
        assert!(group.method_allowed("eth_chainId"));
    }
}
