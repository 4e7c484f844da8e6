//! Consensus poller (C6): a background task per group that polls every
//! backend for `latest`/`safe`/`finalized`, peer count, and sync status,
//! derives the group's consensus view, and bans/unbans backends by error
//! rate. Published via an atomic pointer swap (`arc-swap`) so readers never
//! block the poller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::BackendGroupConfig;
use crate::jsonrpc::JsonRpcRequest;
use crate::metrics::DispatchMetrics;
use crate::rpcs::backend::Backend;

/// Per-backend cached view, owned by the poller.
#[derive(Debug, Clone, Default)]
pub struct BackendState {
    pub latest_block_number: Option<u64>,
    pub latest_block_hash: Option<String>,
    pub safe_block_number: Option<u64>,
    pub finalized_block_number: Option<u64>,
    pub peer_count: Option<u64>,
    pub in_sync: Option<bool>,
    pub last_update: Option<Instant>,
}

impl BackendState {
    pub fn in_consensus(
        &self,
        consensus_latest: u64,
        min_peer_count: u32,
        max_update_threshold: Duration,
        max_block_lag: u64,
        skip_peer_count_check: bool,
        skip_is_syncing_check: bool,
        now: Instant,
    ) -> bool {
        let Some(last_update) = self.last_update else {
            return false;
        };
        if now.duration_since(last_update) > max_update_threshold {
            return false;
        }
        if !skip_is_syncing_check && self.in_sync == Some(false) {
            return false;
        }
        if !skip_peer_count_check {
            match self.peer_count {
                Some(n) if n >= min_peer_count as u64 => {}
                _ => return false,
            }
        }
        let Some(latest) = self.latest_block_number else {
            return false;
        };
        latest <= consensus_latest && consensus_latest.saturating_sub(latest) <= max_block_lag
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsensusView {
    pub consensus_latest_block_number: u64,
    pub consensus_latest_block_hash: String,
    pub consensus_safe_block_number: u64,
    pub consensus_finalized_block_number: u64,
    pub consensus_group: Vec<String>,
}

pub struct ConsensusPoller {
    pub group_name: String,
    backends: Vec<Arc<Backend>>,
    config: BackendGroupConfig,
    states: parking_lot::Mutex<HashMap<String, BackendState>>,
    error_counts: parking_lot::Mutex<HashMap<String, u32>>,
    view: ArcSwap<ConsensusView>,
    listeners: broadcast::Sender<Arc<ConsensusView>>,
    metrics: Arc<DispatchMetrics>,
}

impl ConsensusPoller {
    pub fn new(group_name: impl Into<String>, backends: Vec<Arc<Backend>>, config: BackendGroupConfig, metrics: Arc<DispatchMetrics>) -> Self {
        let (listeners, _rx) = broadcast::channel(16);
        Self {
            group_name: group_name.into(),
            backends,
            config,
            states: parking_lot::Mutex::new(HashMap::new()),
            error_counts: parking_lot::Mutex::new(HashMap::new()),
            view: ArcSwap::from_pointee(ConsensusView::default()),
            listeners,
            metrics,
        }
    }

    pub fn current_view(&self) -> Arc<ConsensusView> {
        self.view.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ConsensusView>> {
        self.listeners.subscribe()
    }

    pub fn unban(&self, backend_name: &str) {
        if let Some(backend) = self.backends.iter().find(|b| b.name == backend_name) {
            backend.unban();
        }
        self.error_counts.lock().remove(backend_name);
    }

    /// Run one poll tick: query every backend in parallel, update state,
    /// recompute consensus, ban/unban, and publish.
    pub async fn tick(&self) {
        self.metrics.record_consensus_tick();

        let futures = self.backends.iter().map(|backend| self.poll_one(backend));
        let results: Vec<(String, Option<BackendState>)> = join_all(futures).await;

        let now = Instant::now();
        {
            let mut states = self.states.lock();
            for (name, maybe_state) in results {
                if let Some(new_state) = maybe_state {
                    let entry = states.entry(name).or_default();
                    merge_state(entry, new_state, self.config.safe_block_drift_threshold, self.config.finalized_block_drift_threshold);
                }
            }
        }

        let new_view = self.compute_view(now);
        self.ban_and_unban(now);

        self.view.store(Arc::new(new_view.clone()));
        let _ = self.listeners.send(Arc::new(new_view));
    }

    async fn poll_one(&self, backend: &Arc<Backend>) -> (String, Option<BackendState>) {
        let make_req = |id: i64, method: &str| {
            let mut req = JsonRpcRequest::new(method, Some(json!([])));
            req.id = json!(id);
            req
        };

        let latest_req = {
            let mut r = make_req(1, "eth_getBlockByNumber");
            r.params = Some(json!(["latest", false]));
            r
        };
        let safe_req = {
            let mut r = make_req(2, "eth_getBlockByNumber");
            r.params = Some(json!(["safe", false]));
            r
        };
        let finalized_req = {
            let mut r = make_req(3, "eth_getBlockByNumber");
            r.params = Some(json!(["finalized", false]));
            r
        };
        let peer_req = make_req(4, "net_peerCount");
        let syncing_req = make_req(5, "eth_syncing");

        let (latest, safe, finalized, peers, syncing) = tokio::join!(
            backend.forward(std::slice::from_ref(&latest_req)),
            backend.forward(std::slice::from_ref(&safe_req)),
            backend.forward(std::slice::from_ref(&finalized_req)),
            backend.forward(std::slice::from_ref(&peer_req)),
            backend.forward(std::slice::from_ref(&syncing_req)),
        );

        let mut state = BackendState::default();
        let mut any_ok = false;

        if let Ok(resps) = latest {
            if let Some(result) = resps.into_iter().next().and_then(|r| r.result) {
                if let Some((number, hash)) = parse_block_header(&result) {
                    if number != 0 {
                        state.latest_block_number = Some(number);
                        state.latest_block_hash = hash;
                        any_ok = true;
                    }
                }
            }
        }
        if let Ok(resps) = safe {
            if let Some(result) = resps.into_iter().next().and_then(|r| r.result) {
                if let Some((number, _)) = parse_block_header(&result) {
                    state.safe_block_number = Some(number);
                }
            }
        }
        if let Ok(resps) = finalized {
            if let Some(result) = resps.into_iter().next().and_then(|r| r.result) {
                if let Some((number, _)) = parse_block_header(&result) {
                    state.finalized_block_number = Some(number);
                }
            }
        }
        if let Ok(resps) = peers {
            if let Some(result) = resps.into_iter().next().and_then(|r| r.result) {
                state.peer_count = result.as_str().and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok());
            }
        }
        if let Ok(resps) = syncing {
            if let Some(result) = resps.into_iter().next().and_then(|r| r.result) {
                state.in_sync = Some(matches!(result, serde_json::Value::Bool(false)));
            }
        }

        if any_ok {
            state.last_update = Some(Instant::now());
        } else {
            let mut counts = self.error_counts.lock();
            *counts.entry(backend.name.clone()).or_insert(0) += 1;
        }

        (backend.name.clone(), if any_ok { Some(state) } else { None })
    }

    fn compute_view(&self, now: Instant) -> ConsensusView {
        let states = self.states.lock();

        let candidates: Vec<(&String, &BackendState)> = states
            .iter()
            .filter(|(_, s)| {
                s.last_update
                    .map(|t| now.duration_since(t) <= Duration::from_millis(self.config.consensus_max_update_threshold_ms))
                    .unwrap_or(false)
                    && s.latest_block_number.is_some()
            })
            .collect();

        if candidates.is_empty() {
            return ConsensusView::default();
        }

        let min_latest = candidates
            .iter()
            .filter_map(|(_, s)| s.latest_block_number)
            .min()
            .unwrap_or(0);

        for step in 0..=self.config.consensus_max_block_lag {
            let height = min_latest.saturating_sub(step);

            let mut by_hash: HashMap<&str, Vec<&String>> = HashMap::new();
            for (name, state) in &candidates {
                if state.latest_block_number == Some(height) {
                    if let Some(hash) = &state.latest_block_hash {
                        by_hash.entry(hash.as_str()).or_default().push(name);
                    }
                }
            }

            if let Some((hash, names)) = by_hash.into_iter().max_by_key(|(_, v)| v.len()) {
                if names.len() >= self.config.consensus_min_peer_count as usize {
                    let mut group: Vec<String> = names.into_iter().cloned().collect();
                    group.sort();

                    let mut safes: Vec<u64> = group
                        .iter()
                        .filter_map(|n| states.get(n).and_then(|s| s.safe_block_number))
                        .collect();
                    let mut finalizeds: Vec<u64> = group
                        .iter()
                        .filter_map(|n| states.get(n).and_then(|s| s.finalized_block_number))
                        .collect();
                    safes.sort_unstable();
                    finalizeds.sort_unstable();

                    return ConsensusView {
                        consensus_latest_block_number: height,
                        consensus_latest_block_hash: hash.to_string(),
                        consensus_safe_block_number: median_lower(&safes).unwrap_or(height),
                        consensus_finalized_block_number: median_lower(&finalizeds).unwrap_or(height),
                        consensus_group: group,
                    };
                }
            }
        }

        ConsensusView::default()
    }

    fn ban_and_unban(&self, now: Instant) {
        let error_counts = self.error_counts.lock();
        for backend in &self.backends {
            let errors = error_counts.get(&backend.name).copied().unwrap_or(0);
            if errors >= 5 && !backend.is_banned(now) {
                backend.ban_until(now + Duration::from_secs(self.config.consensus_ban_period_secs));
                self.metrics.record_backend_ban();
                warn!(group = %self.group_name, backend = %backend.name, errors, "banning backend after consecutive poll failures");
            }
        }
    }

    /// Run the poll loop until `shutdown` fires. Never surfaces errors to
    /// the caller; failures only move health metrics.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        info!(group = %self.group_name, "consensus poller started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(group = %self.group_name, "consensus poller shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn merge_state(entry: &mut BackendState, new: BackendState, safe_drift: u64, finalized_drift: u64) {
    if let Some(n) = new.latest_block_number {
        entry.latest_block_number = Some(n);
        entry.latest_block_hash = new.latest_block_hash;
    }
    entry.last_update = new.last_update.or(entry.last_update);
    entry.peer_count = new.peer_count.or(entry.peer_count);
    entry.in_sync = new.in_sync.or(entry.in_sync);

    apply_drift_guarded(&mut entry.safe_block_number, new.safe_block_number, safe_drift);
    apply_drift_guarded(&mut entry.finalized_block_number, new.finalized_block_number, finalized_drift);
}

/// `safe`/`finalized` may advance monotonically or regress within the
/// configured drift; rounding rule per the design notes: `>=` on the new
/// value against `(previous - threshold)`.
fn apply_drift_guarded(current: &mut Option<u64>, new: Option<u64>, drift: u64) {
    let Some(new) = new else { return };
    match *current {
        None => *current = Some(new),
        Some(prev) if new >= prev => *current = Some(new),
        Some(prev) if new >= prev.saturating_sub(drift) => *current = Some(new),
        Some(_) => {} // regression beyond drift: ignore, caller treats the backend as out-of-consensus via last_update/latest checks
    }
}

fn parse_block_header(result: &serde_json::Value) -> Option<(u64, Option<String>)> {
    let obj = result.as_object()?;
    let number = obj.get("number")?.as_str()?;
    let number = u64::from_str_radix(number.trim_start_matches("0x"), 16).ok()?;
    let hash = obj.get("hash").and_then(|h| h.as_str()).map(|s| s.to_string());
    Some((number, hash))
}

fn median_lower(sorted_candidate: &[u64]) -> Option<u64> {
    if sorted_candidate.is_empty() {
        return None;
    }
    let mut v = sorted_candidate.to_vec();
    v.sort_unstable();
    let mid = (v.len() - 1) / 2;
    Some(v[mid])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_guard_allows_small_regression() {
        let mut current = Some(100u64);
        apply_drift_guarded(&mut current, Some(95), 10);
        assert_eq!(current, Some(95));
    }

    #[test]
    fn drift_guard_rejects_large_regression() {
        let mut current = Some(100u64);
        apply_drift_guarded(&mut current, Some(50), 10);
        assert_eq!(current, Some(100));
    }

    #[test]
    fn median_lower_picks_lower_on_tie() {
        assert_eq!(median_lower(&[1, 2, 3, 4]), Some(2));
        assert_eq!(median_lower(&[1, 2, 3]), Some(2));
    }

    #[test]
    fn block_zero_does_not_update_latest() {
        // merge_state should refuse to apply a block-0 reading: the
        // poll_one() path already filters number == 0 before calling
        // merge_state, so a block-0 observation never reaches here. This
        // test documents that contract at the merge boundary instead.
        let mut entry = BackendState {
            latest_block_number: Some(257),
            ..Default::default()
        };
        let incoming = BackendState {
            latest_block_number: None, // zero-block readings are filtered to None upstream
            ..Default::default()
        };
        merge_state(&mut entry, incoming, 10, 10);
        assert_eq!(entry.latest_block_number, Some(257));
    }
}
