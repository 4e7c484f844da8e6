//! Response cache (C4): an opaque TTL-keyed key-value store with
//! method-driven cacheability rules layered on top.
//!
//! The backing store is an external collaborator per the purpose/scope
//! section; this module ships the trait boundary plus an in-memory
//! default implementation (`TtlCache`) so the dispatcher and tests don't
//! need a real Redis or moka deployment.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use window::Clock;

/// Cache key: method + canonicalized params, after block-tag rewriting.
/// Using the already-serialized param string (rather than hashing) keeps
/// this cheap to construct and easy to reason about in tests.
pub type CacheKey = (String, String);

pub fn cache_key(method: &str, params: &Value) -> CacheKey {
    (method.to_string(), params.to_string())
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub expires_at: Option<Instant>,
}

/// Generic opaque store; the core only needs get/put/delete, matching the
/// external cache contract in the external-interfaces section.
pub trait Cache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Value>;
    fn put(&self, key: CacheKey, value: Value, ttl: Option<Duration>);
    fn delete(&self, key: &CacheKey);
}

/// In-memory default. Evicts lazily on access; no background sweeper.
pub struct TtlCache {
    clock: Box<dyn Clock>,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    max_entries: usize,
}

impl TtlCache {
    pub fn new(clock: Box<dyn Clock>, max_entries: usize) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }
}

impl Cache for TtlCache {
    fn get(&self, key: &CacheKey) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) => {
                if let Some(expires_at) = entry.expires_at {
                    if self.clock.now() >= expires_at {
                        entries.remove(key);
                        return None;
                    }
                }
                Some(entry.value.clone())
            }
            None => None,
        }
    }

    fn put(&self, key: CacheKey, value: Value, ttl: Option<Duration>) {
        if matches!(value, Value::Null) {
            return;
        }

        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            // no real LRU bookkeeping; drop an arbitrary entry to make room
            if let Some(evict_key) = entries.keys().next().cloned() {
                entries.remove(&evict_key);
            }
        }

        let expires_at = ttl.map(|ttl| self.clock.now() + ttl);
        entries.insert(key, CacheEntry { value, expires_at });
    }

    fn delete(&self, key: &CacheKey) {
        self.entries.lock().remove(key);
    }
}

/// Methods unconditionally cacheable on exact params, per the cacheability
/// rules. `debug_getRawReceipts` is included here but has an extra
/// non-empty-result check applied by the caller before storing.
pub fn is_unconditionally_cacheable(method: &str) -> bool {
    matches!(
        method,
        "eth_chainId"
            | "net_version"
            | "eth_getBlockTransactionCountByHash"
            | "eth_getBlockByHash"
            | "eth_getTransactionByHash"
            | "eth_getTransactionByBlockHashAndIndex"
            | "eth_getUncleByBlockHashAndIndex"
            | "eth_getTransactionReceipt"
            | "debug_getRawReceipts"
    )
}

pub fn is_conditionally_cacheable(method: &str) -> bool {
    method == "eth_getBlockByNumber"
}

pub const CONDITIONAL_DEFAULT_TTL: Duration = Duration::from_secs(3);

/// Should a response to `method` be stored, given the resolved block
/// number (if any) and the current consensus latest/safe numbers? Mirrors
/// the "finalized, not pending/latest" rule for `eth_getBlockByNumber`.
pub fn should_cache(
    method: &str,
    result: &Value,
    resolved_block_number: Option<u64>,
    latest: u64,
    safe_block_number: u64,
) -> bool {
    if matches!(result, Value::Null) {
        return false;
    }
    if method == "debug_getRawReceipts" {
        return !matches!(result, Value::Array(a) if a.is_empty());
    }
    if is_unconditionally_cacheable(method) {
        return true;
    }
    if is_conditionally_cacheable(method) {
        let Some(n) = resolved_block_number else {
            return false;
        };
        // finalized means at least safe_block_number blocks behind latest
        return n <= latest.saturating_sub(safe_block_number);
    }
    false
}

pub type SharedCache = Arc<dyn Cache>;
