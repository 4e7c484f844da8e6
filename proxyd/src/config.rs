//! TOML configuration structs and `$NAME` environment-variable resolution.
//!
//! Loading the file itself (watching, hot-reload) is an external concern;
//! this module only owns the typed shape of the config and the one-pass env
//! substitution the teacher's config layer does not need (it reads secrets
//! straight from env vars instead), following the standard `toml` + `serde`
//! idiom.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub backend: BackendDefaults,
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    pub backend_groups: HashMap<String, BackendGroupConfig>,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
    #[serde(default)]
    pub rpc_method_mappings: HashMap<String, String>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sender_rate_limit: SenderRateLimitConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub interop_validation: InteropValidationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default = "default_ws_group")]
    pub ws_backend_group: Option<String>,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_seconds: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub strip_trailing_xff: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_ws_group() -> Option<String> {
    None
}
fn default_response_timeout() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            ws_backend_group: default_ws_group(),
            response_timeout_seconds: default_response_timeout(),
            max_body_bytes: default_max_body_bytes(),
            strip_trailing_xff: false,
        }
    }
}

impl ServerConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendDefaults {
    #[serde(default = "default_max_rps")]
    pub max_rps: u32,
    #[serde(default = "default_max_ws_conns")]
    pub max_ws_conns: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
    #[serde(default = "default_max_response_body_bytes")]
    pub max_response_body_bytes: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_out_of_service_seconds")]
    pub out_of_service_seconds: u64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: f64,
    #[serde(default = "default_max_degraded_latency_ms")]
    pub max_degraded_latency_ms: f64,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

fn default_max_rps() -> u32 {
    100
}
fn default_max_ws_conns() -> u32 {
    10
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_max_request_body_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_max_response_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_retries() -> u32 {
    3
}
fn default_out_of_service_seconds() -> u64 {
    60
}
fn default_max_latency_ms() -> f64 {
    1_000.0
}
fn default_max_degraded_latency_ms() -> f64 {
    5_000.0
}
fn default_max_error_rate() -> f64 {
    0.5
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            max_rps: default_max_rps(),
            max_ws_conns: default_max_ws_conns(),
            timeout_ms: default_timeout_ms(),
            max_request_body_bytes: default_max_request_body_bytes(),
            max_response_body_bytes: default_max_response_body_bytes(),
            max_retries: default_max_retries(),
            out_of_service_seconds: default_out_of_service_seconds(),
            max_latency_ms: default_max_latency_ms(),
            max_degraded_latency_ms: default_max_degraded_latency_ms(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub http_url: String,
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub max_rps: Option<u32>,
    #[serde(default)]
    pub max_ws_conns: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub out_of_service_seconds: Option<u64>,
    #[serde(default)]
    pub strip_trailing_xff: bool,
    #[serde(default)]
    pub skip_peer_count_check: bool,
    #[serde(default)]
    pub skip_is_syncing_check: bool,
    #[serde(default)]
    pub forced_candidate: bool,
    #[serde(default)]
    pub headers_passthrough: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    Fallback,
    Multicall,
    ConsensusAware,
    HealthAware,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendGroupConfig {
    pub backends: Vec<String>,
    #[serde(default)]
    pub strategy: RoutingStrategy,
    #[serde(default = "default_true")]
    pub consensus_async_handler: bool,
    #[serde(default = "default_min_peer_count")]
    pub consensus_min_peer_count: u32,
    #[serde(default = "default_max_update_threshold_ms")]
    pub consensus_max_update_threshold_ms: u64,
    #[serde(default = "default_max_block_lag")]
    pub consensus_max_block_lag: u64,
    #[serde(default = "default_max_block_range")]
    pub consensus_max_block_range: u64,
    #[serde(default = "default_ban_period_secs")]
    pub consensus_ban_period_secs: u64,
    #[serde(default = "default_drift")]
    pub safe_block_drift_threshold: u64,
    #[serde(default = "default_drift")]
    pub finalized_block_drift_threshold: u64,
    #[serde(default)]
    pub method_mappings: HashMap<String, String>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub allowed_methods: Option<Vec<String>>,
    #[serde(default)]
    pub denied_methods: Vec<String>,
}

fn default_min_peer_count() -> u32 {
    2
}
fn default_max_update_threshold_ms() -> u64 {
    10_000
}
fn default_max_block_lag() -> u64 {
    10
}
fn default_max_block_range() -> u64 {
    100
}
fn default_ban_period_secs() -> u64 {
    60
}
fn default_drift() -> u64 {
    10
}
fn default_max_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthenticationConfig {
    #[serde(default)]
    pub static_keys: Vec<String>,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub public_access: bool,
    #[serde(default)]
    pub admin_bearer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_conditional_ttl_ms")]
    pub conditional_ttl_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

fn default_conditional_ttl_ms() -> u64 {
    3_000
}
fn default_max_entries() -> u64 {
    100_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            conditional_ttl_ms: default_conditional_ttl_ms(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderRateLimitConfig {
    #[serde(default = "default_rl_max")]
    pub max_per_interval: u32,
    #[serde(default = "default_rl_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rl_max")]
    pub max_per_interval: u32,
    #[serde(default = "default_rl_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub allowlist: Vec<String>,
}

fn default_rl_max() -> u32 {
    100
}
fn default_rl_interval_ms() -> u64 {
    1_000
}

impl Default for SenderRateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_interval: default_rl_max(),
            interval_ms: default_rl_interval_ms(),
            allowlist: Vec::new(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_interval: default_rl_max(),
            interval_ms: default_rl_interval_ms(),
            allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InteropValidationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub backend_group: Option<String>,
    #[serde(default = "default_access_list_max_entries")]
    pub access_list_max_entries: usize,
    #[serde(default = "default_rl_max")]
    pub sender_max_per_interval: u32,
    #[serde(default = "default_rl_interval_ms")]
    pub sender_interval_ms: u64,
}

fn default_access_list_max_entries() -> usize {
    256
}

impl Default for InteropValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend_group: None,
            access_list_max_entries: default_access_list_max_entries(),
            sender_max_per_interval: default_rl_max(),
            sender_interval_ms: default_rl_interval_ms(),
        }
    }
}

/// Walk a parsed [`toml::Value`] and resolve every string of the form
/// `$NAME` to `std::env::var("NAME")`, leaving the value unchanged (and the
/// env lookup failure silent, matching the "opaque config string" framing
/// in the external-interfaces contract) when the variable isn't set.
pub fn resolve_env(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => {
            if let Some(name) = s.strip_prefix('$') {
                if let Ok(resolved) = std::env::var(name) {
                    *s = resolved;
                }
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                resolve_env(item);
            }
        }
        toml::Value::Table(table) => {
            for (_, v) in table.iter_mut() {
                resolve_env(v);
            }
        }
        _ => {}
    }
}

pub fn load(raw: &str) -> anyhow::Result<AppConfig> {
    let mut value: toml::Value = toml::from_str(raw)?;
    resolve_env(&mut value);
    let config: AppConfig = value.try_into()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_env_vars_in_strings() {
        std::env::set_var("PROXYD_TEST_TOKEN", "shh");
        let mut value = toml::Value::String("$PROXYD_TEST_TOKEN".to_string());
        resolve_env(&mut value);
        assert_eq!(value.as_str(), Some("shh"));
    }

    #[test]
    fn leaves_unset_env_var_untouched() {
        let mut value = toml::Value::String("$PROXYD_TOTALLY_UNSET_VAR".to_string());
        resolve_env(&mut value);
        assert_eq!(value.as_str(), Some("$PROXYD_TOTALLY_UNSET_VAR"));
    }

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            [backends.node1]
            http_url = "http://localhost:8545"

            [backend_groups.main]
            backends = ["node1"]
            strategy = "fallback"
        "#;
        let config = load(raw).unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backend_groups["main"].strategy, RoutingStrategy::Fallback);
    }
}
