//! Application wiring: builds backends, backend groups, consensus pollers,
//! cache, rate limiters, and auth from an [`AppConfig`] and exposes the
//! shared entry points the dispatcher and websocket bridge call into.
//!
//! Generalizes the teacher's `Web3ProxyApp::spawn()` constructor and its
//! `flatten_handle`/`flatten_handles` shutdown-propagation helpers onto the
//! new component set; the teacher's `sea_orm`-backed request/accounting
//! tables have no counterpart here (no database component in scope).

use ethers::core::types::Address;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::cache::{SharedCache, TtlCache};
use crate::config::AppConfig;
use crate::errors::{ProxydError, ProxydResult};
use crate::interop::InteropValidator;
use crate::metrics::DispatchMetrics;
use crate::rpcs::backend::Backend;
use crate::rpcs::consensus::{ConsensusPoller, ConsensusView};
use crate::rpcs::group::BackendGroup;
use crate::rpcs::provider::{HttpWsTransport, Transport};
use ratelimiter::{Allowlist, TokenBucketLimiter};
use window::SystemClock;

pub type AnyhowJoinHandle<T> = JoinHandle<anyhow::Result<T>>;

/// Flatten a `JoinHandle`'s two layers of failure (panic vs. task error)
/// into one. Useful when joining the consensus poller tasks at shutdown.
pub async fn flatten_handle<T>(handle: AnyhowJoinHandle<T>) -> anyhow::Result<T> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(err.into()),
    }
}

pub async fn flatten_handles<T>(
    mut handles: FuturesUnordered<AnyhowJoinHandle<T>>,
) -> anyhow::Result<()> {
    use futures::StreamExt;
    while let Some(x) = handles.next().await {
        match x {
            Err(e) => return Err(e.into()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(_)) => continue,
        }
    }
    Ok(())
}

fn build_transport(config: &crate::config::BackendConfig) -> Arc<dyn Transport> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("proxyd/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("reqwest client configuration is static and always valid");

    Arc::new(HttpWsTransport {
        http_url: config.http_url.clone(),
        ws_url: config.ws_url.clone(),
        client,
        bearer_token: config.bearer_token.clone(),
        basic_auth: config
            .username
            .clone()
            .zip(config.password.clone()),
    })
}

pub struct App {
    pub config: AppConfig,
    pub groups: DashMap<String, Arc<BackendGroup>>,
    pub consensus: DashMap<String, Arc<ConsensusPoller>>,
    pub cache: SharedCache,
    pub authenticator: Authenticator,
    pub metrics: Arc<DispatchMetrics>,
    pub interop_validator: Option<InteropValidator>,
    pub interop_group: Option<Arc<BackendGroup>>,

    ip_limiter: TokenBucketLimiter<IpAddr>,
    sender_limiter: TokenBucketLimiter<Address>,
    ip_allowlist: Allowlist,
    sender_allowlist: Allowlist,

    shutdown_tx: watch::Sender<bool>,
}

impl App {
    /// Build every backend/group/poller from `config` and spawn the
    /// consensus poller background tasks. Returns the app plus the join
    /// handles so the caller (the binary entrypoint) can wait on clean
    /// shutdown.
    pub fn spawn(config: AppConfig) -> anyhow::Result<(Arc<App>, Vec<AnyhowJoinHandle<()>>)> {
        let metrics = Arc::new(DispatchMetrics::default());

        let mut backends_by_name: HashMap<String, Arc<Backend>> = HashMap::new();
        for (name, backend_config) in &config.backends {
            let transport = build_transport(backend_config);
            let backend = Arc::new(Backend::new(
                name.clone(),
                backend_config,
                &config.backend,
                transport,
                Box::new(SystemClock),
                Box::new(SystemClock),
            ));
            backends_by_name.insert(name.clone(), backend);
        }

        let groups: DashMap<String, Arc<BackendGroup>> = DashMap::new();
        let consensus: DashMap<String, Arc<ConsensusPoller>> = DashMap::new();
        let mut handles: Vec<AnyhowJoinHandle<()>> = Vec::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for (group_name, group_config) in &config.backend_groups {
            let group_backends: Vec<Arc<Backend>> = group_config
                .backends
                .iter()
                .filter_map(|name| backends_by_name.get(name).cloned())
                .collect();

            if group_backends.len() != group_config.backends.len() {
                warn!(group = %group_name, "some configured backends were not found; group will run short-handed");
            }

            let group = Arc::new(BackendGroup::new(group_name.clone(), group_config, group_backends.clone()));
            groups.insert(group_name.clone(), group);

            if group_config.strategy == crate::config::RoutingStrategy::ConsensusAware {
                let poller = Arc::new(ConsensusPoller::new(
                    group_name.clone(),
                    group_backends,
                    group_config.clone(),
                    metrics.clone(),
                ));
                let poller_for_task = poller.clone();
                let shutdown_rx = shutdown_rx.clone();
                let handle = tokio::spawn(async move {
                    poller_for_task.run(Duration::from_secs(1), shutdown_rx).await;
                    Ok(())
                });
                handles.push(handle);
                consensus.insert(group_name.clone(), poller);
            }
        }

        let cache: SharedCache = Arc::new(TtlCache::new(
            Box::new(SystemClock),
            config.cache.max_entries as usize,
        ));

        let authenticator = Authenticator::new(
            config.authentication.static_keys.clone(),
            config.authentication.dynamic,
            config.authentication.public_access,
            config.authentication.admin_bearer.clone(),
            None,
            config
                .backend_groups
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| "main".to_string()),
        );

        let ip_limiter = TokenBucketLimiter::new(
            config.rate_limit.max_per_interval,
            Duration::from_millis(config.rate_limit.interval_ms),
            Box::new(SystemClock),
        );
        let sender_limiter = TokenBucketLimiter::new(
            config.sender_rate_limit.max_per_interval,
            Duration::from_millis(config.sender_rate_limit.interval_ms),
            Box::new(SystemClock),
        );
        let ip_allowlist = Allowlist::new(config.rate_limit.allowlist.clone());
        let sender_allowlist = Allowlist::new(config.sender_rate_limit.allowlist.clone());

        let interop_validator = if config.interop_validation.enabled {
            Some(InteropValidator::new(&config.interop_validation, Box::new(SystemClock)))
        } else {
            None
        };
        let interop_group = config
            .interop_validation
            .backend_group
            .as_ref()
            .and_then(|name| groups.get(name).map(|g| g.value().clone()));

        info!(groups = groups.len(), backends = backends_by_name.len(), "proxyd app initialized");

        let app = Arc::new(App {
            config,
            groups,
            consensus,
            cache,
            authenticator,
            metrics,
            interop_validator,
            interop_group,
            ip_limiter,
            sender_limiter,
            ip_allowlist,
            sender_allowlist,
            shutdown_tx,
        });

        Ok((app, handles))
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn rate_limit(&self, ip: IpAddr) -> ProxydResult<()> {
        if self.ip_allowlist.contains(&ip.to_string()) {
            return Ok(());
        }
        self.ip_limiter.check(ip).map_err(|_| ProxydError::OverRateLimit)
    }

    pub fn sender_rate_limit(&self, sender: Address) -> ProxydResult<()> {
        if self.sender_allowlist.contains(&format!("{sender:#x}")) {
            return Ok(());
        }
        self.sender_limiter
            .check(sender)
            .map_err(|_| ProxydError::OverSenderRateLimit)
    }

    pub fn consensus_view(&self, group_name: &str) -> Option<Arc<ConsensusView>> {
        self.consensus.get(group_name).map(|p| p.current_view())
    }

    pub fn max_block_range(&self, group_name: &str) -> u64 {
        self.config
            .backend_groups
            .get(group_name)
            .map(|g| g.consensus_max_block_range)
            .unwrap_or(u64::MAX)
    }

    /// Trigger an immediate poll on every consensus-aware group. Used by
    /// tests and the admin surface to avoid waiting out the poll interval.
    pub async fn poll_all_consensus_now(&self) {
        let pollers: Vec<Arc<ConsensusPoller>> = self.consensus.iter().map(|p| p.value().clone()).collect();
        join_all(pollers.iter().map(|p| p.tick())).await;
    }
}
