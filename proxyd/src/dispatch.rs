//! Request dispatcher (C7): parses single/batched JSON-RPC payloads,
//! enforces auth/size/method rules, applies sender rate limits and the
//! interop pre-validation pipeline, consults the cache, routes to a
//! backend group, and assembles an ordered response.
//!
//! Generalizes the teacher's `frontend::http_proxy::public_proxy_web3_rpc`
//! handler, folding its rate-limit-then-dispatch-then-map-error shape onto
//! the richer per-sub-request pipeline the spec requires.

use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_client_ip::ClientIp;
use ethers::core::types::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tracing::{instrument, trace};

use crate::app::App;
use crate::auth::AuthOutcome;
use crate::block_tag::{self, BlockTag};
use crate::cache::{cache_key, should_cache, CONDITIONAL_DEFAULT_TTL};
use crate::config::RoutingStrategy;
use crate::errors::{ProxydError, ProxydResult};
use crate::jsonrpc::{
    JsonRpcForwardedResponse, JsonRpcForwardedResponseEnum, JsonRpcRequest, JsonRpcRequestEnum,
};
use crate::sender::{access_list_entries, recover_sender};

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

#[instrument(skip(app, body), fields(path_key))]
pub async fn handle_http_rpc(
    Extension(app): Extension<Arc<App>>,
    path_key: Option<Path<String>>,
    headers: HeaderMap,
    ClientIp(ip): ClientIp,
    body: axum::body::Bytes,
) -> Response {
    app.metrics.record_request();

    let bearer = extract_bearer(&headers);
    let path_key = path_key.map(|Path(k)| k);

    let group_name = match app.authenticator.authorize(bearer.as_deref(), path_key.as_deref()).await {
        AuthOutcome::Allowed(group) => group,
        AuthOutcome::Unauthorized => return StatusCode::UNAUTHORIZED.into_response(),
    };

    if body.len() > app.config.server.max_body_bytes {
        return ProxydError::BodyTooLarge(app.config.server.max_body_bytes).into_response();
    }

    if app.rate_limit(ip).is_err() {
        app.metrics.record_rate_limit_rejection();
        return ProxydError::OverRateLimit.into_response();
    }

    let Some(group) = app.groups.get(&group_name).map(|g| g.value().clone()) else {
        return ProxydError::NoBackends.into_response();
    };

    let payload: JsonRpcRequestEnum = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(err) => return ProxydError::ParseError(err).into_response(),
    };

    match payload {
        JsonRpcRequestEnum::Single(req) => {
            let (response, served_by) = dispatch_one(&app, group.as_ref(), req).await;
            let mut resp = (StatusCode::OK, Json(response)).into_response();
            resp.headers_mut().insert(
                "x-served-by",
                served_by.parse().unwrap_or_else(|_| "unknown".parse().unwrap()),
            );
            resp
        }
        JsonRpcRequestEnum::Batch(reqs) => {
            if reqs.is_empty() {
                return ProxydError::InvalidRequest("batch must not be empty".into()).into_response();
            }
            if reqs.len() > group.max_batch_size {
                return ProxydError::InvalidRequest(
                    format!("batch of {} exceeds max_batch_size {}", reqs.len(), group.max_batch_size).into(),
                )
                .into_response();
            }

            let mut responses = Vec::with_capacity(reqs.len());
            let mut last_served_by = String::new();
            for req in reqs {
                let (response, served_by) = dispatch_one(&app, group.as_ref(), req).await;
                last_served_by = served_by;
                responses.push(response);
            }

            let mut resp = (
                StatusCode::OK,
                Json(JsonRpcForwardedResponseEnum::Batch(responses)),
            )
                .into_response();
            resp.headers_mut().insert(
                "x-served-by",
                last_served_by.parse().unwrap_or_else(|_| "unknown".parse().unwrap()),
            );
            resp
        }
    }
}

/// Dispatch exactly one validated sub-request. Never panics; any failure
/// becomes a JSON-RPC error response carrying the request's id.
async fn dispatch_one(
    app: &App,
    group: &crate::rpcs::group::BackendGroup,
    mut req: JsonRpcRequest,
) -> (JsonRpcForwardedResponse, String) {
    let id = serde_json::value::RawValue::from_string(
        serde_json::to_string(&req.id).unwrap_or_else(|_| "null".to_string()),
    )
    .unwrap();

    match dispatch_one_inner(app, group, &mut req).await {
        Ok((response, served_by)) => (response, served_by),
        Err(err) => {
            let (_, data) = err.as_response_parts();
            (JsonRpcForwardedResponse::from_error(data, id), format!("{}/unknown", group.name))
        }
    }
}

async fn dispatch_one_inner(
    app: &App,
    group: &crate::rpcs::group::BackendGroup,
    req: &mut JsonRpcRequest,
) -> ProxydResult<(JsonRpcForwardedResponse, String)> {
    if req.method.is_empty() {
        return Err(ProxydError::InvalidRequest("missing method".into()));
    }
    if !group.method_allowed(&req.method) {
        return Err(ProxydError::MethodNotWhitelisted(req.method.clone().into()));
    }

    if req.method == "eth_sendRawTransaction" || req.method == "eth_sendRawTransactionConditional" {
        return handle_raw_transaction(app, group, req).await;
    }

    if block_tag::is_filter_range_method(&req.method) {
        validate_log_filter_range(app, group, req)?;
    }

    let view = app.consensus_view(&group.name);
    let consensus = view.as_deref();

    if group.strategy == RoutingStrategy::ConsensusAware {
        if let Some(view) = consensus {
            rewrite_consensus_tags(req, view);
        }
    }

    let cache_key = cache_key(&req.method, req.params.as_ref().unwrap_or(&Value::Null));
    if let Some(cached) = app.cache.get(&cache_key) {
        app.metrics.record_cache_hit();
        let id = raw_id(&req.id);
        return Ok((
            JsonRpcForwardedResponse::from_value(cached, id),
            format!("{}/cache", group.name),
        ));
    }
    app.metrics.record_cache_miss();

    let sticky_key = req
        .params
        .as_ref()
        .and_then(|p| p.get(0))
        .and_then(|v| v.as_str());

    let routed = group.dispatch(req, consensus, sticky_key).await?;

    if let Some(result) = &routed.response.result {
        let resolved_block_number = resolved_request_block_number(req);
        let latest = consensus.map(|v| v.consensus_latest_block_number).unwrap_or(0);
        let safe = consensus.map(|v| v.consensus_safe_block_number).unwrap_or(0);
        if should_cache(&req.method, result, resolved_block_number, latest, safe) {
            app.cache.put(cache_key, result.clone(), Some(CONDITIONAL_DEFAULT_TTL));
        }
    }

    Ok((routed.response, format!("{}/{}", group.name, routed.backend_name)))
}

/// Pull the block number actually requested out of a method's block-tag
/// param slot (after consensus rewriting has turned any symbolic tag into a
/// concrete number). `None` if the method has no such slot, the param is
/// missing, or it's still symbolic (e.g. `pending`/`earliest`, which
/// `should_cache` must treat as non-cacheable rather than as block 0).
fn resolved_request_block_number(req: &JsonRpcRequest) -> Option<u64> {
    let idx = block_tag::block_param_index(&req.method)?;
    let params = req.params.as_ref()?;
    let slot = params.get(idx)?;
    match BlockTag::parse(slot)? {
        BlockTag::Number(n) => Some(n),
        _ => None,
    }
}

fn raw_id(id: &Value) -> Box<serde_json::value::RawValue> {
    serde_json::value::RawValue::from_string(serde_json::to_string(id).unwrap_or_else(|_| "null".to_string())).unwrap()
}

async fn handle_raw_transaction(
    app: &App,
    group: &crate::rpcs::group::BackendGroup,
    req: &mut JsonRpcRequest,
) -> ProxydResult<(JsonRpcForwardedResponse, String)> {
    let raw_hex = req
        .params
        .as_ref()
        .and_then(|p| p.get(0))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProxydError::InvalidRequest("missing raw transaction bytes".into()))?;
    let raw: Bytes = raw_hex
        .parse()
        .map_err(|_| ProxydError::InvalidRequest("invalid raw transaction hex".into()))?;

    let sender = recover_sender(&raw)?;
    app.sender_rate_limit(sender)?;

    let entries = access_list_entries(&raw)?;
    if !entries.is_empty() {
        if let Some(validator) = &app.interop_validator {
            validator.validate(sender, entries)?;

            if let Some(interop_group) = app.interop_group.as_ref() {
                trace!(%sender, "routing interop transaction through dedicated validator group");
                let routed = interop_group.dispatch(req, None, None).await?;
                return Ok((routed.response, format!("{}/{}", interop_group.name, routed.backend_name)));
            }
        }
    }

    let routed = group.dispatch(req, None, None).await?;
    Ok((routed.response, format!("{}/{}", group.name, routed.backend_name)))
}

fn validate_log_filter_range(
    app: &App,
    group: &crate::rpcs::group::BackendGroup,
    req: &JsonRpcRequest,
) -> ProxydResult<()> {
    if group.strategy != RoutingStrategy::ConsensusAware {
        return Ok(());
    }
    let params = req.params.as_ref().cloned().unwrap_or(Value::Array(vec![]));
    let Value::Array(arr) = &params else { return Ok(()) };
    let Some(Value::Object(filter)) = arr.get(0) else {
        return Ok(());
    };

    if let Some(to_block) = filter.get("toBlock") {
        if let Some(tag) = BlockTag::parse(to_block) {
            if tag.resolves_to_infinity() {
                return Err(ProxydError::BlockOutOfRange(block_tag::invalid_tag_message(&tag.to_hex())));
            }
        }
    }

    let view = app.consensus_view(&group.name);
    let latest = view.as_ref().map(|v| v.consensus_latest_block_number).unwrap_or(0);
    let max_range = app.max_block_range(&group.name);

    if let Some((from, to)) = block_tag::resolved_range(&params, latest) {
        let span = to.saturating_sub(from);
        if span > max_range {
            return Err(ProxydError::BlockRangeTooLarge(
                format!("block range greater than {max_range} max").into(),
            ));
        }
    }

    Ok(())
}

fn rewrite_consensus_tags(req: &mut JsonRpcRequest, view: &crate::rpcs::consensus::ConsensusView) {
    let Some(params) = req.params.as_mut() else { return };
    block_tag::rewrite_params_block_tag(
        params,
        &req.method,
        view.consensus_latest_block_number,
        view.consensus_safe_block_number,
        view.consensus_finalized_block_number,
    );
    block_tag::rewrite_filter_object_block_tags(
        params,
        view.consensus_latest_block_number,
        view.consensus_safe_block_number,
        view.consensus_finalized_block_number,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, BackendConfig, BackendGroupConfig};
    use std::collections::HashMap;

    #[test]
    fn extract_bearer_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn extract_bearer_none_without_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);
    }

    fn test_backend_config() -> BackendConfig {
        BackendConfig {
            http_url: "http://node1".to_string(),
            ws_url: None,
            username: None,
            password: None,
            bearer_token: None,
            max_rps: None,
            max_ws_conns: None,
            timeout_ms: None,
            max_retries: Some(0),
            out_of_service_seconds: None,
            strip_trailing_xff: false,
            skip_peer_count_check: false,
            skip_is_syncing_check: false,
            forced_candidate: false,
            headers_passthrough: false,
        }
    }

    fn test_group_config() -> BackendGroupConfig {
        BackendGroupConfig {
            backends: vec!["node1".to_string()],
            strategy: RoutingStrategy::ConsensusAware,
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

    #[test]
    fn resolved_request_block_number_reads_the_requests_own_param() {
        let mut req = JsonRpcRequest::new(
            "eth_getBlockByNumber",
            Some(serde_json::json!(["0x5", false])),
        );
        req.id = serde_json::json!(1);
        assert_eq!(resolved_request_block_number(&req), Some(5));

        let mut symbolic = JsonRpcRequest::new(
            "eth_getBlockByNumber",
            Some(serde_json::json!(["pending", false])),
        );
        symbolic.id = serde_json::json!(2);
        assert_eq!(resolved_request_block_number(&symbolic), None);

        let unrelated = JsonRpcRequest::new("eth_chainId", Some(serde_json::json!([])));
        assert_eq!(resolved_request_block_number(&unrelated), None);
    }

    /// Scenario 6 (block-range rejection): an `eth_getLogs` span wider than
    /// `consensus_max_block_range` is rejected with a message naming the
    /// limit, and an unbounded `toBlock: "latest"` is rejected outright.
    #[tokio::test]
    async fn rejects_too_large_block_range_and_symbolic_latest() {
        let mut backends = HashMap::new();
        backends.insert("node1".to_string(), test_backend_config());
        let mut backend_groups = HashMap::new();
        backend_groups.insert("main".to_string(), test_group_config());

        let config = AppConfig {
            server: Default::default(),
            redis: None,
            metrics: Default::default(),
            backend: Default::default(),
            backends,
            backend_groups,
            authentication: Default::default(),
            rpc_method_mappings: HashMap::new(),
            cache: Default::default(),
            sender_rate_limit: Default::default(),
            rate_limit: Default::default(),
            interop_validation: Default::default(),
        };

        let (app, _handles) = crate::app::App::spawn(config).unwrap();
        let group = app.groups.get("main").unwrap().value().clone();

        let mut too_large = JsonRpcRequest::new(
            "eth_getLogs",
            Some(serde_json::json!([{"fromBlock": "0x0", "toBlock": "0xc8"}])),
        );
        too_large.id = serde_json::json!(1);
        let err = validate_log_filter_range(&app, group.as_ref(), &too_large).unwrap_err();
        let (status, data) = err.as_response_parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(data.message.contains("block range greater than 100 max"));

        let mut unbounded = JsonRpcRequest::new(
            "eth_getLogs",
            Some(serde_json::json!([{"fromBlock": "0x0", "toBlock": "latest"}])),
        );
        unbounded.id = serde_json::json!(2);
        let err = validate_log_filter_range(&app, group.as_ref(), &unbounded).unwrap_err();
        let (status, data) = err.as_response_parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(data.message.contains("are not allowed"));
    }
}
