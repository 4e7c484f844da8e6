//! Transport abstraction (C2 support): `{ post(bytes) -> bytes, dial_ws()
//! -> duplex stream }`, generalized from the teacher's `Web3Provider`
//! enum-of-transports (`rpcs/request.rs`) into a trait so backends can be
//! mocked in tests per the design notes.

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::{ProxydError, ProxydResult};

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// POST a raw JSON-RPC body and return the raw response bytes.
    async fn post(&self, body: Vec<u8>, timeout: Duration) -> ProxydResult<Vec<u8>>;

    /// Open a duplex WebSocket stream to the backend's WS endpoint. Only
    /// called for groups designated as the WS group.
    async fn dial_ws(&self) -> ProxydResult<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>;
}

/// Production transport backed by a shared `reqwest::Client` and the
/// backend's configured HTTP/WS URLs and credentials.
#[derive(Debug)]
pub struct HttpWsTransport {
    pub http_url: String,
    pub ws_url: Option<String>,
    pub client: reqwest::Client,
    pub bearer_token: Option<String>,
    pub basic_auth: Option<(String, String)>,
}

#[async_trait]
impl Transport for HttpWsTransport {
    async fn post(&self, body: Vec<u8>, timeout: Duration) -> ProxydResult<Vec<u8>> {
        let mut req = self
            .client
            .post(&self.http_url)
            .header("content-type", "application/json")
            .timeout(timeout)
            .body(body);

        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        } else if let Some((user, pass)) = &self.basic_auth {
            req = req.basic_auth(user, Some(pass));
        }

        let resp = req.send().await.map_err(|err| {
            if err.is_timeout() {
                ProxydError::BackendRequestTimeout
            } else {
                ProxydError::Http(err)
            }
        })?;

        if resp.status().as_u16() >= 500 || resp.status().as_u16() == 429 {
            return Err(ProxydError::BackendBadResponse(
                format!("status {}", resp.status()).into(),
            ));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(ProxydError::Http)?
            .to_vec();

        Ok(bytes)
    }

    async fn dial_ws(&self) -> ProxydResult<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
        let url = self
            .ws_url
            .as_ref()
            .ok_or_else(|| ProxydError::InvalidRequest("backend has no ws_url configured".into()))?;

        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| ProxydError::BackendBadResponse(err.to_string().into()))?;

        Ok(stream)
    }
}

/// In-memory transport for tests: returns canned responses by method name,
/// optionally sleeping first to simulate a slow backend (used by the
/// multicall first-good-wins scenario).
#[derive(Debug, Default)]
pub struct MockTransport {
    pub responses: parking_lot::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    pub delay: parking_lot::Mutex<Option<Duration>>,
    pub calls: std::sync::atomic::AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_response(&self, method: impl Into<String>, body: Vec<u8>) {
        self.responses.lock().insert(method.into(), body);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(&self, body: Vec<u8>, _timeout: Duration) -> ProxydResult<Vec<u8>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        if let Some(delay) = *self.delay.lock() {
            tokio::time::sleep(delay).await;
        }

        let parsed: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| ProxydError::InvalidRequest(err.to_string().into()))?;
        let method = parsed
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default();

        self.responses
            .lock()
            .get(method)
            .cloned()
            .ok_or_else(|| ProxydError::BackendBadResponse(format!("no mock response for {method}").into()))
    }

    async fn dial_ws(&self) -> ProxydResult<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
        Err(ProxydError::InvalidRequest("MockTransport does not support ws".into()))
    }
}
