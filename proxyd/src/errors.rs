//! Utilities for logging errors for admins and displaying errors to users.
//!
//! Mirrors the teacher's flat `derive_more`-based error enum: one variant per
//! failure mode, a single `as_response_parts` match that assigns the
//! `(HTTP status, JSON-RPC code)` pair, and a `.pctx()`-style extension
//! trait for attaching a message without losing the source error.

use crate::jsonrpc::{JsonRpcErrorData, JsonRpcForwardedResponse};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use derive_more::{Display, Error, From};
use serde_json::value::RawValue;
use std::borrow::Cow;
use tracing::{debug, error, trace, warn};

pub type ProxydResult<T> = Result<T, ProxydError>;
pub type ProxydResponse = ProxydResult<Response>;

#[derive(Debug, Display, Error, From)]
pub enum ProxydError {
    #[error(ignore)]
    #[from(ignore)]
    Anyhow(anyhow::Error),

    /// no candidate backend existed to send the request to (empty group,
    /// empty consensus group)
    NoBackends,

    /// every candidate backend was banned or out of service
    BackendOffline,

    /// the backend's own rate limit (rps) would be exceeded
    BackendOverCapacity,

    /// the backend did not respond within its configured timeout
    BackendRequestTimeout,

    #[error(ignore)]
    #[from(ignore)]
    BackendBadResponse(Cow<'static, str>),

    BackendResponseTooLarge,

    /// the response id or jsonrpc version did not match the request
    BackendUnexpectedJsonRpc,

    #[error(ignore)]
    #[from(ignore)]
    MethodNotWhitelisted(Cow<'static, str>),

    #[error(ignore)]
    #[from(ignore)]
    BlockOutOfRange(Cow<'static, str>),

    #[error(ignore)]
    #[from(ignore)]
    BlockRangeTooLarge(Cow<'static, str>),

    OverRateLimit,

    OverSenderRateLimit,

    #[error(ignore)]
    #[from(ignore)]
    BodyTooLarge(usize),

    AccessListTooLarge,

    ParseError(serde_json::Error),

    #[error(ignore)]
    #[from(ignore)]
    InvalidRequest(Cow<'static, str>),

    Unauthorized,

    NotFound,

    /// a syntactically valid JSON-RPC error the backend returned; passed
    /// through to the client unchanged
    #[display(fmt = "{:?}", _0)]
    #[error(ignore)]
    Upstream(JsonRpcErrorData),

    Timeout(tokio::time::error::Elapsed),

    Http(reqwest::Error),

    #[display(fmt = "{:?}, {}", _0, _1)]
    #[error(ignore)]
    WithContext(Option<Box<ProxydError>>, Cow<'static, str>),
}

impl ProxydError {
    pub fn as_response_parts(&self) -> (StatusCode, JsonRpcErrorData) {
        let (code, err): (StatusCode, JsonRpcErrorData) = match self {
            Self::Anyhow(err) => {
                warn!(?err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData {
                        message: "internal server error".into(),
                        code: -32603,
                        data: None,
                    },
                )
            }
            Self::NoBackends => {
                debug!("no backends available");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    JsonRpcErrorData {
                        message: "no backends available".into(),
                        code: -32011,
                        data: None,
                    },
                )
            }
            Self::BackendOffline => {
                debug!("backend offline");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    JsonRpcErrorData {
                        message: "backend is offline".into(),
                        code: -32011,
                        data: None,
                    },
                )
            }
            Self::BackendOverCapacity => {
                trace!("backend over capacity");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    JsonRpcErrorData {
                        message: "backend is over capacity".into(),
                        code: -32019,
                        data: None,
                    },
                )
            }
            Self::BackendRequestTimeout => {
                debug!("backend request timed out");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    JsonRpcErrorData {
                        message: "backend request timed out".into(),
                        code: -32015,
                        data: None,
                    },
                )
            }
            Self::BackendBadResponse(msg) => {
                debug!(%msg, "backend bad response");
                (
                    StatusCode::BAD_GATEWAY,
                    JsonRpcErrorData {
                        message: format!("bad response from backend: {msg}").into(),
                        code: -32020,
                        data: None,
                    },
                )
            }
            Self::BackendResponseTooLarge => {
                warn!("backend response too large");
                (
                    StatusCode::BAD_GATEWAY,
                    JsonRpcErrorData {
                        message: "backend response too large".into(),
                        code: -32020,
                        data: None,
                    },
                )
            }
            Self::BackendUnexpectedJsonRpc => {
                warn!("backend returned unexpected jsonrpc envelope");
                (
                    StatusCode::BAD_GATEWAY,
                    JsonRpcErrorData {
                        message: "backend returned an unexpected jsonrpc response".into(),
                        code: -32020,
                        data: None,
                    },
                )
            }
            Self::MethodNotWhitelisted(method) => {
                trace!(%method, "method not whitelisted");
                (
                    StatusCode::FORBIDDEN,
                    JsonRpcErrorData {
                        message: format!("method {method} is not whitelisted").into(),
                        code: -32601,
                        data: None,
                    },
                )
            }
            Self::BlockOutOfRange(msg) => {
                trace!(%msg, "block out of range");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData {
                        message: msg.clone(),
                        code: -32010,
                        data: None,
                    },
                )
            }
            Self::BlockRangeTooLarge(msg) => {
                trace!(%msg, "block range too large");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData {
                        message: msg.clone(),
                        code: -32010,
                        data: None,
                    },
                )
            }
            Self::OverRateLimit => {
                trace!("over rate limit");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    JsonRpcErrorData {
                        message: "too many requests".into(),
                        code: -32016,
                        data: None,
                    },
                )
            }
            Self::OverSenderRateLimit => {
                trace!("over sender rate limit");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    JsonRpcErrorData {
                        message: "too many requests from this sender".into(),
                        code: -32017,
                        data: None,
                    },
                )
            }
            Self::BodyTooLarge(max) => {
                trace!(%max, "body too large");
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    JsonRpcErrorData {
                        message: format!("request body exceeds {max} bytes").into(),
                        code: -32021,
                        data: None,
                    },
                )
            }
            Self::AccessListTooLarge => {
                trace!("access list too large");
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    JsonRpcErrorData {
                        message: "access list exceeds the configured size cap".into(),
                        code: -32022,
                        data: None,
                    },
                )
            }
            Self::ParseError(err) => {
                trace!(?err, "parse error");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData {
                        message: format!("parse error: {err}").into(),
                        code: -32700,
                        data: None,
                    },
                )
            }
            Self::InvalidRequest(msg) => {
                trace!(%msg, "invalid request");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData {
                        message: msg.clone(),
                        code: -32600,
                        data: None,
                    },
                )
            }
            Self::Unauthorized => {
                trace!("unauthorized");
                (
                    StatusCode::UNAUTHORIZED,
                    JsonRpcErrorData {
                        message: "unauthorized".into(),
                        code: -32000,
                        data: None,
                    },
                )
            }
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                JsonRpcErrorData {
                    message: "not found".into(),
                    code: -32601,
                    data: None,
                },
            ),
            Self::Upstream(data) => (StatusCode::OK, data.clone()),
            Self::Timeout(elapsed) => {
                debug!(?elapsed, "client-visible request timeout");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    JsonRpcErrorData {
                        message: "request timed out".into(),
                        code: -32015,
                        data: None,
                    },
                )
            }
            Self::Http(err) => {
                warn!(?err, "http transport error");
                (
                    StatusCode::BAD_GATEWAY,
                    JsonRpcErrorData {
                        message: "backend transport error".into(),
                        code: -32020,
                        data: None,
                    },
                )
            }
            Self::WithContext(inner, msg) => match inner {
                Some(inner) => {
                    warn!(?inner, %msg, "error with context");
                    return inner.as_response_parts();
                }
                None => {
                    error!(%msg, "error with context");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        JsonRpcErrorData {
                            message: msg.clone(),
                            code: -32603,
                            data: None,
                        },
                    )
                }
            },
        };

        (code, err)
    }

    pub fn into_response_with_id(self, id: Option<Box<RawValue>>) -> Response {
        let (status_code, data) = self.as_response_parts();
        let id = id.unwrap_or_else(|| RawValue::from_string("null".to_string()).unwrap());
        let response = JsonRpcForwardedResponse::from_error(data, id);
        (status_code, Json(response)).into_response()
    }

    /// does this error represent a transient infrastructure failure that
    /// should count against the backend's health window, as opposed to a
    /// client mistake or an application-level upstream error?
    pub fn is_backend_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendRequestTimeout
                | Self::BackendBadResponse(_)
                | Self::BackendResponseTooLarge
                | Self::BackendUnexpectedJsonRpc
                | Self::Http(_)
        )
    }
}

impl IntoResponse for ProxydError {
    fn into_response(self) -> Response {
        self.into_response_with_id(None)
    }
}

pub trait ProxydErrorContext<T> {
    fn pctx<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T, ProxydError>;
}

impl<T> ProxydErrorContext<T> for Option<T> {
    fn pctx<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T, ProxydError> {
        self.ok_or(ProxydError::WithContext(None, msg.into()))
    }
}

impl<T, E> ProxydErrorContext<T> for Result<T, E>
where
    E: Into<ProxydError>,
{
    fn pctx<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T, ProxydError> {
        self.map_err(|err| ProxydError::WithContext(Some(Box::new(err.into())), msg.into()))
    }
}
