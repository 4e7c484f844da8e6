//! JSON-RPC 1.0/2.0 message types.
//!
//! Ids are kept as opaque `serde_json::Value` so we never have to interpret
//! them — they may be numbers, strings, or null, and must be echoed back
//! verbatim per request.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use std::borrow::Cow;

fn is_default_jsonrpc(v: &str) -> bool {
    v.is_empty()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default, skip_serializing_if = "is_default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Value::Null,
            method: method.into(),
            params,
        }
    }
}

/// A single request, or a batch. Distinguished at deserialize time by
/// whether the top-level JSON value is an object or an array.
#[derive(Debug, Clone)]
pub enum JsonRpcRequestEnum {
    Single(JsonRpcRequest),
    Batch(Vec<JsonRpcRequest>),
}

impl<'de> Deserialize<'de> for JsonRpcRequestEnum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Array(items) => {
                let reqs = items
                    .into_iter()
                    .map(|v| serde_json::from_value(v).map_err(serde::de::Error::custom))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(JsonRpcRequestEnum::Batch(reqs))
            }
            other => {
                let req = serde_json::from_value(other).map_err(serde::de::Error::custom)?;
                Ok(JsonRpcRequestEnum::Single(req))
            }
        }
    }
}

impl Serialize for JsonRpcRequestEnum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            JsonRpcRequestEnum::Single(r) => r.serialize(serializer),
            JsonRpcRequestEnum::Batch(rs) => rs.serialize(serializer),
        }
    }
}

/// `code`/`message`/`data` triple matching the JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcErrorData {
    pub code: i64,
    pub message: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcForwardedResponse {
    pub jsonrpc: Cow<'static, str>,
    pub id: Box<RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorData>,
}

impl JsonRpcForwardedResponse {
    pub fn from_value(result: Value, id: Box<RawValue>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed("2.0"),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn from_error(error: JsonRpcErrorData, id: Box<RawValue>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed("2.0"),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_null_result(&self) -> bool {
        matches!(self.result, Some(Value::Null) | None) && self.error.is_none()
    }

    pub fn is_empty_array_result(&self) -> bool {
        matches!(&self.result, Some(Value::Array(a)) if a.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JsonRpcForwardedResponseEnum {
    Single(JsonRpcForwardedResponse),
    Batch(Vec<JsonRpcForwardedResponse>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_request_decodes() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId","params":[]}"#;
        let parsed: JsonRpcRequestEnum = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, JsonRpcRequestEnum::Single(_)));
    }

    #[test]
    fn batch_request_decodes() {
        let raw = r#"[{"jsonrpc":"2.0","id":1,"method":"eth_chainId"},{"jsonrpc":"2.0","id":2,"method":"net_version"}]"#;
        let parsed: JsonRpcRequestEnum = serde_json::from_str(raw).unwrap();
        match parsed {
            JsonRpcRequestEnum::Batch(items) => assert_eq!(items.len(), 2),
            _ => panic!("expected batch"),
        }
    }

    #[test]
    fn id_is_preserved_verbatim() {
        let raw = r#"{"jsonrpc":"2.0","id":"abc-123","method":"eth_chainId"}"#;
        let parsed: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.id, Value::String("abc-123".to_string()));
    }
}
