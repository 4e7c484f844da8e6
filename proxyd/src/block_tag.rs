//! Block tag parsing and rewriting against a consensus view.
//!
//! `latest`/`safe`/`finalized`/`pending`/`earliest` are symbolic selectors
//! that consensus-aware routing rewrites to a concrete hex block number
//! before forwarding upstream, so every backend in the consensus group is
//! asked about the same block.

use serde_json::Value;
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Earliest,
    Latest,
    Safe,
    Finalized,
    Pending,
    Number(u64),
}

impl BlockTag {
    pub fn parse(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => match s.as_str() {
                "earliest" => Some(Self::Earliest),
                "latest" => Some(Self::Latest),
                "safe" => Some(Self::Safe),
                "finalized" => Some(Self::Finalized),
                "pending" => Some(Self::Pending),
                hex if hex.starts_with("0x") => {
                    u64::from_str_radix(&hex[2..], 16).ok().map(Self::Number)
                }
                _ => None,
            },
            Value::Number(n) => n.as_u64().map(Self::Number),
            _ => None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        !matches!(self, Self::Number(_))
    }

    /// Would this tag resolve to an unbounded range if used as the end of a
    /// log filter? `latest`/`pending`/`safe`/`finalized` all track a
    /// moving target, so a range ending there has no fixed size.
    pub fn resolves_to_infinity(&self) -> bool {
        matches!(self, Self::Latest | Self::Pending | Self::Safe | Self::Finalized)
    }

    pub fn to_hex(self) -> String {
        match self {
            Self::Number(n) => format!("0x{n:x}"),
            Self::Earliest => "earliest".to_string(),
            Self::Latest => "latest".to_string(),
            Self::Safe => "safe".to_string(),
            Self::Finalized => "finalized".to_string(),
            Self::Pending => "pending".to_string(),
        }
    }

    pub fn to_value(self) -> Value {
        Value::String(self.to_hex())
    }
}

/// Methods whose first positional param is a block tag, along with the
/// param index. Not exhaustive of the whole JSON-RPC surface, just the
/// methods consensus-aware routing cares about rewriting.
pub fn block_param_index(method: &str) -> Option<usize> {
    match method {
        "eth_getBalance"
        | "eth_getCode"
        | "eth_getTransactionCount"
        | "eth_call"
        | "eth_estimateGas" => Some(1),
        "eth_getBlockByNumber" | "eth_getUncleByBlockNumberAndIndex" => Some(0),
        "eth_getStorageAt" => Some(2),
        _ => None,
    }
}

pub fn is_filter_range_method(method: &str) -> bool {
    matches!(method, "eth_getLogs" | "eth_newFilter")
}

/// Methods that mint a new filter id the caller will reference later.
/// Distinct from [`is_filter_range_method`]: `eth_getLogs` resolves to logs
/// directly and never creates a filter id, even though it shares the same
/// block-range validation as `eth_newFilter`.
pub fn is_filter_creating_method(method: &str) -> bool {
    matches!(method, "eth_newFilter" | "eth_newBlockFilter")
}

/// Methods that reference a previously created filter id and so must be
/// routed back to whichever backend created it.
pub fn is_filter_reference_method(method: &str) -> bool {
    matches!(method, "eth_getFilterChanges" | "eth_uninstallFilter")
}

/// Rewrite `latest`/`safe`/`finalized` tags in a request's positional
/// params against a resolved set of concrete numbers. Returns `true` if any
/// rewrite happened.
pub fn rewrite_params_block_tag(
    params: &mut Value,
    method: &str,
    latest: u64,
    safe: u64,
    finalized: u64,
) -> bool {
    let Some(idx) = block_param_index(method) else {
        return false;
    };
    let Value::Array(arr) = params else {
        return false;
    };
    let Some(slot) = arr.get_mut(idx) else {
        return false;
    };

    rewrite_one(slot, latest, safe, finalized)
}

/// Rewrite `fromBlock`/`toBlock` inside a filter object (`eth_getLogs` /
/// `eth_newFilter`'s first param).
pub fn rewrite_filter_object_block_tags(
    params: &mut Value,
    latest: u64,
    safe: u64,
    finalized: u64,
) -> bool {
    let Value::Array(arr) = params else {
        return false;
    };
    let Some(Value::Object(filter)) = arr.get_mut(0) else {
        return false;
    };

    let mut rewrote = false;
    for key in ["fromBlock", "toBlock"] {
        if let Some(slot) = filter.get_mut(key) {
            rewrote |= rewrite_one(slot, latest, safe, finalized);
        }
    }
    rewrote
}

fn rewrite_one(slot: &mut Value, latest: u64, safe: u64, finalized: u64) -> bool {
    match BlockTag::parse(slot) {
        Some(BlockTag::Latest) => {
            *slot = BlockTag::Number(latest).to_value();
            true
        }
        Some(BlockTag::Safe) => {
            *slot = BlockTag::Number(safe).to_value();
            true
        }
        Some(BlockTag::Finalized) => {
            *slot = BlockTag::Number(finalized).to_value();
            true
        }
        _ => false,
    }
}

/// Resolve a filter's `[fromBlock, toBlock]` span in block count, for
/// `consensusMaxBlockRange` enforcement. Returns `None` if either side is
/// symbolic and unbounded (caller should reject separately via
/// `resolves_to_infinity`).
pub fn resolved_range(params: &Value, latest: u64) -> Option<(u64, u64)> {
    let Value::Array(arr) = params else { return None };
    let Value::Object(filter) = arr.get(0)? else { return None };

    let from = filter
        .get("fromBlock")
        .and_then(BlockTag::parse)
        .unwrap_or(BlockTag::Number(0));
    let to = filter
        .get("toBlock")
        .and_then(BlockTag::parse)
        .unwrap_or(BlockTag::Latest);

    let resolve = |t: BlockTag| -> Option<u64> {
        match t {
            BlockTag::Number(n) => Some(n),
            BlockTag::Latest | BlockTag::Pending => Some(latest),
            BlockTag::Earliest => Some(0),
            BlockTag::Safe | BlockTag::Finalized => None,
        }
    };

    Some((resolve(from)?, resolve(to)?))
}

pub fn invalid_tag_message(tag: &str) -> Cow<'static, str> {
    Cow::Owned(format!("block tags like \"{tag}\" are not allowed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_symbolic_and_numeric() {
        assert_eq!(BlockTag::parse(&json!("latest")), Some(BlockTag::Latest));
        assert_eq!(BlockTag::parse(&json!("0x10")), Some(BlockTag::Number(16)));
        assert_eq!(BlockTag::parse(&json!("bogus")), None);
    }

    #[test]
    fn rewrites_get_balance_tag() {
        let mut params = json!(["0xabc", "latest"]);
        let rewrote = rewrite_params_block_tag(&mut params, "eth_getBalance", 100, 90, 80);
        assert!(rewrote);
        assert_eq!(params[1], json!("0x64"));
    }

    #[test]
    fn leaves_numeric_tag_alone() {
        let mut params = json!(["0xabc", "0x5"]);
        let rewrote = rewrite_params_block_tag(&mut params, "eth_getBalance", 100, 90, 80);
        assert!(!rewrote);
        assert_eq!(params[1], json!("0x5"));
    }

    #[test]
    fn filter_object_from_to_block_rewritten() {
        let mut params = json!([{"fromBlock": "0x0", "toBlock": "safe"}]);
        let rewrote = rewrite_filter_object_block_tags(&mut params, 100, 90, 80);
        assert!(rewrote);
        assert_eq!(params[0]["toBlock"], json!("0x5a"));
    }

    #[test]
    fn resolves_range_rejects_unbounded_latest() {
        let params = json!([{"fromBlock": "0x0", "toBlock": "0xc8"}]);
        let (from, to) = resolved_range(&params, 1000).unwrap();
        assert_eq!((from, to), (0, 200));
    }
}
