//! Minimal JSON-RPC 2.0 client.
//!
//! Every call runs under an explicit deadline: a hung RPC endpoint must
//! never hold a purchase request open indefinitely, so there is no
//! "no timeout" mode here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ChainError, Result};

/// Default per-call deadline for chain RPC.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    /// `null` is a legitimate result (e.g. a pending transaction receipt),
    /// so this is a plain `Value` rather than an `Option`.
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC over HTTP client for one endpoint.
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue a JSON-RPC call with the default deadline.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.call_with_timeout(method, params, Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS))
            .await
    }

    /// Issue a JSON-RPC call with an explicit deadline.
    pub async fn call_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "rpc call");

        let send = self.http.post(&self.url).json(&body).send();
        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| ChainError::Timeout(timeout.as_secs()))?
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        let parsed: RpcResponse = tokio::time::timeout(timeout, response.json())
            .await
            .map_err(|_| ChainError::Timeout(timeout.as_secs()))?
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        serde_json::from_value(parsed.result)
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))
    }
}

/// Parse an `0x`-prefixed hex quantity into a u128.
pub fn parse_hex_quantity(s: &str) -> Result<u128> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::InvalidResponse(format!("not a hex quantity: {s}")))?;
    u128::from_str_radix(digits, 16)
        .map_err(|e| ChainError::InvalidResponse(format!("bad hex quantity {s}: {e}")))
}

/// Render a u128 as an `0x`-prefixed hex quantity.
pub fn to_hex_quantity(n: u128) -> String {
    format!("{n:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_quantity_round_trip() {
        assert_eq!(parse_hex_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_hex_quantity("0x1b").unwrap(), 27);
        assert_eq!(to_hex_quantity(27), "0x1b");
        assert!(parse_hex_quantity("27").is_err());
        assert!(parse_hex_quantity("0xzz").is_err());
    }
}
