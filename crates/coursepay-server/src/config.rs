//! Server configuration loaded from environment variables.
//!
//! Everything except the chain endpoints has a sensible default so the
//! server can start with zero configuration for local development.  In
//! production (`PRODUCTION=true`) the registry bytecode pin is mandatory
//! and startup fails without it.

use std::net::SocketAddr;
use std::path::PathBuf;

use coursepay_shared::constants::{
    SCHEDULER_INTERVAL_SECS, SCHEDULER_STARTUP_DELAY_SECS, STALE_PURCHASE_WINDOW_SECS,
};
use coursepay_shared::{Address, Blockchain, ChainKey};

/// One chain endpoint parsed from `CHAIN_ADAPTERS`.
#[derive(Debug, Clone)]
pub struct ChainEndpoint {
    pub key: ChainKey,
    pub rpc_url: String,
    /// Operator wallet managed by the RPC node.
    pub operator: Address,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Ledger database file. Empty means the platform data directory.
    /// Env: `DATABASE_PATH`
    pub database_path: Option<PathBuf>,

    /// Production mode. Makes the registry bytecode pin mandatory.
    /// Env: `PRODUCTION` (true/false)
    /// Default: `false`
    pub production: bool,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Chain endpoints, comma-separated entries of the form
    /// `evm:137=https://rpc.example|0x<operator-address>`.
    /// Env: `CHAIN_ADAPTERS`
    pub chains: Vec<ChainEndpoint>,

    /// blake3 hex digest of the token registry contract's deployed
    /// bytecode. Verification enforces the pin whenever this is set.
    /// Env: `REGISTRY_CODE_HASH`
    pub registry_code_hash: Option<String>,

    /// Env: `SCHEDULER_INTERVAL_SECS`, default 3600.
    pub scheduler_interval_secs: u64,

    /// Env: `SCHEDULER_STARTUP_DELAY_SECS`, default 30.
    pub scheduler_startup_delay_secs: u64,

    /// Age after which an unsettled (pending/failed) purchase row may be
    /// reconciled away. Env: `STALE_PURCHASE_WINDOW_SECS`, default 600.
    pub stale_purchase_window_secs: i64,

    /// Token bucket refill rate and burst capacity for per-IP rate
    /// limiting. Env: `RATE_LIMIT_PER_SEC` / `RATE_LIMIT_BURST`.
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: None,
            production: false,
            admin_token: None,
            chains: Vec::new(),
            registry_code_hash: None,
            scheduler_interval_secs: SCHEDULER_INTERVAL_SECS,
            scheduler_startup_delay_secs: SCHEDULER_STARTUP_DELAY_SECS,
            stale_purchase_window_secs: STALE_PURCHASE_WINDOW_SECS,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults. Returns an error only for contradictions that must not
    /// survive startup.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => {
                    tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
                }
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(val) = std::env::var("PRODUCTION") {
            config.production = val != "false" && val != "0";
        }

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Ok(spec) = std::env::var("CHAIN_ADAPTERS") {
            config.chains = parse_chain_adapters(&spec)?;
        }

        if let Ok(hash) = std::env::var("REGISTRY_CODE_HASH") {
            if !hash.is_empty() {
                config.registry_code_hash = Some(hash.to_lowercase());
            }
        }

        if config.production && config.registry_code_hash.is_none() {
            return Err("PRODUCTION=true requires REGISTRY_CODE_HASH".to_string());
        }

        if let Ok(val) = std::env::var("SCHEDULER_INTERVAL_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.scheduler_interval_secs = n;
            }
        }

        if let Ok(val) = std::env::var("SCHEDULER_STARTUP_DELAY_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.scheduler_startup_delay_secs = n;
            }
        }

        if let Ok(val) = std::env::var("STALE_PURCHASE_WINDOW_SECS") {
            if let Ok(n) = val.parse::<i64>() {
                config.stale_purchase_window_secs = n;
            }
        }

        if let Ok(val) = std::env::var("RATE_LIMIT_PER_SEC") {
            if let Ok(n) = val.parse::<f64>() {
                config.rate_limit_per_sec = n;
            }
        }

        if let Ok(val) = std::env::var("RATE_LIMIT_BURST") {
            if let Ok(n) = val.parse::<f64>() {
                config.rate_limit_burst = n;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        Ok(config)
    }
}

/// Parse `CHAIN_ADAPTERS`: comma-separated entries of the form
/// `<blockchain>:<chain_id>=<rpc_url>|<operator_address>`.
fn parse_chain_adapters(spec: &str) -> Result<Vec<ChainEndpoint>, String> {
    let mut endpoints = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key_part, rest) = entry
            .split_once('=')
            .ok_or_else(|| format!("chain adapter entry missing '=': {entry}"))?;
        let (chain_part, id_part) = key_part
            .split_once(':')
            .ok_or_else(|| format!("chain key must be <blockchain>:<chain_id>: {key_part}"))?;
        let blockchain = Blockchain::parse(chain_part)
            .ok_or_else(|| format!("unknown blockchain: {chain_part}"))?;
        let chain_id = id_part
            .parse::<u64>()
            .map_err(|_| format!("invalid chain id: {id_part}"))?;
        let (rpc_url, operator_str) = rest
            .split_once('|')
            .ok_or_else(|| format!("chain adapter entry missing '|<operator>': {entry}"))?;
        let operator = Address::parse(operator_str.trim(), blockchain)
            .ok_or_else(|| format!("invalid operator address: {operator_str}"))?;

        endpoints.push(ChainEndpoint {
            key: ChainKey::new(blockchain, chain_id),
            rpc_url: rpc_url.trim().to_string(),
            operator,
        });
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert!(!config.production);
        assert!(config.chains.is_empty());
    }

    #[test]
    fn parses_chain_adapters() {
        let operator = format!("0x{}", "ab".repeat(20));
        let spec = format!(
            "evm:137=https://polygon.example|{operator}, evm:1=https://mainnet.example|{operator}"
        );
        let endpoints = parse_chain_adapters(&spec).unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].key, ChainKey::new(Blockchain::Evm, 137));
        assert_eq!(endpoints[0].rpc_url, "https://polygon.example");
        assert_eq!(endpoints[1].key.chain_id, 1);
    }

    #[test]
    fn rejects_malformed_chain_entries() {
        assert!(parse_chain_adapters("evm:137").is_err());
        assert!(parse_chain_adapters("evm137=https://x|0xabc").is_err());
        assert!(parse_chain_adapters("evm:nope=https://x|0xabc").is_err());
        assert!(parse_chain_adapters("evm:137=https://x").is_err());
    }
}
