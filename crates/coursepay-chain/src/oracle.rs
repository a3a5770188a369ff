//! Token price oracle.
//!
//! Resolves a token's USD price by its configured strategy.  Live lookups
//! run under a strict timeout, and every failure path degrades to the
//! last good cached price or the token's fixed USD price.  `usd_price`
//! never returns an error: checkout must stay available through an
//! oracle outage, so a price-quote failure degrades rather than crashes
//! the flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use coursepay_shared::constants::ORACLE_TIMEOUT_SECS;
use coursepay_shared::{Address, OracleStrategy};

use crate::error::{ChainError, Result};
use crate::rpc::{JsonRpcClient, parse_hex_quantity};

/// Chainlink aggregator selectors, precomputed from the feed ABI.
const SEL_LATEST_ROUND_DATA: &str = "0xfeaf968c";
const SEL_DECIMALS: &str = "0x313ce567";

/// Cached live prices older than this are discarded rather than served.
const CACHE_MAX_AGE: Duration = Duration::from_secs(3_600);

/// Price configuration for one token, read from its ledger row.
#[derive(Debug, Clone)]
pub struct TokenPriceSpec {
    pub symbol: String,
    pub strategy: OracleStrategy,
    /// Always present; the fallback of last resort.
    pub fixed_usd_price: f64,
    pub coingecko_id: Option<String>,
    pub chainlink_feed: Option<Address>,
    /// RPC endpoint for chainlink reads.
    pub rpc_url: Option<String>,
}

/// Where a quote came from, surfaced in logs and API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Live,
    CachedLive,
    Fixed,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Live => "live",
            PriceSource::CachedLive => "cached",
            PriceSource::Fixed => "fixed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    pub usd: f64,
    pub source: PriceSource,
}

#[derive(Clone)]
struct CachedPrice {
    usd: f64,
    fetched_at: Instant,
}

/// Strategy-dispatching price oracle with a last-good-price cache.
pub struct PriceOracle {
    http: reqwest::Client,
    timeout: Duration,
    cache: RwLock<HashMap<String, CachedPrice>>,
    rpc_clients: RwLock<HashMap<String, Arc<JsonRpcClient>>>,
}

impl PriceOracle {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(ORACLE_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
            cache: RwLock::new(HashMap::new()),
            rpc_clients: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the token's USD price.  Infallible by design: the worst
    /// case is the configured fixed price.
    pub async fn usd_price(&self, spec: &TokenPriceSpec) -> PriceQuote {
        if spec.strategy == OracleStrategy::Fixed {
            return PriceQuote {
                usd: spec.fixed_usd_price,
                source: PriceSource::Fixed,
            };
        }

        let live = tokio::time::timeout(self.timeout, self.fetch_live(spec)).await;
        match live {
            Ok(Ok(usd)) if usd.is_finite() && usd > 0.0 => {
                self.cache.write().await.insert(
                    spec.symbol.clone(),
                    CachedPrice {
                        usd,
                        fetched_at: Instant::now(),
                    },
                );
                debug!(symbol = %spec.symbol, usd, "live price quote");
                return PriceQuote {
                    usd,
                    source: PriceSource::Live,
                };
            }
            Ok(Ok(usd)) => {
                warn!(symbol = %spec.symbol, usd, "oracle returned unusable price");
            }
            Ok(Err(e)) => {
                warn!(symbol = %spec.symbol, error = %e, "oracle lookup failed");
            }
            Err(_) => {
                warn!(
                    symbol = %spec.symbol,
                    timeout_secs = self.timeout.as_secs(),
                    "oracle lookup timed out"
                );
            }
        }

        // Prefer the last good live price over the static fixed price.
        if let Some(cached) = self.cache.read().await.get(&spec.symbol) {
            if cached.fetched_at.elapsed() < CACHE_MAX_AGE {
                return PriceQuote {
                    usd: cached.usd,
                    source: PriceSource::CachedLive,
                };
            }
        }

        PriceQuote {
            usd: spec.fixed_usd_price,
            source: PriceSource::Fixed,
        }
    }

    /// Evict cached prices past their maximum age.
    pub async fn purge_stale(&self) {
        let mut cache = self.cache.write().await;
        cache.retain(|_, entry| entry.fetched_at.elapsed() < CACHE_MAX_AGE);
    }

    async fn fetch_live(&self, spec: &TokenPriceSpec) -> Result<f64> {
        match spec.strategy {
            OracleStrategy::Fixed => Ok(spec.fixed_usd_price),
            OracleStrategy::Coingecko => self.fetch_coingecko(spec).await,
            OracleStrategy::Chainlink => self.fetch_chainlink(spec).await,
        }
    }

    async fn fetch_coingecko(&self, spec: &TokenPriceSpec) -> Result<f64> {
        let id = spec
            .coingecko_id
            .as_deref()
            .ok_or_else(|| ChainError::InvalidResponse("token has no coingecko id".into()))?;
        let url = format!(
            "https://api.coingecko.com/api/v3/simple/price?ids={id}&vs_currencies=usd"
        );

        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;

        body.get(id)
            .and_then(|v| v.get("usd"))
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ChainError::InvalidResponse(format!("no usd price for {id}")))
    }

    async fn fetch_chainlink(&self, spec: &TokenPriceSpec) -> Result<f64> {
        let feed = spec
            .chainlink_feed
            .as_ref()
            .ok_or_else(|| ChainError::InvalidResponse("token has no chainlink feed".into()))?;
        let rpc_url = spec
            .rpc_url
            .as_deref()
            .ok_or_else(|| ChainError::InvalidResponse("token has no rpc url".into()))?;

        let rpc = self.rpc_client(rpc_url).await;

        let round: String = rpc
            .call(
                "eth_call",
                json!([{ "to": feed.as_str(), "data": SEL_LATEST_ROUND_DATA }, "latest"]),
            )
            .await?;
        // latestRoundData returns (roundId, answer, startedAt, updatedAt,
        // answeredInRound); answer is the second word.
        let words = round.trim_start_matches("0x");
        if words.len() < 128 {
            return Err(ChainError::InvalidResponse("short latestRoundData".into()));
        }
        let answer = u128::from_str_radix(&words[64..128], 16)
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;

        let decimals_word: String = rpc
            .call(
                "eth_call",
                json!([{ "to": feed.as_str(), "data": SEL_DECIMALS }, "latest"]),
            )
            .await?;
        let decimals = parse_hex_quantity(&decimals_word)? as u32;

        Ok(answer as f64 / 10f64.powi(decimals as i32))
    }

    async fn rpc_client(&self, url: &str) -> Arc<JsonRpcClient> {
        {
            let clients = self.rpc_clients.read().await;
            if let Some(client) = clients.get(url) {
                return client.clone();
            }
        }
        let mut clients = self.rpc_clients.write().await;
        clients
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(JsonRpcClient::new(url.to_string())))
            .clone()
    }
}

impl Default for PriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_spec() -> TokenPriceSpec {
        TokenPriceSpec {
            symbol: "USDC".into(),
            strategy: OracleStrategy::Fixed,
            fixed_usd_price: 1.0,
            coingecko_id: None,
            chainlink_feed: None,
            rpc_url: None,
        }
    }

    #[tokio::test]
    async fn fixed_strategy_short_circuits() {
        let oracle = PriceOracle::new();
        let quote = oracle.usd_price(&fixed_spec()).await;
        assert_eq!(quote.usd, 1.0);
        assert_eq!(quote.source, PriceSource::Fixed);
    }

    #[tokio::test]
    async fn misconfigured_live_strategy_falls_back_to_fixed() {
        // Chainlink strategy with no feed configured: the live fetch fails
        // immediately and the fixed price must come back, never an error.
        let oracle = PriceOracle::new();
        let spec = TokenPriceSpec {
            strategy: OracleStrategy::Chainlink,
            fixed_usd_price: 0.5,
            ..fixed_spec()
        };
        let quote = oracle.usd_price(&spec).await;
        assert_eq!(quote.usd, 0.5);
        assert_eq!(quote.source, PriceSource::Fixed);
    }

    #[tokio::test]
    async fn unreachable_oracle_times_out_to_fixed() {
        // Chainlink read against a black-hole endpoint with a tiny
        // timeout: the lookup must degrade to the fixed price.
        let oracle = PriceOracle::with_timeout(Duration::from_millis(50));
        let spec = TokenPriceSpec {
            strategy: OracleStrategy::Chainlink,
            chainlink_feed: Some(
                Address::parse(&format!("0x{}", "ab".repeat(20)), coursepay_shared::Blockchain::Evm)
                    .unwrap(),
            ),
            rpc_url: Some("http://10.255.255.1:1".into()),
            fixed_usd_price: 1.0,
            ..fixed_spec()
        };
        let quote = oracle.usd_price(&spec).await;
        assert_eq!(quote.usd, 1.0);
        assert_eq!(quote.source, PriceSource::Fixed);
    }
}
