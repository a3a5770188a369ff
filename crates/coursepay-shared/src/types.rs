use serde::{Deserialize, Serialize};

/// Blockchain family an escrow contract is deployed on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Blockchain {
    Evm,
    Solana,
}

impl Blockchain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Blockchain::Evm => "evm",
            Blockchain::Solana => "solana",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "evm" => Some(Self::Evm),
            "solana" => Some(Self::Solana),
            _ => None,
        }
    }
}

impl std::fmt::Display for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies one concrete chain: a blockchain family plus its network id.
///
/// Used as the key for connection/wallet caching and for grouping release
/// batches, so it must be cheap to hash and compare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChainKey {
    pub blockchain: Blockchain,
    pub chain_id: u64,
}

impl ChainKey {
    pub fn new(blockchain: Blockchain, chain_id: u64) -> Self {
        Self {
            blockchain,
            chain_id,
        }
    }
}

impl std::fmt::Display for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.blockchain, self.chain_id)
    }
}

/// An on-chain account or contract address, stored in its canonical
/// string form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Accepts a non-empty address string after basic shape validation.
    ///
    /// EVM addresses must be `0x` + 40 hex chars; other families are only
    /// length-bounded since their encodings vary.
    pub fn parse(s: &str, blockchain: Blockchain) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s.len() > 128 {
            return None;
        }
        match blockchain {
            Blockchain::Evm => {
                let hex_part = s.strip_prefix("0x")?;
                if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
                    return None;
                }
            }
            Blockchain::Solana => {
                if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return None;
                }
            }
        }
        Some(Self(s.to_string()))
    }

    /// Wrap a string already known to be a valid address (e.g. read back
    /// from the ledger, which only stores validated addresses).
    pub fn from_trusted(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transaction hash.  The buyer's approval hash doubles as the purchase
/// idempotency key, so equality and hashing matter here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TxHash(String);

impl TxHash {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s.len() > 128 {
            return None;
        }
        let hex_part = s.strip_prefix("0x").unwrap_or(s);
        if !hex_part.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn from_trusted(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to an escrow entry inside the escrow contract, as
/// returned by `create_escrow`.  The ledger stores it verbatim and hands
/// it back for release/refund calls; its internal format belongs to the
/// chain adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EscrowId(pub String);

impl EscrowId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EscrowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a payment token's USD price is resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OracleStrategy {
    /// Use the statically configured USD price (stablecoins, tests).
    Fixed,
    /// CoinGecko simple-price HTTP API.
    Coingecko,
    /// Chainlink price feed read over RPC.
    Chainlink,
}

impl OracleStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleStrategy::Fixed => "fixed",
            OracleStrategy::Coingecko => "coingecko",
            OracleStrategy::Chainlink => "chainlink",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(Self::Fixed),
            "coingecko" => Some(Self::Coingecko),
            "chainlink" => Some(Self::Chainlink),
            _ => None,
        }
    }
}
