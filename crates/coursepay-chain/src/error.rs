use coursepay_shared::ChainKey;
use thiserror::Error;

/// Errors produced by chain adapters and the RPC layer.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Transport-level failure reaching the RPC endpoint.
    #[error("RPC transport error: {0}")]
    Transport(String),

    /// The RPC endpoint answered with an error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A call exceeded its deadline.
    #[error("RPC call timed out after {0}s")]
    Timeout(u64),

    /// Gas estimation failed (usually a revert at simulation time).
    #[error("Gas estimation failed: {0}")]
    GasEstimation(String),

    /// A submitted transaction was mined but reverted.
    #[error("Transaction reverted: {tx_hash}")]
    Reverted { tx_hash: String },

    /// The on-chain release predicate rejected the escrow.
    #[error("Escrow {escrow_id} is not releasable: {reason}")]
    NotReleasable { escrow_id: String, reason: String },

    /// A batch release call failed as a whole; callers should fall back
    /// to per-item release.
    #[error("Batch release failed: {0}")]
    BatchFailed(String),

    /// No adapter is registered for the requested chain.
    #[error("No chain adapter registered for {0}")]
    UnknownChain(ChainKey),

    /// Operator wallet configuration problem.
    #[error("Wallet error: {0}")]
    Wallet(String),

    /// The RPC endpoint returned something unparseable.
    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, ChainError>;
