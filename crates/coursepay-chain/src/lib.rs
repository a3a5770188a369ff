//! # coursepay-chain
//!
//! On-chain plumbing for the escrow settlement pipeline:
//!
//! - **JSON-RPC client** with per-call timeouts ([`rpc`])
//! - **Escrow chain adapter** — the four escrow operations plus state
//!   reads, behind the [`EscrowChain`] trait ([`adapter`])
//! - **Chain registry** — one adapter per `(blockchain, chain_id)`,
//!   constructed at startup and injected by reference ([`registry`])
//! - **Token & registry verifier** — fails closed against database
//!   tampering ([`verify`])
//! - **Price oracle** with strict timeouts and fixed-price fallback
//!   ([`oracle`])
//!
//! The smart contracts themselves are opaque; this crate only speaks the
//! narrow RPC contract the settlement pipeline needs.

pub mod adapter;
pub mod oracle;
pub mod registry;
pub mod rpc;
pub mod verify;

mod error;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use adapter::{
    EscrowChain, EscrowCreateParams, EscrowReceipt, OnChainEscrowState, ReleaseReceipt,
};
pub use error::ChainError;
pub use registry::ChainRegistry;
