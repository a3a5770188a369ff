//! # coursepay-shared
//!
//! Pure domain types for the coursepay escrow settlement service: chain
//! identifiers, exact-integer token amounts, and basis-point fee math.
//!
//! Nothing in this crate performs I/O.  Monetary values are `u128` amounts
//! in the token's smallest unit; floating point appears only at the
//! USD-quote boundary and never survives into fee arithmetic.

pub mod amount;
pub mod constants;
pub mod fees;
pub mod types;

mod error;

pub use amount::TokenAmount;
pub use error::AmountError;
pub use fees::{EffectiveFees, FeeBps, FeeBreakdown};
pub use types::{Address, Blockchain, ChainKey, EscrowId, OracleStrategy, TxHash};
