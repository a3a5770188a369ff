use thiserror::Error;

/// Errors produced by token amount parsing and arithmetic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount string: {0}")]
    Parse(String),

    #[error("Amount arithmetic overflow")]
    Overflow,

    #[error("Token decimals out of range: {0} (max 38)")]
    DecimalsOutOfRange(u8),

    #[error("Invalid USD quote: {0}")]
    InvalidQuote(String),
}
