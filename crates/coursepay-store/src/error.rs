use thiserror::Error;

/// Errors produced by the ledger layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A non-terminal purchase already exists for this (buyer, course).
    #[error("Buyer already has a purchase for this course")]
    DuplicatePurchase,

    /// The approval transaction hash is already referenced by a purchase.
    #[error("Approval transaction hash already used")]
    TxHashConflict,

    /// A write tried to move escrow status along a forbidden edge.
    #[error("Illegal escrow transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// UUID parsing error.
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    /// Stored amount string failed to parse.
    #[error("Amount error: {0}")]
    Amount(#[from] coursepay_shared::AmountError),

    /// A stored enum value is not recognized.
    #[error("Corrupt enum value in column {column}: {value}")]
    CorruptEnum { column: &'static str, value: String },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
