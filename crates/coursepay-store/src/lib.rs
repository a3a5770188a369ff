//! # coursepay-store
//!
//! The purchase ledger: durable SQLite storage for purchases, payment
//! tokens, fee settings and the admin audit log, plus read-only lookups
//! of the courses/users written by the catalog subsystem.
//!
//! The ledger is the system of record for everything the settlement
//! pipeline believes happened.  Escrow state transitions go through a
//! single conditional-update function that enforces the allowed edge
//! graph at the storage layer, and the uniqueness constraints on
//! `(buyer, course)` and on the approval transaction hash are real
//! indexes, not application-level checks.

pub mod audit;
pub mod catalog;
pub mod database;
pub mod migrations;
pub mod models;
pub mod purchases;
pub mod settings;
pub mod tokens;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
