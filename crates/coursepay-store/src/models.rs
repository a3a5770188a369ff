//! Domain model structs persisted in the ledger database.
//!
//! Every struct derives `Serialize`/`Deserialize` so it can be handed
//! directly to the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coursepay_shared::{Blockchain, EscrowId, OracleStrategy, TokenAmount, TxHash};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Purchase lifecycle status.  Largely mirrors [`EscrowStatus`] but a
/// purchase can be `active` while its escrow is still locked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Refunded,
    Revoked,
    Expired,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Active => "active",
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Failed => "failed",
            PurchaseStatus::Refunded => "refunded",
            PurchaseStatus::Revoked => "revoked",
            PurchaseStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            "revoked" => Some(Self::Revoked),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Non-terminal statuses block a new purchase for the same
    /// (buyer, course); terminal ones do not.
    pub fn blocks_repurchase(&self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Completed)
    }
}

/// On-ledger escrow state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Pending,
    Locked,
    Released,
    Refunded,
    Failed,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Locked => "locked",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "locked" => Some(Self::Locked),
            "released" => Some(Self::Released),
            "refunded" => Some(Self::Refunded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Released and refunded escrows may never be touched again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// The allowed transition graph:
    /// `pending -> {locked, failed}`, `locked -> {released, refunded}`.
    pub fn can_transition_to(&self, to: EscrowStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Locked)
                | (Self::Pending, Self::Failed)
                | (Self::Locked, Self::Released)
                | (Self::Locked, Self::Refunded)
        )
    }
}

// ---------------------------------------------------------------------------
// Purchase
// ---------------------------------------------------------------------------

/// A ledger entry: one purchase attempt of a course by a buyer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Purchase {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub course_id: Uuid,
    pub payment_token_id: Uuid,

    /// Exact token amount in base units.
    pub amount: TokenAmount,
    /// USD value at purchase time; informational only, never used in fee
    /// arithmetic.
    pub usd_equivalent: f64,
    pub platform_fee: TokenAmount,
    pub instructor_fee: TokenAmount,
    /// Carved out of `platform_fee`.
    pub revenue_split: TokenAmount,
    /// Fee rates captured at purchase time; immutable thereafter even if
    /// platform defaults change.
    pub platform_fee_bps: u16,
    pub revenue_split_bps: u16,

    /// The buyer's on-chain approval; globally unique, doubles as the
    /// idempotency key.
    pub approval_tx_hash: TxHash,
    pub escrow_id: Option<EscrowId>,
    /// Hash of the `createEscrow` submission.
    pub escrow_tx_hash: Option<TxHash>,
    pub blockchain: Blockchain,
    pub chain_id: u64,

    pub status: PurchaseStatus,
    pub escrow_status: EscrowStatus,
    pub release_eligible_at: DateTime<Utc>,
    pub release_tx_hash: Option<TxHash>,
    pub refund_tx_hash: Option<TxHash>,

    /// Consumption signals, owned by the progress subsystem; read here
    /// only as refund/release eligibility inputs.
    pub progress_percent: u8,
    pub watch_time_secs: u32,
    pub completed_lessons: Vec<String>,

    pub refund_eligible: bool,
    pub refund_requested_at: Option<DateTime<Utc>>,
    pub refund_processed_at: Option<DateTime<Utc>>,
    pub refund_denial_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Payment token
// ---------------------------------------------------------------------------

/// Static payment token configuration.  Admin-written, read-heavy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentToken {
    pub id: Uuid,
    pub symbol: String,
    pub name: String,
    pub blockchain: Blockchain,
    pub chain_id: u64,
    pub token_address: String,
    pub escrow_address: String,
    pub registry_address: String,
    pub decimals: u8,
    pub oracle_strategy: OracleStrategy,
    pub fixed_usd_price: f64,
    pub coingecko_id: Option<String>,
    pub chainlink_feed: Option<String>,
    pub active: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Fee settings
// ---------------------------------------------------------------------------

/// Singleton platform defaults, read at purchase-creation time only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformSettings {
    pub platform_fee_bps: u16,
    pub revenue_split_bps: u16,
    pub escrow_period_days: i64,
    pub refund_progress_ceiling: u8,
    pub release_progress_threshold: u8,
    pub release_watch_minutes: u32,
    pub updated_at: DateTime<Utc>,
}

/// Per-instructor fee override; applies only while `active`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstructorFeeSettings {
    pub instructor_id: Uuid,
    pub platform_fee_bps: u16,
    pub revenue_split_bps: u16,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// One privileged manual intervention.  Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub purchase_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub target_user: Option<Uuid>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Collaborator models (catalog-owned, read-only here)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub instructor_id: Uuid,
    pub price_usd: f64,
    pub published: bool,
    pub total_duration_minutes: u32,
}

/// One configured payout wallet in a user's structured multi-chain list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutWallet {
    pub blockchain: Blockchain,
    pub chain_id: u64,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Uuid,
    pub display_name: String,
    pub payout_wallets: Vec<PayoutWallet>,
    /// Single-address field predating multi-chain wallets; consulted only
    /// when the structured list has no entry for the chain.
    pub legacy_wallet_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escrow_transition_graph() {
        use EscrowStatus::*;
        assert!(Pending.can_transition_to(Locked));
        assert!(Pending.can_transition_to(Failed));
        assert!(Locked.can_transition_to(Released));
        assert!(Locked.can_transition_to(Refunded));

        // No backward or terminal-escaping edges.
        assert!(!Released.can_transition_to(Locked));
        assert!(!Released.can_transition_to(Refunded));
        assert!(!Refunded.can_transition_to(Released));
        assert!(!Locked.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Locked));
    }

    #[test]
    fn status_round_trip() {
        for s in [
            "pending",
            "active",
            "completed",
            "failed",
            "refunded",
            "revoked",
            "expired",
        ] {
            assert_eq!(PurchaseStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(PurchaseStatus::parse("bogus").is_none());
    }

    #[test]
    fn repurchase_blocking() {
        assert!(PurchaseStatus::Active.blocks_repurchase());
        assert!(PurchaseStatus::Completed.blocks_repurchase());
        assert!(!PurchaseStatus::Refunded.blocks_repurchase());
        assert!(!PurchaseStatus::Revoked.blocks_repurchase());
        assert!(!PurchaseStatus::Failed.blocks_repurchase());
    }
}
