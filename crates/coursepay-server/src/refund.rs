//! Refund eligibility and execution.
//!
//! Eligibility is a pure function over the purchase row: it never touches
//! the chain and never errors, it only answers yes or no with a reason.
//! Execution is the side-effecting half that talks to the escrow contract
//! and records the outcome in the ledger.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use coursepay_chain::ChainRegistry;
use coursepay_shared::{Address, ChainKey, TxHash};
use coursepay_store::{EscrowStatus, Purchase, PurchaseStatus};

use crate::error::ApiError;
use crate::Ledger;

/// Why a refund was denied. The `Display` text is stored on the purchase
/// row and returned to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundDenial {
    AlreadyRefunded,
    EscrowReleased,
    PeriodExpired,
    ProgressTooHigh { progress: u8, ceiling: u8 },
    NotSettled,
    CourseCompleted,
}

impl fmt::Display for RefundDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefundDenial::AlreadyRefunded => write!(f, "already refunded"),
            RefundDenial::EscrowReleased => write!(f, "funds already released to instructor"),
            RefundDenial::PeriodExpired => write!(f, "period expired"),
            RefundDenial::ProgressTooHigh { progress, ceiling } => {
                write!(f, "course progress {progress}% exceeds {ceiling}% limit")
            }
            RefundDenial::NotSettled => write!(f, "purchase has no settled escrow"),
            RefundDenial::CourseCompleted => write!(f, "course already completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundDecision {
    Eligible,
    Ineligible(RefundDenial),
}

/// Decide refund eligibility. Pure: same inputs, same answer.
///
/// A purchase is refundable while its escrow is still locked, the escrow
/// period has not elapsed, and the buyer has consumed at most `ceiling`
/// percent of the course.
pub fn evaluate_refund(p: &Purchase, now: DateTime<Utc>, ceiling: u8) -> RefundDecision {
    use RefundDecision::*;

    if p.status == PurchaseStatus::Refunded || p.escrow_status == EscrowStatus::Refunded {
        return Ineligible(RefundDenial::AlreadyRefunded);
    }
    if p.escrow_status == EscrowStatus::Released {
        return Ineligible(RefundDenial::EscrowReleased);
    }
    if p.status == PurchaseStatus::Completed {
        return Ineligible(RefundDenial::CourseCompleted);
    }
    if p.escrow_status != EscrowStatus::Locked {
        return Ineligible(RefundDenial::NotSettled);
    }
    if now >= p.release_eligible_at {
        return Ineligible(RefundDenial::PeriodExpired);
    }
    if p.progress_percent > ceiling {
        return Ineligible(RefundDenial::ProgressTooHigh {
            progress: p.progress_percent,
            ceiling,
        });
    }

    Eligible
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub purchase_id: Uuid,
    pub refund_tx_hash: TxHash,
}

/// Execute a buyer-requested refund end to end: record the request,
/// evaluate eligibility, submit the on-chain refund, and transition the
/// escrow. Denials are recorded on the row and surfaced as a 400 with
/// the denial reason.
pub async fn execute_refund(
    ledger: &Ledger,
    registry: &Arc<ChainRegistry>,
    purchase_id: Uuid,
) -> Result<RefundOutcome, ApiError> {
    let (purchase, escrow_contract, ceiling) = {
        let db = ledger.lock().await;
        let purchase = db.get_purchase(purchase_id)?;
        let token = db.get_payment_token(purchase.payment_token_id)?;
        let ceiling = db.platform_settings()?.refund_progress_ceiling;
        db.record_refund_request(purchase_id)?;
        (purchase, token.escrow_address, ceiling)
    };

    match evaluate_refund(&purchase, Utc::now(), ceiling) {
        RefundDecision::Eligible => {}
        RefundDecision::Ineligible(denial) => {
            let reason = denial.to_string();
            warn!(purchase = %purchase_id, %reason, "refund denied");
            ledger
                .lock()
                .await
                .record_refund_denial(purchase_id, &reason)?;
            return Err(ApiError::BadRequest(format!("refund denied: {reason}")));
        }
    }

    let escrow_id = purchase
        .escrow_id
        .as_ref()
        .ok_or_else(|| ApiError::Internal("locked escrow row missing escrow id".into()))?;
    let key = ChainKey::new(purchase.blockchain, purchase.chain_id);
    let chain = registry
        .get(&key)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let contract = Address::parse(&escrow_contract, purchase.blockchain)
        .ok_or_else(|| ApiError::Internal("invalid escrow contract address".into()))?;

    let receipt = chain
        .refund_escrow(&contract, escrow_id)
        .await
        .map_err(|e| {
            warn!(purchase = %purchase_id, error = %e, "on-chain refund failed");
            ApiError::Internal(format!("refund submission failed: {e}"))
        })?;

    ledger
        .lock()
        .await
        .mark_escrow_refunded(purchase_id, &receipt.tx_hash)?;

    info!(
        purchase = %purchase_id,
        tx = %receipt.tx_hash,
        "escrow refunded to buyer"
    );

    Ok(RefundOutcome {
        purchase_id,
        refund_tx_hash: receipt.tx_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use coursepay_shared::constants::DEFAULT_REFUND_PROGRESS_CEILING;
    use coursepay_shared::{Blockchain, EscrowId, TokenAmount};

    fn locked_purchase(now: DateTime<Utc>) -> Purchase {
        Purchase {
            id: Uuid::new_v4(),
            buyer_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            payment_token_id: Uuid::new_v4(),
            amount: TokenAmount::from_base_units(100_000_000),
            usd_equivalent: 100.0,
            platform_fee: TokenAmount::from_base_units(20_000_000),
            instructor_fee: TokenAmount::from_base_units(80_000_000),
            revenue_split: TokenAmount::ZERO,
            platform_fee_bps: 2_000,
            revenue_split_bps: 0,
            approval_tx_hash: TxHash::from_trusted(format!("0x{}", "11".repeat(32))),
            escrow_id: Some(EscrowId("7".into())),
            escrow_tx_hash: Some(TxHash::from_trusted(format!("0x{}", "22".repeat(32)))),
            blockchain: Blockchain::Evm,
            chain_id: 137,
            status: PurchaseStatus::Active,
            escrow_status: EscrowStatus::Locked,
            release_eligible_at: now + Duration::days(14),
            release_tx_hash: None,
            refund_tx_hash: None,
            progress_percent: 0,
            watch_time_secs: 0,
            completed_lessons: vec![],
            refund_eligible: true,
            refund_requested_at: None,
            refund_processed_at: None,
            refund_denial_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn fresh_purchase_is_eligible() {
        let now = Utc::now();
        let p = locked_purchase(now);
        assert_eq!(
            evaluate_refund(&p, now, DEFAULT_REFUND_PROGRESS_CEILING),
            RefundDecision::Eligible
        );
    }

    #[test]
    fn progress_boundary_is_inclusive() {
        let now = Utc::now();
        let mut p = locked_purchase(now);

        p.progress_percent = 20;
        assert_eq!(evaluate_refund(&p, now, 20), RefundDecision::Eligible);

        p.progress_percent = 21;
        assert_eq!(
            evaluate_refund(&p, now, 20),
            RefundDecision::Ineligible(RefundDenial::ProgressTooHigh {
                progress: 21,
                ceiling: 20
            })
        );
    }

    #[test]
    fn expired_period_denies_with_reason() {
        let now = Utc::now();
        let mut p = locked_purchase(now);
        p.release_eligible_at = now - Duration::seconds(1);

        let decision = evaluate_refund(&p, now, 20);
        let RefundDecision::Ineligible(denial) = decision else {
            panic!("expected denial");
        };
        assert_eq!(denial.to_string(), "period expired");
    }

    #[test]
    fn terminal_escrows_deny() {
        let now = Utc::now();

        let mut released = locked_purchase(now);
        released.escrow_status = EscrowStatus::Released;
        assert_eq!(
            evaluate_refund(&released, now, 20),
            RefundDecision::Ineligible(RefundDenial::EscrowReleased)
        );

        let mut refunded = locked_purchase(now);
        refunded.escrow_status = EscrowStatus::Refunded;
        refunded.status = PurchaseStatus::Refunded;
        assert_eq!(
            evaluate_refund(&refunded, now, 20),
            RefundDecision::Ineligible(RefundDenial::AlreadyRefunded)
        );
    }

    #[test]
    fn unsettled_escrow_denies() {
        let now = Utc::now();
        let mut p = locked_purchase(now);
        p.escrow_status = EscrowStatus::Pending;
        p.status = PurchaseStatus::Pending;
        assert_eq!(
            evaluate_refund(&p, now, 20),
            RefundDecision::Ineligible(RefundDenial::NotSettled)
        );
    }
}
