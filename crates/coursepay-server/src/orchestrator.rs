//! Purchase orchestration.
//!
//! Drives one purchase from request to settled escrow:
//!
//! 1. validate the request against catalog and token configuration
//! 2. verify the token against the on-chain registry (every request)
//! 3. enforce idempotency (approval hash) and single-purchase rules
//! 4. reconcile any stale unsettled row blocking a retry
//! 5. capture fee rates and price, resolve the instructor payout wallet
//! 6. write the `pending/pending` ledger row, then create the escrow
//! 7. transition the row to `locked` (or `failed`, surfacing the ids)
//!
//! The ledger row is written before the chain call on purpose: a crash
//! between the two leaves a pending row that reconciliation can repair
//! from on-chain state, never a locked escrow with no ledger entry.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use coursepay_chain::adapter::EscrowCreateParams;
use coursepay_chain::oracle::PriceOracle;
use coursepay_chain::verify::{verify_payment_token, TokenUnderVerification, VerifyPolicy};
use coursepay_chain::{ChainRegistry, EscrowChain, OnChainEscrowState};
use coursepay_shared::{fees, Address, ChainKey, EscrowId, TokenAmount, TxHash};
use coursepay_store::{EscrowStatus, PaymentToken, Purchase, PurchaseStatus, UserRecord};
use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::quote::{self, PaymentQuote};
use crate::Ledger;

/// Token preflight results are wiring facts (contract deployed, operator
/// role granted) and may be cached briefly.
const PREFLIGHT_TTL: StdDuration = StdDuration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub course_id: Uuid,
    pub payment_token_id: Uuid,
    pub buyer_id: Uuid,
    pub buyer_address: String,
    /// Hash of the buyer's on-chain token approval.
    pub approval_tx_hash: String,
    /// Base units the buyer approved.
    pub amount: TokenAmount,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOutcome {
    pub purchase_id: Uuid,
    pub escrow_id: EscrowId,
    pub escrow_tx_hash: TxHash,
    pub status: PurchaseStatus,
    pub release_eligible_at: chrono::DateTime<Utc>,
}

pub struct PurchaseOrchestrator {
    ledger: Ledger,
    registry: Arc<ChainRegistry>,
    oracle: Arc<PriceOracle>,
    config: Arc<ServerConfig>,
    preflight: TtlCache<Uuid, bool>,
}

impl PurchaseOrchestrator {
    pub fn new(
        ledger: Ledger,
        registry: Arc<ChainRegistry>,
        oracle: Arc<PriceOracle>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            ledger,
            registry,
            oracle,
            config,
            preflight: TtlCache::new(PREFLIGHT_TTL),
        }
    }

    pub fn oracle(&self) -> &PriceOracle {
        &self.oracle
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build a checkout quote, failing fast on token misconfiguration so
    /// the buyer never signs an approval that cannot settle.
    pub async fn calculate(
        &self,
        course_id: Uuid,
        payment_token_id: Uuid,
    ) -> Result<PaymentQuote, ApiError> {
        let (course, token) = {
            let db = self.ledger.lock().await;
            (
                db.get_course(course_id)?,
                db.get_payment_token(payment_token_id)?,
            )
        };
        if !course.published {
            return Err(ApiError::NotFound("course not available".into()));
        }
        let chain = self.chain_for(&token)?;
        self.preflight_token(chain.as_ref(), &token).await?;

        let db = self.ledger.lock().await;
        quote::build_quote(&db, &self.oracle, &self.config, &course, &token).await
    }

    /// Process a purchase end to end.
    pub async fn process_purchase(
        &self,
        req: &PurchaseRequest,
    ) -> Result<PurchaseOutcome, ApiError> {
        let approval = TxHash::parse(&req.approval_tx_hash)
            .ok_or_else(|| ApiError::BadRequest("malformed approval transaction hash".into()))?;
        if req.amount.is_zero() {
            return Err(ApiError::BadRequest("amount must be positive".into()));
        }

        // Load everything we need under one ledger lock, then do chain
        // work unlocked. The unique indexes keep concurrent requests
        // honest regardless.
        let (course, token, instructor, existing, already_by_hash) = {
            let db = self.ledger.lock().await;
            let course = db.get_course(req.course_id)?;
            let token = db.get_payment_token(req.payment_token_id)?;
            let instructor = db.get_user(course.instructor_id)?;
            let existing = db.find_open_purchase(req.buyer_id, req.course_id)?;
            let already = db.get_purchase_by_approval(&approval)?.is_some();
            (course, token, instructor, existing, already)
        };

        if !course.published {
            return Err(ApiError::NotFound("course not available".into()));
        }
        if !token.active || !token.enabled {
            return Err(ApiError::BadRequest("payment token is not available".into()));
        }
        if already_by_hash {
            return Err(ApiError::Conflict("transaction hash already used".into()));
        }

        let buyer_address = Address::parse(&req.buyer_address, token.blockchain)
            .ok_or_else(|| ApiError::BadRequest("invalid buyer address".into()))?;

        let chain = self.chain_for(&token)?;
        self.preflight_token(chain.as_ref(), &token).await?;

        if let Some(open) = existing {
            self.resolve_open_purchase(chain.as_ref(), &token, open)
                .await?;
        }

        // Registry verification runs on every request; a tampered token
        // row must not survive between requests.
        self.verify_token(chain.as_ref(), &token).await?;

        let payout_wallet = resolve_payout_wallet(&instructor, &token).ok_or_else(|| {
            ApiError::BadRequest(format!(
                "instructor has no payout wallet configured for {}:{}",
                token.blockchain, token.chain_id
            ))
        })?;

        // Capture rates and price at purchase time.
        let (effective, escrow_period_days) = {
            let db = self.ledger.lock().await;
            let effective = db.effective_fees(course.instructor_id)?;
            let days = db.platform_settings()?.escrow_period_days;
            (effective, days)
        };
        let price = self
            .oracle
            .usd_price(&quote::price_spec(&token, &self.config))
            .await;
        let breakdown = fees::split_amount(req.amount, &effective);

        let now = Utc::now();
        let purchase = Purchase {
            id: Uuid::new_v4(),
            buyer_id: req.buyer_id,
            course_id: req.course_id,
            payment_token_id: token.id,
            amount: req.amount,
            usd_equivalent: token_units_to_usd(req.amount, price.usd, token.decimals),
            platform_fee: breakdown.platform_fee,
            instructor_fee: breakdown.instructor_fee,
            revenue_split: breakdown.revenue_split,
            platform_fee_bps: effective.platform_bps.value(),
            revenue_split_bps: effective.revenue_split_bps.value(),
            approval_tx_hash: approval.clone(),
            escrow_id: None,
            escrow_tx_hash: None,
            blockchain: token.blockchain,
            chain_id: token.chain_id,
            status: PurchaseStatus::Pending,
            escrow_status: EscrowStatus::Pending,
            release_eligible_at: now + Duration::days(escrow_period_days),
            release_tx_hash: None,
            refund_tx_hash: None,
            progress_percent: 0,
            watch_time_secs: 0,
            completed_lessons: vec![],
            refund_eligible: false,
            refund_requested_at: None,
            refund_processed_at: None,
            refund_denial_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.ledger.lock().await.insert_purchase(&purchase)?;

        let escrow_contract = Address::parse(&token.escrow_address, token.blockchain)
            .ok_or(ApiError::Misconfigured)?;
        let params = EscrowCreateParams {
            buyer: buyer_address,
            instructor: payout_wallet,
            amount: req.amount,
            course_ref: course.id.to_string(),
            escrow_period_days,
            platform_fee_bps: effective.platform_bps.value(),
        };

        match chain.create_escrow(&escrow_contract, &params).await {
            Ok(receipt) => {
                self.ledger.lock().await.mark_escrow_locked(
                    purchase.id,
                    &receipt.escrow_id,
                    &receipt.tx_hash,
                )?;
                info!(
                    purchase = %purchase.id,
                    escrow = %receipt.escrow_id,
                    tx = %receipt.tx_hash,
                    buyer = %req.buyer_id,
                    course = %course.id,
                    "escrow locked"
                );
                Ok(PurchaseOutcome {
                    purchase_id: purchase.id,
                    escrow_id: receipt.escrow_id,
                    escrow_tx_hash: receipt.tx_hash,
                    status: PurchaseStatus::Active,
                    release_eligible_at: purchase.release_eligible_at,
                })
            }
            Err(e) => {
                warn!(purchase = %purchase.id, error = %e, "escrow creation failed");
                self.ledger.lock().await.mark_escrow_failed(purchase.id)?;
                Err(ApiError::ChainFailure {
                    purchase_id: purchase.id,
                    approval_tx_hash: approval.as_str().to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// A (buyer, course) pair already has an open purchase. Fresh rows
    /// reject the retry outright. A pending row older than the stale
    /// window is reconciled against on-chain state: repaired in place if
    /// the escrow actually locked, deleted so the retry can proceed if
    /// the chain has no trace of it.
    async fn resolve_open_purchase(
        &self,
        chain: &dyn EscrowChain,
        token: &PaymentToken,
        open: Purchase,
    ) -> Result<(), ApiError> {
        if open.status != PurchaseStatus::Pending {
            return Err(ApiError::Conflict("already purchased this course".into()));
        }

        let age = Utc::now() - open.created_at;
        if age.num_seconds() < self.config.stale_purchase_window_secs {
            return Err(ApiError::Conflict(
                "a purchase for this course is already in progress".into(),
            ));
        }

        let on_chain = match &open.escrow_id {
            None => OnChainEscrowState::Absent,
            Some(escrow_id) => {
                let contract = Address::parse(&token.escrow_address, token.blockchain)
                    .ok_or(ApiError::Misconfigured)?;
                chain
                    .escrow_state(&contract, escrow_id)
                    .await
                    .map_err(|e| ApiError::Internal(format!("escrow state check failed: {e}")))?
            }
        };

        match on_chain {
            OnChainEscrowState::Absent => {
                let deleted = self.ledger.lock().await.delete_unsettled(open.id)?;
                info!(
                    purchase = %open.id,
                    deleted,
                    "discarded stale unsettled purchase after on-chain check"
                );
                Ok(())
            }
            state => {
                // The escrow exists on chain; the ledger row is the one
                // that is behind. Repair it and reject the retry.
                warn!(
                    purchase = %open.id,
                    ?state,
                    "stale pending row has a live escrow; repairing ledger"
                );
                if state == OnChainEscrowState::Locked {
                    let db = self.ledger.lock().await;
                    db.transition_escrow(
                        open.id,
                        EscrowStatus::Pending,
                        EscrowStatus::Locked,
                        coursepay_store::purchases::TransitionEffects {
                            escrow_id: open.escrow_id.as_ref(),
                            tx_hash: open.escrow_tx_hash.as_ref(),
                        },
                    )?;
                }
                Err(ApiError::Conflict("already purchased this course".into()))
            }
        }
    }

    async fn verify_token(
        &self,
        chain: &dyn EscrowChain,
        token: &PaymentToken,
    ) -> Result<(), ApiError> {
        let under_verification = token_under_verification(token).ok_or(ApiError::Misconfigured)?;
        let policy = VerifyPolicy {
            expected_registry_code_hash: self
                .config
                .registry_code_hash
                .clone()
                .unwrap_or_default(),
            enforce_code_hash: self.config.registry_code_hash.is_some(),
        };

        let verdict = verify_payment_token(chain, &under_verification, &policy).await;
        if let coursepay_chain::verify::Verification::Failed { reason } = verdict {
            warn!(
                token = %token.symbol,
                chain = %chain.key(),
                %reason,
                "payment token failed registry verification"
            );
            return Err(ApiError::VerificationFailed);
        }
        Ok(())
    }

    /// Configuration preflight: the escrow contract must be deployed and
    /// the operator wallet must hold its operator role. Cached briefly.
    async fn preflight_token(
        &self,
        chain: &dyn EscrowChain,
        token: &PaymentToken,
    ) -> Result<(), ApiError> {
        if let Some(ok) = self.preflight.get(&token.id).await {
            return if ok { Ok(()) } else { Err(ApiError::Misconfigured) };
        }

        let escrow = Address::parse(&token.escrow_address, token.blockchain)
            .ok_or(ApiError::Misconfigured)?;

        let ok = match chain.contract_code(&escrow).await {
            Ok(code) if code.is_empty() => {
                warn!(token = %token.symbol, escrow = %escrow, "no escrow contract deployed");
                false
            }
            Ok(_) => match chain.operator_has_role(&escrow).await {
                Ok(true) => true,
                Ok(false) => {
                    warn!(token = %token.symbol, escrow = %escrow, "operator lacks escrow role");
                    false
                }
                Err(e) => {
                    warn!(token = %token.symbol, error = %e, "operator role check failed");
                    false
                }
            },
            Err(e) => {
                warn!(token = %token.symbol, error = %e, "escrow bytecode fetch failed");
                false
            }
        };

        self.preflight.insert(token.id, ok).await;
        if ok {
            Ok(())
        } else {
            Err(ApiError::Misconfigured)
        }
    }

    fn chain_for(&self, token: &PaymentToken) -> Result<Arc<dyn EscrowChain>, ApiError> {
        let key = ChainKey::new(token.blockchain, token.chain_id);
        self.registry.get(&key).map_err(|_| {
            warn!(chain = %key, "no chain adapter configured for token");
            ApiError::Misconfigured
        })
    }
}

/// Pick the instructor's payout wallet for the token's chain: the
/// structured multi-chain list first, the legacy single address only as
/// a fallback.
fn resolve_payout_wallet(instructor: &UserRecord, token: &PaymentToken) -> Option<Address> {
    if let Some(wallet) = instructor
        .payout_wallets
        .iter()
        .find(|w| w.blockchain == token.blockchain && w.chain_id == token.chain_id)
    {
        return Address::parse(&wallet.address, token.blockchain);
    }
    instructor
        .legacy_wallet_address
        .as_deref()
        .and_then(|addr| Address::parse(addr, token.blockchain))
}

fn token_under_verification(token: &PaymentToken) -> Option<TokenUnderVerification> {
    Some(TokenUnderVerification {
        symbol: token.symbol.clone(),
        token_address: Address::parse(&token.token_address, token.blockchain)?,
        escrow_address: Address::parse(&token.escrow_address, token.blockchain)?,
        registry_address: Address::parse(&token.registry_address, token.blockchain)?,
    })
}

/// Informational USD value of a token amount. Lossy by nature; never
/// used in fee arithmetic.
fn token_units_to_usd(amount: TokenAmount, token_usd: f64, decimals: u8) -> f64 {
    (amount.base_units() as f64 / 10f64.powi(decimals as i32)) * token_usd
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use coursepay_chain::mock::MockChain;
    use coursepay_shared::{Blockchain, OracleStrategy};
    use coursepay_store::{Course, Database, PayoutWallet, StoreError};
    use tokio::sync::Mutex;

    struct Fixture {
        orchestrator: PurchaseOrchestrator,
        ledger: Ledger,
        chain: Arc<MockChain>,
        course: Course,
        token: PaymentToken,
    }

    fn fixture() -> Fixture {
        fixture_with(ServerConfig::default())
    }

    fn fixture_with(config: ServerConfig) -> Fixture {
        let db = Database::open_in_memory().unwrap();

        let instructor = Uuid::new_v4();
        db.upsert_user(&UserRecord {
            id: instructor,
            display_name: "Grace".into(),
            payout_wallets: vec![PayoutWallet {
                blockchain: Blockchain::Evm,
                chain_id: 137,
                address: format!("0x{}", "dd".repeat(20)),
            }],
            legacy_wallet_address: None,
        })
        .unwrap();

        let course = Course {
            id: Uuid::new_v4(),
            title: "Systems Programming".into(),
            instructor_id: instructor,
            price_usd: 100.0,
            published: true,
            total_duration_minutes: 600,
        };
        db.upsert_course(&course).unwrap();

        let now = Utc::now();
        let token = PaymentToken {
            id: Uuid::new_v4(),
            symbol: "USDC".into(),
            name: "USD Coin".into(),
            blockchain: Blockchain::Evm,
            chain_id: 137,
            token_address: format!("0x{}", "aa".repeat(20)),
            escrow_address: format!("0x{}", "bb".repeat(20)),
            registry_address: format!("0x{}", "cc".repeat(20)),
            decimals: 6,
            oracle_strategy: OracleStrategy::Fixed,
            fixed_usd_price: 1.0,
            coingecko_id: None,
            chainlink_feed: None,
            active: true,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        db.insert_payment_token(&token).unwrap();

        let chain = Arc::new(MockChain::new(ChainKey::new(Blockchain::Evm, 137)));
        let mut registry = ChainRegistry::new();
        registry.register(chain.clone());

        let ledger: Ledger = Arc::new(Mutex::new(db));
        let orchestrator = PurchaseOrchestrator::new(
            ledger.clone(),
            Arc::new(registry),
            Arc::new(PriceOracle::new()),
            Arc::new(config),
        );

        Fixture {
            orchestrator,
            ledger,
            chain,
            course,
            token,
        }
    }

    fn request(f: &Fixture) -> PurchaseRequest {
        PurchaseRequest {
            course_id: f.course.id,
            payment_token_id: f.token.id,
            buyer_id: Uuid::new_v4(),
            buyer_address: format!("0x{}", "ee".repeat(20)),
            approval_tx_hash: format!("0x{}", "12".repeat(32)),
            amount: TokenAmount::from_base_units(100_000_000),
        }
    }

    #[tokio::test]
    async fn happy_path_locks_escrow() {
        let f = fixture();
        let outcome = f.orchestrator.process_purchase(&request(&f)).await.unwrap();

        assert_eq!(outcome.status, PurchaseStatus::Active);

        let db = f.ledger.lock().await;
        let stored = db.get_purchase(outcome.purchase_id).unwrap();
        assert_eq!(stored.escrow_status, EscrowStatus::Locked);
        assert_eq!(stored.status, PurchaseStatus::Active);
        assert_eq!(stored.escrow_id, Some(outcome.escrow_id));
        // 20% platform fee captured at creation.
        assert_eq!(stored.platform_fee.base_units(), 20_000_000);
        assert_eq!(stored.instructor_fee.base_units(), 80_000_000);
        assert!((stored.usd_equivalent - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_purchase_never_reaches_the_chain() {
        let f = fixture();
        let first = request(&f);
        f.orchestrator.process_purchase(&first).await.unwrap();

        let mut retry = first.clone();
        retry.approval_tx_hash = format!("0x{}", "34".repeat(32));
        let err = f.orchestrator.process_purchase(&retry).await.unwrap_err();

        assert!(matches!(err, ApiError::Conflict(_)));
        // Exactly one escrow was ever created.
        let creates = f
            .chain
            .calls()
            .iter()
            .filter(|c| c.starts_with("create_escrow"))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn reused_approval_hash_conflicts() {
        let f = fixture();
        let first = request(&f);
        f.orchestrator.process_purchase(&first).await.unwrap();

        let mut second = request(&f);
        second.buyer_id = Uuid::new_v4();
        second.approval_tx_hash = first.approval_tx_hash.clone();
        let err = f.orchestrator.process_purchase(&second).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(msg) if msg.contains("transaction hash")));
    }

    #[tokio::test]
    async fn tampered_registry_rejects_before_escrow_creation() {
        let f = fixture();
        f.chain.set_registry_verdict(false);

        let err = f.orchestrator.process_purchase(&request(&f)).await.unwrap_err();
        assert!(matches!(err, ApiError::VerificationFailed));

        // No escrow was created and no ledger row survived.
        assert!(!f.chain.calls().iter().any(|c| c.starts_with("create_escrow")));
        let db = f.ledger.lock().await;
        let all = db
            .list_purchases(&coursepay_store::purchases::PurchaseFilter {
                escrow_status: None,
                status: None,
                blockchain: None,
                chain_id: None,
                limit: 100,
                offset: 0,
            })
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn chain_failure_keeps_row_and_surfaces_ids() {
        let f = fixture();
        f.chain.fail_create();

        let req = request(&f);
        let err = f.orchestrator.process_purchase(&req).await.unwrap_err();

        let ApiError::ChainFailure {
            purchase_id,
            approval_tx_hash,
            ..
        } = err
        else {
            panic!("expected chain failure");
        };
        assert_eq!(approval_tx_hash, req.approval_tx_hash);

        let db = f.ledger.lock().await;
        let stored = db.get_purchase(purchase_id).unwrap();
        assert_eq!(stored.status, PurchaseStatus::Failed);
        assert_eq!(stored.escrow_status, EscrowStatus::Failed);
    }

    #[tokio::test]
    async fn failed_row_does_not_block_retry() {
        let f = fixture();
        f.chain.fail_create();
        let req = request(&f);
        let _ = f.orchestrator.process_purchase(&req).await.unwrap_err();

        // The failed row must not count as an open purchase: the retry
        // gets a fresh row and fails on the chain again instead of being
        // rejected as a duplicate.
        let mut retry = req.clone();
        retry.approval_tx_hash = format!("0x{}", "56".repeat(32));
        let err = f.orchestrator.process_purchase(&retry).await.unwrap_err();
        assert!(matches!(err, ApiError::ChainFailure { .. }));
    }

    #[tokio::test]
    async fn misconfigured_operator_fails_fast() {
        let f = fixture();
        f.chain.set_operator_role(false);

        let err = f
            .orchestrator
            .calculate(f.course.id, f.token.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Misconfigured));
        assert!(!f.chain.calls().iter().any(|c| c.starts_with("create_escrow")));
    }

    #[tokio::test]
    async fn stale_pending_row_with_no_escrow_is_discarded() {
        let mut config = ServerConfig::default();
        config.stale_purchase_window_secs = 0;
        let f = fixture_with(config);

        let req = request(&f);
        // Seed a pending row as if a previous attempt crashed before the
        // chain call.
        let now = Utc::now() - Duration::seconds(5);
        let stale = Purchase {
            id: Uuid::new_v4(),
            buyer_id: req.buyer_id,
            course_id: req.course_id,
            payment_token_id: f.token.id,
            amount: req.amount,
            usd_equivalent: 100.0,
            platform_fee: TokenAmount::from_base_units(20_000_000),
            instructor_fee: TokenAmount::from_base_units(80_000_000),
            revenue_split: TokenAmount::ZERO,
            platform_fee_bps: 2_000,
            revenue_split_bps: 0,
            approval_tx_hash: TxHash::from_trusted(format!("0x{}", "99".repeat(32))),
            escrow_id: None,
            escrow_tx_hash: None,
            blockchain: Blockchain::Evm,
            chain_id: 137,
            status: PurchaseStatus::Pending,
            escrow_status: EscrowStatus::Pending,
            release_eligible_at: now + Duration::days(14),
            release_tx_hash: None,
            refund_tx_hash: None,
            progress_percent: 0,
            watch_time_secs: 0,
            completed_lessons: vec![],
            refund_eligible: false,
            refund_requested_at: None,
            refund_processed_at: None,
            refund_denial_reason: None,
            created_at: now,
            updated_at: now,
        };
        f.ledger.lock().await.insert_purchase(&stale).unwrap();

        let outcome = f.orchestrator.process_purchase(&req).await.unwrap();
        assert_eq!(outcome.status, PurchaseStatus::Active);

        // The stale row is gone; only the new purchase remains.
        let db = f.ledger.lock().await;
        assert!(matches!(
            db.get_purchase(stale.id),
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn fresh_pending_row_blocks_retry() {
        let f = fixture(); // default 600s window
        let req = request(&f);

        let now = Utc::now();
        let pending = Purchase {
            created_at: now,
            updated_at: now,
            ..stale_row_for(&req, &f.token, now)
        };
        f.ledger.lock().await.insert_purchase(&pending).unwrap();

        let err = f.orchestrator.process_purchase(&req).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(msg) if msg.contains("in progress")));
    }

    fn stale_row_for(
        req: &PurchaseRequest,
        token: &PaymentToken,
        now: chrono::DateTime<Utc>,
    ) -> Purchase {
        Purchase {
            id: Uuid::new_v4(),
            buyer_id: req.buyer_id,
            course_id: req.course_id,
            payment_token_id: token.id,
            amount: req.amount,
            usd_equivalent: 100.0,
            platform_fee: TokenAmount::from_base_units(20_000_000),
            instructor_fee: TokenAmount::from_base_units(80_000_000),
            revenue_split: TokenAmount::ZERO,
            platform_fee_bps: 2_000,
            revenue_split_bps: 0,
            approval_tx_hash: TxHash::from_trusted(format!("0x{}", "77".repeat(32))),
            escrow_id: None,
            escrow_tx_hash: None,
            blockchain: Blockchain::Evm,
            chain_id: 137,
            status: PurchaseStatus::Pending,
            escrow_status: EscrowStatus::Pending,
            release_eligible_at: now + Duration::days(14),
            release_tx_hash: None,
            refund_tx_hash: None,
            progress_percent: 0,
            watch_time_secs: 0,
            completed_lessons: vec![],
            refund_eligible: false,
            refund_requested_at: None,
            refund_processed_at: None,
            refund_denial_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}
