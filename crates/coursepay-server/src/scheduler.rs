//! Escrow release scheduler and ledger/chain reconciliation.
//!
//! A periodic pass releases locked escrows whose funds are due to the
//! instructor. An escrow is due when any of these holds:
//!
//! - the escrow period has elapsed, or
//! - the buyer consumed at least the progress threshold, or
//! - the buyer's watch time crossed the watch threshold (reduced for
//!   short courses, where absolute watch time saturates quickly).
//!
//! Releases are grouped per (chain, escrow contract) and submitted in
//! sub-batches; a failed batch falls back to per-item submissions so one
//! bad escrow cannot block the rest of the cohort.
//!
//! The pass is guarded by an atomic flag: if a previous pass is still
//! running (slow RPC), the new tick is skipped rather than stacked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use coursepay_chain::{ChainRegistry, EscrowChain, OnChainEscrowState};
use coursepay_shared::constants::{
    CHAIN_SUB_BATCH_SIZE, RELEASE_WATCH_MINUTES_SHORT, SCHEDULER_BATCH_CAP, SHORT_COURSE_MINUTES,
};
use coursepay_shared::{Address, ChainKey, EscrowId};
use coursepay_store::purchases::TransitionEffects;
use coursepay_store::{EscrowStatus, PlatformSettings, Purchase, PurchaseStatus};

use crate::config::ServerConfig;
use crate::Ledger;

/// Counters from one release pass, logged as the pass summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReleasePass {
    pub candidates: usize,
    pub eligible: usize,
    pub released: usize,
    pub failed: usize,
    /// True when the pass was skipped because another was running.
    pub skipped: bool,
}

pub struct ReleaseScheduler {
    ledger: Ledger,
    registry: Arc<ChainRegistry>,
    config: Arc<ServerConfig>,
    running: AtomicBool,
}

impl ReleaseScheduler {
    pub fn new(ledger: Ledger, registry: Arc<ChainRegistry>, config: Arc<ServerConfig>) -> Self {
        Self {
            ledger,
            registry,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Periodic driver: startup delay, then a release pass and a
    /// reconciliation sweep every interval.
    pub async fn run_forever(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_secs(self.config.scheduler_startup_delay_secs)).await;

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.scheduler_interval_secs));
        loop {
            ticker.tick().await;
            let pass = self.run_once().await;
            if !pass.skipped {
                info!(
                    candidates = pass.candidates,
                    eligible = pass.eligible,
                    released = pass.released,
                    failed = pass.failed,
                    "release pass complete"
                );
            }
            self.reconcile_once().await;
        }
    }

    /// One release pass over the locked escrows.
    pub async fn run_once(&self) -> ReleasePass {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("previous release pass still running, skipping tick");
            return ReleasePass {
                skipped: true,
                ..Default::default()
            };
        }

        let pass = self.release_pass().await;
        self.running.store(false, Ordering::SeqCst);
        pass
    }

    async fn release_pass(&self) -> ReleasePass {
        let mut pass = ReleasePass::default();
        let now = Utc::now();

        // Candidates, settings and per-purchase course/token data under
        // one lock; all chain work happens unlocked.
        let (candidates, settings, course_minutes, contracts) = {
            let db = self.ledger.lock().await;
            let candidates = match db.early_release_candidates(SCHEDULER_BATCH_CAP) {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "failed to query release candidates");
                    return pass;
                }
            };
            let settings = match db.platform_settings() {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to load platform settings");
                    return pass;
                }
            };

            let mut course_minutes: HashMap<uuid::Uuid, u32> = HashMap::new();
            let mut contracts: HashMap<uuid::Uuid, String> = HashMap::new();
            for p in &candidates {
                if !course_minutes.contains_key(&p.course_id) {
                    if let Ok(course) = db.get_course(p.course_id) {
                        course_minutes.insert(p.course_id, course.total_duration_minutes);
                    }
                }
                if !contracts.contains_key(&p.payment_token_id) {
                    if let Ok(token) = db.get_payment_token(p.payment_token_id) {
                        contracts.insert(p.payment_token_id, token.escrow_address);
                    }
                }
            }
            (candidates, settings, course_minutes, contracts)
        };

        pass.candidates = candidates.len();

        // Group due escrows by (chain, escrow contract).
        let mut groups: HashMap<(ChainKey, String), Vec<Purchase>> = HashMap::new();
        for p in candidates {
            let minutes = course_minutes.get(&p.course_id).copied().unwrap_or(0);
            if !release_due(&p, minutes, &settings, now) {
                continue;
            }
            let Some(contract) = contracts.get(&p.payment_token_id) else {
                warn!(purchase = %p.id, "release candidate has no token row");
                continue;
            };
            pass.eligible += 1;
            let key = ChainKey::new(p.blockchain, p.chain_id);
            groups.entry((key, contract.clone())).or_default().push(p);
        }

        for ((key, contract_str), purchases) in groups {
            let chain = match self.registry.get(&key) {
                Ok(c) => c,
                Err(e) => {
                    warn!(chain = %key, error = %e, "no adapter for due escrows");
                    pass.failed += purchases.len();
                    continue;
                }
            };
            let Some(contract) = Address::parse(&contract_str, key.blockchain) else {
                warn!(chain = %key, contract = %contract_str, "invalid escrow contract address");
                pass.failed += purchases.len();
                continue;
            };

            for chunk in purchases.chunks(CHAIN_SUB_BATCH_SIZE) {
                let (released, failed) = self
                    .release_chunk(chain.as_ref(), &contract, chunk)
                    .await;
                pass.released += released;
                pass.failed += failed;
            }
        }

        pass
    }

    /// Release one sub-batch: try the batch call first, fall back to
    /// per-item submissions so a single reverting escrow only loses
    /// itself.
    async fn release_chunk(
        &self,
        chain: &dyn EscrowChain,
        contract: &Address,
        chunk: &[Purchase],
    ) -> (usize, usize) {
        // The contract's own predicate decides; a locked row whose escrow
        // the contract will not release yet is skipped, not failed.
        let mut due: Vec<(&Purchase, &EscrowId)> = Vec::with_capacity(chunk.len());
        for p in chunk {
            let Some(escrow_id) = &p.escrow_id else {
                warn!(purchase = %p.id, "locked purchase missing escrow id");
                continue;
            };
            match chain.can_release(contract, escrow_id).await {
                Ok(true) => due.push((p, escrow_id)),
                Ok(false) => {
                    info!(purchase = %p.id, escrow = %escrow_id, "contract declines release");
                }
                Err(e) => {
                    warn!(purchase = %p.id, error = %e, "canRelease check failed");
                }
            }
        }
        if due.is_empty() {
            return (0, 0);
        }

        let ids: Vec<EscrowId> = due.iter().map(|(_, id)| (*id).clone()).collect();

        if ids.len() > 1 {
            match chain.batch_release_escrows(contract, &ids).await {
                Ok(receipt) => {
                    let mut released = 0;
                    let mut failed = 0;
                    let db = self.ledger.lock().await;
                    for (p, _) in &due {
                        match db.mark_escrow_released(p.id, &receipt.tx_hash) {
                            Ok(()) => released += 1,
                            Err(e) => {
                                error!(purchase = %p.id, error = %e, "ledger release update failed");
                                failed += 1;
                            }
                        }
                    }
                    return (released, failed);
                }
                Err(e) => {
                    warn!(
                        count = ids.len(),
                        error = %e,
                        "batch release failed, falling back to per-item submissions"
                    );
                }
            }
        }

        let mut released = 0;
        let mut failed = 0;
        for (p, escrow_id) in &due {
            match chain.release_escrow(contract, escrow_id).await {
                Ok(receipt) => {
                    let result = self
                        .ledger
                        .lock()
                        .await
                        .mark_escrow_released(p.id, &receipt.tx_hash);
                    match result {
                        Ok(()) => {
                            info!(purchase = %p.id, tx = %receipt.tx_hash, "escrow released");
                            released += 1;
                        }
                        Err(e) => {
                            error!(purchase = %p.id, error = %e, "ledger release update failed");
                            failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(purchase = %p.id, escrow = %escrow_id, error = %e, "release failed");
                    failed += 1;
                }
            }
        }
        (released, failed)
    }

    /// Reconcile stale unsettled rows against on-chain state.
    ///
    /// A pending row that crashed mid-purchase either has a live escrow
    /// (the ledger is behind: repair it) or no trace on chain (delete the
    /// row so the buyer can retry). Nothing is deleted without the chain
    /// check.
    pub async fn reconcile_once(&self) {
        let stale = {
            let db = self.ledger.lock().await;
            match db.find_stale_unsettled(self.config.stale_purchase_window_secs) {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "stale purchase scan failed");
                    return;
                }
            }
        };
        if stale.is_empty() {
            return;
        }
        info!(count = stale.len(), "reconciling stale unsettled purchases");

        for p in stale {
            if let Err(e) = self.reconcile_row(&p).await {
                warn!(purchase = %p.id, error = %e, "reconciliation failed");
            }
        }
    }

    async fn reconcile_row(&self, p: &Purchase) -> Result<(), String> {
        let Some(escrow_id) = &p.escrow_id else {
            // Never reached the chain; safe to discard.
            let deleted = self
                .ledger
                .lock()
                .await
                .delete_unsettled(p.id)
                .map_err(|e| e.to_string())?;
            info!(purchase = %p.id, deleted, "discarded unsettled purchase with no escrow");
            return Ok(());
        };

        let (contract_str, blockchain) = {
            let db = self.ledger.lock().await;
            let token = db.get_payment_token(p.payment_token_id).map_err(|e| e.to_string())?;
            (token.escrow_address, token.blockchain)
        };
        let key = ChainKey::new(p.blockchain, p.chain_id);
        let chain = self.registry.get(&key).map_err(|e| e.to_string())?;
        let contract =
            Address::parse(&contract_str, blockchain).ok_or("invalid escrow contract")?;

        let state = chain
            .escrow_state(&contract, escrow_id)
            .await
            .map_err(|e| e.to_string())?;

        match state {
            OnChainEscrowState::Absent => {
                let deleted = self
                    .ledger
                    .lock()
                    .await
                    .delete_unsettled(p.id)
                    .map_err(|e| e.to_string())?;
                info!(purchase = %p.id, deleted, "discarded unsettled purchase; chain has no escrow");
            }
            live => {
                if p.escrow_status != EscrowStatus::Pending {
                    // A failed row with a live escrow needs a human: the
                    // graph has no failed -> locked edge.
                    error!(
                        purchase = %p.id,
                        status = p.status.as_str(),
                        ?live,
                        "failed purchase has a live on-chain escrow; manual remediation required"
                    );
                    return Ok(());
                }
                warn!(purchase = %p.id, ?live, "ledger behind chain; repairing");
                let db = self.ledger.lock().await;
                db.transition_escrow(
                    p.id,
                    EscrowStatus::Pending,
                    EscrowStatus::Locked,
                    TransitionEffects {
                        escrow_id: Some(escrow_id),
                        tx_hash: p.escrow_tx_hash.as_ref(),
                    },
                )
                .map_err(|e| e.to_string())?;
                match live {
                    OnChainEscrowState::Released => {
                        db.transition_escrow(
                            p.id,
                            EscrowStatus::Locked,
                            EscrowStatus::Released,
                            TransitionEffects::default(),
                        )
                        .map_err(|e| e.to_string())?;
                    }
                    OnChainEscrowState::Refunded => {
                        db.transition_escrow(
                            p.id,
                            EscrowStatus::Locked,
                            EscrowStatus::Refunded,
                            TransitionEffects::default(),
                        )
                        .map_err(|e| e.to_string())?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// The three-way release eligibility test.
fn release_due(
    p: &Purchase,
    course_minutes: u32,
    settings: &PlatformSettings,
    now: chrono::DateTime<Utc>,
) -> bool {
    if p.status == PurchaseStatus::Revoked {
        return false;
    }
    if now >= p.release_eligible_at {
        return true;
    }
    if p.progress_percent >= settings.release_progress_threshold {
        return true;
    }
    let watch_threshold = if course_minutes > 0 && course_minutes <= SHORT_COURSE_MINUTES {
        RELEASE_WATCH_MINUTES_SHORT
    } else {
        settings.release_watch_minutes
    };
    p.watch_time_secs / 60 >= watch_threshold
}
