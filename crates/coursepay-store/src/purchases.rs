//! Purchase ledger operations.
//!
//! All escrow-state writes funnel through [`Database::transition_escrow`],
//! which validates the requested edge against the allowed graph and then
//! executes a conditional UPDATE whose WHERE clause re-checks the current
//! state.  A concurrent writer that got there first makes the predicate
//! fail, so ordering holds without an application-level lock.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter};
use uuid::Uuid;

use coursepay_shared::{Blockchain, EscrowId, TokenAmount, TxHash};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{EscrowStatus, Purchase, PurchaseStatus};

const PURCHASE_COLS: &str = "id, buyer_id, course_id, payment_token_id, amount, usd_equivalent, \
     platform_fee, instructor_fee, revenue_split, platform_fee_bps, revenue_split_bps, \
     approval_tx_hash, escrow_id, escrow_tx_hash, blockchain, chain_id, status, escrow_status, \
     release_eligible_at, release_tx_hash, refund_tx_hash, progress_percent, watch_time_secs, \
     completed_lessons, refund_eligible, refund_requested_at, refund_processed_at, \
     refund_denial_reason, created_at, updated_at";

impl Database {
    /// Insert a new purchase row.
    ///
    /// The unique indexes do the real duplicate checking: a second
    /// non-terminal purchase for the same (buyer, course) maps to
    /// [`StoreError::DuplicatePurchase`], and a reused approval hash maps
    /// to [`StoreError::TxHashConflict`].
    pub fn insert_purchase(&self, p: &Purchase) -> Result<()> {
        let result = self.conn().execute(
            &format!("INSERT INTO purchases ({PURCHASE_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)"),
            params![
                p.id.to_string(),
                p.buyer_id.to_string(),
                p.course_id.to_string(),
                p.payment_token_id.to_string(),
                p.amount.to_string(),
                p.usd_equivalent,
                p.platform_fee.to_string(),
                p.instructor_fee.to_string(),
                p.revenue_split.to_string(),
                p.platform_fee_bps,
                p.revenue_split_bps,
                p.approval_tx_hash.as_str(),
                p.escrow_id.as_ref().map(|e| e.as_str().to_string()),
                p.escrow_tx_hash.as_ref().map(|t| t.as_str().to_string()),
                p.blockchain.as_str(),
                p.chain_id,
                p.status.as_str(),
                p.escrow_status.as_str(),
                p.release_eligible_at.to_rfc3339(),
                p.release_tx_hash.as_ref().map(|t| t.as_str().to_string()),
                p.refund_tx_hash.as_ref().map(|t| t.as_str().to_string()),
                p.progress_percent,
                p.watch_time_secs,
                serde_json::to_string(&p.completed_lessons).unwrap_or_else(|_| "[]".into()),
                p.refund_eligible,
                p.refund_requested_at.map(|t| t.to_rfc3339()),
                p.refund_processed_at.map(|t| t.to_rfc3339()),
                p.refund_denial_reason.as_deref(),
                p.created_at.to_rfc3339(),
                p.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(map_purchase_constraint(e)),
        }
    }

    pub fn get_purchase(&self, id: Uuid) -> Result<Purchase> {
        self.conn()
            .query_row(
                &format!("SELECT {PURCHASE_COLS} FROM purchases WHERE id = ?1"),
                params![id.to_string()],
                row_to_purchase,
            )
            .map_err(not_found)
    }

    /// Look up by the buyer's approval transaction hash (the idempotency
    /// key).
    pub fn get_purchase_by_approval(&self, tx_hash: &TxHash) -> Result<Option<Purchase>> {
        match self.conn().query_row(
            &format!("SELECT {PURCHASE_COLS} FROM purchases WHERE approval_tx_hash = ?1"),
            params![tx_hash.as_str()],
            row_to_purchase,
        ) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// The non-terminal purchase (if any) a buyer holds for a course.
    pub fn find_open_purchase(&self, buyer_id: Uuid, course_id: Uuid) -> Result<Option<Purchase>> {
        match self.conn().query_row(
            &format!(
                "SELECT {PURCHASE_COLS} FROM purchases
                 WHERE buyer_id = ?1 AND course_id = ?2
                   AND status IN ('pending', 'active', 'completed')"
            ),
            params![buyer_id.to_string(), course_id.to_string()],
            row_to_purchase,
        ) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// `pending`/`failed` rows older than the abandonment window.  These
    /// are candidates for reconciliation; they are never deleted without
    /// an on-chain state check first.
    pub fn find_stale_unsettled(&self, window_secs: i64) -> Result<Vec<Purchase>> {
        let cutoff = (Utc::now() - Duration::seconds(window_secs)).to_rfc3339();
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PURCHASE_COLS} FROM purchases
             WHERE status IN ('pending', 'failed') AND created_at < ?1
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![cutoff], row_to_purchase)?;
        collect(rows)
    }

    /// Delete an abandoned row.  Guarded so it can only ever remove
    /// `pending`/`failed` purchases; settled rows are untouchable.
    pub fn delete_unsettled(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM purchases WHERE id = ?1 AND status IN ('pending', 'failed')",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn purchases_for_buyer(&self, buyer_id: Uuid) -> Result<Vec<Purchase>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PURCHASE_COLS} FROM purchases
             WHERE buyer_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![buyer_id.to_string()], row_to_purchase)?;
        collect(rows)
    }

    /// Locked, active purchases whose time-based release date has passed,
    /// capped for one scheduler pass.
    pub fn release_candidates(&self, now: DateTime<Utc>, cap: u32) -> Result<Vec<Purchase>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PURCHASE_COLS} FROM purchases
             WHERE escrow_status = 'locked' AND status IN ('active', 'completed')
               AND release_eligible_at <= ?1
             ORDER BY release_eligible_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![now.to_rfc3339(), cap], row_to_purchase)?;
        collect(rows)
    }

    /// Locked purchases not yet past their release date (consumption may
    /// still trigger early release).
    pub fn early_release_candidates(&self, cap: u32) -> Result<Vec<Purchase>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PURCHASE_COLS} FROM purchases
             WHERE escrow_status = 'locked' AND status IN ('active', 'completed')
             ORDER BY release_eligible_at ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![cap], row_to_purchase)?;
        collect(rows)
    }

    /// Admin escrow listing with optional filters.
    pub fn list_purchases(&self, filter: &PurchaseFilter) -> Result<Vec<Purchase>> {
        let mut sql = format!("SELECT {PURCHASE_COLS} FROM purchases WHERE 1=1");
        let mut args: Vec<String> = Vec::new();

        if let Some(es) = filter.escrow_status {
            args.push(es.as_str().to_string());
            sql.push_str(&format!(" AND escrow_status = ?{}", args.len()));
        }
        if let Some(s) = filter.status {
            args.push(s.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(b) = filter.blockchain {
            args.push(b.as_str().to_string());
            sql.push_str(&format!(" AND blockchain = ?{}", args.len()));
        }
        if let Some(c) = filter.chain_id {
            args.push(c.to_string());
            sql.push_str(&format!(" AND chain_id = ?{}", args.len()));
        }
        args.push(filter.limit.max(1).to_string());
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", args.len()));
        args.push(filter.offset.to_string());
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_purchase)?;
        collect(rows)
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    /// The single escrow-state transition function.
    ///
    /// Validates the `from -> to` edge against the allowed graph, then
    /// performs a conditional UPDATE that only succeeds while the row is
    /// still in `from`.  Zero affected rows means another writer moved
    /// the row first (or it never existed); the actual state is read back
    /// to produce a precise error.
    pub fn transition_escrow(
        &self,
        id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
        effects: TransitionEffects<'_>,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                from: from.as_str().into(),
                to: to.as_str().into(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let affected = match to {
            EscrowStatus::Locked => self.conn().execute(
                "UPDATE purchases
                 SET escrow_status = 'locked', status = 'active',
                     escrow_id = ?1, escrow_tx_hash = ?2,
                     refund_eligible = 1, updated_at = ?3
                 WHERE id = ?4 AND escrow_status = ?5",
                params![
                    effects.escrow_id.map(|e| e.as_str().to_string()),
                    effects.tx_hash.map(|t| t.as_str().to_string()),
                    now,
                    id.to_string(),
                    from.as_str(),
                ],
            )?,
            EscrowStatus::Failed => self.conn().execute(
                "UPDATE purchases
                 SET escrow_status = 'failed', status = 'failed', updated_at = ?1
                 WHERE id = ?2 AND escrow_status = ?3",
                params![now, id.to_string(), from.as_str()],
            )?,
            EscrowStatus::Released => self.conn().execute(
                "UPDATE purchases
                 SET escrow_status = 'released', release_tx_hash = ?1,
                     refund_eligible = 0, updated_at = ?2
                 WHERE id = ?3 AND escrow_status = ?4",
                params![
                    effects.tx_hash.map(|t| t.as_str().to_string()),
                    now,
                    id.to_string(),
                    from.as_str(),
                ],
            )?,
            EscrowStatus::Refunded => self.conn().execute(
                "UPDATE purchases
                 SET escrow_status = 'refunded', status = 'refunded',
                     refund_tx_hash = ?1, refund_processed_at = ?2,
                     refund_eligible = 0, updated_at = ?2
                 WHERE id = ?3 AND escrow_status = ?4",
                params![
                    effects.tx_hash.map(|t| t.as_str().to_string()),
                    now,
                    id.to_string(),
                    from.as_str(),
                ],
            )?,
            EscrowStatus::Pending => unreachable!("no edge leads back to pending"),
        };

        if affected == 0 {
            let actual = self.get_purchase(id)?;
            return Err(StoreError::IllegalTransition {
                from: actual.escrow_status.as_str().into(),
                to: to.as_str().into(),
            });
        }
        Ok(())
    }

    /// pending -> locked, recording the escrow handle and submission hash.
    pub fn mark_escrow_locked(
        &self,
        id: Uuid,
        escrow_id: &EscrowId,
        tx_hash: &TxHash,
    ) -> Result<()> {
        self.transition_escrow(
            id,
            EscrowStatus::Pending,
            EscrowStatus::Locked,
            TransitionEffects {
                escrow_id: Some(escrow_id),
                tx_hash: Some(tx_hash),
            },
        )
    }

    /// pending -> failed (chain failure; row preserved for remediation).
    pub fn mark_escrow_failed(&self, id: Uuid) -> Result<()> {
        self.transition_escrow(
            id,
            EscrowStatus::Pending,
            EscrowStatus::Failed,
            TransitionEffects::default(),
        )
    }

    /// locked -> released.
    pub fn mark_escrow_released(&self, id: Uuid, tx_hash: &TxHash) -> Result<()> {
        self.transition_escrow(
            id,
            EscrowStatus::Locked,
            EscrowStatus::Released,
            TransitionEffects {
                escrow_id: None,
                tx_hash: Some(tx_hash),
            },
        )
    }

    /// locked -> refunded (terminal).
    pub fn mark_escrow_refunded(&self, id: Uuid, tx_hash: &TxHash) -> Result<()> {
        self.transition_escrow(
            id,
            EscrowStatus::Locked,
            EscrowStatus::Refunded,
            TransitionEffects {
                escrow_id: None,
                tx_hash: Some(tx_hash),
            },
        )
    }

    // -----------------------------------------------------------------------
    // Non-state writes
    // -----------------------------------------------------------------------

    /// Consumption signals from the progress subsystem.  Deliberately
    /// cannot touch status fields.
    pub fn update_consumption(
        &self,
        id: Uuid,
        progress_percent: u8,
        watch_time_secs: u32,
        completed_lessons: &[String],
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE purchases
             SET progress_percent = ?1, watch_time_secs = ?2,
                 completed_lessons = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                progress_percent.min(100),
                watch_time_secs,
                serde_json::to_string(completed_lessons).unwrap_or_else(|_| "[]".into()),
                Utc::now().to_rfc3339(),
                id.to_string(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn record_refund_request(&self, id: Uuid) -> Result<()> {
        self.conn().execute(
            "UPDATE purchases SET refund_requested_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn record_refund_denial(&self, id: Uuid, reason: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE purchases SET refund_denial_reason = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    /// Mark a purchase revoked (admin free-access revocation or manual
    /// intervention on a settled row).
    pub fn mark_revoked(&self, id: Uuid) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE purchases SET status = 'revoked', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// Optional columns written alongside a transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransitionEffects<'a> {
    pub escrow_id: Option<&'a EscrowId>,
    pub tx_hash: Option<&'a TxHash>,
}

/// Admin listing filter.
#[derive(Debug, Clone, Copy)]
pub struct PurchaseFilter {
    pub escrow_status: Option<EscrowStatus>,
    pub status: Option<PurchaseStatus>,
    pub blockchain: Option<Blockchain>,
    pub chain_id: Option<u64>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for PurchaseFilter {
    fn default() -> Self {
        Self {
            escrow_status: None,
            status: None,
            blockchain: None,
            chain_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

/// Map SQLITE_CONSTRAINT on the purchase unique indexes to typed
/// conflicts the orchestrator can turn into 409s.
fn map_purchase_constraint(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ffi, Some(ref msg)) = e {
        if ffi.code == rusqlite::ErrorCode::ConstraintViolation {
            if msg.contains("approval_tx_hash") {
                return StoreError::TxHashConflict;
            }
            if msg.contains("buyer_id") {
                return StoreError::DuplicatePurchase;
            }
        }
    }
    StoreError::Sqlite(e)
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<Purchase>>,
) -> Result<Vec<Purchase>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_purchase(row: &rusqlite::Row<'_>) -> rusqlite::Result<Purchase> {
    fn bad(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    }
    fn bad_enum(idx: usize, value: &str) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown enum value: {value}").into(),
        )
    }
    fn uuid_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
        let s: String = row.get(idx)?;
        Uuid::parse_str(&s).map_err(|e| bad(idx, e))
    }
    fn amount_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<TokenAmount> {
        let s: String = row.get(idx)?;
        TokenAmount::parse(&s).map_err(|e| bad(idx, e))
    }
    fn ts_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
        let s: String = row.get(idx)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| bad(idx, e))
    }
    fn opt_ts_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
        let s: Option<String> = row.get(idx)?;
        match s {
            None => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| bad(idx, e)),
        }
    }

    let blockchain_str: String = row.get(14)?;
    let blockchain =
        Blockchain::parse(&blockchain_str).ok_or_else(|| bad_enum(14, &blockchain_str))?;
    let status_str: String = row.get(16)?;
    let status = PurchaseStatus::parse(&status_str).ok_or_else(|| bad_enum(16, &status_str))?;
    let escrow_str: String = row.get(17)?;
    let escrow_status =
        EscrowStatus::parse(&escrow_str).ok_or_else(|| bad_enum(17, &escrow_str))?;

    let lessons_json: String = row.get(23)?;
    let completed_lessons: Vec<String> =
        serde_json::from_str(&lessons_json).map_err(|e| bad(23, e))?;

    Ok(Purchase {
        id: uuid_at(row, 0)?,
        buyer_id: uuid_at(row, 1)?,
        course_id: uuid_at(row, 2)?,
        payment_token_id: uuid_at(row, 3)?,
        amount: amount_at(row, 4)?,
        usd_equivalent: row.get(5)?,
        platform_fee: amount_at(row, 6)?,
        instructor_fee: amount_at(row, 7)?,
        revenue_split: amount_at(row, 8)?,
        platform_fee_bps: row.get(9)?,
        revenue_split_bps: row.get(10)?,
        approval_tx_hash: TxHash::from_trusted(row.get(11)?),
        escrow_id: row.get::<_, Option<String>>(12)?.map(EscrowId),
        escrow_tx_hash: row.get::<_, Option<String>>(13)?.map(TxHash::from_trusted),
        blockchain,
        chain_id: row.get(15)?,
        status,
        escrow_status,
        release_eligible_at: ts_at(row, 18)?,
        release_tx_hash: row.get::<_, Option<String>>(19)?.map(TxHash::from_trusted),
        refund_tx_hash: row.get::<_, Option<String>>(20)?.map(TxHash::from_trusted),
        progress_percent: row.get(21)?,
        watch_time_secs: row.get(22)?,
        completed_lessons,
        refund_eligible: row.get(24)?,
        refund_requested_at: opt_ts_at(row, 25)?,
        refund_processed_at: opt_ts_at(row, 26)?,
        refund_denial_reason: row.get(27)?,
        created_at: ts_at(row, 28)?,
        updated_at: ts_at(row, 29)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PurchaseStatus;

    fn purchase(buyer: Uuid, course: Uuid, tx: &str) -> Purchase {
        let now = Utc::now();
        Purchase {
            id: Uuid::new_v4(),
            buyer_id: buyer,
            course_id: course,
            payment_token_id: Uuid::new_v4(),
            amount: TokenAmount::from_base_units(100_000_000),
            usd_equivalent: 100.0,
            platform_fee: TokenAmount::from_base_units(20_000_000),
            instructor_fee: TokenAmount::from_base_units(80_000_000),
            revenue_split: TokenAmount::ZERO,
            platform_fee_bps: 2_000,
            revenue_split_bps: 0,
            approval_tx_hash: TxHash::from_trusted(tx.to_string()),
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
            completed_lessons: Vec::new(),
            refund_eligible: false,
            refund_requested_at: None,
            refund_processed_at: None,
            refund_denial_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn insert_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        let p = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xaaa1");
        db.insert_purchase(&p).unwrap();

        let got = db.get_purchase(p.id).unwrap();
        assert_eq!(got.amount, p.amount);
        assert_eq!(got.escrow_status, EscrowStatus::Pending);
        assert_eq!(got.approval_tx_hash, p.approval_tx_hash);
    }

    #[test]
    fn approval_hash_is_globally_unique() {
        let db = Database::open_in_memory().unwrap();
        let p1 = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xdup");
        let p2 = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xdup");
        db.insert_purchase(&p1).unwrap();
        assert!(matches!(
            db.insert_purchase(&p2),
            Err(StoreError::TxHashConflict)
        ));
    }

    #[test]
    fn one_open_purchase_per_buyer_course() {
        let db = Database::open_in_memory().unwrap();
        let buyer = Uuid::new_v4();
        let course = Uuid::new_v4();
        db.insert_purchase(&purchase(buyer, course, "0xbbb1")).unwrap();
        assert!(matches!(
            db.insert_purchase(&purchase(buyer, course, "0xbbb2")),
            Err(StoreError::DuplicatePurchase)
        ));
    }

    #[test]
    fn terminal_rows_do_not_block_repurchase() {
        let db = Database::open_in_memory().unwrap();
        let buyer = Uuid::new_v4();
        let course = Uuid::new_v4();
        let mut p = purchase(buyer, course, "0xccc1");
        p.status = PurchaseStatus::Refunded;
        p.escrow_status = EscrowStatus::Refunded;
        db.insert_purchase(&p).unwrap();

        db.insert_purchase(&purchase(buyer, course, "0xccc2")).unwrap();
    }

    #[test]
    fn lock_then_release_path() {
        let db = Database::open_in_memory().unwrap();
        let p = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xddd1");
        db.insert_purchase(&p).unwrap();

        let escrow = EscrowId("7".into());
        let lock_tx = TxHash::from_trusted("0xlock".into());
        db.mark_escrow_locked(p.id, &escrow, &lock_tx).unwrap();

        let locked = db.get_purchase(p.id).unwrap();
        assert_eq!(locked.escrow_status, EscrowStatus::Locked);
        assert_eq!(locked.status, PurchaseStatus::Active);
        assert_eq!(locked.escrow_id, Some(escrow));
        assert!(locked.refund_eligible);

        let rel_tx = TxHash::from_trusted("0xrel".into());
        db.mark_escrow_released(p.id, &rel_tx).unwrap();
        let released = db.get_purchase(p.id).unwrap();
        assert_eq!(released.escrow_status, EscrowStatus::Released);
        assert!(!released.refund_eligible);
        assert_eq!(released.release_tx_hash, Some(rel_tx));
    }

    #[test]
    fn released_is_terminal() {
        let db = Database::open_in_memory().unwrap();
        let p = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xeee1");
        db.insert_purchase(&p).unwrap();
        db.mark_escrow_locked(
            p.id,
            &EscrowId("1".into()),
            &TxHash::from_trusted("0xl".into()),
        )
        .unwrap();
        db.mark_escrow_released(p.id, &TxHash::from_trusted("0xr".into()))
            .unwrap();

        // Duplicate release and late refund both die in the guard.
        assert!(matches!(
            db.mark_escrow_released(p.id, &TxHash::from_trusted("0xr2".into())),
            Err(StoreError::IllegalTransition { .. })
        ));
        assert!(matches!(
            db.mark_escrow_refunded(p.id, &TxHash::from_trusted("0xrf".into())),
            Err(StoreError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn escrow_status_never_moves_backward() {
        let db = Database::open_in_memory().unwrap();
        let p = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xfff1");
        db.insert_purchase(&p).unwrap();

        // locked -> released requires the row to actually be locked.
        assert!(matches!(
            db.mark_escrow_released(p.id, &TxHash::from_trusted("0xr".into())),
            Err(StoreError::IllegalTransition { .. })
        ));
        // Graph-invalid edges are rejected before any SQL runs.
        assert!(matches!(
            db.transition_escrow(
                p.id,
                EscrowStatus::Released,
                EscrowStatus::Locked,
                TransitionEffects::default(),
            ),
            Err(StoreError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn release_candidates_respects_cap_and_dates() {
        let db = Database::open_in_memory().unwrap();
        let course = Uuid::new_v4();
        for i in 0..5 {
            let mut p = purchase(Uuid::new_v4(), course, &format!("0xcand{i}"));
            p.release_eligible_at = Utc::now() - Duration::hours(1);
            db.insert_purchase(&p).unwrap();
            db.mark_escrow_locked(
                p.id,
                &EscrowId(i.to_string()),
                &TxHash::from_trusted(format!("0xlk{i}")),
            )
            .unwrap();
        }
        // One still inside its escrow period.
        let mut future = purchase(Uuid::new_v4(), course, "0xfuture");
        future.release_eligible_at = Utc::now() + Duration::days(7);
        db.insert_purchase(&future).unwrap();
        db.mark_escrow_locked(
            future.id,
            &EscrowId("99".into()),
            &TxHash::from_trusted("0xlk99".into()),
        )
        .unwrap();

        let candidates = db.release_candidates(Utc::now(), 3).unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.id != future.id));

        let all = db.release_candidates(Utc::now(), 100).unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn stale_unsettled_scan_and_guarded_delete() {
        let db = Database::open_in_memory().unwrap();
        let mut stale = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xstale");
        stale.created_at = Utc::now() - Duration::seconds(3_600);
        db.insert_purchase(&stale).unwrap();

        let fresh = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xfresh");
        db.insert_purchase(&fresh).unwrap();

        let found = db.find_stale_unsettled(600).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);

        assert!(db.delete_unsettled(stale.id).unwrap());

        // A settled row cannot be deleted through this path.
        db.mark_escrow_locked(
            fresh.id,
            &EscrowId("5".into()),
            &TxHash::from_trusted("0xl5".into()),
        )
        .unwrap();
        assert!(!db.delete_unsettled(fresh.id).unwrap());
    }

    #[test]
    fn consumption_update_leaves_status_alone() {
        let db = Database::open_in_memory().unwrap();
        let p = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xprog");
        db.insert_purchase(&p).unwrap();
        db.update_consumption(p.id, 42, 1_800, &["lesson-1".into()])
            .unwrap();

        let got = db.get_purchase(p.id).unwrap();
        assert_eq!(got.progress_percent, 42);
        assert_eq!(got.watch_time_secs, 1_800);
        assert_eq!(got.completed_lessons, vec!["lesson-1".to_string()]);
        assert_eq!(got.status, PurchaseStatus::Pending);
        assert_eq!(got.escrow_status, EscrowStatus::Pending);
    }

    #[test]
    fn filtered_listing() {
        let db = Database::open_in_memory().unwrap();
        let p1 = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xls1");
        db.insert_purchase(&p1).unwrap();
        let p2 = purchase(Uuid::new_v4(), Uuid::new_v4(), "0xls2");
        db.insert_purchase(&p2).unwrap();
        db.mark_escrow_locked(
            p2.id,
            &EscrowId("2".into()),
            &TxHash::from_trusted("0xl2".into()),
        )
        .unwrap();

        let locked = db
            .list_purchases(&PurchaseFilter {
                escrow_status: Some(EscrowStatus::Locked),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].id, p2.id);
    }
}
