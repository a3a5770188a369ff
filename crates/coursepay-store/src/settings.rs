//! Platform and instructor fee settings.
//!
//! Settings are read at purchase-creation time only; the rates a purchase
//! captured are never recomputed from here afterwards.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use coursepay_shared::constants::{
    DEFAULT_ESCROW_PERIOD_DAYS, DEFAULT_PLATFORM_FEE_BPS, DEFAULT_REFUND_PROGRESS_CEILING,
    DEFAULT_REVENUE_SPLIT_BPS, RELEASE_PROGRESS_THRESHOLD, RELEASE_WATCH_MINUTES,
};
use coursepay_shared::{EffectiveFees, FeeBps};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{InstructorFeeSettings, PlatformSettings};

impl Database {
    /// Read the singleton platform settings, seeding defaults on first
    /// access.
    pub fn platform_settings(&self) -> Result<PlatformSettings> {
        let existing = self.conn().query_row(
            "SELECT platform_fee_bps, revenue_split_bps, escrow_period_days,
                    refund_progress_ceiling, release_progress_threshold,
                    release_watch_minutes, updated_at
             FROM platform_settings WHERE id = 1",
            [],
            row_to_platform_settings,
        );

        match existing {
            Ok(s) => Ok(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                let defaults = PlatformSettings {
                    platform_fee_bps: DEFAULT_PLATFORM_FEE_BPS,
                    revenue_split_bps: DEFAULT_REVENUE_SPLIT_BPS,
                    escrow_period_days: DEFAULT_ESCROW_PERIOD_DAYS,
                    refund_progress_ceiling: DEFAULT_REFUND_PROGRESS_CEILING,
                    release_progress_threshold: RELEASE_PROGRESS_THRESHOLD,
                    release_watch_minutes: RELEASE_WATCH_MINUTES,
                    updated_at: Utc::now(),
                };
                self.save_platform_settings(&defaults)?;
                Ok(defaults)
            }
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    pub fn save_platform_settings(&self, s: &PlatformSettings) -> Result<()> {
        self.conn().execute(
            "INSERT INTO platform_settings
                 (id, platform_fee_bps, revenue_split_bps, escrow_period_days,
                  refund_progress_ceiling, release_progress_threshold,
                  release_watch_minutes, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 platform_fee_bps = ?1, revenue_split_bps = ?2,
                 escrow_period_days = ?3, refund_progress_ceiling = ?4,
                 release_progress_threshold = ?5, release_watch_minutes = ?6,
                 updated_at = ?7",
            params![
                s.platform_fee_bps,
                s.revenue_split_bps,
                s.escrow_period_days,
                s.refund_progress_ceiling,
                s.release_progress_threshold,
                s.release_watch_minutes,
                s.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn instructor_fee_settings(
        &self,
        instructor_id: Uuid,
    ) -> Result<Option<InstructorFeeSettings>> {
        match self.conn().query_row(
            "SELECT instructor_id, platform_fee_bps, revenue_split_bps, active, updated_at
             FROM instructor_fee_settings WHERE instructor_id = ?1",
            params![instructor_id.to_string()],
            row_to_instructor_settings,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    pub fn save_instructor_fee_settings(&self, s: &InstructorFeeSettings) -> Result<()> {
        self.conn().execute(
            "INSERT INTO instructor_fee_settings
                 (instructor_id, platform_fee_bps, revenue_split_bps, active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(instructor_id) DO UPDATE SET
                 platform_fee_bps = ?2, revenue_split_bps = ?3,
                 active = ?4, updated_at = ?5",
            params![
                s.instructor_id.to_string(),
                s.platform_fee_bps,
                s.revenue_split_bps,
                s.active,
                s.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The fee rates to apply for this instructor right now: their custom
    /// override when flagged active, else the platform defaults.
    pub fn effective_fees(&self, instructor_id: Uuid) -> Result<EffectiveFees> {
        if let Some(custom) = self.instructor_fee_settings(instructor_id)? {
            if custom.active {
                return Ok(EffectiveFees {
                    platform_bps: FeeBps::new(custom.platform_fee_bps)?,
                    revenue_split_bps: FeeBps::new(custom.revenue_split_bps)?,
                    custom: true,
                });
            }
        }
        let platform = self.platform_settings()?;
        Ok(EffectiveFees {
            platform_bps: FeeBps::new(platform.platform_fee_bps)?,
            revenue_split_bps: FeeBps::new(platform.revenue_split_bps)?,
            custom: false,
        })
    }
}

fn row_to_platform_settings(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlatformSettings> {
    let ts: String = row.get(6)?;
    let updated_at = DateTime::parse_from_rfc3339(&ts)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(PlatformSettings {
        platform_fee_bps: row.get(0)?,
        revenue_split_bps: row.get(1)?,
        escrow_period_days: row.get(2)?,
        refund_progress_ceiling: row.get(3)?,
        release_progress_threshold: row.get(4)?,
        release_watch_minutes: row.get(5)?,
        updated_at,
    })
}

fn row_to_instructor_settings(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<InstructorFeeSettings> {
    let id_str: String = row.get(0)?;
    let instructor_id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let ts: String = row.get(4)?;
    let updated_at = DateTime::parse_from_rfc3339(&ts)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(InstructorFeeSettings {
        instructor_id,
        platform_fee_bps: row.get(1)?,
        revenue_split_bps: row.get(2)?,
        active: row.get(3)?,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_seed_on_first_read() {
        let db = Database::open_in_memory().unwrap();
        let s = db.platform_settings().unwrap();
        assert_eq!(s.platform_fee_bps, DEFAULT_PLATFORM_FEE_BPS);
        assert_eq!(s.escrow_period_days, DEFAULT_ESCROW_PERIOD_DAYS);
    }

    #[test]
    fn inactive_override_falls_back_to_platform() {
        let db = Database::open_in_memory().unwrap();
        let instructor = Uuid::new_v4();
        db.save_instructor_fee_settings(&InstructorFeeSettings {
            instructor_id: instructor,
            platform_fee_bps: 1_000,
            revenue_split_bps: 0,
            active: false,
            updated_at: Utc::now(),
        })
        .unwrap();

        let fees = db.effective_fees(instructor).unwrap();
        assert!(!fees.custom);
        assert_eq!(fees.platform_bps.value(), DEFAULT_PLATFORM_FEE_BPS);
    }

    #[test]
    fn active_override_wins() {
        let db = Database::open_in_memory().unwrap();
        let instructor = Uuid::new_v4();
        db.save_instructor_fee_settings(&InstructorFeeSettings {
            instructor_id: instructor,
            platform_fee_bps: 1_000,
            revenue_split_bps: 500,
            active: true,
            updated_at: Utc::now(),
        })
        .unwrap();

        let fees = db.effective_fees(instructor).unwrap();
        assert!(fees.custom);
        assert_eq!(fees.platform_bps.value(), 1_000);
        assert_eq!(fees.revenue_split_bps.value(), 500);
    }
}
