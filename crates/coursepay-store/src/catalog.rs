//! Read-only collaborator lookups.
//!
//! Courses and users are owned by the catalog/profile subsystem; the
//! settlement pipeline only reads them.  The insert helpers exist so the
//! out-of-scope writers (and tests) can seed rows.

use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Course, PayoutWallet, UserRecord};

impl Database {
    pub fn get_course(&self, id: Uuid) -> Result<Course> {
        self.conn()
            .query_row(
                "SELECT id, title, instructor_id, price_usd, published, total_duration_minutes
                 FROM courses WHERE id = ?1",
                params![id.to_string()],
                row_to_course,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn get_user(&self, id: Uuid) -> Result<UserRecord> {
        self.conn()
            .query_row(
                "SELECT id, display_name, payout_wallets, legacy_wallet_address
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Seed helper for the catalog writer and tests.
    pub fn upsert_course(&self, c: &Course) -> Result<()> {
        self.conn().execute(
            "INSERT INTO courses (id, title, instructor_id, price_usd, published, total_duration_minutes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 title = ?2, instructor_id = ?3, price_usd = ?4,
                 published = ?5, total_duration_minutes = ?6",
            params![
                c.id.to_string(),
                c.title,
                c.instructor_id.to_string(),
                c.price_usd,
                c.published,
                c.total_duration_minutes,
            ],
        )?;
        Ok(())
    }

    /// Seed helper for the profile writer and tests.
    pub fn upsert_user(&self, u: &UserRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, payout_wallets, legacy_wallet_address)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = ?2, payout_wallets = ?3, legacy_wallet_address = ?4",
            params![
                u.id.to_string(),
                u.display_name,
                serde_json::to_string(&u.payout_wallets).unwrap_or_else(|_| "[]".into()),
                u.legacy_wallet_address.as_deref(),
            ],
        )?;
        Ok(())
    }
}

fn row_to_course(row: &rusqlite::Row<'_>) -> rusqlite::Result<Course> {
    let id_str: String = row.get(0)?;
    let instructor_str: String = row.get(2)?;
    let parse = |idx: usize, s: &str| {
        Uuid::parse_str(s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    };
    Ok(Course {
        id: parse(0, &id_str)?,
        title: row.get(1)?,
        instructor_id: parse(2, &instructor_str)?,
        price_usd: row.get(3)?,
        published: row.get(4)?,
        total_duration_minutes: row.get(5)?,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let id_str: String = row.get(0)?;
    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let wallets_json: String = row.get(2)?;
    let payout_wallets: Vec<PayoutWallet> =
        serde_json::from_str(&wallets_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(UserRecord {
        id,
        display_name: row.get(1)?,
        payout_wallets,
        legacy_wallet_address: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursepay_shared::Blockchain;

    #[test]
    fn course_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let course = Course {
            id: Uuid::new_v4(),
            title: "Intro to Soldering".into(),
            instructor_id: Uuid::new_v4(),
            price_usd: 100.0,
            published: true,
            total_duration_minutes: 300,
        };
        db.upsert_course(&course).unwrap();
        let got = db.get_course(course.id).unwrap();
        assert_eq!(got, course);
    }

    #[test]
    fn user_wallets_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let user = UserRecord {
            id: Uuid::new_v4(),
            display_name: "Ada".into(),
            payout_wallets: vec![PayoutWallet {
                blockchain: Blockchain::Evm,
                chain_id: 137,
                address: format!("0x{}", "dd".repeat(20)),
            }],
            legacy_wallet_address: Some(format!("0x{}", "ee".repeat(20))),
        };
        db.upsert_user(&user).unwrap();
        let got = db.get_user(user.id).unwrap();
        assert_eq!(got, user);
        assert!(db.get_user(Uuid::new_v4()).is_err());
    }
}
