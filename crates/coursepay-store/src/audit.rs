//! Admin audit log.
//!
//! Append-only by construction: this module exposes insert and list, and
//! nothing in the crate issues UPDATE or DELETE against the table.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::Result;
use crate::models::AuditLogEntry;

impl Database {
    pub fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.conn().execute(
            "INSERT INTO admin_audit_log
                 (id, actor, action, purchase_id, course_id, target_user, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id.to_string(),
                entry.actor,
                entry.action,
                entry.purchase_id.map(|u| u.to_string()),
                entry.course_id.map(|u| u.to_string()),
                entry.target_user.map(|u| u.to_string()),
                entry.reason,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_audit_entries(&self, limit: u32) -> Result<Vec<AuditLogEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, actor, action, purchase_id, course_id, target_user, reason, created_at
             FROM admin_audit_log ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_audit_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

fn row_to_audit_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    fn bad(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    }
    fn opt_uuid(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
        let s: Option<String> = row.get(idx)?;
        match s {
            None => Ok(None),
            Some(s) => Uuid::parse_str(&s).map(Some).map_err(|e| bad(idx, e)),
        }
    }

    let id_str: String = row.get(0)?;
    let ts_str: String = row.get(7)?;
    Ok(AuditLogEntry {
        id: Uuid::parse_str(&id_str).map_err(|e| bad(0, e))?,
        actor: row.get(1)?,
        action: row.get(2)?,
        purchase_id: opt_uuid(row, 3)?,
        course_id: opt_uuid(row, 4)?,
        target_user: opt_uuid(row, 5)?,
        reason: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&ts_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| bad(7, e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_list() {
        let db = Database::open_in_memory().unwrap();
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            actor: "admin".into(),
            action: "manual_release".into(),
            purchase_id: Some(Uuid::new_v4()),
            course_id: None,
            target_user: None,
            reason: "support ticket #4412".into(),
            created_at: Utc::now(),
        };
        db.append_audit(&entry).unwrap();

        let entries = db.recent_audit_entries(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "manual_release");
        assert_eq!(entries[0].reason, "support ticket #4412");
    }
}
