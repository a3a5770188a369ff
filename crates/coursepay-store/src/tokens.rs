//! Payment token configuration CRUD.
//!
//! Tokens are created and updated only by admin action; everything on the
//! purchase path just reads them.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use coursepay_shared::{Blockchain, OracleStrategy};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::PaymentToken;

const TOKEN_COLS: &str = "id, symbol, name, blockchain, chain_id, token_address, escrow_address, \
     registry_address, decimals, oracle_strategy, fixed_usd_price, coingecko_id, chainlink_feed, \
     active, enabled, created_at, updated_at";

impl Database {
    pub fn insert_payment_token(&self, t: &PaymentToken) -> Result<()> {
        self.conn().execute(
            &format!("INSERT INTO payment_tokens ({TOKEN_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"),
            params![
                t.id.to_string(),
                t.symbol,
                t.name,
                t.blockchain.as_str(),
                t.chain_id,
                t.token_address,
                t.escrow_address,
                t.registry_address,
                t.decimals,
                t.oracle_strategy.as_str(),
                t.fixed_usd_price,
                t.coingecko_id.as_deref(),
                t.chainlink_feed.as_deref(),
                t.active,
                t.enabled,
                t.created_at.to_rfc3339(),
                t.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_payment_token(&self, id: Uuid) -> Result<PaymentToken> {
        self.conn()
            .query_row(
                &format!("SELECT {TOKEN_COLS} FROM payment_tokens WHERE id = ?1"),
                params![id.to_string()],
                row_to_token,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// All tokens currently usable for new purchases.
    pub fn active_payment_tokens(&self) -> Result<Vec<PaymentToken>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {TOKEN_COLS} FROM payment_tokens
             WHERE active = 1 AND enabled = 1
             ORDER BY symbol ASC"
        ))?;
        let rows = stmt.query_map([], row_to_token)?;
        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?);
        }
        Ok(tokens)
    }

    pub fn set_token_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE payment_tokens SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentToken> {
    fn bad(idx: usize, msg: String) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
    }

    let id_str: String = row.get(0)?;
    let id = Uuid::parse_str(&id_str).map_err(|e| bad(0, e.to_string()))?;
    let blockchain_str: String = row.get(3)?;
    let blockchain = Blockchain::parse(&blockchain_str)
        .ok_or_else(|| bad(3, format!("unknown blockchain: {blockchain_str}")))?;
    let strategy_str: String = row.get(9)?;
    let oracle_strategy = OracleStrategy::parse(&strategy_str)
        .ok_or_else(|| bad(9, format!("unknown oracle strategy: {strategy_str}")))?;

    let parse_ts = |idx: usize| -> rusqlite::Result<DateTime<Utc>> {
        let s: String = row.get(idx)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| bad(idx, e.to_string()))
    };

    Ok(PaymentToken {
        id,
        symbol: row.get(1)?,
        name: row.get(2)?,
        blockchain,
        chain_id: row.get(4)?,
        token_address: row.get(5)?,
        escrow_address: row.get(6)?,
        registry_address: row.get(7)?,
        decimals: row.get(8)?,
        oracle_strategy,
        fixed_usd_price: row.get(10)?,
        coingecko_id: row.get(11)?,
        chainlink_feed: row.get(12)?,
        active: row.get(13)?,
        enabled: row.get(14)?,
        created_at: parse_ts(15)?,
        updated_at: parse_ts(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn usdc(chain_id: u64) -> PaymentToken {
        let now = Utc::now();
        PaymentToken {
            id: Uuid::new_v4(),
            symbol: "USDC".into(),
            name: "USD Coin".into(),
            blockchain: Blockchain::Evm,
            chain_id,
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
        }
    }

    #[test]
    fn insert_and_fetch() {
        let db = Database::open_in_memory().unwrap();
        let t = usdc(137);
        db.insert_payment_token(&t).unwrap();
        let got = db.get_payment_token(t.id).unwrap();
        assert_eq!(got.symbol, "USDC");
        assert_eq!(got.decimals, 6);
    }

    #[test]
    fn symbol_chain_pair_is_unique() {
        let db = Database::open_in_memory().unwrap();
        db.insert_payment_token(&usdc(137)).unwrap();
        assert!(db.insert_payment_token(&usdc(137)).is_err());
        // Same symbol on another chain is fine.
        db.insert_payment_token(&usdc(1)).unwrap();
    }

    #[test]
    fn disabled_tokens_drop_out_of_active_list() {
        let db = Database::open_in_memory().unwrap();
        let t = usdc(137);
        db.insert_payment_token(&t).unwrap();
        assert_eq!(db.active_payment_tokens().unwrap().len(), 1);

        db.set_token_enabled(t.id, false).unwrap();
        assert!(db.active_payment_tokens().unwrap().is_empty());
    }
}
