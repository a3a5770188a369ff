//! v001 -- Initial schema creation.
//!
//! The two unique indexes on `purchases` are the concurrency control for
//! purchase creation: the partial index allows at most one non-terminal
//! purchase per (buyer, course), and the approval-hash index makes the
//! buyer's on-chain approval a global idempotency key.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Purchases (the ledger)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS purchases (
    id                   TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    buyer_id             TEXT NOT NULL,              -- UUID, FK -> users(id)
    course_id            TEXT NOT NULL,              -- UUID, FK -> courses(id)
    payment_token_id     TEXT NOT NULL,              -- UUID, FK -> payment_tokens(id)

    -- Monetary (exact integer strings in token base units)
    amount               TEXT NOT NULL,
    usd_equivalent       REAL NOT NULL,              -- informational, quote-time only
    platform_fee         TEXT NOT NULL,
    instructor_fee       TEXT NOT NULL,
    revenue_split        TEXT NOT NULL,
    platform_fee_bps     INTEGER NOT NULL,           -- captured at purchase time
    revenue_split_bps    INTEGER NOT NULL,

    -- Chain linkage
    approval_tx_hash     TEXT NOT NULL,              -- buyer's approval, idempotency key
    escrow_id            TEXT,                       -- opaque handle from the adapter
    escrow_tx_hash       TEXT,                       -- createEscrow submission
    blockchain           TEXT NOT NULL,              -- 'evm' | 'solana'
    chain_id             INTEGER NOT NULL,

    -- State
    status               TEXT NOT NULL,              -- pending|active|completed|failed|refunded|revoked|expired
    escrow_status        TEXT NOT NULL,              -- pending|locked|released|refunded|failed
    release_eligible_at  TEXT NOT NULL,              -- RFC-3339
    release_tx_hash      TEXT,
    refund_tx_hash       TEXT,

    -- Consumption signals (written by the progress subsystem)
    progress_percent     INTEGER NOT NULL DEFAULT 0,
    watch_time_secs      INTEGER NOT NULL DEFAULT 0,
    completed_lessons    TEXT NOT NULL DEFAULT '[]', -- JSON array of lesson ids

    -- Refund bookkeeping
    refund_eligible      INTEGER NOT NULL DEFAULT 0,
    refund_requested_at  TEXT,
    refund_processed_at  TEXT,
    refund_denial_reason TEXT,

    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

-- At most one non-terminal purchase per buyer and course; terminal rows
-- (refunded/revoked/failed/expired) never block a new attempt.
CREATE UNIQUE INDEX IF NOT EXISTS idx_purchases_buyer_course_open
    ON purchases(buyer_id, course_id)
    WHERE status IN ('pending', 'active', 'completed');

CREATE UNIQUE INDEX IF NOT EXISTS idx_purchases_approval_tx
    ON purchases(approval_tx_hash);

CREATE INDEX IF NOT EXISTS idx_purchases_release_scan
    ON purchases(escrow_status, status, release_eligible_at);

CREATE INDEX IF NOT EXISTS idx_purchases_buyer
    ON purchases(buyer_id, created_at DESC);

-- ----------------------------------------------------------------
-- Payment tokens (admin-managed, read-heavy)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS payment_tokens (
    id               TEXT PRIMARY KEY NOT NULL,      -- UUID v4
    symbol           TEXT NOT NULL,
    name             TEXT NOT NULL,
    blockchain       TEXT NOT NULL,
    chain_id         INTEGER NOT NULL,
    token_address    TEXT NOT NULL,
    escrow_address   TEXT NOT NULL,
    registry_address TEXT NOT NULL,
    decimals         INTEGER NOT NULL,
    oracle_strategy  TEXT NOT NULL,                  -- fixed|coingecko|chainlink
    fixed_usd_price  REAL NOT NULL,
    coingecko_id     TEXT,
    chainlink_feed   TEXT,
    active           INTEGER NOT NULL DEFAULT 1,
    enabled          INTEGER NOT NULL DEFAULT 1,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_symbol_chain
    ON payment_tokens(symbol, chain_id);

-- ----------------------------------------------------------------
-- Fee settings
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS platform_settings (
    id                         INTEGER PRIMARY KEY CHECK (id = 1),  -- singleton
    platform_fee_bps           INTEGER NOT NULL,
    revenue_split_bps          INTEGER NOT NULL,
    escrow_period_days         INTEGER NOT NULL,
    refund_progress_ceiling    INTEGER NOT NULL,
    release_progress_threshold INTEGER NOT NULL,
    release_watch_minutes      INTEGER NOT NULL,
    updated_at                 TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instructor_fee_settings (
    instructor_id     TEXT PRIMARY KEY NOT NULL,     -- UUID
    platform_fee_bps  INTEGER NOT NULL,
    revenue_split_bps INTEGER NOT NULL,
    active            INTEGER NOT NULL DEFAULT 0,
    updated_at        TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Admin audit log (append-only; no UPDATE/DELETE API exists)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS admin_audit_log (
    id          TEXT PRIMARY KEY NOT NULL,           -- UUID v4
    actor       TEXT NOT NULL,
    action      TEXT NOT NULL,
    purchase_id TEXT,
    course_id   TEXT,
    target_user TEXT,
    reason      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_created
    ON admin_audit_log(created_at DESC);

-- ----------------------------------------------------------------
-- Collaborator tables (written by the catalog subsystem; the
-- settlement pipeline only reads them)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS courses (
    id                     TEXT PRIMARY KEY NOT NULL, -- UUID v4
    title                  TEXT NOT NULL,
    instructor_id          TEXT NOT NULL,             -- UUID, FK -> users(id)
    price_usd              REAL NOT NULL,
    published              INTEGER NOT NULL DEFAULT 0,
    total_duration_minutes INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS users (
    id                    TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    display_name          TEXT NOT NULL,
    payout_wallets        TEXT NOT NULL DEFAULT '[]', -- JSON [{blockchain, chain_id, address}]
    legacy_wallet_address TEXT                        -- pre-multi-chain single address
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
