/// Basis point denominator: fee percentages are integers out of 10_000.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Default platform fee when no instructor override is active (20%).
pub const DEFAULT_PLATFORM_FEE_BPS: u16 = 2_000;

/// Default revenue-share carved out of the platform fee (0%).
pub const DEFAULT_REVENUE_SPLIT_BPS: u16 = 0;

/// Default escrow hold period before time-based release (days).
pub const DEFAULT_ESCROW_PERIOD_DAYS: i64 = 14;

/// Consumption progress ceiling above which a refund is denied (percent).
pub const DEFAULT_REFUND_PROGRESS_CEILING: u8 = 20;

/// Progress percentage that triggers early escrow release.
pub const RELEASE_PROGRESS_THRESHOLD: u8 = 90;

/// Accumulated watch time that triggers early release (minutes).
pub const RELEASE_WATCH_MINUTES: u32 = 240;

/// Reduced watch-time threshold for short courses (minutes).
pub const RELEASE_WATCH_MINUTES_SHORT: u32 = 45;

/// A course counts as "short" below this total duration (minutes).
pub const SHORT_COURSE_MINUTES: u32 = 90;

/// Stale `pending`/`failed` purchases older than this are eligible for
/// reconciliation and cleanup (seconds).
pub const STALE_PURCHASE_WINDOW_SECS: i64 = 600;

/// Maximum release candidates fetched per scheduler pass.
pub const SCHEDULER_BATCH_CAP: u32 = 100;

/// Escrows per on-chain batch release call (bounds gas per transaction).
pub const CHAIN_SUB_BATCH_SIZE: usize = 20;

/// Price oracle lookups are abandoned after this long (seconds).
pub const ORACLE_TIMEOUT_SECS: u64 = 3;

/// Gas estimates are padded by this percentage before submission.
pub const GAS_BUFFER_PERCENT: u64 = 20;

/// Default scheduler interval (seconds).
pub const SCHEDULER_INTERVAL_SECS: u64 = 3_600;

/// Delay before the first scheduler pass after process start (seconds).
pub const SCHEDULER_STARTUP_DELAY_SECS: u64 = 30;
