//! Fee and price calculation for checkout.
//!
//! Converts a course's USD price into exact token base units via the
//! price oracle, applies the instructor's effective fee rates, and
//! returns everything the client needs to render checkout and sign the
//! approval. Conversion always truncates toward zero so a buyer is never
//! asked to approve more than the USD price implies.

use tracing::debug;
use uuid::Uuid;

use coursepay_chain::oracle::{PriceOracle, TokenPriceSpec};
use coursepay_shared::{fees, Address, Blockchain, TokenAmount};
use coursepay_store::{Course, Database, PaymentToken};
use serde::Serialize;

use crate::config::ServerConfig;
use crate::error::ApiError;

/// A complete checkout quote for one (course, token) pair.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentQuote {
    pub course_id: Uuid,
    pub payment_token_id: Uuid,
    pub token_symbol: String,
    pub blockchain: Blockchain,
    pub chain_id: u64,
    pub token_address: String,
    pub escrow_address: String,
    pub decimals: u8,

    pub course_price_usd: f64,
    pub token_usd_price: f64,
    /// "live", "cached" or "fixed".
    pub price_source: &'static str,

    /// Exact amount in base units the buyer must approve.
    pub amount: TokenAmount,
    /// The same amount as a human-readable decimal string.
    pub amount_decimal: String,

    pub platform_fee: TokenAmount,
    pub instructor_fee: TokenAmount,
    pub revenue_split: TokenAmount,
    pub platform_fee_bps: u16,
    pub revenue_split_bps: u16,

    pub escrow_period_days: i64,
}

/// The oracle inputs for a token row. Chainlink reads go through the
/// chain's configured RPC endpoint.
pub fn price_spec(token: &PaymentToken, config: &ServerConfig) -> TokenPriceSpec {
    let rpc_url = config
        .chains
        .iter()
        .find(|c| c.key.blockchain == token.blockchain && c.key.chain_id == token.chain_id)
        .map(|c| c.rpc_url.clone());
    TokenPriceSpec {
        symbol: token.symbol.clone(),
        strategy: token.oracle_strategy,
        fixed_usd_price: token.fixed_usd_price,
        coingecko_id: token.coingecko_id.clone(),
        chainlink_feed: token
            .chainlink_feed
            .as_ref()
            .and_then(|f| Address::parse(f, token.blockchain)),
        rpc_url,
    }
}

/// Build a quote for a published course paid with an active token.
///
/// Written as a sync fn returning a future rather than an `async fn`:
/// `Database` is not `Sync`, and an `async fn` would capture the `&Database`
/// argument in its future, making the axum handler future non-`Send`. All
/// database reads happen synchronously before the returned future is built.
pub fn build_quote<'a>(
    db: &Database,
    oracle: &'a PriceOracle,
    config: &'a ServerConfig,
    course: &'a Course,
    token: &'a PaymentToken,
) -> impl std::future::Future<Output = Result<PaymentQuote, ApiError>> + Send + 'a {
    let effective = db.effective_fees(course.instructor_id);
    let settings = db.platform_settings();
    async move {
        let effective = effective?;
        let escrow_period_days = settings?.escrow_period_days;
        let price = oracle.usd_price(&price_spec(token, config)).await;

        let amount =
            TokenAmount::from_usd(course.price_usd, price.usd, token.decimals).map_err(|e| {
                // A quote this broken means token configuration, not user input.
                tracing::error!(token = %token.symbol, error = %e, "unusable price quote");
                ApiError::Misconfigured
            })?;
        let breakdown = fees::split_amount(amount, &effective);

        debug!(
            course = %course.id,
            token = %token.symbol,
            usd = price.usd,
            source = price.source.as_str(),
            amount = %amount,
            "payment quote"
        );

        Ok(PaymentQuote {
            course_id: course.id,
            payment_token_id: token.id,
            token_symbol: token.symbol.clone(),
            blockchain: token.blockchain,
            chain_id: token.chain_id,
            token_address: token.token_address.clone(),
            escrow_address: token.escrow_address.clone(),
            decimals: token.decimals,
            course_price_usd: course.price_usd,
            token_usd_price: price.usd,
            price_source: price.source.as_str(),
            amount,
            amount_decimal: amount.to_decimal_string(token.decimals),
            platform_fee: breakdown.platform_fee,
            instructor_fee: breakdown.instructor_fee,
            revenue_split: breakdown.revenue_split,
            platform_fee_bps: effective.platform_bps.value(),
            revenue_split_bps: effective.revenue_split_bps.value(),
            escrow_period_days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coursepay_shared::OracleStrategy;
    use coursepay_store::UserRecord;

    fn seed(db: &Database) -> (Course, PaymentToken) {
        let instructor = Uuid::new_v4();
        db.upsert_user(&UserRecord {
            id: instructor,
            display_name: "Ada".into(),
            payout_wallets: vec![],
            legacy_wallet_address: None,
        })
        .unwrap();
        let course = Course {
            id: Uuid::new_v4(),
            title: "Rust for Embedded".into(),
            instructor_id: instructor,
            price_usd: 100.0,
            published: true,
            total_duration_minutes: 300,
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
        (course, token)
    }

    #[tokio::test]
    async fn hundred_dollar_course_in_stablecoin() {
        let db = Database::open_in_memory().unwrap();
        let (course, token) = seed(&db);
        let oracle = PriceOracle::new();
        let config = ServerConfig::default();

        let quote = build_quote(&db, &oracle, &config, &course, &token)
            .await
            .unwrap();

        assert_eq!(quote.amount.base_units(), 100_000_000);
        assert_eq!(quote.platform_fee.base_units(), 20_000_000);
        assert_eq!(quote.instructor_fee.base_units(), 80_000_000);
        assert_eq!(quote.price_source, "fixed");
        assert_eq!(quote.amount_decimal, "100.000000");
        assert_eq!(
            quote.platform_fee.base_units() + quote.instructor_fee.base_units(),
            quote.amount.base_units()
        );
    }

    #[tokio::test]
    async fn conversion_never_rounds_up() {
        let db = Database::open_in_memory().unwrap();
        let (mut course, mut token) = seed(&db);
        // $10 at a price that does not divide evenly.
        course.price_usd = 10.0;
        db.upsert_course(&course).unwrap();
        token.id = Uuid::new_v4();
        token.symbol = "WETH".into();
        token.fixed_usd_price = 3.0;
        db.insert_payment_token(&token).unwrap();

        let oracle = PriceOracle::new();
        let config = ServerConfig::default();
        let quote = build_quote(&db, &oracle, &config, &course, &token)
            .await
            .unwrap();

        // 10/3 = 3.333... truncated at 6 decimals.
        assert_eq!(quote.amount.base_units(), 3_333_333);
    }
}
