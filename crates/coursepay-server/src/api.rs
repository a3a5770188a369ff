//! HTTP API for the settlement pipeline.
//!
//! Public surface: checkout quotes, purchase processing, refunds and
//! purchase history. Admin surface (bearer token, constant-time compare):
//! escrow listing, manual release/refund with a mandatory reason, free
//! access grants/revocations and the audit log.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::info;
use uuid::Uuid;

use coursepay_chain::ChainRegistry;
use coursepay_chain::oracle::PriceOracle;
use coursepay_shared::{Address, ChainKey, TokenAmount};
use coursepay_store::purchases::PurchaseFilter;
use coursepay_store::{AuditLogEntry, EscrowStatus, Purchase, PurchaseStatus};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::orchestrator::{PurchaseOrchestrator, PurchaseRequest};
use crate::quote;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::refund;
use crate::Ledger;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub orchestrator: Arc<PurchaseOrchestrator>,
    pub registry: Arc<ChainRegistry>,
    pub oracle: Arc<PriceOracle>,
    pub config: Arc<ServerConfig>,
}

pub fn router(state: AppState, limiter: RateLimiter) -> Router {
    let payment = Router::new()
        .route("/payment/tokens", get(list_tokens))
        .route("/payment/calculate", post(calculate))
        .route("/payment/purchase", post(purchase))
        .route("/payment/refund", post(request_refund_by_body))
        .route("/purchases/:id/refund", post(request_refund))
        .route("/purchases/student/history", get(purchase_history))
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ));

    let admin = Router::new()
        .route("/admin/escrows", get(admin_list_escrows))
        .route("/admin/escrows/:id/release", post(admin_release))
        .route("/admin/escrows/:id/refund", post(admin_refund))
        .route("/admin/access/grant", post(admin_grant_access))
        .route("/admin/access/revoke", post(admin_revoke_access))
        .route("/admin/audit", get(admin_audit_log));

    Router::new()
        .route("/health", get(health))
        .route("/info", get(info_endpoint))
        .merge(payment)
        .merge(admin)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    limiter: RateLimiter,
    addr: std::net::SocketAddr,
) -> anyhow::Result<()> {
    let app = router(state, limiter);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn info_endpoint(State(state): State<AppState>) -> Json<Value> {
    let chains: Vec<String> = state.registry.keys().map(|k| k.to_string()).collect();
    Json(json!({
        "service": "coursepay",
        "version": env!("CARGO_PKG_VERSION"),
        "production": state.config.production,
        "chains": chains,
    }))
}

// ---------------------------------------------------------------------------
// Public payment surface
// ---------------------------------------------------------------------------

async fn list_tokens(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let tokens = { state.ledger.lock().await.active_payment_tokens()? };

    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        let price = state
            .oracle
            .usd_price(&quote::price_spec(&token, &state.config))
            .await;
        out.push(json!({
            "id": token.id,
            "symbol": token.symbol,
            "name": token.name,
            "blockchain": token.blockchain,
            "chainId": token.chain_id,
            "tokenAddress": token.token_address,
            "escrowAddress": token.escrow_address,
            "decimals": token.decimals,
            "usdPrice": price.usd,
            "priceSource": price.source.as_str(),
        }));
    }
    Ok(Json(json!({ "tokens": out })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalculateRequest {
    course_id: Uuid,
    payment_token_id: Uuid,
}

async fn calculate(
    State(state): State<AppState>,
    Json(req): Json<CalculateRequest>,
) -> Result<Json<quote::PaymentQuote>, ApiError> {
    let quote = state
        .orchestrator
        .calculate(req.course_id, req.payment_token_id)
        .await?;
    Ok(Json(quote))
}

async fn purchase(
    State(state): State<AppState>,
    Json(req): Json<PurchaseRequest>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.orchestrator.process_purchase(&req).await?;
    Ok(Json(json!({
        "purchaseId": outcome.purchase_id,
        "escrowId": outcome.escrow_id,
        "escrowTxHash": outcome.escrow_tx_hash,
        "status": outcome.status,
        "releaseEligibleAt": outcome.release_eligible_at,
    })))
}

async fn request_refund(
    State(state): State<AppState>,
    Path(purchase_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    execute_refund_response(&state, purchase_id).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundBody {
    purchase_id: Uuid,
}

/// Body-based twin of `POST /purchases/:id/refund`, kept for checkout
/// clients that post against the payment namespace.
async fn request_refund_by_body(
    State(state): State<AppState>,
    Json(body): Json<RefundBody>,
) -> Result<Json<Value>, ApiError> {
    execute_refund_response(&state, body.purchase_id).await
}

async fn execute_refund_response(
    state: &AppState,
    purchase_id: Uuid,
) -> Result<Json<Value>, ApiError> {
    let outcome = refund::execute_refund(&state.ledger, &state.registry, purchase_id).await?;
    Ok(Json(json!({
        "purchaseId": outcome.purchase_id,
        "refundTxHash": outcome.refund_tx_hash,
        "status": "refunded",
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    buyer_id: Uuid,
}

async fn purchase_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let (purchases, ceiling) = {
        let db = state.ledger.lock().await;
        let purchases = db.purchases_for_buyer(query.buyer_id)?;
        let ceiling = db.platform_settings()?.refund_progress_ceiling;
        (purchases, ceiling)
    };

    let now = Utc::now();
    let out: Vec<Value> = purchases
        .into_iter()
        .map(|p| {
            let (eligible, denial) = match refund::evaluate_refund(&p, now, ceiling) {
                refund::RefundDecision::Eligible => (true, None),
                refund::RefundDecision::Ineligible(d) => (false, Some(d.to_string())),
            };
            json!({
                "purchase": p,
                "refundEligibleNow": eligible,
                "refundDenialReason": denial,
            })
        })
        .collect();

    Ok(Json(json!({ "purchases": out })))
}

// ---------------------------------------------------------------------------
// Admin surface
// ---------------------------------------------------------------------------

/// Constant-time admin bearer check. A missing `ADMIN_TOKEN` disables
/// the whole admin surface.
fn require_admin(config: &ServerConfig, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = config
        .admin_token
        .as_deref()
        .ok_or_else(|| ApiError::Forbidden("admin API disabled".into()))?;

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Forbidden("missing bearer token".into()))?;

    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("invalid admin token".into()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EscrowListQuery {
    escrow_status: Option<String>,
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    50
}

async fn admin_list_escrows(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EscrowListQuery>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config, &headers)?;

    let escrow_status = match query.escrow_status.as_deref() {
        None => None,
        Some(s) => Some(
            EscrowStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown escrow status: {s}")))?,
        ),
    };
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(
            PurchaseStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {s}")))?,
        ),
    };

    let purchases = {
        state.ledger.lock().await.list_purchases(&PurchaseFilter {
            escrow_status,
            status,
            blockchain: None,
            chain_id: None,
            limit: query.limit.min(500),
            offset: query.offset,
        })?
    };
    Ok(Json(json!({ "purchases": purchases })))
}

#[derive(Debug, Deserialize)]
struct AdminActionRequest {
    reason: String,
}

fn require_reason(req: &AdminActionRequest) -> Result<&str, ApiError> {
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::BadRequest(
            "a reason is required for admin actions".into(),
        ));
    }
    Ok(reason)
}

async fn admin_release(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(purchase_id): Path<Uuid>,
    Json(req): Json<AdminActionRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config, &headers)?;
    let reason = require_reason(&req)?.to_string();

    let (purchase, contract) = load_escrow_target(&state, purchase_id).await?;
    let escrow_id = purchase
        .escrow_id
        .as_ref()
        .ok_or_else(|| ApiError::Conflict("purchase has no escrow".into()))?;

    let key = ChainKey::new(purchase.blockchain, purchase.chain_id);
    let chain = state
        .registry
        .get(&key)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let receipt = chain
        .release_escrow(&contract, escrow_id)
        .await
        .map_err(|e| ApiError::Internal(format!("release failed: {e}")))?;

    {
        let db = state.ledger.lock().await;
        db.mark_escrow_released(purchase_id, &receipt.tx_hash)?;
        db.append_audit(&audit_entry(
            "manual_release",
            Some(purchase_id),
            Some(purchase.course_id),
            None,
            &reason,
        ))?;
    }
    info!(purchase = %purchase_id, %reason, "admin released escrow");

    Ok(Json(json!({
        "purchaseId": purchase_id,
        "releaseTxHash": receipt.tx_hash,
        "status": "released",
    })))
}

async fn admin_refund(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(purchase_id): Path<Uuid>,
    Json(req): Json<AdminActionRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config, &headers)?;
    let reason = require_reason(&req)?.to_string();

    let (purchase, contract) = load_escrow_target(&state, purchase_id).await?;
    let escrow_id = purchase
        .escrow_id
        .as_ref()
        .ok_or_else(|| ApiError::Conflict("purchase has no escrow".into()))?;

    let key = ChainKey::new(purchase.blockchain, purchase.chain_id);
    let chain = state
        .registry
        .get(&key)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let receipt = chain
        .refund_escrow(&contract, escrow_id)
        .await
        .map_err(|e| ApiError::Internal(format!("refund failed: {e}")))?;

    {
        let db = state.ledger.lock().await;
        db.mark_escrow_refunded(purchase_id, &receipt.tx_hash)?;
        db.append_audit(&audit_entry(
            "manual_refund",
            Some(purchase_id),
            Some(purchase.course_id),
            None,
            &reason,
        ))?;
    }
    info!(purchase = %purchase_id, %reason, "admin refunded escrow");

    Ok(Json(json!({
        "purchaseId": purchase_id,
        "refundTxHash": receipt.tx_hash,
        "status": "refunded",
    })))
}

async fn load_escrow_target(
    state: &AppState,
    purchase_id: Uuid,
) -> Result<(Purchase, Address), ApiError> {
    let db = state.ledger.lock().await;
    let purchase = db.get_purchase(purchase_id)?;
    let token = db.get_payment_token(purchase.payment_token_id)?;
    let contract = Address::parse(&token.escrow_address, token.blockchain)
        .ok_or_else(|| ApiError::Internal("invalid escrow contract address".into()))?;
    Ok((purchase, contract))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantAccessRequest {
    student_id: Uuid,
    course_id: Uuid,
    reason: String,
}

/// Grant free access: a zero-amount active purchase with no escrow.
/// Neither the release scan (wants a locked escrow) nor the stale sweep
/// (wants a pending/failed status) will ever touch it.
async fn admin_grant_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GrantAccessRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config, &headers)?;
    let reason = req.reason.trim().to_string();
    if reason.is_empty() {
        return Err(ApiError::BadRequest(
            "a reason is required for admin actions".into(),
        ));
    }

    let db = state.ledger.lock().await;
    let course = db.get_course(req.course_id)?;
    let token = db
        .active_payment_tokens()?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Internal("no payment token configured".into()))?;

    let now = Utc::now();
    let purchase = Purchase {
        id: Uuid::new_v4(),
        buyer_id: req.student_id,
        course_id: req.course_id,
        payment_token_id: token.id,
        amount: TokenAmount::ZERO,
        usd_equivalent: 0.0,
        platform_fee: TokenAmount::ZERO,
        instructor_fee: TokenAmount::ZERO,
        revenue_split: TokenAmount::ZERO,
        platform_fee_bps: 0,
        revenue_split_bps: 0,
        approval_tx_hash: coursepay_shared::TxHash::from_trusted(format!(
            "admin-grant-{}",
            Uuid::new_v4()
        )),
        escrow_id: None,
        escrow_tx_hash: None,
        blockchain: token.blockchain,
        chain_id: token.chain_id,
        status: PurchaseStatus::Active,
        escrow_status: EscrowStatus::Pending,
        release_eligible_at: now,
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
    db.insert_purchase(&purchase)?;
    db.append_audit(&audit_entry(
        "grant_access",
        Some(purchase.id),
        Some(course.id),
        Some(req.student_id),
        &reason,
    ))?;
    info!(student = %req.student_id, course = %course.id, "admin granted free access");

    Ok(Json(json!({ "purchaseId": purchase.id, "status": "active" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeAccessRequest {
    purchase_id: Uuid,
    reason: String,
}

async fn admin_revoke_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RevokeAccessRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config, &headers)?;
    let reason = req.reason.trim().to_string();
    if reason.is_empty() {
        return Err(ApiError::BadRequest(
            "a reason is required for admin actions".into(),
        ));
    }

    let db = state.ledger.lock().await;
    let purchase = db.get_purchase(req.purchase_id)?;
    db.mark_revoked(req.purchase_id)?;
    db.append_audit(&audit_entry(
        "revoke_access",
        Some(req.purchase_id),
        Some(purchase.course_id),
        Some(purchase.buyer_id),
        &reason,
    ))?;
    info!(purchase = %req.purchase_id, "admin revoked access");

    Ok(Json(json!({ "purchaseId": req.purchase_id, "status": "revoked" })))
}

async fn admin_audit_log(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config, &headers)?;
    let entries = { state.ledger.lock().await.recent_audit_entries(100)? };
    Ok(Json(json!({ "entries": entries })))
}

fn audit_entry(
    action: &str,
    purchase_id: Option<Uuid>,
    course_id: Option<Uuid>,
    target_user: Option<Uuid>,
    reason: &str,
) -> AuditLogEntry {
    AuditLogEntry {
        id: Uuid::new_v4(),
        actor: "admin".into(),
        action: action.into(),
        purchase_id,
        course_id,
        target_user,
        reason: reason.into(),
        created_at: Utc::now(),
    }
}
