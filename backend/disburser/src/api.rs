//! Axum REST API handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::callback::{CallbackCorrelator, CallbackParams};
use crate::config::Config;
use crate::disbursement::{DisbursementOrchestrator, DisbursementRequest};
use crate::errors::{DisburserError, Result};
use crate::finalize::Finalizer;
use crate::funding::{PoolFundingOrchestrator, PoolGrantRequest};
use crate::grant::{AssetAmount, GrantState};
use crate::open_payments::AuthorizationClient;
use crate::store::GrantStore;

pub struct ApiState {
    pub store: Arc<dyn GrantStore>,
    pub funding: PoolFundingOrchestrator,
    pub callback: CallbackCorrelator,
    pub finalizer: Arc<Finalizer>,
    pub disbursements: DisbursementOrchestrator,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn GrantStore>,
        auth: Arc<dyn AuthorizationClient>,
        config: &Config,
    ) -> Self {
        let finalizer = Arc::new(Finalizer::new(store.clone(), auth.clone()));
        Self {
            // An attempt still in flight has at most one outbound request left.
            funding: PoolFundingOrchestrator::new(
                store.clone(),
                auth.clone(),
                config.service_url.clone(),
            )
            .with_stale_request_after(Duration::from_secs(
                config.http_timeout_secs.saturating_mul(2),
            )),
            callback: CallbackCorrelator::new(
                store.clone(),
                config.operator_redirect_url.clone(),
                config.require_interact_hash,
            ),
            disbursements: DisbursementOrchestrator::new(
                store.clone(),
                auth,
                finalizer.clone(),
                config.finalize_on_disburse,
                config.incoming_payment_description.clone(),
            ),
            finalizer,
            store,
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pools/callback", get(complete_interaction))
        .route("/pools/:pool_id", get(pool_status))
        .route("/pools/:pool_id/grant", post(request_pool_grant))
        .route("/pools/:pool_id/finalize", post(finalize))
        .route("/pools/:pool_id/disbursements", post(disburse))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    pub retryable: bool,
}

#[derive(Serialize)]
pub struct PoolStatusResponse {
    pub pool_id: String,
    pub state: GrantState,
    pub sender_wallet: String,
    pub receiver_wallet: String,
    pub total: AssetAmount,
    pub disbursed: u64,
    pub remaining: u64,
    pub redirect_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

impl IntoResponse for DisburserError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {self}");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.kind(),
                message: self.to_string(),
                retryable: self.is_retryable(),
            }),
        )
            .into_response()
    }
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| DisburserError::Validation(rejection.body_text()))
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /pools/:pool_id/grant`
///
/// Starts interactive authorization for the pool. `201` for a new grant,
/// `200` when an identical pending grant is returned again.
pub async fn request_pool_grant(
    State(state): State<Arc<ApiState>>,
    Path(pool_id): Path<String>,
    payload: std::result::Result<Json<PoolGrantRequest>, JsonRejection>,
) -> Result<Response> {
    let mut request = json_body(payload)?;
    request.pool_id = pool_id;

    let pending = state.funding.request_pool_grant(request).await?;
    let status = if pending.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(pending)).into_response())
}

/// `GET /pools/callback?pool_id=&interact_ref=&hash=`
///
/// Where the authorization server sends the funder after approval.
pub async fn complete_interaction(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect> {
    let target = state.callback.complete_interaction(params).await?;
    Ok(Redirect::to(target.as_str()))
}

/// `POST /pools/:pool_id/finalize`
pub async fn finalize(
    State(state): State<Arc<ApiState>>,
    Path(pool_id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.finalizer.finalize(&pool_id).await?))
}

/// `POST /pools/:pool_id/disbursements`
pub async fn disburse(
    State(state): State<Arc<ApiState>>,
    Path(pool_id): Path<String>,
    payload: std::result::Result<Json<DisbursementRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let mut request = json_body(payload)?;
    request.pool_id = pool_id;

    let receipt = state.disbursements.disburse(request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /pools/:pool_id`
///
/// Lifecycle state and spend so far. Never includes tokens.
pub async fn pool_status(
    State(state): State<Arc<ApiState>>,
    Path(pool_id): Path<String>,
) -> Result<Json<PoolStatusResponse>> {
    let grant = state.store.load(&pool_id).await?;
    let disbursed = state.store.disbursed_total(&pool_id).await?;

    Ok(Json(PoolStatusResponse {
        remaining: grant.total.value.saturating_sub(disbursed),
        disbursed,
        pool_id: grant.pool_id,
        state: grant.state,
        sender_wallet: grant.sender_wallet,
        receiver_wallet: grant.receiver_wallet,
        total: grant.total,
        redirect_uri: grant.redirect_uri,
        created_at: grant.created_at,
        last_transition_at: grant.last_transition_at,
    }))
}
