//! HTTP surface: route table, request/response shapes, and the mapping
//! from `PassError` to status codes. Caller identity arrives as an
//! `actor_id` body field; session issuance is an external collaborator.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use gatepass_core::error::{PassError, Severity};
use gatepass_core::gate::{GateDecision, GateReport, GateVerifier};
use gatepass_core::lifecycle::{Decision, NewRequest, RequestLifecycle};
use gatepass_core::model::{DelegationRow, RequestRow, TrustAdjustmentRow};
use gatepass_core::status::{GateEvent, RequestStatus};
use gatepass_core::store::PassStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PassStore>,
    pub lifecycle: Arc<RequestLifecycle>,
    pub gate: Arc<GateVerifier>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/requests", post(create_request))
        .route(
            "/api/requests/:id",
            get(get_request).put(edit_request).delete(cancel_request),
        )
        .route("/api/queue/:actor_id", get(approval_queue))
        .route("/api/queue/:id/status", put(decide_queue))
        .route("/api/wardens/:id/verify", put(warden_verify))
        .route("/api/gate/verify", post(gate_verify))
        .route("/api/gate/log-action", post(gate_log))
        .route("/api/students/:id/trust", get(trust_history).post(trust_adjust))
        .route("/api/students/:id/reset-cooldown", post(reset_cooldown))
        .route("/api/students/:id/block", post(set_block))
        .route("/api/delegations", post(grant_delegation))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

// ── Response envelope ──

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

#[derive(Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

/// Wrapper so `PassError` can flow out of handlers with `?`.
pub struct AppError(PassError);

impl From<PassError> for AppError {
    fn from(e: PassError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PassError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PassError::StateConflict { .. } => StatusCode::CONFLICT,
            PassError::Authorization(_) => StatusCode::FORBIDDEN,
            PassError::Eligibility { .. } => StatusCode::FORBIDDEN,
            PassError::NotFound(..) => StatusCode::NOT_FOUND,
            PassError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let severity = match &self.0 {
            PassError::Eligibility { severity, .. } => Some(*severity),
            _ => None,
        };
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiError {
                code: self.0.code(),
                message: self.0.to_string(),
                severity,
            }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

// ── Handlers ──

async fn health() -> Json<ApiResponse<&'static str>> {
    ApiResponse::ok("ok")
}

async fn create_request(
    State(state): State<AppState>,
    Json(body): Json<NewRequest>,
) -> ApiResult<RequestRow> {
    let row = state.lifecycle.create(body).await?;
    Ok(ApiResponse::ok(row))
}

#[derive(Serialize)]
struct RequestDetail {
    request: RequestRow,
    gate: GateDecision,
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<RequestDetail> {
    let request = state.lifecycle.get(id).await?;
    let student = state
        .store
        .student(request.student_id)
        .await
        .map_err(PassError::from)?
        .ok_or(PassError::NotFound("student", request.student_id))?;
    let gate = state.gate.evaluate(&request, &student, Utc::now()).await?;
    Ok(ApiResponse::ok(RequestDetail { request, gate }))
}

async fn approval_queue(
    State(state): State<AppState>,
    Path(actor_id): Path<Uuid>,
) -> ApiResult<Vec<RequestRow>> {
    let rows = state.lifecycle.queue_for(actor_id).await?;
    Ok(ApiResponse::ok(rows))
}

#[derive(Deserialize)]
struct DecisionBody {
    actor_id: Uuid,
    status: Decision,
    reason: Option<String>,
    #[serde(default)]
    trust_override: bool,
}

/// Stage-1/2 decision: routed by the request's current status.
async fn decide_queue(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<RequestRow> {
    let request = state.lifecycle.get(id).await?;
    let row = match request.status {
        RequestStatus::Pending => {
            state
                .lifecycle
                .decide_stage1(id, body.actor_id, body.status, body.reason)
                .await?
        }
        RequestStatus::Recommended => {
            state
                .lifecycle
                .decide_stage2(id, body.actor_id, body.status, body.reason)
                .await?
        }
        other => {
            return Err(PassError::StateConflict {
                expected: "pending or recommended",
                actual: other.to_string(),
            }
            .into())
        }
    };
    Ok(ApiResponse::ok(row))
}

async fn warden_verify(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<RequestRow> {
    let row = state
        .lifecycle
        .decide_stage3(id, body.actor_id, body.status, body.reason, body.trust_override)
        .await?;
    Ok(ApiResponse::ok(row))
}

#[derive(Deserialize)]
struct CancelParams {
    student_id: Uuid,
}

async fn cancel_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<CancelParams>,
) -> ApiResult<RequestRow> {
    let row = state.lifecycle.cancel(id, params.student_id).await?;
    Ok(ApiResponse::ok(row))
}

async fn edit_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<NewRequest>,
) -> ApiResult<RequestRow> {
    let caller = body.student_id;
    let row = state.lifecycle.edit(id, caller, body).await?;
    Ok(ApiResponse::ok(row))
}

#[derive(Deserialize)]
struct GateVerifyBody {
    identifier: String,
}

async fn gate_verify(
    State(state): State<AppState>,
    Json(body): Json<GateVerifyBody>,
) -> ApiResult<GateReport> {
    let report = state.gate.verify(&body.identifier, Utc::now()).await?;
    Ok(ApiResponse::ok(report))
}

#[derive(Deserialize)]
struct GateLogBody {
    request_id: Uuid,
    action: GateEvent,
    gatekeeper_id: Uuid,
}

async fn gate_log(
    State(state): State<AppState>,
    Json(body): Json<GateLogBody>,
) -> ApiResult<GateReport> {
    let report = state
        .gate
        .log_action(body.request_id, body.action, body.gatekeeper_id, Utc::now())
        .await?;
    Ok(ApiResponse::ok(report))
}

async fn trust_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<TrustAdjustmentRow>> {
    let rows = state.lifecycle.trust_ledger().history(id).await?;
    Ok(ApiResponse::ok(rows))
}

#[derive(Deserialize)]
struct TrustAdjustBody {
    actor_id: Uuid,
    delta: i32,
    reason: String,
}

async fn trust_adjust(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TrustAdjustBody>,
) -> ApiResult<i32> {
    let new_score = state
        .lifecycle
        .trust_ledger()
        .adjust(id, body.delta, &body.reason, &body.actor_id.to_string())
        .await?;
    Ok(ApiResponse::ok(new_score))
}

async fn reset_cooldown(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<()> {
    state.lifecycle.trust_ledger().reset_cooldown(id).await?;
    Ok(ApiResponse::ok(()))
}

#[derive(Deserialize)]
struct BlockBody {
    blocked: bool,
}

async fn set_block(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<BlockBody>,
) -> ApiResult<()> {
    state.lifecycle.set_pass_block(id, body.blocked).await?;
    Ok(ApiResponse::ok(()))
}

#[derive(Deserialize)]
struct DelegationBody {
    authority_id: Uuid,
    delegate_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
}

async fn grant_delegation(
    State(state): State<AppState>,
    Json(body): Json<DelegationBody>,
) -> ApiResult<DelegationRow> {
    let row = state
        .lifecycle
        .resolver()
        .grant_delegation(body.authority_id, body.delegate_id, body.starts_at, body.ends_at)
        .await?;
    Ok(ApiResponse::ok(row))
}
