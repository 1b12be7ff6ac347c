//! HTTP API for the escrow daemon.
//!
//! Provides REST endpoints for:
//! - Health check
//! - Agreement registration (optionally funded in the same call)
//! - Per-role workflow status
//! - Lifecycle operations (fund, accept, start, submit, review, withdraw, cancel, dispute)
//! - Interruption check and per-kind recovery
//!
//! The acting role is always supplied by the caller.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use escrow_domain::{AgreementDraft, AgreementId, MirrorRecord, OperationKind, Role};
use escrow_exec::{IdentityPort, LedgerError, LedgerPort};
use escrow_store::{Store, StoreError};

use crate::error::DaemonError;
use crate::workflow::{
    InterruptionReport, OperationOutcome, OperationStatus, RecoveryReport, WorkflowOrchestrator,
    WorkflowStatus,
};

// =============================================================================
// API State
// =============================================================================

/// Shared state for API handlers.
pub struct ApiState<L: LedgerPort + 'static, I: IdentityPort + 'static, S: Store + 'static> {
    pub orchestrator: Arc<WorkflowOrchestrator<L, I, S>>,
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Request to register an agreement.
#[derive(Debug, Deserialize)]
pub struct CreateAgreementRequest {
    #[serde(flatten)]
    pub draft: AgreementDraft,
    /// Fund on behalf of the needer right after registration
    #[serde(default)]
    pub fund: bool,
}

/// Response after registering an agreement.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAgreementResponse {
    pub agreement: MirrorRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding: Option<OperationOutcome>,
}

/// Acting role, for operations with no other input.
#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: Role,
}

/// Request to submit work for review.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub role: Role,
    pub note: String,
}

/// Request to review submitted work.
#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub role: Role,
    pub approved: bool,
    #[serde(default)]
    pub comments: Option<String>,
}

/// Query for the status endpoint.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub role: Role,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub outcome: OperationStatus,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

// =============================================================================
// Router
// =============================================================================

/// Create the API router.
pub fn create_router<L, I, S>(state: Arc<ApiState<L, I, S>>) -> Router
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    Router::new()
        .route("/health", get(health_handler))
        .route("/agreements", post(create_handler))
        .route("/agreements/:id", get(get_agreement_handler))
        .route("/agreements/:id/status", get(status_handler))
        .route("/agreements/:id/fund", post(fund_handler))
        .route("/agreements/:id/accept", post(accept_handler))
        .route("/agreements/:id/start", post(start_handler))
        .route("/agreements/:id/submit", post(submit_handler))
        .route("/agreements/:id/review", post(review_handler))
        .route("/agreements/:id/withdraw", post(withdraw_handler))
        .route("/agreements/:id/cancel", post(cancel_handler))
        .route("/agreements/:id/dispute", post(dispute_handler))
        .route("/agreements/:id/interrupted", get(interrupted_handler))
        .route("/agreements/:id/interrupted/clear", post(clear_orphaned_handler))
        .route("/agreements/:id/recover/:kind", post(recover_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Register an agreement, funding it when requested.
async fn create_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Json(req): Json<CreateAgreementRequest>,
) -> Result<(StatusCode, Json<CreateAgreementResponse>), ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let orchestrator = &state.orchestrator;
    let agreement_id = req.draft.agreement_id.clone();

    let funding = if req.fund {
        Some(orchestrator.create_agreement(req.draft).await.map_err(to_error_response)?)
    } else {
        orchestrator.register_agreement(req.draft).await.map_err(to_error_response)?;
        None
    };
    let agreement = orchestrator.load(&agreement_id).await.map_err(to_error_response)?;

    Ok((StatusCode::CREATED, Json(CreateAgreementResponse { agreement, funding })))
}

/// Get the mirror record.
async fn get_agreement_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
) -> Result<Json<MirrorRecord>, ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    let record = state.orchestrator.load(&agreement_id).await.map_err(to_error_response)?;
    Ok(Json(record))
}

/// Per-role workflow status.
async fn status_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<WorkflowStatus>, ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    let status = state
        .orchestrator
        .get_workflow_status(&agreement_id, query.role)
        .await
        .map_err(to_error_response)?;
    Ok(Json(status))
}

async fn fund_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
    Json(req): Json<RoleRequest>,
) -> Result<(StatusCode, Json<OperationOutcome>), ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    operation_response(state.orchestrator.fund(&agreement_id, req.role).await)
}

async fn accept_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
    Json(req): Json<RoleRequest>,
) -> Result<(StatusCode, Json<OperationOutcome>), ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    operation_response(state.orchestrator.accept(&agreement_id, req.role).await)
}

async fn start_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
    Json(req): Json<RoleRequest>,
) -> Result<(StatusCode, Json<OperationOutcome>), ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    operation_response(state.orchestrator.start_work(&agreement_id, req.role).await)
}

async fn submit_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<OperationOutcome>), ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    operation_response(
        state
            .orchestrator
            .submit_for_review(&agreement_id, req.role, req.note)
            .await,
    )
}

async fn review_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> Result<(StatusCode, Json<OperationOutcome>), ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    operation_response(
        state
            .orchestrator
            .review_submission(&agreement_id, req.role, req.approved, req.comments)
            .await,
    )
}

async fn withdraw_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
    Json(req): Json<RoleRequest>,
) -> Result<(StatusCode, Json<OperationOutcome>), ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    operation_response(state.orchestrator.withdraw(&agreement_id, req.role).await)
}

async fn cancel_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
    Json(req): Json<RoleRequest>,
) -> Result<(StatusCode, Json<OperationOutcome>), ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    operation_response(state.orchestrator.cancel(&agreement_id, req.role).await)
}

async fn dispute_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
    Json(req): Json<RoleRequest>,
) -> Result<(StatusCode, Json<OperationOutcome>), ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    operation_response(state.orchestrator.raise_dispute(&agreement_id, req.role).await)
}

/// Report and reconcile an in-flight marker.
async fn interrupted_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
) -> Result<Json<InterruptionReport>, ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    let report = state
        .orchestrator
        .check_interrupted_transactions(&agreement_id)
        .await
        .map_err(to_error_response)?;
    Ok(Json(report))
}

/// Drop a stale marker that never recorded a transaction.
async fn clear_orphaned_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path(id): Path<String>,
) -> Result<Json<InterruptionReport>, ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    let report = state
        .orchestrator
        .clear_orphaned_marker(&agreement_id)
        .await
        .map_err(to_error_response)?;
    Ok(Json(report))
}

/// Recover an operation of a specific kind.
async fn recover_handler<L, I, S>(
    State(state): State<Arc<ApiState<L, I, S>>>,
    Path((id, kind)): Path<(String, OperationKind)>,
) -> Result<Json<RecoveryReport>, ApiError>
where
    L: LedgerPort + 'static,
    I: IdentityPort + 'static,
    S: Store + 'static,
{
    let agreement_id = parse_id(id)?;
    let report = state
        .orchestrator
        .recover_state(&agreement_id, kind)
        .await
        .map_err(to_error_response)?;
    Ok(Json(report))
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_id(raw: String) -> Result<AgreementId, ApiError> {
    AgreementId::new(raw).map_err(|e| to_error_response(e.into()))
}

/// Succeeded → 200, pending reconciliation → 202.
fn operation_response(
    result: Result<OperationOutcome, DaemonError>,
) -> Result<(StatusCode, Json<OperationOutcome>), ApiError> {
    let outcome = result.map_err(to_error_response)?;
    let status = match outcome.status {
        OperationStatus::PendingReconciliation => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

fn to_error_response(error: DaemonError) -> ApiError {
    let status = match &error {
        DaemonError::AgreementNotFound(_) => StatusCode::NOT_FOUND,
        DaemonError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
        DaemonError::Domain(_) => StatusCode::BAD_REQUEST,
        DaemonError::IdentityUnbound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DaemonError::Engine(_)
        | DaemonError::PreconditionViolated(_)
        | DaemonError::AlreadyInFlight { .. }
        | DaemonError::AgreementExists(_) => StatusCode::CONFLICT,
        DaemonError::Store(e) if e.is_conflict() => StatusCode::CONFLICT,
        DaemonError::Ledger(LedgerError::NetworkUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        DaemonError::Ledger(LedgerError::PreconditionViolated(_)) => StatusCode::CONFLICT,
        DaemonError::Ledger(_) => StatusCode::BAD_GATEWAY,
        DaemonError::Store(_) | DaemonError::Config(_) | DaemonError::Internal(_) | DaemonError::Shutdown => {
            StatusCode::INTERNAL_SERVER_ERROR
        },
    };

    (
        status,
        Json(ErrorResponse {
            outcome: error.outcome_kind(),
            error: error.to_string(),
        }),
    )
}

// =============================================================================
// Tests
// =============================================================================
