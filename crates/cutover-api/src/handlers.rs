//! REST API handlers.
//!
//! Deploys run in the background under the environment lease taken
//! before the 202 is returned; everything else answers synchronously.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cutover_core::{ErrorKind, Outcome, RevisionId, RevisionSpec};
use cutover_deploy::DeployError;

use crate::ApiState;

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn deploy_error(e: &DeployError) -> axum::response::Response {
    let status = match e {
        DeployError::UnknownEnvironment(_) => StatusCode::NOT_FOUND,
        _ => match e.kind() {
            ErrorKind::DeploymentInProgress => StatusCode::CONFLICT,
            ErrorKind::NoRollbackTarget => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Registration | ErrorKind::InvalidSplit => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Deploy ─────────────────────────────────────────────────────

/// Request body: a full revision spec, or an image combined with the
/// environment's configured defaults.
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub spec: Option<RevisionSpec>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeployAccepted {
    pub environment: String,
    pub revision: RevisionId,
    pub image: String,
}

fn resolve_spec(state: &ApiState, env: &str, req: DeployRequest) -> Result<RevisionSpec, String> {
    match (req.spec, req.image) {
        (Some(spec), None) => Ok(spec),
        (None, Some(image)) => state
            .defaults
            .get(env)
            .map(|d| d.spec_for(&image))
            .ok_or_else(|| format!("environment {env} has no revision defaults; send a full spec")),
        (Some(_), Some(_)) => Err("send either `spec` or `image`, not both".to_string()),
        (None, None) => Err("request needs `spec` or `image`".to_string()),
    }
}

/// POST /api/v1/environments/{env}/deploy
pub async fn deploy(
    State(state): State<ApiState>,
    Path(env): Path<String>,
    Json(req): Json<DeployRequest>,
) -> impl IntoResponse {
    let spec = match resolve_spec(&state, &env, req) {
        Ok(spec) => spec,
        Err(msg) => return error_response(&msg, StatusCode::BAD_REQUEST).into_response(),
    };
    if let Err(e) = spec.validate() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }

    let lease = match state.orchestrator.begin(&env) {
        Ok(lease) => lease,
        Err(e) => return deploy_error(&e),
    };

    let accepted = DeployAccepted {
        environment: env.clone(),
        revision: spec.revision_id(),
        image: spec.image.clone(),
    };
    info!(environment = %env, revision = %accepted.revision, "deployment accepted");

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let report = orchestrator.run(lease, spec).await;
        if !report.succeeded() {
            warn!(environment = %report.environment, state = %report.final_state(), "background deployment did not succeed");
        }
    });

    (StatusCode::ACCEPTED, ApiResponse::ok(accepted)).into_response()
}

// ── Rollback / cancel ──────────────────────────────────────────

/// POST /api/v1/environments/{env}/rollback
pub async fn rollback(State(state): State<ApiState>, Path(env): Path<String>) -> impl IntoResponse {
    match state.orchestrator.rollback(&env).await {
        Ok(report) => {
            let failure = match &report.outcome {
                Outcome::RollbackFailed { rollback_error, .. } => {
                    Some(rollback_error.message.clone())
                }
                _ => None,
            };
            match failure {
                Some(error) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiResponse {
                        success: false,
                        data: Some(report),
                        error: Some(error),
                    }),
                )
                    .into_response(),
                None => ApiResponse::ok(report).into_response(),
            }
        }
        Err(e) => deploy_error(&e),
    }
}

#[derive(Debug, Serialize)]
pub struct CancelAccepted {
    pub environment: String,
    pub cancelled: bool,
}

/// POST /api/v1/environments/{env}/cancel
pub async fn cancel(State(state): State<ApiState>, Path(env): Path<String>) -> impl IntoResponse {
    if let Err(e) = state.orchestrator.settings(&env) {
        return deploy_error(&e);
    }
    if state.orchestrator.cancel(&env) {
        let body = CancelAccepted {
            environment: env,
            cancelled: true,
        };
        (StatusCode::ACCEPTED, ApiResponse::ok(body)).into_response()
    } else {
        error_response("no deployment in progress", StatusCode::NOT_FOUND).into_response()
    }
}

// ── Status / history ───────────────────────────────────────────

/// GET /api/v1/environments/{env}/status
pub async fn status(State(state): State<ApiState>, Path(env): Path<String>) -> impl IntoResponse {
    match state.orchestrator.status(&env).await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => deploy_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/environments/{env}/history
pub async fn history(
    State(state): State<ApiState>,
    Path(env): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match state.orchestrator.history(&env, limit) {
        Ok(reports) => ApiResponse::ok(reports).into_response(),
        Err(e) => deploy_error(&e),
    }
}
