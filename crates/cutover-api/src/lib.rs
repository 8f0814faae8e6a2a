//! cutover-api — REST API for the deployment orchestrator.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/environments/{env}/deploy` | Start a deployment (202) |
//! | POST | `/api/v1/environments/{env}/rollback` | Roll back to the recorded target |
//! | POST | `/api/v1/environments/{env}/cancel` | Cancel the running deployment |
//! | GET | `/api/v1/environments/{env}/status` | Record, split and lease state |
//! | GET | `/api/v1/environments/{env}/history` | Deployment reports, newest first |

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use cutover_core::{CutoverConfig, RevisionDefaults};
use cutover_deploy::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    /// Per-environment defaults for deploy requests that only name an image.
    pub defaults: Arc<HashMap<String, RevisionDefaults>>,
}

impl ApiState {
    pub fn new(orchestrator: Orchestrator, config: &CutoverConfig) -> Self {
        let defaults = config
            .environments
            .iter()
            .filter_map(|(name, env)| env.defaults.clone().map(|d| (name.clone(), d)))
            .collect();
        Self {
            orchestrator,
            defaults: Arc::new(defaults),
        }
    }
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/environments/{env}/deploy", post(handlers::deploy))
        .route("/environments/{env}/rollback", post(handlers::rollback))
        .route("/environments/{env}/cancel", post(handlers::cancel))
        .route("/environments/{env}/status", get(handlers::status))
        .route("/environments/{env}/history", get(handlers::history))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
