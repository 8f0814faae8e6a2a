//! Split validation and application.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use cutover_core::{RevisionId, TrafficSplit};

use crate::TrafficBackend;
use crate::error::{TrafficError, TrafficResult};

/// Validates splits before handing them to a backend.
#[derive(Clone)]
pub struct TrafficController {
    backend: Arc<dyn TrafficBackend>,
}

impl TrafficController {
    pub fn new(backend: Arc<dyn TrafficBackend>) -> Self {
        Self { backend }
    }

    /// Register `revision` as a routable target. Idempotent.
    pub async fn attach(
        &self,
        environment: &str,
        revision: &RevisionId,
        endpoint: &str,
    ) -> TrafficResult<()> {
        self.backend.attach(environment, revision, endpoint).await
    }

    /// Replace the environment's split.
    ///
    /// Fails with [`TrafficError::InvalidSplit`] when the weights don't sum
    /// to 100, more than two revisions are named, or a named revision is
    /// not attached. Nothing is applied on failure.
    pub async fn set_split(
        &self,
        environment: &str,
        weights: BTreeMap<RevisionId, u8>,
    ) -> TrafficResult<TrafficSplit> {
        let split = TrafficSplit::new(environment, weights)?;
        self.apply_validated(split).await
    }

    /// Move all traffic to `revision`.
    pub async fn cut_over(
        &self,
        environment: &str,
        revision: &RevisionId,
    ) -> TrafficResult<TrafficSplit> {
        self.apply_validated(TrafficSplit::all_to(environment, revision))
            .await
    }

    pub async fn current_split(&self, environment: &str) -> TrafficResult<Option<TrafficSplit>> {
        self.backend.current(environment).await
    }

    async fn apply_validated(&self, split: TrafficSplit) -> TrafficResult<TrafficSplit> {
        for revision in split.weights().keys() {
            if !self.backend.is_attached(split.environment(), revision).await? {
                return Err(TrafficError::InvalidSplit(format!(
                    "revision {revision} is not attached to {}",
                    split.environment()
                )));
            }
        }
        self.backend.apply(&split).await?;
        info!(environment = split.environment(), %split, "traffic split applied");
        Ok(split)
    }
}
