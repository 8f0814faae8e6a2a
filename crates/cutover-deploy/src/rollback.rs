//! Rollback coordinator.
//!
//! Restoring a revision means, in order: all traffic back to it, the
//! service pointed at it and stable, and the public path healthy. The same
//! [`RollbackCoordinator::restore`] serves automatic rollbacks from a
//! failed deployment and operator-requested rollbacks, which work from the
//! persisted record alone.

use std::sync::Arc;

use tracing::{error, info, warn};

use cutover_cluster::{ClusterAdapter, WaitOutcome};
use cutover_core::{
    DeployState, DeploymentReport, DeploymentStatus, Operation, Outcome, Revision, RevisionId,
    now_secs,
};
use cutover_state::StateStore;
use cutover_traffic::TrafficController;

use crate::error::{DeployError, DeployResult};
use crate::gate::HealthGate;
use crate::lease::Lease;
use crate::settings::EnvironmentSettings;

#[derive(Clone)]
pub struct RollbackCoordinator {
    store: StateStore,
    cluster: Arc<dyn ClusterAdapter>,
    traffic: TrafficController,
    gate: HealthGate,
}

impl RollbackCoordinator {
    pub fn new(
        store: StateStore,
        cluster: Arc<dyn ClusterAdapter>,
        traffic: TrafficController,
        gate: HealthGate,
    ) -> Self {
        Self {
            store,
            cluster,
            traffic,
            gate,
        }
    }

    /// Roll the lease's environment back to its recorded target.
    ///
    /// Fails with [`DeployError::NoRollbackTarget`] before touching any
    /// backend when there is no record or no target. Otherwise the result
    /// is a report whose outcome is `RolledBack` or `RollbackFailed`.
    pub async fn rollback(
        &self,
        lease: &Lease,
        settings: &EnvironmentSettings,
    ) -> DeployResult<DeploymentReport> {
        let environment = lease.environment();
        let target = self
            .store
            .get_record(environment)?
            .and_then(|r| r.rollback_target().cloned())
            .ok_or_else(|| DeployError::NoRollbackTarget(environment.to_string()))?;

        let started_at = now_secs();
        let mut states = vec![DeployState::RollingBack];
        info!(%environment, target = %target, "rollback started");

        let outcome = match self.restore(environment, &target, settings).await {
            Ok(()) => {
                self.mark_restored(environment, &target);
                Outcome::RolledBack { cause: None }
            }
            Err(e) => {
                let e = DeployError::RollbackFailed(e.to_string());
                self.mark_failed(environment);
                Outcome::RollbackFailed {
                    cause: None,
                    rollback_error: e.to_failure(),
                }
            }
        };
        states.push(outcome.final_state());

        let report = DeploymentReport {
            environment: environment.to_string(),
            operation: Operation::Rollback,
            attempted: Some(target),
            image: None,
            states,
            outcome,
            serving: self.serving(environment).await,
            started_at,
            finished_at: now_secs(),
        };
        self.archive(&report);
        Ok(report)
    }

    /// Put `target` back in service.
    pub async fn restore(
        &self,
        environment: &str,
        target: &RevisionId,
        settings: &EnvironmentSettings,
    ) -> DeployResult<()> {
        let revision = self.lookup(environment, target).await?;

        self.traffic
            .attach(environment, target, &settings.endpoint_for(target))
            .await?;
        self.traffic.cut_over(environment, target).await?;

        self.cluster.update_service(environment, &revision).await?;
        let stable = settings.timeouts.stable;
        if self.cluster.wait_stable(environment, stable).await? == WaitOutcome::TimedOut {
            return Err(DeployError::TimedOut(format!(
                "service {environment} did not stabilize on {target} within {stable:?}"
            )));
        }

        let health = self
            .gate
            .check(environment, &settings.public_target(target), settings)
            .await?;
        info!(%environment, revision = %target, detail = %health.detail, "revision restored");
        Ok(())
    }

    /// The cataloged revision for `id`, falling back to the backend's list.
    async fn lookup(&self, environment: &str, id: &RevisionId) -> DeployResult<Revision> {
        if let Some(revision) = self.store.get_revision(environment, id)? {
            return Ok(revision);
        }
        let known = self.cluster.list_revisions(environment).await?;
        match known.into_iter().find(|r| &r.id == id) {
            Some(revision) => Ok(self.store.put_revision(environment, &revision)?),
            None => Err(DeployError::Cluster(format!(
                "revision {id} is not known in {environment}"
            ))),
        }
    }

    pub(crate) fn mark_restored(&self, environment: &str, target: &RevisionId) {
        let result = self.store.update_record(environment, |r| {
            r.active = Some(target.clone());
            r.pending = None;
            r.status = DeploymentStatus::RolledBack;
            r.deployed_at = now_secs();
        });
        if let Err(e) = result {
            error!(%environment, error = %e, "failed to record rollback");
        }
    }

    pub(crate) fn mark_failed(&self, environment: &str) {
        let result = self.store.update_record(environment, |r| {
            r.status = DeploymentStatus::Failed;
            r.deployed_at = now_secs();
        });
        if let Err(e) = result {
            error!(%environment, error = %e, "failed to record failure");
        }
    }

    /// Revision carrying the most traffic, if known.
    pub(crate) async fn serving(&self, environment: &str) -> Option<RevisionId> {
        match self.traffic.current_split(environment).await {
            Ok(split) => split.and_then(|s| s.serving().cloned()),
            Err(e) => {
                warn!(%environment, error = %e, "could not read traffic split");
                None
            }
        }
    }

    pub(crate) fn archive(&self, report: &DeploymentReport) {
        match self.store.append_report(report) {
            Ok(seq) => info!(
                environment = %report.environment,
                seq,
                state = %report.final_state(),
                "report archived"
            ),
            Err(e) => error!(environment = %report.environment, error = %e, "failed to archive report"),
        }
    }
}
