//! Deployment orchestrator — drives the blue/green state machine.
//!
//! One attempt moves through `Registering`, `AwaitingHealth`,
//! `CuttingOver` and `Verifying`. A failure before a revision is
//! registered ends in `Failed` with nothing changed. Any later failure,
//! including a cancellation seen at a step boundary, hands the attempt to
//! the [`RollbackCoordinator`], which restores the revision that was
//! serving when the attempt began.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use cutover_cluster::{ClusterAdapter, ClusterError, WaitOutcome};
use cutover_core::{
    DeployState, DeploymentRecord, DeploymentReport, DeploymentStatus, HealthReport, Operation,
    Outcome, RevisionId, RevisionSpec, TrafficSplit, now_secs,
};
use cutover_health::Prober;
use cutover_state::StateStore;
use cutover_traffic::TrafficController;

use crate::error::{DeployError, DeployResult};
use crate::gate::HealthGate;
use crate::lease::{CancelToken, Lease, LeaseRegistry};
use crate::rollback::RollbackCoordinator;
use crate::settings::EnvironmentSettings;

/// Live view of one environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStatus {
    pub environment: String,
    pub record: Option<DeploymentRecord>,
    pub split: Option<TrafficSplit>,
    /// Whether an operation holds the environment's lease, in this
    /// process or another one sharing the lock directory.
    pub in_progress: bool,
    /// Latest health verdict reached by this process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health: Option<HealthReport>,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: StateStore,
    cluster: Arc<dyn ClusterAdapter>,
    traffic: TrafficController,
    gate: HealthGate,
    rollback: RollbackCoordinator,
    leases: LeaseRegistry,
    environments: Arc<HashMap<String, EnvironmentSettings>>,
}

/// Bookkeeping for one attempt.
struct Attempt<'a> {
    environment: &'a str,
    settings: &'a EnvironmentSettings,
    token: &'a CancelToken,
    states: Vec<DeployState>,
    /// Revision serving when the attempt began; the rollback target.
    blue: Option<RevisionId>,
    green: RevisionId,
    registered: bool,
}

impl Attempt<'_> {
    fn enter(&mut self, state: DeployState) {
        debug!(environment = %self.environment, revision = %self.green, %state, "entering state");
        self.states.push(state);
    }

    fn check_cancelled(&self) -> DeployResult<()> {
        if self.token.is_cancelled() {
            warn!(environment = %self.environment, revision = %self.green, "attempt cancelled");
            return Err(DeployError::Cancelled);
        }
        Ok(())
    }
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        cluster: Arc<dyn ClusterAdapter>,
        traffic: TrafficController,
        prober: Prober,
        environments: HashMap<String, EnvironmentSettings>,
    ) -> Self {
        let gate = HealthGate::new(prober);
        let rollback =
            RollbackCoordinator::new(store.clone(), cluster.clone(), traffic.clone(), gate.clone());
        Self {
            store,
            cluster,
            traffic,
            gate,
            rollback,
            leases: LeaseRegistry::new(),
            environments: Arc::new(environments),
        }
    }

    /// Take leases from `leases`, e.g. one backed by lock files.
    pub fn with_leases(mut self, leases: LeaseRegistry) -> Self {
        self.leases = leases;
        self
    }

    pub fn leases(&self) -> &LeaseRegistry {
        &self.leases
    }

    pub fn settings(&self, environment: &str) -> DeployResult<&EnvironmentSettings> {
        self.environments
            .get(environment)
            .ok_or_else(|| DeployError::UnknownEnvironment(environment.to_string()))
    }

    /// Reserve `environment` for an attempt.
    ///
    /// Fails immediately with [`DeployError::DeploymentInProgress`] when
    /// another operation holds it.
    pub fn begin(&self, environment: &str) -> DeployResult<Lease> {
        self.settings(environment)?;
        self.leases.acquire(environment)
    }

    /// Deploy `spec` to `environment`.
    ///
    /// `Err` means the attempt was rejected before any state changed. A
    /// started attempt always yields a report, whatever its outcome.
    pub async fn deploy(
        &self,
        environment: &str,
        spec: RevisionSpec,
    ) -> DeployResult<DeploymentReport> {
        let lease = self.begin(environment)?;
        Ok(self.run(lease, spec).await)
    }

    /// Run an attempt under a lease taken with [`Orchestrator::begin`].
    pub async fn run(&self, lease: Lease, spec: RevisionSpec) -> DeploymentReport {
        let started_at = now_secs();
        let environment = lease.environment().to_string();
        let green = spec.revision_id();

        let settings = match self.settings(&environment) {
            Ok(settings) => settings,
            Err(e) => {
                let outcome = Outcome::Failed {
                    error: e.to_failure(),
                };
                return DeploymentReport {
                    environment,
                    operation: Operation::Deploy,
                    attempted: Some(green),
                    image: Some(spec.image),
                    states: vec![DeployState::Idle, DeployState::Failed],
                    outcome,
                    serving: None,
                    started_at,
                    finished_at: now_secs(),
                };
            }
        };

        let mut attempt = Attempt {
            environment: &environment,
            settings,
            token: lease.token(),
            states: vec![DeployState::Idle],
            blue: None,
            green,
            registered: false,
        };
        info!(%environment, revision = %attempt.green, image = %spec.image, "deployment started");

        let outcome = match self.advance(&mut attempt, &spec).await {
            Ok(()) => Outcome::Succeeded,
            Err(e) if !attempt.registered => {
                warn!(%environment, error = %e, "deployment failed before registration");
                self.abandon(&environment);
                Outcome::Failed {
                    error: e.to_failure(),
                }
            }
            Err(e) => {
                warn!(%environment, revision = %attempt.green, error = %e, "deployment failed, rolling back");
                attempt.enter(DeployState::RollingBack);
                self.roll_back_attempt(&attempt, e).await
            }
        };
        attempt.states.push(outcome.final_state());

        let report = DeploymentReport {
            environment: environment.clone(),
            operation: Operation::Deploy,
            attempted: Some(attempt.green.clone()),
            image: Some(spec.image.clone()),
            states: attempt.states,
            outcome,
            serving: self.rollback.serving(&environment).await,
            started_at,
            finished_at: now_secs(),
        };
        info!(
            %environment,
            state = %report.final_state(),
            serving = ?report.serving,
            "deployment finished"
        );
        self.rollback.archive(&report);
        report
    }

    /// Roll `environment` back to its recorded target.
    pub async fn rollback(&self, environment: &str) -> DeployResult<DeploymentReport> {
        let settings = self.settings(environment)?;
        let lease = self.leases.acquire(environment)?;
        self.rollback.rollback(&lease, settings).await
    }

    /// Ask the running attempt on `environment` to stop at its next step
    /// boundary. Returns false if nothing is running.
    pub fn cancel(&self, environment: &str) -> bool {
        self.leases.cancel(environment)
    }

    pub async fn status(&self, environment: &str) -> DeployResult<EnvironmentStatus> {
        self.settings(environment)?;
        Ok(EnvironmentStatus {
            environment: environment.to_string(),
            record: self.store.get_record(environment)?,
            split: self.traffic.current_split(environment).await?,
            in_progress: self.leases.is_held(environment),
            last_health: self.gate.latest(environment),
        })
    }

    pub fn history(&self, environment: &str, limit: usize) -> DeployResult<Vec<DeploymentReport>> {
        self.settings(environment)?;
        Ok(self.store.list_history(environment, limit)?)
    }

    /// The forward path. Returns at the first failure.
    async fn advance(&self, attempt: &mut Attempt<'_>, spec: &RevisionSpec) -> DeployResult<()> {
        let environment = attempt.environment;
        let settings = attempt.settings;

        // Registering
        attempt.enter(DeployState::Registering);
        let current = match self.cluster.current_revision(environment).await {
            Ok(revision) => {
                self.store.put_revision(environment, &revision)?;
                Some(revision.id)
            }
            Err(ClusterError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let green = attempt.green.clone();
        let record = self.store.update_record(environment, |r| {
            // An unconcluded attempt may have left its revision running;
            // the recorded active one is then the last known good.
            let blue = if r.pending.is_some() {
                r.active.clone().or(current)
            } else {
                current.or_else(|| r.active.clone())
            };
            if blue.is_some() {
                r.active = blue;
            }
            r.pending = Some(green);
            r.status = DeploymentStatus::Pending;
            r.deployed_at = now_secs();
        })?;
        attempt.blue = record.active;

        let revision = self.cluster.register_revision(environment, spec).await?;
        self.store.put_revision(environment, &revision)?;
        attempt.registered = true;
        if revision.id != attempt.green {
            debug!(expected = %attempt.green, got = %revision.id, "backend assigned a different revision id");
            attempt.green = revision.id.clone();
        }
        attempt.check_cancelled()?;

        // AwaitingHealth: green runs alongside blue, traffic untouched.
        attempt.enter(DeployState::AwaitingHealth);
        self.cluster.update_service(environment, &revision).await?;
        let stable = settings.timeouts.stable;
        if self.cluster.wait_stable(environment, stable).await? == WaitOutcome::TimedOut {
            return Err(DeployError::TimedOut(format!(
                "service {environment} did not stabilize on {} within {stable:?}",
                revision.id
            )));
        }
        self.traffic
            .attach(environment, &revision.id, &settings.endpoint_for(&revision.id))
            .await?;
        self.gate
            .check(environment, &settings.private_target(&revision.id), settings)
            .await?;
        attempt.check_cancelled()?;

        // CuttingOver
        attempt.enter(DeployState::CuttingOver);
        if let Some(blue) = &attempt.blue {
            self.traffic
                .attach(environment, blue, &settings.endpoint_for(blue))
                .await?;
        }
        self.traffic.cut_over(environment, &revision.id).await?;
        self.store.update_record(environment, |r| {
            r.status = DeploymentStatus::Cutover;
            r.deployed_at = now_secs();
        })?;
        attempt.check_cancelled()?;

        // Verifying
        attempt.enter(DeployState::Verifying);
        let health = self
            .gate
            .check(environment, &settings.public_target(&revision.id), settings)
            .await?;
        attempt.check_cancelled()?;

        let old = attempt.blue.clone().filter(|b| *b != revision.id);
        let record = self.store.update_record(environment, |r| {
            if old.is_some() {
                r.previous = old;
            }
            r.active = Some(revision.id.clone());
            r.pending = None;
            r.status = DeploymentStatus::Healthy;
            r.deployed_at = now_secs();
        })?;
        info!(
            %environment,
            active = %revision.id,
            previous = ?record.previous,
            health = %health.detail,
            "deployment succeeded"
        );
        Ok(())
    }

    async fn roll_back_attempt(&self, attempt: &Attempt<'_>, cause: DeployError) -> Outcome {
        let environment = attempt.environment;
        let Some(blue) = &attempt.blue else {
            self.rollback.mark_failed(environment);
            let rollback_error = DeployError::NoRollbackTarget(environment.to_string());
            warn!(%environment, "first deployment failed with nothing to roll back to");
            return Outcome::RollbackFailed {
                cause: Some(cause.to_failure()),
                rollback_error: rollback_error.to_failure(),
            };
        };

        match self.rollback.restore(environment, blue, attempt.settings).await {
            Ok(()) => {
                self.rollback.mark_restored(environment, blue);
                Outcome::RolledBack {
                    cause: Some(cause.to_failure()),
                }
            }
            Err(e) => {
                let rollback_error = DeployError::RollbackFailed(e.to_string());
                warn!(%environment, target = %blue, error = %rollback_error, "rollback failed, operator action required");
                self.rollback.mark_failed(environment);
                Outcome::RollbackFailed {
                    cause: Some(cause.to_failure()),
                    rollback_error: rollback_error.to_failure(),
                }
            }
        }
    }

    /// Clear the pending marker of an attempt that changed nothing.
    fn abandon(&self, environment: &str) {
        let result = self.store.update_record(environment, |r| {
            r.pending = None;
            r.status = DeploymentStatus::Failed;
            r.deployed_at = now_secs();
        });
        if let Err(e) = result {
            warn!(%environment, error = %e, "failed to record failed attempt");
        }
    }
}
