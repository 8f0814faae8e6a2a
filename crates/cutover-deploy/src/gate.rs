//! Health gates.
//!
//! A gate polls one target and turns a failed verdict into the matching
//! [`DeployError`]. The report of the latest verdict per environment is
//! kept in memory for status queries; it is never persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use cutover_core::HealthReport;
use cutover_health::{HealthTarget, ProbeOutcome, Prober};

use crate::error::{DeployError, DeployResult};
use crate::settings::EnvironmentSettings;

#[derive(Clone)]
pub struct HealthGate {
    health: Prober,
    latest: Arc<Mutex<HashMap<String, HealthReport>>>,
}

impl HealthGate {
    pub fn new(health: Prober) -> Self {
        Self {
            health,
            latest: Arc::default(),
        }
    }

    /// Poll `target` within the environment's health window.
    pub async fn check(
        &self,
        environment: &str,
        target: &HealthTarget,
        settings: &EnvironmentSettings,
    ) -> DeployResult<HealthReport> {
        let verdict = self
            .health
            .probe(target, settings.timeouts.health, settings.timeouts.interval)
            .await;
        let report = verdict.report;
        debug!(
            %environment,
            revision = %report.revision,
            passed = report.passed,
            attempts = verdict.attempts,
            "health gate decided"
        );
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(environment.to_string(), report.clone());

        match verdict.outcome {
            ProbeOutcome::Healthy => Ok(report),
            ProbeOutcome::Unhealthy(_) => Err(DeployError::Unhealthy(format!(
                "{} after {} attempts: {}",
                target.url, verdict.attempts, report.detail
            ))),
            ProbeOutcome::TimedOut(_) => Err(DeployError::TimedOut(format!(
                "{} not healthy within {:?}: {}",
                target.url, settings.timeouts.health, report.detail
            ))),
        }
    }

    /// Report of the environment's most recent gate in this process.
    pub fn latest(&self, environment: &str) -> Option<HealthReport> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(environment)
            .cloned()
    }
}
