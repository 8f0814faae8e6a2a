//! Deployment records, traffic splits, health reports and audit reports.
//!
//! These are the values persisted by `cutover-state` and exchanged between
//! the orchestrator and its backends. All are JSON-serializable.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::revision::RevisionId;

// ── Deployment record ──────────────────────────────────────────────

/// Status of the live record for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// An attempt is underway; traffic is still on `active`.
    Pending,
    /// `active` is serving and verified.
    Healthy,
    /// Traffic has been moved to the pending revision, not yet verified.
    Cutover,
    /// The last operation restored `active` from a failed attempt or on request.
    RolledBack,
    /// The last operation failed.
    Failed,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Healthy => "healthy",
            DeploymentStatus::Cutover => "cutover",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The one live deployment record of an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub environment: String,
    /// Revision that was last known good and serving.
    pub active: Option<RevisionId>,
    /// Revision `active` superseded. Only successful deployments move it.
    pub previous: Option<RevisionId>,
    /// Revision of an attempt that has not concluded cleanly.
    #[serde(default)]
    pub pending: Option<RevisionId>,
    /// Unix timestamp (seconds) of the last record update.
    pub deployed_at: u64,
    pub status: DeploymentStatus,
}

impl DeploymentRecord {
    /// A blank record for an environment that has never been deployed.
    pub fn new(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            active: None,
            previous: None,
            pending: None,
            deployed_at: 0,
            status: DeploymentStatus::Failed,
        }
    }

    /// Revision a standalone rollback should restore.
    ///
    /// An unconcluded attempt (`pending` set) means traffic may sit on
    /// the pending revision, so the last known good `active` is the
    /// target. Otherwise it is `previous`.
    pub fn rollback_target(&self) -> Option<&RevisionId> {
        if self.pending.is_some() {
            self.active.as_ref().or(self.previous.as_ref())
        } else {
            self.previous.as_ref()
        }
    }
}

// ── Health ─────────────────────────────────────────────────────────

/// Result of validating one revision's health.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    pub revision: RevisionId,
    /// Unix timestamp (seconds) when the verdict was reached.
    pub checked_at: u64,
    pub passed: bool,
    pub detail: String,
}

// ── Traffic split ──────────────────────────────────────────────────

/// Maximum number of revisions a split may name.
pub const MAX_SPLIT_REVISIONS: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("split names no revisions")]
    Empty,
    #[error("split names {0} revisions, at most {MAX_SPLIT_REVISIONS} allowed")]
    TooManyRevisions(usize),
    #[error("weights sum to {0}, expected 100")]
    BadSum(u32),
}

/// Weighted assignment of an environment's traffic to revisions.
///
/// Construction validates that at most two revisions are named and the
/// weights sum to exactly 100; deserialization goes through the same check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSplit")]
pub struct TrafficSplit {
    environment: String,
    weights: BTreeMap<RevisionId, u8>,
}

#[derive(Deserialize)]
struct RawSplit {
    environment: String,
    weights: BTreeMap<RevisionId, u8>,
}

impl TryFrom<RawSplit> for TrafficSplit {
    type Error = SplitError;

    fn try_from(raw: RawSplit) -> Result<Self, Self::Error> {
        TrafficSplit::new(&raw.environment, raw.weights)
    }
}

impl TrafficSplit {
    pub fn new(environment: &str, weights: BTreeMap<RevisionId, u8>) -> Result<Self, SplitError> {
        if weights.is_empty() {
            return Err(SplitError::Empty);
        }
        if weights.len() > MAX_SPLIT_REVISIONS {
            return Err(SplitError::TooManyRevisions(weights.len()));
        }
        let sum: u32 = weights.values().map(|w| u32::from(*w)).sum();
        if sum != 100 {
            return Err(SplitError::BadSum(sum));
        }
        Ok(Self {
            environment: environment.to_string(),
            weights,
        })
    }

    /// All traffic to a single revision.
    pub fn all_to(environment: &str, revision: &RevisionId) -> Self {
        Self {
            environment: environment.to_string(),
            weights: BTreeMap::from([(revision.clone(), 100)]),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn weights(&self) -> &BTreeMap<RevisionId, u8> {
        &self.weights
    }

    /// Weight assigned to a revision (0 if absent).
    pub fn weight_of(&self, revision: &RevisionId) -> u8 {
        self.weights.get(revision).copied().unwrap_or(0)
    }

    /// The revision carrying the most traffic (ties go to the smaller id).
    pub fn serving(&self) -> Option<&RevisionId> {
        self.weights
            .iter()
            .filter(|(_, w)| **w > 0)
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(rev, _)| rev)
    }

    /// Whether every bit of traffic goes to `revision`.
    pub fn is_all_on(&self, revision: &RevisionId) -> bool {
        self.weight_of(revision) == 100
    }
}

impl fmt::Display for TrafficSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .weights
            .iter()
            .map(|(rev, w)| format!("{rev}={w}%"))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

// ── Deployment state machine + audit ───────────────────────────────

/// States a deployment attempt passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Idle,
    Registering,
    AwaitingHealth,
    CuttingOver,
    Verifying,
    Succeeded,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployState::Idle => "Idle",
            DeployState::Registering => "Registering",
            DeployState::AwaitingHealth => "AwaitingHealth",
            DeployState::CuttingOver => "CuttingOver",
            DeployState::Verifying => "Verifying",
            DeployState::Succeeded => "Succeeded",
            DeployState::Failed => "Failed",
            DeployState::RollingBack => "RollingBack",
            DeployState::RolledBack => "RolledBack",
            DeployState::RollbackFailed => "RollbackFailed",
        };
        f.write_str(s)
    }
}

/// Failure categories, each with its own process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Registration,
    ServiceUpdate,
    Unhealthy,
    TimedOut,
    InvalidSplit,
    DeploymentInProgress,
    NoRollbackTarget,
    RollbackFailed,
    Cancelled,
    /// Backend I/O, state store or configuration problems.
    Internal,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Registration => 10,
            ErrorKind::ServiceUpdate => 11,
            ErrorKind::Unhealthy => 12,
            ErrorKind::TimedOut => 13,
            ErrorKind::InvalidSplit => 14,
            ErrorKind::DeploymentInProgress => 15,
            ErrorKind::NoRollbackTarget => 16,
            ErrorKind::RollbackFailed => 17,
            ErrorKind::Cancelled => 18,
            ErrorKind::Internal => 1,
        }
    }
}

/// A failure as recorded in a report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// How an attempt ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Failed before anything changed; no rollback was needed.
    Failed { error: FailureInfo },
    /// The rollback target was restored. `cause` is the failure that
    /// triggered it; a requested rollback has none.
    RolledBack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<FailureInfo>,
    },
    /// Failed, and restoring the rollback target failed too.
    RollbackFailed {
        cause: Option<FailureInfo>,
        rollback_error: FailureInfo,
    },
}

impl Outcome {
    pub fn final_state(&self) -> DeployState {
        match self {
            Outcome::Succeeded => DeployState::Succeeded,
            Outcome::Failed { .. } => DeployState::Failed,
            Outcome::RolledBack { .. } => DeployState::RolledBack,
            Outcome::RollbackFailed { .. } => DeployState::RollbackFailed,
        }
    }

    /// Exit code for the CLI: a rolled-back attempt reports its cause.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Succeeded => 0,
            Outcome::Failed { error } => error.kind.exit_code(),
            Outcome::RolledBack { cause } => cause.as_ref().map_or(0, |c| c.kind.exit_code()),
            Outcome::RollbackFailed { .. } => ErrorKind::RollbackFailed.exit_code(),
        }
    }
}

/// What kind of operation a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    Rollback,
}

/// Audit record of one terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentReport {
    pub environment: String,
    pub operation: Operation,
    /// Revision the operation tried to put in service.
    pub attempted: Option<RevisionId>,
    /// Image of the attempted spec, when deploying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Every state traversed, in order, ending in a terminal state.
    pub states: Vec<DeployState>,
    pub outcome: Outcome,
    /// Revision serving traffic once the operation finished.
    pub serving: Option<RevisionId>,
    pub started_at: u64,
    pub finished_at: u64,
}

impl DeploymentReport {
    pub fn final_state(&self) -> DeployState {
        self.outcome.final_state()
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> RevisionId {
        RevisionId::from(s)
    }

    #[test]
    fn split_requires_sum_of_100() {
        let weights = BTreeMap::from([(rev("v1"), 60), (rev("v2"), 30)]);
        assert_eq!(
            TrafficSplit::new("prod", weights),
            Err(SplitError::BadSum(90))
        );
    }

    #[test]
    fn split_rejects_more_than_two_revisions() {
        let weights = BTreeMap::from([(rev("a"), 50), (rev("b"), 25), (rev("c"), 25)]);
        assert_eq!(
            TrafficSplit::new("prod", weights),
            Err(SplitError::TooManyRevisions(3))
        );
        assert_eq!(
            TrafficSplit::new("prod", BTreeMap::new()),
            Err(SplitError::Empty)
        );
    }

    #[test]
    fn split_serving_picks_heaviest() {
        let split =
            TrafficSplit::new("prod", BTreeMap::from([(rev("v1"), 0), (rev("v2"), 100)])).unwrap();
        assert_eq!(split.serving(), Some(&rev("v2")));
        assert!(split.is_all_on(&rev("v2")));
        assert_eq!(split.weight_of(&rev("v3")), 0);
    }

    #[test]
    fn split_deserialization_is_validated() {
        let bad = r#"{"environment":"prod","weights":{"v1":70,"v2":70}}"#;
        assert!(serde_json::from_str::<TrafficSplit>(bad).is_err());

        let good = r#"{"environment":"prod","weights":{"v1":70,"v2":30}}"#;
        let split: TrafficSplit = serde_json::from_str(good).unwrap();
        assert_eq!(split.to_string(), "v1=70%, v2=30%");
    }

    #[test]
    fn rollback_target_prefers_previous_when_concluded() {
        let mut record = DeploymentRecord::new("prod");
        assert_eq!(record.rollback_target(), None);

        record.active = Some(rev("v2"));
        record.previous = Some(rev("v1"));
        record.status = DeploymentStatus::Healthy;
        assert_eq!(record.rollback_target(), Some(&rev("v1")));
    }

    #[test]
    fn rollback_target_is_active_for_unconcluded_attempt() {
        let record = DeploymentRecord {
            environment: "prod".to_string(),
            active: Some(rev("v2")),
            previous: Some(rev("v1")),
            pending: Some(rev("v3")),
            deployed_at: 10,
            status: DeploymentStatus::Cutover,
        };
        assert_eq!(record.rollback_target(), Some(&rev("v2")));
    }

    #[test]
    fn outcome_exit_codes() {
        let cause = FailureInfo {
            kind: ErrorKind::Unhealthy,
            message: "503".to_string(),
        };
        assert_eq!(Outcome::Succeeded.exit_code(), 0);
        assert_eq!(
            Outcome::RolledBack {
                cause: Some(cause.clone())
            }
            .exit_code(),
            12
        );
        assert_eq!(Outcome::RolledBack { cause: None }.exit_code(), 0);
        assert_eq!(
            Outcome::RollbackFailed {
                cause: Some(cause),
                rollback_error: FailureInfo {
                    kind: ErrorKind::ServiceUpdate,
                    message: "boom".to_string(),
                },
            }
            .exit_code(),
            17
        );
    }
}
