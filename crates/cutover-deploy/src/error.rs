//! Deployment error taxonomy.

use thiserror::Error;

use cutover_cluster::ClusterError;
use cutover_core::{ErrorKind, FailureInfo};
use cutover_state::StateError;
use cutover_traffic::TrafficError;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("registration failed: {0}")]
    Registration(String),

    #[error("service update failed: {0}")]
    ServiceUpdate(String),

    #[error("unhealthy: {0}")]
    Unhealthy(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("invalid split: {0}")]
    InvalidSplit(String),

    #[error("a deployment of {0} is already in progress")]
    DeploymentInProgress(String),

    #[error("lease error: {0}")]
    Lease(String),

    #[error("{0} has no revision to roll back to")]
    NoRollbackTarget(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("unknown environment {0}")]
    UnknownEnvironment(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("traffic error: {0}")]
    Traffic(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Registration(_) => ErrorKind::Registration,
            DeployError::ServiceUpdate(_) => ErrorKind::ServiceUpdate,
            DeployError::Unhealthy(_) => ErrorKind::Unhealthy,
            DeployError::TimedOut(_) => ErrorKind::TimedOut,
            DeployError::InvalidSplit(_) => ErrorKind::InvalidSplit,
            DeployError::DeploymentInProgress(_) => ErrorKind::DeploymentInProgress,
            DeployError::NoRollbackTarget(_) => ErrorKind::NoRollbackTarget,
            DeployError::RollbackFailed(_) => ErrorKind::RollbackFailed,
            DeployError::Cancelled => ErrorKind::Cancelled,
            DeployError::UnknownEnvironment(_)
            | DeployError::Cluster(_)
            | DeployError::Traffic(_)
            | DeployError::Lease(_)
            | DeployError::State(_) => ErrorKind::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub fn to_failure(&self) -> FailureInfo {
        FailureInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<ClusterError> for DeployError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Registration(msg) => DeployError::Registration(msg),
            ClusterError::ServiceUpdate(msg) => DeployError::ServiceUpdate(msg),
            other => DeployError::Cluster(other.to_string()),
        }
    }
}

impl From<TrafficError> for DeployError {
    fn from(e: TrafficError) -> Self {
        match e {
            TrafficError::InvalidSplit(msg) => DeployError::InvalidSplit(msg),
            TrafficError::Backend(msg) => DeployError::Traffic(msg),
        }
    }
}
