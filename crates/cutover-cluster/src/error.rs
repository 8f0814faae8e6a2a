//! Cluster adapter errors.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The environment has no service or no running revision.
    #[error("not found: {0}")]
    NotFound(String),

    /// The spec was invalid or the backend rejected the registration.
    #[error("registration failed: {0}")]
    Registration(String),

    /// The backend rejected the service update.
    #[error("service update failed: {0}")]
    ServiceUpdate(String),

    /// Anything else: transport, parsing, state store.
    #[error("cluster backend error: {0}")]
    Backend(String),
}

impl From<cutover_state::StateError> for ClusterError {
    fn from(e: cutover_state::StateError) -> Self {
        ClusterError::Backend(e.to_string())
    }
}
