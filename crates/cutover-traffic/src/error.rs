//! Traffic controller errors.

use thiserror::Error;

use cutover_core::SplitError;

pub type TrafficResult<T> = Result<T, TrafficError>;

#[derive(Debug, Error)]
pub enum TrafficError {
    /// The requested split is malformed or names an unattached revision.
    #[error("invalid split: {0}")]
    InvalidSplit(String),

    /// The backend could not apply or read the split.
    #[error("traffic backend error: {0}")]
    Backend(String),
}

impl From<SplitError> for TrafficError {
    fn from(e: SplitError) -> Self {
        TrafficError::InvalidSplit(e.to_string())
    }
}

impl From<cutover_state::StateError> for TrafficError {
    fn from(e: cutover_state::StateError) -> Self {
        TrafficError::Backend(e.to_string())
    }
}
