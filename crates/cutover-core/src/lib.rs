//! cutover-core — shared data model for the cutover deployment orchestrator.
//!
//! Every other crate in the workspace speaks in these types: immutable
//! [`Revision`]s identified by content, the per-environment
//! [`DeploymentRecord`], [`TrafficSplit`] weights, and the audit
//! [`DeploymentReport`] produced at the end of every attempt.

pub mod config;
pub mod image;
pub mod revision;
pub mod types;

pub use config::{
    BackendKind, CutoverConfig, EnvironmentConfig, RevisionDefaults, StateConfig, StepTimeouts,
    Timeouts, parse_duration,
};
pub use image::{ImageError, ImageRef};
pub use revision::{LogTarget, PortMapping, Revision, RevisionError, RevisionId, RevisionSpec};
pub use types::*;

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
