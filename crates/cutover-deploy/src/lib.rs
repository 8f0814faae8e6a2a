//! cutover-deploy — blue/green deployment orchestration.
//!
//! The [`Orchestrator`] runs one attempt per environment at a time: it
//! registers the new (green) revision, brings it up next to the serving
//! (blue) one, gates on health, moves all traffic in one split change, and
//! verifies through the public path. Failures after registration are
//! rolled back by the [`RollbackCoordinator`]. Every attempt ends in a
//! [`cutover_core::DeploymentReport`] appended to the environment's
//! history.
//!
//! # Components
//!
//! - **`orchestrator`** — the deployment state machine
//! - **`gate`** — health gates and the latest verdict per environment
//! - **`rollback`** — restore of a known-good revision, automatic or requested
//! - **`lease`** — per-environment mutual exclusion and cancellation
//! - **`settings`** — health URLs and step timeouts per environment

pub mod error;
pub mod gate;
pub mod lease;
pub mod orchestrator;
pub mod rollback;
pub mod settings;

#[cfg(test)]
mod testkit;

pub use error::{DeployError, DeployResult};
pub use gate::HealthGate;
pub use lease::{CancelHandle, CancelToken, Lease, LeaseRegistry};
pub use orchestrator::{EnvironmentStatus, Orchestrator};
pub use rollback::RollbackCoordinator;
pub use settings::{EnvironmentSettings, settings_from_config};
