//! cutover-cluster — compute-orchestration backends.
//!
//! The [`ClusterAdapter`] trait is the only view the orchestrator has of
//! the compute backend: register a revision, point the service at it,
//! wait for convergence, and read back what is running. Adapters make a
//! single attempt per call; retry policy belongs to the caller.
//!
//! # Adapters
//!
//! - **`local`** — [`LocalCluster`], revisions and service bindings kept in
//!   the state store. Converges immediately.
//! - **`ecs`** — [`EcsCluster`], Amazon ECS driven through the `aws` CLI,
//!   with an optional standby service so two revisions run side by side.
//!
//! [`ClusterRegistry`] dispatches each environment to its own adapter.
//! [`ElbTraffic`] is the matching traffic backend: it weighs an
//! environment's two ECS services at an Application Load Balancer
//! listener.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use cutover_core::{Revision, RevisionSpec};

pub mod aws;
pub mod ecs;
pub mod elb;
pub mod error;
pub mod local;
pub mod registry;

pub use aws::{AwsCli, CommandOutput, CommandRunner};
pub use ecs::{EcsCluster, EcsService};
pub use elb::{ElbListener, ElbTraffic};
pub use error::{ClusterError, ClusterResult};
pub use local::LocalCluster;
pub use registry::ClusterRegistry;

/// Boxed future alias for adapter results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of waiting for a service to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Stable,
    TimedOut,
}

/// Abstraction over the compute-orchestration backend.
pub trait ClusterAdapter: Send + Sync {
    /// Revision the environment's service currently runs.
    ///
    /// Fails with [`ClusterError::NotFound`] when nothing has been deployed.
    fn current_revision<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Revision>>;

    /// Register a new immutable revision from a spec.
    fn register_revision<'a>(
        &'a self,
        environment: &'a str,
        spec: &'a RevisionSpec,
    ) -> BoxFuture<'a, ClusterResult<Revision>>;

    /// Point the environment's service at `revision`. The backend starts
    /// scheduling its tasks; the previous ones keep running until replaced.
    fn update_service<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a Revision,
    ) -> BoxFuture<'a, ClusterResult<()>>;

    /// Wait until the service has converged or `timeout` elapses.
    fn wait_stable<'a>(
        &'a self,
        environment: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ClusterResult<WaitOutcome>>;

    /// Known revisions of the environment, newest first.
    fn list_revisions<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Vec<Revision>>>;
}
