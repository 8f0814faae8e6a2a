//! cutover-traffic — the traffic controller.
//!
//! [`TrafficController`] validates and applies [`TrafficSplit`]s through a
//! [`TrafficBackend`]. A split is always replaced wholesale, so readers
//! observe either the old split or the new one.
//!
//! # Backends
//!
//! - [`Router`] — in-process weighted router.
//! - [`StoredTraffic`] — splits and targets persisted in the state store,
//!   for a mesh or proxy that syncs from it.
//! - [`TrafficRegistry`] — per-environment dispatch over the above.
//!
//! [`TrafficProxy`] serves an environment's clients from the stored split.

use std::future::Future;
use std::pin::Pin;

use cutover_core::{RevisionId, TrafficSplit};

pub mod controller;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod stored;

pub use controller::TrafficController;
pub use error::{TrafficError, TrafficResult};
pub use proxy::TrafficProxy;
pub use registry::TrafficRegistry;
pub use router::{Route, Router};
pub use stored::{StoredTraffic, SyncStats};

/// Boxed future alias for backend results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where splits are applied.
pub trait TrafficBackend: Send + Sync {
    /// Make `revision` a routable target of `environment`. Re-attaching
    /// updates the endpoint.
    fn attach<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
        endpoint: &'a str,
    ) -> BoxFuture<'a, TrafficResult<()>>;

    /// Whether `revision` is attached to `environment`.
    fn is_attached<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
    ) -> BoxFuture<'a, TrafficResult<bool>>;

    /// Replace the environment's split in one step.
    fn apply<'a>(&'a self, split: &'a TrafficSplit) -> BoxFuture<'a, TrafficResult<()>>;

    /// The split in effect, `None` before the first apply.
    fn current<'a>(&'a self, environment: &'a str)
    -> BoxFuture<'a, TrafficResult<Option<TrafficSplit>>>;
}
