//! Per-environment adapter dispatch.
//!
//! Each environment in `cutover.toml` picks its own backend. The registry
//! routes every call to the adapter registered for that environment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cutover_core::{Revision, RevisionSpec};

use crate::error::{ClusterError, ClusterResult};
use crate::{BoxFuture, ClusterAdapter, WaitOutcome};

#[derive(Clone, Default)]
pub struct ClusterRegistry {
    adapters: HashMap<String, Arc<dyn ClusterAdapter>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `environment` to `adapter`, replacing any earlier entry.
    pub fn with_environment(mut self, environment: &str, adapter: Arc<dyn ClusterAdapter>) -> Self {
        self.adapters.insert(environment.to_string(), adapter);
        self
    }

    pub fn environments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    fn adapter(&self, environment: &str) -> ClusterResult<&Arc<dyn ClusterAdapter>> {
        self.adapters
            .get(environment)
            .ok_or_else(|| ClusterError::Backend(format!("no cluster backend for {environment}")))
    }
}

impl ClusterAdapter for ClusterRegistry {
    fn current_revision<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Revision>> {
        Box::pin(async move { self.adapter(environment)?.current_revision(environment).await })
    }

    fn register_revision<'a>(
        &'a self,
        environment: &'a str,
        spec: &'a RevisionSpec,
    ) -> BoxFuture<'a, ClusterResult<Revision>> {
        Box::pin(async move {
            self.adapter(environment)?
                .register_revision(environment, spec)
                .await
        })
    }

    fn update_service<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a Revision,
    ) -> BoxFuture<'a, ClusterResult<()>> {
        Box::pin(async move {
            self.adapter(environment)?
                .update_service(environment, revision)
                .await
        })
    }

    fn wait_stable<'a>(
        &'a self,
        environment: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ClusterResult<WaitOutcome>> {
        Box::pin(async move { self.adapter(environment)?.wait_stable(environment, timeout).await })
    }

    fn list_revisions<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Vec<Revision>>> {
        Box::pin(async move { self.adapter(environment)?.list_revisions(environment).await })
    }
}
