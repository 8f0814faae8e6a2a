//! Per-environment backend dispatch.
//!
//! An environment fronted by a load balancer shifts weights there; the
//! rest keep their splits in the state store. The registry routes every
//! call to the backend registered for the split's environment.

use std::collections::HashMap;
use std::sync::Arc;

use cutover_core::{RevisionId, TrafficSplit};

use crate::error::{TrafficError, TrafficResult};
use crate::{BoxFuture, TrafficBackend};

#[derive(Clone, Default)]
pub struct TrafficRegistry {
    backends: HashMap<String, Arc<dyn TrafficBackend>>,
}

impl TrafficRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `environment` to `backend`, replacing any earlier entry.
    pub fn with_environment(mut self, environment: &str, backend: Arc<dyn TrafficBackend>) -> Self {
        self.backends.insert(environment.to_string(), backend);
        self
    }

    fn backend(&self, environment: &str) -> TrafficResult<&Arc<dyn TrafficBackend>> {
        self.backends
            .get(environment)
            .ok_or_else(|| TrafficError::Backend(format!("no traffic backend for {environment}")))
    }
}

impl TrafficBackend for TrafficRegistry {
    fn attach<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
        endpoint: &'a str,
    ) -> BoxFuture<'a, TrafficResult<()>> {
        Box::pin(async move {
            self.backend(environment)?
                .attach(environment, revision, endpoint)
                .await
        })
    }

    fn is_attached<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
    ) -> BoxFuture<'a, TrafficResult<bool>> {
        Box::pin(async move { self.backend(environment)?.is_attached(environment, revision).await })
    }

    fn apply<'a>(&'a self, split: &'a TrafficSplit) -> BoxFuture<'a, TrafficResult<()>> {
        Box::pin(async move { self.backend(split.environment())?.apply(split).await })
    }

    fn current<'a>(
        &'a self,
        environment: &'a str,
    ) -> BoxFuture<'a, TrafficResult<Option<TrafficSplit>>> {
        Box::pin(async move { self.backend(environment)?.current(environment).await })
    }
}
