//! Splits persisted in the state store.
//!
//! `StoredTraffic` is the backend the CLI and API use: the split and the
//! attached targets of every environment live in the state store, where a
//! mesh or proxy picks them up. [`StoredTraffic::sync_router`] does that
//! for an in-process [`Router`], as [`crate::TrafficProxy`] does on every
//! tick.

use std::collections::HashMap;

use tracing::debug;

use cutover_core::{RevisionId, TrafficSplit, now_secs};
use cutover_state::{StateStore, TrafficTarget};

use crate::error::TrafficResult;
use crate::router::Router;
use crate::{BoxFuture, TrafficBackend};

#[derive(Clone)]
pub struct StoredTraffic {
    store: StateStore,
}

impl StoredTraffic {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Rebuild `router`'s view of `environment` from the store. Routes
    /// the store no longer has are dropped.
    pub fn sync_router(&self, router: &Router, environment: &str) -> TrafficResult<SyncStats> {
        let endpoints: HashMap<RevisionId, String> = self
            .store
            .list_targets(environment)?
            .into_iter()
            .map(|t| (t.revision, t.endpoint))
            .collect();
        let split = self.store.get_split(environment)?;
        let stats = SyncStats {
            targets: endpoints.len() as u32,
            split_applied: split.is_some(),
        };
        router.replace_environment(environment, endpoints, split.as_ref());
        debug!(
            %environment,
            targets = stats.targets,
            split = stats.split_applied,
            "router synced from state store"
        );
        Ok(stats)
    }
}

/// Statistics from a router sync.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub targets: u32,
    pub split_applied: bool,
}

impl TrafficBackend for StoredTraffic {
    fn attach<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
        endpoint: &'a str,
    ) -> BoxFuture<'a, TrafficResult<()>> {
        Box::pin(async move {
            if let Some(existing) = self.store.get_target(environment, revision)? {
                if existing.endpoint == endpoint {
                    return Ok(());
                }
            }
            self.store.put_target(&TrafficTarget {
                environment: environment.to_string(),
                revision: revision.clone(),
                endpoint: endpoint.to_string(),
                attached_at: now_secs(),
            })?;
            debug!(%environment, %revision, endpoint, "traffic target stored");
            Ok(())
        })
    }

    fn is_attached<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
    ) -> BoxFuture<'a, TrafficResult<bool>> {
        Box::pin(async move { Ok(self.store.get_target(environment, revision)?.is_some()) })
    }

    fn apply<'a>(&'a self, split: &'a TrafficSplit) -> BoxFuture<'a, TrafficResult<()>> {
        Box::pin(async move { Ok(self.store.put_split(split)?) })
    }

    fn current<'a>(
        &'a self,
        environment: &'a str,
    ) -> BoxFuture<'a, TrafficResult<Option<TrafficSplit>>> {
        Box::pin(async move { Ok(self.store.get_split(environment)?) })
    }
}
