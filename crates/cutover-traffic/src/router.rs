//! In-process weighted router.
//!
//! The router maps each environment to its attached revisions and the
//! split in effect. `next_backend` picks a revision by smooth weighted
//! round-robin: over any 100 consecutive picks a 70/30 split yields
//! exactly 70 and 30, interleaved rather than in bursts. A revision with
//! weight 0 is never picked.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use cutover_core::{RevisionId, TrafficSplit};

use crate::error::TrafficResult;
use crate::{BoxFuture, TrafficBackend};

/// A revision endpoint that can serve traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub revision: RevisionId,
    pub endpoint: String,
}

struct Slot {
    revision: RevisionId,
    weight: i32,
    current: i32,
}

#[derive(Default)]
struct EnvironmentEntry {
    endpoints: HashMap<RevisionId, String>,
    split: Option<TrafficSplit>,
    slots: Vec<Slot>,
}

/// Routes requests to revision endpoints by weight.
#[derive(Clone, Default)]
pub struct Router {
    environments: Arc<RwLock<HashMap<String, EnvironmentEntry>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the endpoint for the next request to `environment`.
    pub fn next_backend(&self, environment: &str) -> Option<Route> {
        let mut environments = self
            .environments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = environments.get_mut(environment)?;

        let total: i32 = entry.slots.iter().map(|s| s.weight).sum();
        if total == 0 {
            return None;
        }
        for slot in &mut entry.slots {
            slot.current += slot.weight;
        }
        let chosen = entry
            .slots
            .iter_mut()
            .filter(|s| s.weight > 0)
            .max_by_key(|s| s.current)?;
        chosen.current -= total;
        let revision = chosen.revision.clone();

        let endpoint = entry.endpoints.get(&revision)?.clone();
        Some(Route { revision, endpoint })
    }

    pub(crate) fn attach_route(&self, environment: &str, revision: &RevisionId, endpoint: &str) {
        let mut environments = self
            .environments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        environments
            .entry(environment.to_string())
            .or_default()
            .endpoints
            .insert(revision.clone(), endpoint.to_string());
        debug!(%environment, %revision, endpoint, "route attached");
    }

    pub(crate) fn replace_split(&self, split: &TrafficSplit) {
        let mut environments = self
            .environments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = environments
            .entry(split.environment().to_string())
            .or_default();
        entry.slots = split
            .weights()
            .iter()
            .map(|(revision, weight)| Slot {
                revision: revision.clone(),
                weight: i32::from(*weight),
                current: 0,
            })
            .collect();
        entry.split = Some(split.clone());
        debug!(environment = split.environment(), %split, "router split replaced");
    }

    /// Swap the environment's endpoints wholesale. Weighted-round-robin
    /// state survives when `split` is the one already in effect.
    pub(crate) fn replace_environment(
        &self,
        environment: &str,
        endpoints: HashMap<RevisionId, String>,
        split: Option<&TrafficSplit>,
    ) {
        let mut environments = self
            .environments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = environments.entry(environment.to_string()).or_default();
        entry.endpoints = endpoints;
        if entry.split.as_ref() == split {
            return;
        }
        entry.slots = split
            .map(|s| {
                s.weights()
                    .iter()
                    .map(|(revision, weight)| Slot {
                        revision: revision.clone(),
                        weight: i32::from(*weight),
                        current: 0,
                    })
                    .collect()
            })
            .unwrap_or_default();
        entry.split = split.cloned();
        debug!(%environment, split = ?entry.split, "router environment replaced");
    }
}

impl TrafficBackend for Router {
    fn attach<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
        endpoint: &'a str,
    ) -> BoxFuture<'a, TrafficResult<()>> {
        Box::pin(async move {
            self.attach_route(environment, revision, endpoint);
            Ok(())
        })
    }

    fn is_attached<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
    ) -> BoxFuture<'a, TrafficResult<bool>> {
        Box::pin(async move {
            let environments = self
                .environments
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            Ok(environments
                .get(environment)
                .is_some_and(|e| e.endpoints.contains_key(revision)))
        })
    }

    fn apply<'a>(&'a self, split: &'a TrafficSplit) -> BoxFuture<'a, TrafficResult<()>> {
        Box::pin(async move {
            self.replace_split(split);
            Ok(())
        })
    }

    fn current<'a>(
        &'a self,
        environment: &'a str,
    ) -> BoxFuture<'a, TrafficResult<Option<TrafficSplit>>> {
        Box::pin(async move {
            let environments = self
                .environments
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            Ok(environments.get(environment).and_then(|e| e.split.clone()))
        })
    }
}
