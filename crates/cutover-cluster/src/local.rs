//! Local cluster — a state-store backed stand-in for a real scheduler.
//!
//! Revisions are stored in the `REVISIONS` table and the service binding
//! of each environment in `SERVICES`. Updates converge instantly, so
//! `wait_stable` always reports `Stable`. Useful for single-host setups
//! where the process manager reads the binding, and for tests.

use std::time::Duration;

use tracing::{debug, info};

use cutover_core::{Revision, RevisionSpec, now_secs};
use cutover_state::{ServiceBinding, StateStore};

use crate::error::{ClusterError, ClusterResult};
use crate::{BoxFuture, ClusterAdapter, WaitOutcome};

#[derive(Clone)]
pub struct LocalCluster {
    store: StateStore,
}

impl LocalCluster {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl ClusterAdapter for LocalCluster {
    fn current_revision<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Revision>> {
        Box::pin(async move {
            let binding = self
                .store
                .get_service(environment)?
                .ok_or_else(|| ClusterError::NotFound(format!("no service for {environment}")))?;
            self.store
                .get_revision(environment, &binding.revision)?
                .ok_or_else(|| {
                    ClusterError::NotFound(format!(
                        "service {environment} runs unknown revision {}",
                        binding.revision
                    ))
                })
        })
    }

    fn register_revision<'a>(
        &'a self,
        environment: &'a str,
        spec: &'a RevisionSpec,
    ) -> BoxFuture<'a, ClusterResult<Revision>> {
        Box::pin(async move {
            spec.validate()
                .map_err(|e| ClusterError::Registration(e.to_string()))?;
            let id = spec.revision_id();
            let revision = Revision {
                backend_ref: format!("local:{environment}:{id}"),
                id,
                spec: spec.clone(),
                registered_at: now_secs(),
            };
            let stored = self.store.put_revision(environment, &revision)?;
            info!(%environment, revision = %stored.id, image = %stored.spec.image, "revision registered");
            Ok(stored)
        })
    }

    fn update_service<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a Revision,
    ) -> BoxFuture<'a, ClusterResult<()>> {
        Box::pin(async move {
            if self.store.get_revision(environment, &revision.id)?.is_none() {
                return Err(ClusterError::ServiceUpdate(format!(
                    "revision {} is not registered in {environment}",
                    revision.id
                )));
            }
            let standby = self
                .store
                .get_service(environment)?
                .map(|b| b.revision)
                .filter(|r| *r != revision.id);
            self.store.put_service(&ServiceBinding {
                environment: environment.to_string(),
                revision: revision.id.clone(),
                standby,
                updated_at: now_secs(),
            })?;
            info!(%environment, revision = %revision.id, "service updated");
            Ok(())
        })
    }

    fn wait_stable<'a>(
        &'a self,
        environment: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, ClusterResult<WaitOutcome>> {
        Box::pin(async move {
            debug!(%environment, "local service converged");
            Ok(WaitOutcome::Stable)
        })
    }

    fn list_revisions<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Vec<Revision>>> {
        Box::pin(async move { Ok(self.store.list_revisions(environment)?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_core::PortMapping;

    fn spec(image: &str) -> RevisionSpec {
        RevisionSpec {
            name: "web".to_string(),
            image: image.to_string(),
            cpu: 256,
            memory_mib: 512,
            ports: vec![PortMapping::tcp(8080)],
            logging: None,
        }
    }

    fn cluster() -> LocalCluster {
        LocalCluster::new(StateStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn current_revision_not_found_before_first_update() {
        let cluster = cluster();
        let err = cluster.current_revision("prod").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn register_then_update_sets_current() {
        let cluster = cluster();
        let rev = cluster.register_revision("prod", &spec("web:v1")).await.unwrap();
        cluster.update_service("prod", &rev).await.unwrap();

        let current = cluster.current_revision("prod").await.unwrap();
        assert_eq!(current.id, rev.id);
        assert_eq!(
            cluster.wait_stable("prod", Duration::from_secs(1)).await.unwrap(),
            WaitOutcome::Stable
        );
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let cluster = cluster();
        let a = cluster.register_revision("prod", &spec("web:v1")).await.unwrap();
        let b = cluster.register_revision("prod", &spec("web:v1")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(cluster.list_revisions("prod").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn register_rejects_invalid_spec() {
        let cluster = cluster();
        let mut bad = spec("web:v1");
        bad.memory_mib = 0;
        let err = cluster.register_revision("prod", &bad).await.unwrap_err();
        assert!(matches!(err, ClusterError::Registration(_)));
    }

    #[tokio::test]
    async fn update_with_unregistered_revision_fails() {
        let cluster = cluster();
        let rev = cluster.register_revision("staging", &spec("web:v1")).await.unwrap();
        let err = cluster.update_service("prod", &rev).await.unwrap_err();
        assert!(matches!(err, ClusterError::ServiceUpdate(_)));
    }

    #[tokio::test]
    async fn update_keeps_old_revision_as_standby() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = LocalCluster::new(store.clone());
        let v1 = cluster.register_revision("prod", &spec("web:v1")).await.unwrap();
        let v2 = cluster.register_revision("prod", &spec("web:v2")).await.unwrap();
        cluster.update_service("prod", &v1).await.unwrap();
        cluster.update_service("prod", &v2).await.unwrap();

        let binding = store.get_service("prod").unwrap().unwrap();
        assert_eq!(binding.revision, v2.id);
        assert_eq!(binding.standby, Some(v1.id));
    }
}
