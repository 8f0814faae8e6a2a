//! Assembles the orchestrator from cutover.toml.
//!
//! Every command opens the state file per transaction, so any number of
//! cutover processes can share it. Operations on one environment exclude
//! each other through lock files next to the state file.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use tracing::{debug, info};

use cutover_cluster::{
    AwsCli, ClusterRegistry, EcsCluster, EcsService, ElbListener, ElbTraffic, LocalCluster,
};
use cutover_core::{BackendKind, CutoverConfig, EnvironmentConfig};
use cutover_deploy::{LeaseRegistry, Orchestrator, settings_from_config};
use cutover_health::{HttpCheck, Prober};
use cutover_state::StateStore;
use cutover_traffic::{StoredTraffic, TrafficController, TrafficRegistry};

pub struct Context {
    pub config: CutoverConfig,
    pub store: StateStore,
    pub orchestrator: Orchestrator,
}

impl Context {
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let config = CutoverConfig::from_file(config_path)?;
        Self::from_config(config, config_path.parent())
    }

    /// Relative state paths resolve against `base`, the config's directory.
    pub fn from_config(config: CutoverConfig, base: Option<&Path>) -> anyhow::Result<Self> {
        let state_path = match base {
            Some(dir) if config.state.path.is_relative() => dir.join(&config.state.path),
            _ => config.state.path.clone(),
        };
        if let Some(parent) = state_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = StateStore::open(&state_path)?;
        let lock_dir = state_path.with_extension("locks");
        info!(path = ?state_path, locks = ?lock_dir, "state store ready");

        let cluster = cluster_registry(&config, &store)?;
        let traffic = TrafficController::new(Arc::new(traffic_registry(&config, &store)?));
        let environments = settings_from_config(&config)?;
        let request_timeout = environments
            .values()
            .map(|s| s.timeouts.request)
            .max()
            .unwrap_or(std::time::Duration::from_secs(2));
        let check = HttpCheck::new().map_err(anyhow::Error::msg)?;
        let prober = Prober::new(Arc::new(check), request_timeout);

        let orchestrator =
            Orchestrator::new(store.clone(), Arc::new(cluster), traffic, prober, environments)
                .with_leases(LeaseRegistry::with_lock_dir(lock_dir));
        Ok(Self {
            config,
            store,
            orchestrator,
        })
    }
}

/// One adapter per environment, chosen by its `backend`.
fn cluster_registry(config: &CutoverConfig, store: &StateStore) -> anyhow::Result<ClusterRegistry> {
    let local = Arc::new(LocalCluster::new(store.clone()));
    let mut registry = ClusterRegistry::new();
    for (name, env) in &config.environments {
        registry = match env.backend {
            BackendKind::Local => registry.with_environment(name, local.clone()),
            BackendKind::Ecs => registry.with_environment(name, Arc::new(ecs_cluster(name, env)?)),
        };
        debug!(environment = %name, backend = ?env.backend, "cluster adapter configured");
    }
    Ok(registry)
}

/// A load balancer listener where one is configured, else the state store.
fn traffic_registry(config: &CutoverConfig, store: &StateStore) -> anyhow::Result<TrafficRegistry> {
    let stored = Arc::new(StoredTraffic::new(store.clone()));
    let mut registry = TrafficRegistry::new();
    for (name, env) in &config.environments {
        registry = match &env.listener_arn {
            Some(listener_arn) => {
                let listener = ElbListener {
                    listener_arn: listener_arn.clone(),
                    service: ecs_service(name, env)?,
                    target_groups: env.target_groups.clone(),
                };
                let runner = Arc::new(AwsCli::new(env.region.clone()));
                debug!(environment = %name, listener = %listener_arn, "traffic shifts at the load balancer");
                registry.with_environment(name, Arc::new(ElbTraffic::new(runner).with_environment(name, listener)))
            }
            None => registry.with_environment(name, stored.clone()),
        };
    }
    Ok(registry)
}

fn ecs_cluster(name: &str, env: &EnvironmentConfig) -> anyhow::Result<EcsCluster> {
    let runner = Arc::new(AwsCli::new(env.region.clone()));
    Ok(EcsCluster::new(runner).with_environment(name, ecs_service(name, env)?))
}

fn ecs_service(name: &str, env: &EnvironmentConfig) -> anyhow::Result<EcsService> {
    let missing = |field: &str| anyhow!("environment {name}: ecs backend requires `{field}`");
    Ok(EcsService {
        cluster: env.cluster.clone().ok_or_else(|| missing("cluster"))?,
        service: env.service.clone().ok_or_else(|| missing("service"))?,
        standby: env.standby_service.clone(),
        family: env.family().ok_or_else(|| missing("family"))?.to_string(),
        execution_role_arn: env.execution_role_arn.clone(),
        region: env.region.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[state]
path = "state/cutover.redb"

[environments.prod]
private_health_url = "http://{revision}.internal:8080/healthz"
public_health_url = "http://prod.example.com/healthz"

[environments.aws]
backend = "ecs"
cluster = "main"
service = "web"
region = "eu-west-1"
private_health_url = "http://{revision}.internal:8080/healthz"
public_health_url = "http://web.example.com/healthz"
"#;

    #[test]
    fn state_path_resolves_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = CutoverConfig::from_toml(CONFIG).unwrap();
        let ctx = Context::from_config(config, Some(dir.path())).unwrap();
        assert!(dir.path().join("state/cutover.redb").exists());
        assert!(ctx.orchestrator.history("prod", 5).unwrap().is_empty());
    }

    #[test]
    fn every_environment_gets_an_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let config = CutoverConfig::from_toml(CONFIG).unwrap();
        let store = StateStore::open(&dir.path().join("s.redb")).unwrap();
        let registry = cluster_registry(&config, &store).unwrap();
        assert_eq!(registry.environments(), vec!["aws", "prod"]);
    }

    #[tokio::test]
    async fn processes_share_the_state_file_per_environment() {
        let dir = tempfile::tempdir().unwrap();
        let config = CutoverConfig::from_toml(CONFIG).unwrap();
        let first = Context::from_config(config.clone(), Some(dir.path())).unwrap();
        let second = Context::from_config(config, Some(dir.path())).unwrap();

        let lease = first.orchestrator.begin("prod").unwrap();
        assert!(dir.path().join("state/cutover.locks/prod.lock").exists());
        assert!(second.orchestrator.status("prod").await.unwrap().in_progress);
        assert!(second.orchestrator.history("prod", 5).unwrap().is_empty());

        let err = match second.orchestrator.begin("prod") {
            Ok(_) => panic!("prod is leased by the first context"),
            Err(e) => anyhow::Error::new(e),
        };
        assert_eq!(super::super::exit_code(&err), 15);
        let other = second.orchestrator.begin("aws").unwrap();

        drop(lease);
        drop(other);
        assert!(second.orchestrator.begin("prod").is_ok());
    }

    #[test]
    fn listener_environments_shift_at_the_load_balancer() {
        let config = CutoverConfig::from_toml(
            r#"
[environments.web]
backend = "ecs"
cluster = "main"
service = "web-blue"
standby_service = "web-green"
listener_arn = "arn:aws:elasticloadbalancing:eu-west-1:123:listener/app/web/1/2"
private_health_url = "http://{revision}.internal:8080/healthz"
public_health_url = "https://web.example.com/healthz"

[environments.web.target_groups]
web-blue = "arn:aws:elasticloadbalancing:eu-west-1:123:targetgroup/web-blue/1"
web-green = "arn:aws:elasticloadbalancing:eu-west-1:123:targetgroup/web-green/2"
"#,
        )
        .unwrap();
        let env = config.environment("web").unwrap();
        let service = ecs_service("web", env).unwrap();
        assert_eq!(service.services(), vec!["web-blue", "web-green"]);

        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("s.redb")).unwrap();
        assert!(traffic_registry(&config, &store).is_ok());
    }
}
