//! cutover.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::revision::{LogTarget, PortMapping, RevisionSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutoverConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Path of the redb state file.
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".cutover/state.redb"),
        }
    }
}

/// Which compute backend an environment runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Revisions and service bindings kept in the state store.
    #[default]
    Local,
    /// Amazon ECS via the `aws` CLI.
    Ecs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub backend: BackendKind,
    pub cluster: Option<String>,
    pub service: Option<String>,
    /// Second ECS service. With it, revisions alternate between the two
    /// services so the outgoing revision keeps running beside the new one.
    pub standby_service: Option<String>,
    /// Task definition family; defaults to the service name.
    pub family: Option<String>,
    pub execution_role_arn: Option<String>,
    pub region: Option<String>,
    /// Health URL of a revision before it takes traffic. `{revision}` is
    /// replaced with the revision id.
    pub private_health_url: String,
    /// Health URL through the load-balanced path.
    pub public_health_url: String,
    #[serde(default)]
    pub timeouts: Timeouts,
    pub defaults: Option<RevisionDefaults>,
    /// Application load balancer listener whose weighted forward action
    /// carries the environment's traffic.
    pub listener_arn: Option<String>,
    /// Target group of each ECS service, keyed by service name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_groups: BTreeMap<String, String>,
    /// Address `cutover serve` proxies the environment's traffic on.
    pub listen: Option<String>,
}

/// Step timeouts as duration strings ("5s", "500ms", "2m").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// How long `wait_stable` may take.
    #[serde(default = "default_stable")]
    pub stable: String,
    /// Health probe window.
    #[serde(default = "default_health")]
    pub health: String,
    /// Interval between probe attempts.
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Timeout of a single probe request.
    #[serde(default = "default_request")]
    pub request: String,
}

fn default_stable() -> String {
    "300s".to_string()
}
fn default_health() -> String {
    "60s".to_string()
}
fn default_interval() -> String {
    "5s".to_string()
}
fn default_request() -> String {
    "2s".to_string()
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            stable: default_stable(),
            health: default_health(),
            interval: default_interval(),
            request: default_request(),
        }
    }
}

/// Parsed step timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    pub stable: Duration,
    pub health: Duration,
    pub interval: Duration,
    pub request: Duration,
}

impl Timeouts {
    pub fn resolve(&self) -> anyhow::Result<StepTimeouts> {
        let parse = |name: &str, value: &str| {
            parse_duration(value).ok_or_else(|| anyhow!("invalid {name} timeout: {value:?}"))
        };
        Ok(StepTimeouts {
            stable: parse("stable", &self.stable)?,
            health: parse("health", &self.health)?,
            interval: parse("interval", &self.interval)?,
            request: parse("request", &self.request)?,
        })
    }
}

/// Defaults used to build a revision spec from a bare image reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionDefaults {
    /// Container name.
    pub name: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub port: u16,
    pub log_group: Option<String>,
    #[serde(default = "default_log_driver")]
    pub log_driver: String,
    pub log_stream_prefix: Option<String>,
}

fn default_log_driver() -> String {
    "awslogs".to_string()
}

impl RevisionDefaults {
    /// Build a full spec around `image`.
    pub fn spec_for(&self, image: &str) -> RevisionSpec {
        RevisionSpec {
            name: self.name.clone(),
            image: image.to_string(),
            cpu: self.cpu,
            memory_mib: self.memory_mib,
            ports: vec![PortMapping::tcp(self.port)],
            logging: self.log_group.as_ref().map(|group| LogTarget {
                driver: self.log_driver.clone(),
                group: group.clone(),
                stream_prefix: self.log_stream_prefix.clone(),
            }),
        }
    }
}

impl EnvironmentConfig {
    /// Task definition family for ECS.
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref().or(self.service.as_deref())
    }

    /// ECS services of the environment, `service` before `standby_service`.
    pub fn services(&self) -> Vec<&str> {
        self.service
            .as_deref()
            .into_iter()
            .chain(self.standby_service.as_deref())
            .collect()
    }

    fn validate(&self, name: &str) -> anyhow::Result<()> {
        validate_name(name)?;
        if self.backend == BackendKind::Ecs {
            if self.cluster.is_none() {
                bail!("environment {name}: ecs backend requires `cluster`");
            }
            if self.service.is_none() {
                bail!("environment {name}: ecs backend requires `service`");
            }
        }
        if self.listener_arn.is_some() {
            if self.backend != BackendKind::Ecs || self.standby_service.is_none() {
                bail!(
                    "environment {name}: `listener_arn` needs the ecs backend with `service` and `standby_service`"
                );
            }
            for service in self.services() {
                if !self.target_groups.contains_key(service) {
                    bail!("environment {name}: no target group for service {service}");
                }
            }
        }
        if let Some(listen) = &self.listen {
            if self.backend != BackendKind::Local {
                bail!("environment {name}: `listen` is only supported with the local backend");
            }
            listen
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("environment {name}: invalid listen address {listen:?}"))?;
        }
        self.timeouts
            .resolve()
            .with_context(|| format!("environment {name}"))?;
        Ok(())
    }
}

/// Environment names become key prefixes and lock file names, so they are
/// limited to ASCII letters, digits, `-` and `_`.
fn validate_name(name: &str) -> anyhow::Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        bail!("invalid environment name {name:?}: use letters, digits, `-` and `_`");
    }
    Ok(())
}

impl CutoverConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: CutoverConfig = toml::from_str(content)?;
        for (name, env) in &config.environments {
            env.validate(name)?;
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Look up an environment by name.
    pub fn environment(&self, name: &str) -> anyhow::Result<&EnvironmentConfig> {
        self.environments
            .get(name)
            .ok_or_else(|| anyhow!("unknown environment: {name}"))
    }

    /// Scaffold a config with one local environment.
    pub fn scaffold(environment: &str, port: u16) -> Self {
        let env = EnvironmentConfig {
            backend: BackendKind::Local,
            cluster: None,
            service: Some("app".to_string()),
            standby_service: None,
            family: None,
            execution_role_arn: None,
            region: None,
            private_health_url: format!("http://127.0.0.1:{port}/healthz"),
            public_health_url: format!("http://127.0.0.1:{port}/healthz"),
            timeouts: Timeouts::default(),
            defaults: Some(RevisionDefaults {
                name: "app".to_string(),
                cpu: 256,
                memory_mib: 512,
                port,
                log_group: None,
                log_driver: default_log_driver(),
                log_stream_prefix: None,
            }),
            listener_arn: None,
            target_groups: BTreeMap::new(),
            listen: None,
        };
        CutoverConfig {
            state: StateConfig::default(),
            environments: BTreeMap::from([(environment.to_string(), env)]),
        }
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
