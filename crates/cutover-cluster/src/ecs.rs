//! Amazon ECS adapter.
//!
//! Each environment maps to one ECS service, or to a pair of services when
//! a standby is configured. Revisions are Fargate task definitions tagged
//! with their content-derived revision id, so the id survives the round
//! trip even though ECS normalizes the definition (filling in host ports,
//! defaulting protocols).
//!
//! With a pair, each service is a slot. The slot tagged
//! `cutover:role=primary` runs the environment's current revision; a new
//! revision goes to the other slot, which is then promoted. The outgoing
//! revision keeps running in the demoted slot until the next deploy
//! replaces it, so a load balancer can weigh traffic across both.
//!
//! Convergence is polled through `describe-services` rather than the
//! CLI waiter so the caller's timeout is honoured exactly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cutover_core::{LogTarget, PortMapping, Revision, RevisionId, RevisionSpec, now_secs};

use crate::aws::{CommandRunner, call, parse};
use crate::error::{ClusterError, ClusterResult};
use crate::{BoxFuture, ClusterAdapter, WaitOutcome};

/// Tag key carrying the revision id on task definitions.
pub const REVISION_TAG: &str = "cutover:revision";

/// Tag key marking a service's slot role, `primary` or `standby`.
pub const ROLE_TAG: &str = "cutover:role";

/// How many task definitions `list_revisions` describes.
const LIST_LIMIT: usize = 20;

/// ECS coordinates of one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsService {
    pub cluster: String,
    pub service: String,
    /// Second slot; revisions alternate between `service` and this one.
    pub standby: Option<String>,
    /// Task definition family.
    pub family: String,
    pub execution_role_arn: Option<String>,
    /// Region used for the awslogs driver options.
    pub region: Option<String>,
}

impl EcsService {
    pub fn services(&self) -> Vec<&str> {
        std::iter::once(self.service.as_str())
            .chain(self.standby.as_deref())
            .collect()
    }
}

pub struct EcsCluster {
    runner: Arc<dyn CommandRunner>,
    services: HashMap<String, EcsService>,
    poll_interval: Duration,
}

impl EcsCluster {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            services: HashMap::new(),
            poll_interval: Duration::from_secs(15),
        }
    }

    /// Bind an environment to an ECS service.
    pub fn with_environment(mut self, environment: &str, service: EcsService) -> Self {
        self.services.insert(environment.to_string(), service);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn service(&self, environment: &str) -> ClusterResult<&EcsService> {
        self.services.get(environment).ok_or_else(|| {
            ClusterError::Backend(format!("no ECS service configured for {environment}"))
        })
    }

    async fn primary(&self, svc: &EcsService) -> ClusterResult<ServiceDescription> {
        let slots = describe_slots(self.runner.as_ref(), svc).await?;
        primary_slot(svc, slots)
    }

    async fn update_slot(
        &self,
        svc: &EcsService,
        slot: &str,
        revision: &Revision,
        desired_count: Option<u32>,
    ) -> ClusterResult<()> {
        let count = desired_count.map(|c| c.to_string());
        let mut args = vec![
            "ecs",
            "update-service",
            "--cluster",
            svc.cluster.as_str(),
            "--service",
            slot,
            "--task-definition",
            revision.backend_ref.as_str(),
        ];
        if let Some(count) = &count {
            args.extend(["--desired-count", count.as_str()]);
        }
        let out = call(self.runner.as_ref(), &args).await?;
        if !out.success {
            return Err(ClusterError::ServiceUpdate(out.stderr));
        }
        let resp: UpdateServiceResponse =
            parse(&out.stdout).map_err(|e| ClusterError::ServiceUpdate(e.to_string()))?;
        if resp.service.task_definition != revision.backend_ref {
            return Err(ClusterError::ServiceUpdate(format!(
                "service reports task definition {} after update to {}",
                resp.service.task_definition, revision.backend_ref
            )));
        }
        Ok(())
    }

    /// Tag `promoted` primary and every other slot standby.
    async fn promote(&self, slots: &[ServiceDescription], promoted: &str) -> ClusterResult<()> {
        for slot in slots {
            let role = if slot.service_name == promoted { "primary" } else { "standby" };
            let tag = format!("key={ROLE_TAG},value={role}");
            let out = call(
                self.runner.as_ref(),
                &["ecs", "tag-resource", "--resource-arn", &slot.service_arn, "--tags", &tag],
            )
            .await?;
            if !out.success {
                return Err(ClusterError::ServiceUpdate(format!(
                    "tagging {} as {role}: {}",
                    slot.service_name, out.stderr
                )));
            }
        }
        Ok(())
    }
}

impl ClusterAdapter for EcsCluster {
    fn current_revision<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Revision>> {
        Box::pin(async move {
            let svc = self.service(environment)?;
            let desc = self.primary(svc).await?;
            if desc.task_definition.is_empty() {
                return Err(ClusterError::NotFound(format!(
                    "service {} has no task definition",
                    desc.service_name
                )));
            }
            describe_task_definition(self.runner.as_ref(), &desc.task_definition).await
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
            let svc = self.service(environment)?;
            let id = spec.revision_id();
            let input = task_definition_input(svc, spec, &id);

            let out = call(
                self.runner.as_ref(),
                &["ecs", "register-task-definition", "--cli-input-json", &input.to_string()],
            )
            .await?;
            if !out.success {
                return Err(ClusterError::Registration(out.stderr));
            }
            let resp: RegisterTaskDefinitionResponse = parse(&out.stdout)?;
            let arn = resp.task_definition.task_definition_arn;
            info!(%environment, revision = %id, %arn, "task definition registered");

            Ok(Revision {
                id,
                spec: spec.clone(),
                backend_ref: arn,
                registered_at: now_secs(),
            })
        })
    }

    fn update_service<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a Revision,
    ) -> BoxFuture<'a, ClusterResult<()>> {
        Box::pin(async move {
            let svc = self.service(environment)?;
            if svc.standby.is_none() {
                self.update_slot(svc, &svc.service, revision, None).await?;
                info!(%environment, revision = %revision.id, service = %svc.service, "service updated");
                return Ok(());
            }

            let slots = describe_slots(self.runner.as_ref(), svc).await?;
            let primary = primary_slot(svc, slots.clone())?;
            // A slot already running the revision is reused as is.
            let target = slots
                .iter()
                .find(|s| s.task_definition == revision.backend_ref)
                .or_else(|| slots.iter().find(|s| s.service_name != primary.service_name))
                .unwrap_or(&primary);
            let desired = (target.service_name != primary.service_name)
                .then_some(primary.desired_count.max(1));
            self.update_slot(svc, &target.service_name, revision, desired)
                .await?;
            self.promote(&slots, &target.service_name).await?;
            info!(
                %environment,
                revision = %revision.id,
                service = %target.service_name,
                demoted = %primary.service_name,
                "slot promoted"
            );
            Ok(())
        })
    }

    fn wait_stable<'a>(
        &'a self,
        environment: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ClusterResult<WaitOutcome>> {
        Box::pin(async move {
            let svc = self.service(environment)?;
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let desc = match tokio::time::timeout(remaining, self.primary(svc)).await {
                    Ok(desc) => desc?,
                    Err(_) => break,
                };
                if desc.is_stable() {
                    debug!(%environment, service = %desc.service_name, "service stable");
                    return Ok(WaitOutcome::Stable);
                }
                debug!(
                    %environment,
                    running = desc.running_count,
                    desired = desc.desired_count,
                    deployments = desc.deployments.len(),
                    "service not yet stable"
                );
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(self.poll_interval.min(remaining)).await;
            }
            warn!(%environment, ?timeout, "service did not stabilize in time");
            Ok(WaitOutcome::TimedOut)
        })
    }

    fn list_revisions<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Vec<Revision>>> {
        Box::pin(async move {
            let svc = self.service(environment)?;
            let limit = LIST_LIMIT.to_string();
            let out = call(
                self.runner.as_ref(),
                &[
                    "ecs",
                    "list-task-definitions",
                    "--family-prefix",
                    &svc.family,
                    "--sort",
                    "DESC",
                    "--max-items",
                    &limit,
                ],
            )
            .await?;
            if !out.success {
                return Err(ClusterError::Backend(out.stderr));
            }
            let resp: ListTaskDefinitionsResponse = parse(&out.stdout)?;
            let mut revisions = Vec::with_capacity(resp.task_definition_arns.len());
            for arn in resp.task_definition_arns.iter().take(LIST_LIMIT) {
                revisions.push(describe_task_definition(self.runner.as_ref(), arn).await?);
            }
            Ok(revisions)
        })
    }
}

// ── Slots ──────────────────────────────────────────────────────────

/// Every configured service of `svc`, in configuration order.
async fn describe_slots(
    runner: &dyn CommandRunner,
    svc: &EcsService,
) -> ClusterResult<Vec<ServiceDescription>> {
    let mut args = vec!["ecs", "describe-services", "--cluster", svc.cluster.as_str(), "--services"];
    args.extend(svc.services());
    args.extend(["--include", "TAGS"]);
    let out = call(runner, &args).await?;
    if !out.success {
        return Err(ClusterError::Backend(out.stderr));
    }
    let resp: DescribeServicesResponse = parse(&out.stdout)?;
    if let Some(failure) = resp.failures.first() {
        return Err(ClusterError::NotFound(format!(
            "service {} in {}: {}",
            failure.arn, svc.cluster, failure.reason
        )));
    }

    let mut described = resp.services;
    if let [only] = described.as_mut_slice() {
        // Older CLIs omit the name for single-service queries.
        if only.service_name.is_empty() {
            only.service_name = svc.service.clone();
        }
    }
    let mut slots = Vec::with_capacity(described.len());
    for name in svc.services() {
        let index = described
            .iter()
            .position(|d| d.service_name == name)
            .ok_or_else(|| ClusterError::NotFound(format!("service {name} in {}", svc.cluster)))?;
        slots.push(described.swap_remove(index));
    }
    Ok(slots)
}

/// The slot tagged primary, else the configured `service`.
fn primary_slot(
    svc: &EcsService,
    slots: Vec<ServiceDescription>,
) -> ClusterResult<ServiceDescription> {
    let mut fallback = None;
    for slot in slots {
        if slot.tag(ROLE_TAG) == Some("primary") {
            return Ok(slot);
        }
        if slot.service_name == svc.service {
            fallback = Some(slot);
        }
    }
    fallback.ok_or_else(|| ClusterError::NotFound(format!("service {} in {}", svc.service, svc.cluster)))
}

/// Revision running in each slot, by service name. Slots without a task
/// definition are left out.
pub(crate) async fn slot_revisions(
    runner: &dyn CommandRunner,
    svc: &EcsService,
) -> ClusterResult<Vec<(String, RevisionId)>> {
    let mut running = Vec::new();
    for slot in describe_slots(runner, svc).await? {
        if slot.task_definition.is_empty() {
            continue;
        }
        let revision = describe_task_definition(runner, &slot.task_definition).await?;
        running.push((slot.service_name, revision.id));
    }
    Ok(running)
}

async fn describe_task_definition(runner: &dyn CommandRunner, arn: &str) -> ClusterResult<Revision> {
    let out = call(
        runner,
        &["ecs", "describe-task-definition", "--task-definition", arn, "--include", "TAGS"],
    )
    .await?;
    if !out.success {
        return Err(ClusterError::Backend(out.stderr));
    }
    let resp: DescribeTaskDefinitionResponse = parse(&out.stdout)?;
    to_revision(&resp.task_definition, &resp.tags)
}

// ── Task definition mapping ────────────────────────────────────────

fn task_definition_input(svc: &EcsService, spec: &RevisionSpec, id: &RevisionId) -> serde_json::Value {
    let ports: Vec<serde_json::Value> = spec
        .ports
        .iter()
        .map(|p| {
            let mut port = serde_json::json!({
                "containerPort": p.container_port,
                "protocol": p.protocol,
            });
            if let Some(host) = p.host_port {
                port["hostPort"] = host.into();
            }
            port
        })
        .collect();

    let mut container = serde_json::json!({
        "name": spec.name,
        "image": spec.image,
        "essential": true,
        "portMappings": ports,
    });
    if let Some(log) = &spec.logging {
        let mut options = serde_json::Map::new();
        options.insert("awslogs-group".into(), log.group.clone().into());
        if let Some(prefix) = &log.stream_prefix {
            options.insert("awslogs-stream-prefix".into(), prefix.clone().into());
        }
        if let Some(region) = &svc.region {
            options.insert("awslogs-region".into(), region.clone().into());
        }
        container["logConfiguration"] = serde_json::json!({
            "logDriver": log.driver,
            "options": options,
        });
    }

    let mut input = serde_json::json!({
        "family": svc.family,
        "networkMode": "awsvpc",
        "requiresCompatibilities": ["FARGATE"],
        "cpu": spec.cpu.to_string(),
        "memory": spec.memory_mib.to_string(),
        "containerDefinitions": [container],
        "tags": [{ "key": REVISION_TAG, "value": id.as_str() }],
    });
    if let Some(role) = &svc.execution_role_arn {
        input["executionRoleArn"] = role.clone().into();
    }
    input
}

fn to_revision(td: &TaskDefinition, tags: &[Tag]) -> ClusterResult<Revision> {
    let container = td.container_definitions.first().ok_or_else(|| {
        ClusterError::Backend(format!("{} has no containers", td.task_definition_arn))
    })?;

    let cpu = td
        .cpu
        .as_deref()
        .and_then(|c| c.parse().ok())
        .or(container.cpu)
        .unwrap_or(0);
    let memory_mib = td
        .memory
        .as_deref()
        .and_then(|m| m.parse().ok())
        .or(container.memory)
        .unwrap_or(0);

    let spec = RevisionSpec {
        name: container.name.clone(),
        image: container.image.clone(),
        cpu,
        memory_mib,
        ports: container
            .port_mappings
            .iter()
            .map(|p| PortMapping {
                container_port: p.container_port,
                host_port: p.host_port,
                protocol: p.protocol.clone().unwrap_or_else(|| "tcp".to_string()),
            })
            .collect(),
        logging: container.log_configuration.as_ref().map(|lc| LogTarget {
            driver: lc.log_driver.clone(),
            group: lc.options.get("awslogs-group").cloned().unwrap_or_default(),
            stream_prefix: lc.options.get("awslogs-stream-prefix").cloned(),
        }),
    };

    let id = tags
        .iter()
        .find(|t| t.key == REVISION_TAG)
        .map(|t| RevisionId::new(t.value.clone()))
        .unwrap_or_else(|| spec.revision_id());

    Ok(Revision {
        id,
        spec,
        backend_ref: td.task_definition_arn.clone(),
        registered_at: td.registered_at.map(|t| t as u64).unwrap_or(0),
    })
}

// ── CLI response shapes ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDefinition {
    task_definition_arn: String,
    #[serde(default)]
    container_definitions: Vec<ContainerDefinition>,
    cpu: Option<String>,
    memory: Option<String>,
    /// Epoch seconds (fractional) as printed by the CLI.
    registered_at: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerDefinition {
    name: String,
    image: String,
    cpu: Option<u32>,
    memory: Option<u32>,
    #[serde(default)]
    port_mappings: Vec<EcsPortMapping>,
    log_configuration: Option<LogConfiguration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EcsPortMapping {
    container_port: u16,
    host_port: Option<u16>,
    protocol: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogConfiguration {
    log_driver: String,
    #[serde(default)]
    options: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterTaskDefinitionResponse {
    task_definition: TaskDefinition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeTaskDefinitionResponse {
    task_definition: TaskDefinition,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTaskDefinitionsResponse {
    #[serde(default)]
    task_definition_arns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DescribeServicesResponse {
    #[serde(default)]
    services: Vec<ServiceDescription>,
    #[serde(default)]
    failures: Vec<ServiceFailure>,
}

#[derive(Debug, Deserialize)]
struct UpdateServiceResponse {
    service: ServiceDescription,
}

#[derive(Debug, Deserialize)]
struct ServiceFailure {
    #[serde(default)]
    arn: String,
    reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDescription {
    #[serde(default)]
    service_name: String,
    #[serde(default)]
    service_arn: String,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    task_definition: String,
    #[serde(default)]
    desired_count: u32,
    #[serde(default)]
    running_count: u32,
    #[serde(default)]
    deployments: Vec<ServiceDeployment>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDeployment {
    task_definition: String,
    #[serde(default)]
    desired_count: u32,
    #[serde(default)]
    running_count: u32,
    rollout_state: Option<String>,
}

impl ServiceDescription {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    /// One deployment, on the service's task definition, fully running.
    fn is_stable(&self) -> bool {
        match self.deployments.as_slice() {
            [only] => {
                only.task_definition == self.task_definition
                    && only.running_count == only.desired_count
                    && self.running_count == self.desired_count
                    && only.rollout_state.as_deref().is_none_or(|s| s == "COMPLETED")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::CommandOutput;
    use crate::aws::fake::FakeAws;

    const ARN_V1: &str = "arn:aws:ecs:eu-west-1:123:task-definition/web:1";
    const ARN_V2: &str = "arn:aws:ecs:eu-west-1:123:task-definition/web:2";

    fn setup() -> (Arc<FakeAws>, EcsCluster) {
        let fake = Arc::new(FakeAws::default());
        let cluster = EcsCluster::new(fake.clone())
            .with_environment(
                "prod",
                EcsService {
                    cluster: "prod-cluster".to_string(),
                    service: "web".to_string(),
                    standby: None,
                    family: "web".to_string(),
                    execution_role_arn: Some("arn:aws:iam::123:role/exec".to_string()),
                    region: Some("eu-west-1".to_string()),
                },
            )
            .with_poll_interval(Duration::from_millis(5));
        (fake, cluster)
    }

    fn spec(image: &str) -> RevisionSpec {
        RevisionSpec {
            name: "web".to_string(),
            image: image.to_string(),
            cpu: 256,
            memory_mib: 512,
            ports: vec![PortMapping::tcp(8080)],
            logging: Some(LogTarget {
                driver: "awslogs".to_string(),
                group: "/ecs/web".to_string(),
                stream_prefix: Some("web".to_string()),
            }),
        }
    }

    fn service_json(task_def: &str, deployments: &[(&str, u32, u32, &str)]) -> String {
        let deployments: Vec<serde_json::Value> = deployments
            .iter()
            .map(|(td, desired, running, state)| {
                serde_json::json!({
                    "taskDefinition": td,
                    "desiredCount": desired,
                    "runningCount": running,
                    "rolloutState": state,
                })
            })
            .collect();
        let running: u32 = deployments
            .iter()
            .map(|d| d["runningCount"].as_u64().unwrap() as u32)
            .sum();
        serde_json::json!({
            "services": [{
                "serviceName": "web",
                "taskDefinition": task_def,
                "desiredCount": 2,
                "runningCount": running,
                "deployments": deployments,
            }],
            "failures": [],
        })
        .to_string()
    }

    fn task_def_json(arn: &str, image: &str, tag: Option<&str>) -> String {
        let tags: Vec<serde_json::Value> = tag
            .map(|t| vec![serde_json::json!({ "key": REVISION_TAG, "value": t })])
            .unwrap_or_default();
        serde_json::json!({
            "taskDefinition": {
                "taskDefinitionArn": arn,
                "family": "web",
                "cpu": "256",
                "memory": "512",
                "registeredAt": 1_700_000_000.5,
                "containerDefinitions": [{
                    "name": "web",
                    "image": image,
                    "portMappings": [{ "containerPort": 8080, "hostPort": 8080, "protocol": "tcp" }],
                    "logConfiguration": {
                        "logDriver": "awslogs",
                        "options": { "awslogs-group": "/ecs/web", "awslogs-stream-prefix": "web" }
                    }
                }]
            },
            "tags": tags,
        })
        .to_string()
    }

    #[tokio::test]
    async fn register_sends_tagged_fargate_definition() {
        let (fake, cluster) = setup();
        fake.respond(
            "register-task-definition",
            CommandOutput::ok(task_def_json(ARN_V2, "web:v2", None)),
        );

        let rev = cluster.register_revision("prod", &spec("web:v2")).await.unwrap();
        assert_eq!(rev.backend_ref, ARN_V2);
        assert_eq!(rev.id, spec("web:v2").revision_id());

        let calls = fake.calls_to("register-task-definition");
        let input: serde_json::Value = serde_json::from_str(&calls[0][3]).unwrap();
        assert_eq!(input["family"], "web");
        assert_eq!(input["cpu"], "256");
        assert_eq!(input["executionRoleArn"], "arn:aws:iam::123:role/exec");
        assert_eq!(input["tags"][0]["value"], rev.id.as_str());
        let log = &input["containerDefinitions"][0]["logConfiguration"];
        assert_eq!(log["options"]["awslogs-region"], "eu-west-1");
    }

    #[tokio::test]
    async fn register_rejection_is_registration_error() {
        let (fake, cluster) = setup();
        fake.respond(
            "register-task-definition",
            CommandOutput::failed("ClientException: Invalid setting for container"),
        );
        let err = cluster.register_revision("prod", &spec("web:v2")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Registration(msg) if msg.contains("ClientException")));
    }

    #[tokio::test]
    async fn register_invalid_spec_never_calls_aws() {
        let (fake, cluster) = setup();
        let mut bad = spec("web:v2");
        bad.ports.clear();
        let err = cluster.register_revision("prod", &bad).await.unwrap_err();
        assert!(matches!(err, ClusterError::Registration(_)));
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn current_revision_reads_tag() {
        let (fake, cluster) = setup();
        fake.respond(
            "describe-services",
            CommandOutput::ok(service_json(ARN_V1, &[(ARN_V1, 2, 2, "COMPLETED")])),
        );
        fake.respond(
            "describe-task-definition",
            CommandOutput::ok(task_def_json(ARN_V1, "web:v1", Some("rev-abc"))),
        );

        let rev = cluster.current_revision("prod").await.unwrap();
        assert_eq!(rev.id, RevisionId::from("rev-abc"));
        assert_eq!(rev.spec.image, "web:v1");
        assert_eq!(rev.spec.cpu, 256);
        assert_eq!(rev.spec.ports[0].host_port, Some(8080));
        assert_eq!(rev.registered_at, 1_700_000_000);
    }

    #[tokio::test]
    async fn current_revision_missing_service() {
        let (fake, cluster) = setup();
        fake.respond(
            "describe-services",
            CommandOutput::ok(r#"{"services":[],"failures":[{"arn":"x","reason":"MISSING"}]}"#),
        );
        let err = cluster.current_revision("prod").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_service_failure_is_service_update_error() {
        let (fake, cluster) = setup();
        fake.respond("update-service", CommandOutput::failed("AccessDeniedException"));
        let rev = Revision {
            id: RevisionId::from("rev-2"),
            spec: spec("web:v2"),
            backend_ref: ARN_V2.to_string(),
            registered_at: 0,
        };
        let err = cluster.update_service("prod", &rev).await.unwrap_err();
        assert!(matches!(err, ClusterError::ServiceUpdate(_)));
    }

    #[tokio::test]
    async fn wait_stable_polls_until_single_deployment() {
        let (fake, cluster) = setup();
        fake.respond(
            "describe-services",
            CommandOutput::ok(service_json(
                ARN_V2,
                &[(ARN_V2, 2, 1, "IN_PROGRESS"), (ARN_V1, 2, 2, "COMPLETED")],
            )),
        );
        fake.respond(
            "describe-services",
            CommandOutput::ok(service_json(ARN_V2, &[(ARN_V2, 2, 2, "COMPLETED")])),
        );

        let outcome = cluster.wait_stable("prod", Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Stable);
        assert_eq!(fake.calls_to("describe-services").len(), 2);
    }

    #[tokio::test]
    async fn wait_stable_times_out() {
        let (fake, cluster) = setup();
        fake.respond(
            "describe-services",
            CommandOutput::ok(service_json(
                ARN_V2,
                &[(ARN_V2, 2, 0, "IN_PROGRESS"), (ARN_V1, 2, 2, "COMPLETED")],
            )),
        );
        let outcome = cluster
            .wait_stable("prod", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn list_revisions_describes_each_arn() {
        let (fake, cluster) = setup();
        fake.respond(
            "list-task-definitions",
            CommandOutput::ok(serde_json::json!({ "taskDefinitionArns": [ARN_V2, ARN_V1] }).to_string()),
        );
        fake.respond(
            "describe-task-definition",
            CommandOutput::ok(task_def_json(ARN_V2, "web:v2", Some("rev-2"))),
        );
        fake.respond(
            "describe-task-definition",
            CommandOutput::ok(task_def_json(ARN_V1, "web:v1", Some("rev-1"))),
        );

        let revs = cluster.list_revisions("prod").await.unwrap();
        let ids: Vec<&str> = revs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["rev-2", "rev-1"]);
    }

    fn slotted() -> (Arc<FakeAws>, EcsCluster) {
        let fake = Arc::new(FakeAws::default());
        let cluster = EcsCluster::new(fake.clone()).with_environment(
            "prod",
            EcsService {
                cluster: "prod-cluster".to_string(),
                service: "web-blue".to_string(),
                standby: Some("web-green".to_string()),
                family: "web".to_string(),
                execution_role_arn: None,
                region: None,
            },
        );
        (fake, cluster)
    }

    /// `(service, role, task definition, desired count)` per slot.
    fn slots_json(slots: &[(&str, &str, &str, u32)]) -> String {
        let services: Vec<serde_json::Value> = slots
            .iter()
            .map(|(name, role, td, desired)| {
                serde_json::json!({
                    "serviceName": name,
                    "serviceArn": format!("arn:aws:ecs:eu-west-1:123:service/prod-cluster/{name}"),
                    "tags": [{ "key": ROLE_TAG, "value": role }],
                    "taskDefinition": td,
                    "desiredCount": desired,
                    "runningCount": desired,
                    "deployments": [{
                        "taskDefinition": td,
                        "desiredCount": desired,
                        "runningCount": desired,
                        "rolloutState": "COMPLETED",
                    }],
                })
            })
            .collect();
        serde_json::json!({ "services": services, "failures": [] }).to_string()
    }

    fn revision(arn: &str) -> Revision {
        Revision {
            id: RevisionId::from("rev-x"),
            spec: spec("web:x"),
            backend_ref: arn.to_string(),
            registered_at: 0,
        }
    }

    fn updated(arn: &str) -> CommandOutput {
        CommandOutput::ok(serde_json::json!({ "service": { "taskDefinition": arn } }).to_string())
    }

    fn arg_after<'c>(call: &'c [String], flag: &str) -> Option<&'c str> {
        call.iter()
            .position(|a| a == flag)
            .and_then(|i| call.get(i + 1))
            .map(String::as_str)
    }

    #[tokio::test]
    async fn new_revision_starts_in_standby_slot_beside_primary() {
        let (fake, cluster) = slotted();
        fake.respond(
            "describe-services",
            CommandOutput::ok(slots_json(&[
                ("web-blue", "primary", ARN_V1, 3),
                ("web-green", "standby", "", 0),
            ])),
        );
        fake.respond("update-service", updated(ARN_V2));
        fake.respond("tag-resource", CommandOutput::ok("{}"));

        cluster.update_service("prod", &revision(ARN_V2)).await.unwrap();

        let updates = fake.calls_to("update-service");
        assert_eq!(updates.len(), 1);
        assert_eq!(arg_after(&updates[0], "--service"), Some("web-green"));
        assert_eq!(arg_after(&updates[0], "--desired-count"), Some("3"));

        let tags: Vec<(String, String)> = fake
            .calls_to("tag-resource")
            .iter()
            .map(|c| {
                (
                    arg_after(c, "--resource-arn").unwrap().rsplit('/').next().unwrap().to_string(),
                    arg_after(c, "--tags").unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            tags,
            vec![
                ("web-blue".to_string(), format!("key={ROLE_TAG},value=standby")),
                ("web-green".to_string(), format!("key={ROLE_TAG},value=primary")),
            ]
        );
    }

    #[tokio::test]
    async fn slot_already_running_the_revision_is_promoted_back() {
        let (fake, cluster) = slotted();
        fake.respond(
            "describe-services",
            CommandOutput::ok(slots_json(&[
                ("web-blue", "standby", ARN_V1, 2),
                ("web-green", "primary", ARN_V2, 2),
            ])),
        );
        fake.respond("update-service", updated(ARN_V1));
        fake.respond("tag-resource", CommandOutput::ok("{}"));

        cluster.update_service("prod", &revision(ARN_V1)).await.unwrap();

        let updates = fake.calls_to("update-service");
        assert_eq!(arg_after(&updates[0], "--service"), Some("web-blue"));
        let promoted: Vec<Vec<String>> = fake
            .calls_to("tag-resource")
            .into_iter()
            .filter(|c| arg_after(c, "--tags").is_some_and(|t| t.ends_with("primary")))
            .collect();
        assert_eq!(promoted.len(), 1);
        assert!(arg_after(&promoted[0], "--resource-arn").unwrap().ends_with("/web-blue"));
    }

    #[tokio::test]
    async fn current_revision_follows_primary_tag() {
        let (fake, cluster) = slotted();
        fake.respond(
            "describe-services",
            CommandOutput::ok(slots_json(&[
                ("web-green", "primary", ARN_V2, 2),
                ("web-blue", "standby", ARN_V1, 2),
            ])),
        );
        fake.respond(
            "describe-task-definition",
            CommandOutput::ok(task_def_json(ARN_V2, "web:v2", Some("rev-2"))),
        );

        let rev = cluster.current_revision("prod").await.unwrap();
        assert_eq!(rev.id, RevisionId::from("rev-2"));
        let describe = &fake.calls_to("describe-services")[0];
        assert!(describe.contains(&"web-green".to_string()));
        assert_eq!(arg_after(describe, "--include"), Some("TAGS"));
    }

    #[tokio::test]
    async fn failed_tagging_is_a_service_update_error() {
        let (fake, cluster) = slotted();
        fake.respond(
            "describe-services",
            CommandOutput::ok(slots_json(&[
                ("web-blue", "primary", ARN_V1, 2),
                ("web-green", "standby", "", 0),
            ])),
        );
        fake.respond("update-service", updated(ARN_V2));
        fake.respond("tag-resource", CommandOutput::failed("AccessDeniedException"));

        let err = cluster.update_service("prod", &revision(ARN_V2)).await.unwrap_err();
        assert!(matches!(err, ClusterError::ServiceUpdate(msg) if msg.contains("AccessDenied")));
    }

    #[tokio::test]
    async fn missing_standby_service_is_not_found() {
        let (fake, cluster) = slotted();
        fake.respond(
            "describe-services",
            CommandOutput::ok(slots_json(&[("web-blue", "primary", ARN_V1, 2)])),
        );
        let err = cluster.current_revision("prod").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(msg) if msg.contains("web-green")));
    }

    #[tokio::test]
    async fn unknown_environment_is_backend_error() {
        let (_fake, cluster) = setup();
        let err = cluster.current_revision("staging").await.unwrap_err();
        assert!(matches!(err, ClusterError::Backend(_)));
    }
}
