//! Application Load Balancer traffic backend.
//!
//! An environment with a standby slot puts each ECS service behind its
//! own target group, and one listener forwards to both. A split becomes
//! the listener's weighted forward action, so the cut-over happens at the
//! load balancer in one `modify-listener` call. A revision is routable
//! while one of the slots runs it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use cutover_core::{RevisionId, TrafficSplit};
use cutover_traffic::{BoxFuture, TrafficBackend, TrafficError, TrafficResult};

use crate::aws::{CommandRunner, call, parse};
use crate::ecs::{EcsService, slot_revisions};

/// Listener of one environment and the target group of each slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElbListener {
    pub listener_arn: String,
    pub service: EcsService,
    /// Target group ARN by ECS service name.
    pub target_groups: BTreeMap<String, String>,
}

pub struct ElbTraffic {
    runner: Arc<dyn CommandRunner>,
    listeners: HashMap<String, ElbListener>,
}

impl ElbTraffic {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            listeners: HashMap::new(),
        }
    }

    pub fn with_environment(mut self, environment: &str, listener: ElbListener) -> Self {
        self.listeners.insert(environment.to_string(), listener);
        self
    }

    fn listener(&self, environment: &str) -> TrafficResult<&ElbListener> {
        self.listeners.get(environment).ok_or_else(|| {
            TrafficError::Backend(format!("no load balancer listener configured for {environment}"))
        })
    }

    /// Target group of the slot running each revision.
    async fn groups_by_revision(
        &self,
        listener: &ElbListener,
    ) -> TrafficResult<HashMap<RevisionId, String>> {
        let running = slot_revisions(self.runner.as_ref(), &listener.service)
            .await
            .map_err(|e| TrafficError::Backend(e.to_string()))?;
        let mut groups = HashMap::new();
        for (service, revision) in running {
            let group = listener.target_groups.get(&service).ok_or_else(|| {
                TrafficError::Backend(format!("no target group for service {service}"))
            })?;
            groups.insert(revision, group.clone());
        }
        Ok(groups)
    }
}

impl TrafficBackend for ElbTraffic {
    fn attach<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
        endpoint: &'a str,
    ) -> BoxFuture<'a, TrafficResult<()>> {
        Box::pin(async move {
            let listener = self.listener(environment)?;
            if !self.groups_by_revision(listener).await?.contains_key(revision) {
                return Err(TrafficError::InvalidSplit(format!(
                    "revision {revision} is not running in any slot of {environment}"
                )));
            }
            // Targets register with their group through ECS, not through us.
            debug!(%environment, %revision, endpoint, "revision reachable through its slot");
            Ok(())
        })
    }

    fn is_attached<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
    ) -> BoxFuture<'a, TrafficResult<bool>> {
        Box::pin(async move {
            let listener = self.listener(environment)?;
            Ok(self.groups_by_revision(listener).await?.contains_key(revision))
        })
    }

    fn apply<'a>(&'a self, split: &'a TrafficSplit) -> BoxFuture<'a, TrafficResult<()>> {
        Box::pin(async move {
            let environment = split.environment();
            let listener = self.listener(environment)?;
            let groups = self.groups_by_revision(listener).await?;

            let mut weights: BTreeMap<&str, u8> = listener
                .target_groups
                .values()
                .map(|arn| (arn.as_str(), 0))
                .collect();
            for (revision, weight) in split.weights() {
                let group = groups.get(revision).ok_or_else(|| {
                    TrafficError::InvalidSplit(format!(
                        "revision {revision} is not running in any slot of {environment}"
                    ))
                })?;
                weights.insert(group.as_str(), *weight);
            }
            let action = forward_action(&weights);

            let out = call(
                self.runner.as_ref(),
                &[
                    "elbv2",
                    "modify-listener",
                    "--listener-arn",
                    &listener.listener_arn,
                    "--default-actions",
                    &action.to_string(),
                ],
            )
            .await
            .map_err(|e| TrafficError::Backend(e.to_string()))?;
            if !out.success {
                return Err(TrafficError::Backend(out.stderr));
            }
            info!(%environment, %split, listener = %listener.listener_arn, "listener weights applied");
            Ok(())
        })
    }

    fn current<'a>(
        &'a self,
        environment: &'a str,
    ) -> BoxFuture<'a, TrafficResult<Option<TrafficSplit>>> {
        Box::pin(async move {
            let listener = self.listener(environment)?;
            let out = call(
                self.runner.as_ref(),
                &["elbv2", "describe-listeners", "--listener-arns", &listener.listener_arn],
            )
            .await
            .map_err(|e| TrafficError::Backend(e.to_string()))?;
            if !out.success {
                return Err(TrafficError::Backend(out.stderr));
            }
            let resp: DescribeListenersResponse =
                parse(&out.stdout).map_err(|e| TrafficError::Backend(e.to_string()))?;
            let Some(weights) = resp
                .listeners
                .first()
                .and_then(|l| l.default_actions.iter().find(|a| a.kind == "forward"))
                .map(ListenerAction::weights)
            else {
                return Ok(None);
            };

            let revisions: HashMap<String, RevisionId> = self
                .groups_by_revision(listener)
                .await?
                .into_iter()
                .map(|(revision, group)| (group, revision))
                .collect();
            let mut split = BTreeMap::new();
            for (group, weight) in weights.into_iter().filter(|(_, w)| *w > 0) {
                let revision = revisions.get(&group).ok_or_else(|| {
                    TrafficError::Backend(format!("target group {group} has no running revision"))
                })?;
                let weight = u8::try_from(weight).map_err(|_| {
                    TrafficError::Backend(format!("listener weight {weight} is not a percentage"))
                })?;
                split.insert(revision.clone(), weight);
            }
            if split.is_empty() {
                return Ok(None);
            }
            TrafficSplit::new(environment, split)
                .map(Some)
                .map_err(|e| TrafficError::Backend(format!("listener weights: {e}")))
        })
    }
}

fn forward_action(weights: &BTreeMap<&str, u8>) -> serde_json::Value {
    let groups: Vec<serde_json::Value> = weights
        .iter()
        .map(|(arn, weight)| serde_json::json!({ "TargetGroupArn": arn, "Weight": weight }))
        .collect();
    serde_json::json!([{
        "Type": "forward",
        "ForwardConfig": { "TargetGroups": groups },
    }])
}

// ── CLI response shapes ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeListenersResponse {
    #[serde(default)]
    listeners: Vec<Listener>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Listener {
    #[serde(default)]
    default_actions: Vec<ListenerAction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListenerAction {
    #[serde(rename = "Type")]
    kind: String,
    target_group_arn: Option<String>,
    forward_config: Option<ForwardConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ForwardConfig {
    #[serde(default)]
    target_groups: Vec<WeightedGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WeightedGroup {
    target_group_arn: String,
    /// Absent means 1 to the load balancer; only relative weights matter.
    weight: Option<u32>,
}

impl ListenerAction {
    /// Target group weights; a plain forward sends everything to one group.
    fn weights(&self) -> Vec<(String, u32)> {
        match (&self.forward_config, &self.target_group_arn) {
            (Some(config), _) if !config.target_groups.is_empty() => config
                .target_groups
                .iter()
                .map(|g| (g.target_group_arn.clone(), g.weight.unwrap_or(1)))
                .collect(),
            (_, Some(arn)) => vec![(arn.clone(), 100)],
            _ => Vec::new(),
        }
    }
}
