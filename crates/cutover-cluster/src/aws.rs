//! `aws` CLI invocation.
//!
//! [`CommandRunner`] is injected into [`crate::EcsCluster`] and
//! [`crate::ElbTraffic`] so tests can substitute canned responses for the
//! real CLI.

use std::process::Stdio;

use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::debug;

use crate::BoxFuture;
use crate::error::{ClusterError, ClusterResult};

/// Captured output of one CLI invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs an `aws` subcommand, e.g. `["ecs", "describe-services", ...]`.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, args: &'a [String]) -> BoxFuture<'a, ClusterResult<CommandOutput>>;
}

/// The real `aws` binary.
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
}

impl AwsCli {
    pub fn new(region: Option<String>) -> Self {
        Self {
            program: "aws".to_string(),
            region,
        }
    }
}

impl CommandRunner for AwsCli {
    fn run<'a>(&'a self, args: &'a [String]) -> BoxFuture<'a, ClusterResult<CommandOutput>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.program);
            cmd.args(args).arg("--output").arg("json");
            if let Some(region) = &self.region {
                cmd.arg("--region").arg(region);
            }
            debug!(program = %self.program, ?args, "running aws cli");

            let output = cmd
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| {
                    ClusterError::Backend(format!("failed to execute {}: {e}", self.program))
                })?;

            Ok(CommandOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        })
    }
}

/// Run `args` through `runner`.
pub(crate) async fn call(runner: &dyn CommandRunner, args: &[&str]) -> ClusterResult<CommandOutput> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    runner.run(&args).await
}

pub(crate) fn parse<T: DeserializeOwned>(stdout: &str) -> ClusterResult<T> {
    serde_json::from_str(stdout)
        .map_err(|e| ClusterError::Backend(format!("unexpected aws cli output: {e}")))
}
