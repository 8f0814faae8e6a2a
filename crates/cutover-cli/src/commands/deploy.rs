use std::path::Path;

use anyhow::{Context as _, bail};
use tracing::warn;

use cutover_core::{CutoverConfig, DeploymentReport, Outcome, RevisionSpec};

use super::context::Context;

pub async fn deploy(
    config_path: &Path,
    environment: &str,
    revision: &str,
    json: bool,
) -> anyhow::Result<i32> {
    let ctx = Context::load(config_path)?;
    // Validated at registration; an invalid spec exits with code 10.
    let spec = resolve_spec(&ctx.config, environment, revision)?;

    let lease = ctx.orchestrator.begin(environment)?;
    let cancel = lease.cancel_handle();
    let run = ctx.orchestrator.run(lease, spec);
    tokio::pin!(run);

    let report = tokio::select! {
        report = &mut run => report,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!(%environment, "interrupted, cancelling at the next step");
            cancel.cancel();
            run.await
        }
    };

    print_report(&report, json)?;
    Ok(report.outcome.exit_code())
}

pub async fn rollback(config_path: &Path, environment: &str, json: bool) -> anyhow::Result<i32> {
    let ctx = Context::load(config_path)?;
    let report = ctx.orchestrator.rollback(environment).await?;
    print_report(&report, json)?;
    Ok(report.outcome.exit_code())
}

/// A `.toml`/`.json` revision file, or an image reference expanded with
/// the environment's `[defaults]`.
pub fn resolve_spec(
    config: &CutoverConfig,
    environment: &str,
    revision: &str,
) -> anyhow::Result<RevisionSpec> {
    let path = Path::new(revision);
    let extension = path.extension().and_then(|e| e.to_str());
    match extension {
        Some("toml") | Some("json") => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let spec = if extension == Some("toml") {
                toml::from_str(&content)?
            } else {
                serde_json::from_str(&content)?
            };
            Ok(spec)
        }
        _ => {
            let env = config.environment(environment)?;
            match &env.defaults {
                Some(defaults) => Ok(defaults.spec_for(revision)),
                None => bail!(
                    "environment {environment} has no [defaults]; pass a revision file instead of an image"
                ),
            }
        }
    }
}

pub fn print_report(report: &DeploymentReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let attempted = report
        .attempted
        .as_ref()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{}: {} {}", report.environment, report.final_state(), attempted);
    let states: Vec<String> = report.states.iter().map(|s| s.to_string()).collect();
    println!("  states:  {}", states.join(" → "));

    match &report.outcome {
        Outcome::Succeeded => {}
        Outcome::Failed { error } => println!("  error:   {}", error.message),
        Outcome::RolledBack { cause } => {
            if let Some(cause) = cause {
                println!("  error:   {}", cause.message);
            }
        }
        Outcome::RollbackFailed {
            cause,
            rollback_error,
        } => {
            if let Some(cause) = cause {
                println!("  error:   {}", cause.message);
            }
            println!("  rollback: {}", rollback_error.message);
        }
    }

    if !report.succeeded() {
        let serving = report
            .serving
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!("  serving: {serving}");
    }
    Ok(())
}
