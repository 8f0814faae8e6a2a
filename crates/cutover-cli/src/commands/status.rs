use std::path::Path;

use super::context::Context;
use super::deploy::print_report;

pub async fn status(config_path: &Path, environment: &str, json: bool) -> anyhow::Result<i32> {
    let ctx = Context::load(config_path)?;
    let status = ctx.orchestrator.status(environment).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(0);
    }

    println!("Environment: {}", status.environment);
    match &status.record {
        Some(record) => {
            let show = |r: &Option<cutover_core::RevisionId>| {
                r.as_ref().map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
            };
            println!("  status:   {}", record.status);
            println!("  active:   {}", show(&record.active));
            println!("  previous: {}", show(&record.previous));
            if record.pending.is_some() {
                println!("  pending:  {}", show(&record.pending));
            }
            println!("  updated:  {}", record.deployed_at);
        }
        None => println!("  never deployed"),
    }
    match &status.split {
        Some(split) => println!("  traffic:  {split}"),
        None => println!("  traffic:  no split"),
    }
    if status.in_progress {
        println!("  lease:    held, an operation is in progress");
    }
    if let Some(health) = &status.last_health {
        let verdict = if health.passed { "passed" } else { "failed" };
        println!("  health:   {verdict} for {} ({})", health.revision, health.detail);
    }
    Ok(0)
}

pub fn history(
    config_path: &Path,
    environment: &str,
    limit: usize,
    json: bool,
) -> anyhow::Result<i32> {
    let ctx = Context::load(config_path)?;
    let reports = ctx.orchestrator.history(environment, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(0);
    }
    if reports.is_empty() {
        println!("No deployments recorded for {environment}");
    }
    for report in &reports {
        print_report(report, false)?;
    }
    Ok(0)
}
