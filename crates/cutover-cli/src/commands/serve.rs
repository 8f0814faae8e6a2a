use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context as _;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use cutover_api::{ApiState, build_router};
use cutover_traffic::{StoredTraffic, TrafficProxy};

use super::context::Context;

/// Run the REST API until interrupted, plus a traffic proxy for every
/// environment with a `listen` address. Deploys from other cutover
/// processes are picked up by the proxies on their next sync.
pub async fn serve(config_path: &Path, bind: &str, port: u16) -> anyhow::Result<()> {
    let ctx = Context::load(config_path)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut proxies = JoinSet::new();
    for (name, env) in &ctx.config.environments {
        let Some(listen) = &env.listen else {
            continue;
        };
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("environment {name}: invalid listen address {listen}"))?;
        let proxy = TrafficProxy::bind(name, addr, StoredTraffic::new(ctx.store.clone())).await?;
        proxies.spawn(proxy.serve(shutdown_rx.clone()));
    }

    let state = ApiState::new(ctx.orchestrator.clone(), &ctx.config);
    let app = build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        %addr,
        environments = ctx.config.environments.len(),
        proxies = proxies.len(),
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    while let Some(joined) = proxies.join_next().await {
        match joined {
            Ok(Err(e)) => error!(error = %e, "traffic proxy failed"),
            Err(e) => error!(error = %e, "traffic proxy task panicked"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}
