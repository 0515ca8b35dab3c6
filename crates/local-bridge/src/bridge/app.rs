use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::bridge::{
    config, http, logging, outbound, telemetry,
    tunnel::{pending, registry, rendezvous, server},
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let api_addr: SocketAddr = config::normalize_bind_addr(&cfg.api_addr)
        .parse()
        .with_context(|| format!("invalid api_addr: {}", cfg.api_addr))?;
    let tunnel_addr: SocketAddr = config::normalize_bind_addr(&cfg.tunnel_addr)
        .parse()
        .with_context(|| format!("invalid tunnel_addr: {}", cfg.tunnel_addr))?;

    tracing::info!(
        config = %resolved.path.display(),
        api_addr = %api_addr,
        tunnel_addr = %tunnel_addr,
        response_timeout = %humantime::format_duration(cfg.tunnel.response_timeout),
        max_body_bytes = cfg.max_body_bytes,
        "bridge: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    // The two shared stores; everything else talks through them.
    let registry = Arc::new(registry::Registry::new());
    let pending = Arc::new(pending::PendingTable::new());

    let rendezvous = Arc::new(rendezvous::Rendezvous::new(
        registry.clone(),
        pending.clone(),
        cfg.tunnel.response_timeout,
    ));
    let outbound = Arc::new(outbound::Outbound::new(cfg.outbound.timeout)?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // Public API server.
    {
        let app = http::router(
            http::ApiState {
                rendezvous,
                registry: registry.clone(),
                outbound,
                prom: Some(prom),
            },
            cfg.max_body_bytes,
        );
        let ln = tokio::net::TcpListener::bind(api_addr)
            .await
            .with_context(|| format!("api: bind {api_addr}"))?;
        tracing::info!(addr = %api_addr, "api: listening");

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { http::serve_with_shutdown(ln, app, shutdown).await });
    }

    // Tunnel WebSocket server.
    {
        let app = server::router(server::TunnelState {
            registry: registry.clone(),
            pending: pending.clone(),
        });
        let ln = tokio::net::TcpListener::bind(tunnel_addr)
            .await
            .with_context(|| format!("tunnel: bind {tunnel_addr}"))?;
        tracing::info!(addr = %tunnel_addr, "tunnel: listening");

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { http::serve_with_shutdown(ln, app, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Open tunnel sockets keep their servers busy; cap the drain so shutdown cannot stall.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!(
            clients = registry.len().await,
            pending = pending.len(),
            "shutdown: drain timed out; aborting"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
