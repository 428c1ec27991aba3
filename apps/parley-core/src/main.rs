use anyhow::Context;
use axum::Router;
use parley_core::{api, app, config};
use std::net::SocketAddr;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    parley_telemetry::init();

    let (cfg, cfg_path) = config::Config::load().context("loading config/parley.toml")?;
    info!(?cfg_path, characters = cfg.characters.len(), "config loaded");

    let addr: SocketAddr = cfg.bind_addr().parse().context("invalid bind address")?;
    let state = app::AppState::new(cfg).await;
    let registry = state.handles.registry.clone();
    let router: Router = api::build_router(state);

    info!(%addr, version = env!("CARGO_PKG_VERSION"), "parley-core listening");

    let server = axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    );

    let graceful = server.with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        let closed = registry.close_all("server shutdown");
        info!(closed, "ctrl-c received; shutting down");
    });

    if let Err(e) = graceful.await {
        error!(error = %e, "server error");
    }

    Ok(())
}
