use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Extension, Router};
use tracing_subscriber::EnvFilter;

use proxyd::app::{flatten_handles, App};
use proxyd::{config, dispatch, ws};

async fn handle_health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "proxyd.toml".to_string());
    let raw = std::fs::read_to_string(&config_path)
        .map_err(|err| anyhow::anyhow!("failed to read config at {config_path}: {err}"))?;
    let app_config = config::load(&raw)?;

    let listen_addr: SocketAddr = app_config.server.listen_addr.parse()?;

    let (app, poller_handles) = App::spawn(app_config)?;

    let router = build_router(app.clone());

    tracing::info!(%listen_addr, "proxyd listening");

    let server = axum::Server::bind(&listen_addr)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    app.shutdown();

    let handles: futures::stream::FuturesUnordered<_> = poller_handles.into_iter().collect();
    flatten_handles(handles).await?;

    Ok(())
}

fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/", get(ws::handle_ws_upgrade).post(dispatch::handle_http_rpc))
        .route(
            "/:path_key",
            get(ws::handle_ws_upgrade).post(dispatch::handle_http_rpc),
        )
        .layer(Extension(app))
}
