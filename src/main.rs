use std::sync::Arc;

use anyhow::Context;
use review_mirror_lib::{admin, AppState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let state = Arc::new(AppState::initialize().context("failed to initialise service state")?);
    let addr = state.config().bind_addr();

    let _scheduler = state.spawn_scheduler();
    let flusher = state.spawn_telemetry_flush();
    let app = admin::router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(target: "bootstrap", %addr, "admin surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated")?;

    flusher.abort();
    if let Err(err) = state.telemetry().flush() {
        warn!(target: "telemetry", error = %err, "failed to flush activity log on shutdown");
    }
    info!(target: "bootstrap", "shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target: "bootstrap", error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
