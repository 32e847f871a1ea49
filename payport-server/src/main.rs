//! The payport server binary: config preflight, logger setup, context
//! wiring, and the axum serve loop with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use payport_common::shutdown::{ShutdownChannel, ShutdownReason};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::AppContext;

/// Session auth and the Turnstile verifier port.
mod auth;
/// Environment configuration with startup preflight.
mod config;
/// Everything a request handler needs, wired once at startup.
mod context;
/// `tracing` logger configuration.
mod logger;
/// Fixed-window per-IP rate limiting.
mod rate_limit;
/// The axum router and request handlers.
mod routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the preflight reports whatever is absent.
    let _ = dotenvy::dotenv();
    logger::init();

    let config = Config::from_env()?;
    if !config.payuni_api_base.contains("sandbox") {
        warn!(
            api_base = %config.payuni_api_base,
            "PAYUNI_API_BASE does not look like the sandbox host; \
             real charges will happen"
        );
    }

    let bind_addr = config.bind_addr;
    let ctx = AppContext::new(config).context("failed to build app context")?;
    serve(ctx, bind_addr).await
}

async fn serve(ctx: Arc<AppContext>, bind_addr: SocketAddr) -> anyhow::Result<()> {
    let shutdown = ShutdownChannel::new();
    let shutdown_on_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_on_signal.send(wait_for_signal().await);
    });

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("could not bind {bind_addr}"))?;
    info!("listening on http://{bind_addr}");

    let router = routes::router(ctx);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = shutdown.recv().await;
        info!(%reason, "shutting down; draining connections");
    })
    .await
    .context("server exited with an error")
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => tokio::select! {
            _ = ctrl_c => ShutdownReason::Interrupt,
            _ = terminate.recv() => ShutdownReason::Terminate,
        },
        Err(err) => {
            warn!("could not install SIGTERM handler: {err:#}");
            let _ = ctrl_c.await;
            ShutdownReason::Interrupt
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownReason {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownReason::Interrupt
}
