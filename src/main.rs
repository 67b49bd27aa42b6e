//! Live RTMP ingest server with HLS delivery
//!
//! Publishers push H.264/AAC over RTMP using single-use tokens; viewers
//! pull the same streams as HLS playlists with fMP4/CMAF segments over
//! HTTP. The ingest pipeline demuxes FLV-framed media, repairs the H.264
//! bitstream (SPS/PPS ahead of every IDR), fans frames out per stream, and
//! segments them on keyframe boundaries into a sliding live window.

#![allow(dead_code)]

mod auth;
mod config;
mod error;
mod flv;
mod http;
mod mux;
mod registry;
mod rtmp;
mod segmenter;
mod state;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::http::create_router;
use crate::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
const APP_NAME: &str = "rtmp-hls-server";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    tracing::info!("{} v{} starting", APP_NAME, VERSION);

    let config = ServerConfig::from_env();
    tracing::info!("configuration loaded: {:?}", config);

    let state = Arc::new(AppState::new(config.clone())?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // RTMP ingest listener
    let rtmp_addr: SocketAddr = config
        .rtmp_addr
        .parse()
        .map_err(|e| ServerError::Config(format!("bad RTMP_BIND_ADDR: {e}")))?;
    let rtmp_task = {
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = rtmp::run(state, rtmp_addr, shutdown).await {
                tracing::error!(error = %e, "RTMP ingest terminated");
            }
        })
    };

    // periodic token sweep; per-token purge already bounds memory, this
    // just keeps the table tidy
    {
        let state = state.clone();
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = state.tokens.sweep();
                        if purged > 0 {
                            tracing::debug!(purged, "expired tokens purged");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // HTTP playback + control
    let app = create_router(state);
    let http_addr: SocketAddr = config
        .http_addr
        .parse()
        .map_err(|e| ServerError::Config(format!("bad HTTP_BIND_ADDR: {e}")))?;
    tracing::info!(%http_addr, "HTTP server listening");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = rtmp_task.await;
    tracing::info!("bye");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtmp_hls_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
