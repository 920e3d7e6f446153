//! aircheck - Radio Recording Appliance
//!
//! Records reserved live radio broadcasts to local HLS trees and serves
//! the archive through a small HTTP API.

use std::sync::Arc;

use aircheck::api::{ApiServer, AppState};
use aircheck::capture::CaptureWorker;
use aircheck::capture::muxer::FfmpegMuxer;
use aircheck::clock::SystemClock;
use aircheck::config::Config;
use aircheck::convert::Converter;
use aircheck::logging::init_logging;
use aircheck::scheduler::{Scheduler, SchedulerConfig};
use aircheck::store::Store;
use aircheck::upstream::UpstreamClient;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before reading configuration.
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env_or_default());
    let _guard = init_logging(config.verbose, config.log_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    info!("starting aircheck v{}", env!("CARGO_PKG_VERSION"));
    info!(data_root = %config.data_root.display(), "opening catalogue");

    let store = Arc::new(Store::open(&config.data_root).await?);

    let upstream = Arc::new(UpstreamClient::new(
        config.upstream.clone(),
        config.series_cache_ttl,
    )?);

    let clock = Arc::new(SystemClock);
    let muxer = Arc::new(FfmpegMuxer::new(config.muxer_path.clone()));
    let worker = Arc::new(CaptureWorker::new(
        clock.clone(),
        muxer,
        Arc::clone(&store),
        config.grace_period,
        config.segment_duration_secs,
    ));

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        upstream.clone(),
        clock,
        worker,
        SchedulerConfig::from(config.as_ref()),
    );
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run());

    let converter = Arc::new(Converter::new(config.muxer_path.clone()));
    let state = AppState::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&scheduler),
        upstream,
        converter,
    );
    let server = Arc::new(ApiServer::new(state));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    info!("aircheck started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, shutting down");
        }
    }

    server.shutdown();
    scheduler.stop().await;

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "server did not shut down cleanly"),
        Err(e) => error!(error = %e, "server task panicked"),
    }
    // stop() cancelled the scheduler's token; the loop exits on its own.
    let _ = scheduler_task.await;

    info!("aircheck shutdown complete");
    Ok(())
}

/// Wait for SIGTERM (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

/// On non-Unix targets only Ctrl+C is handled.
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
