//! API server setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::routes;
use crate::config::Config;
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::upstream::ScheduleFeed;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub upstream: Arc<dyn ScheduleFeed>,
    pub converter: Arc<Converter>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        upstream: Arc<dyn ScheduleFeed>,
        converter: Arc<Converter>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            config,
            store,
            scheduler,
            upstream,
            converter,
        }
    }
}

/// API server.
pub struct ApiServer {
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    fn build_router(&self) -> Router {
        // The front-end is a static page served from anywhere; keep CORS
        // permissive.
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        routes::create_router(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until the cancellation token fires.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.state.config.bind_address, self.state.config.port
        )
        .parse()
        .map_err(|e| Error::internal(format!("invalid listen address: {e}")))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("cannot bind {addr}: {e}")))?;

        tracing::info!("API server listening on http://{addr}");

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down");
            })
            .await
            .map_err(|e| Error::internal(format!("server error: {e}")))
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
