//! HTTP server for the watchdog listener surface

use crate::coordinator::Coordinator;
use crate::handlers;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use watchdog_common::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP server wrapper around the coordinator
pub struct Server {
    coordinator: Arc<Coordinator>,
}

impl Server {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn create_app(&self) -> Router {
        handlers::create_router(self.coordinator.clone()).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
    }

    /// Serve until the coordinator's cancellation token fires
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let app = self.create_app();
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind {}: {}", bind_addr, e)))?;
        info!("listening on {}", bind_addr);
        self.coordinator.mark_listener_open();

        let cancel = self.coordinator.cancellation_token();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("server error: {}", e)));

        self.coordinator.mark_listener_closed();
        result
    }
}
