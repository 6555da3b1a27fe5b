//! HTTP API for renderers and UIs observing the pipeline

pub mod health;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::animation::AnimationState;
use crate::events::EventBus;

/// Command sent from an API client to the pipeline loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Cancel the current turn and stop playback
    Stop,
}

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub events: EventBus,
    /// Latest face pose published by the render loop
    pub animation: watch::Receiver<AnimationState>,
    pub control: mpsc::Sender<ControlCommand>,
    pub started_at: DateTime<Utc>,
}

/// Event API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub fn new(
        port: u16,
        events: EventBus,
        animation: watch::Receiver<AnimationState>,
        control: mpsc::Sender<ControlCommand>,
    ) -> Self {
        Self {
            state: Arc::new(ApiState {
                events,
                animation,
                control,
                started_at: Utc::now(),
            }),
            port,
        }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        // Renderers are served from other origins
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .merge(health::router(self.state.clone()))
            .nest("/ws", websocket::router(self.state.clone()))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "event api listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
