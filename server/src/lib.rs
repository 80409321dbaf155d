//! # Tunnel Server
//!
//! The public edge of the tunnel. Agents dial `/_connect` and register the
//! domains they serve; every other request is routed by host to the agent
//! owning that domain and replayed over its control channel.

pub mod api;
pub mod config;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod registrar;
pub mod relay;
pub mod session;
pub mod state;

use std::future::Future;
use std::io;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Path agents connect to.
pub const CONNECT_PATH: &str = "/_connect";

/// Path of the JSON status endpoint.
pub const STATUS_PATH: &str = "/_status";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(CONNECT_PATH, get(handlers::connect_handler))
        .route(STATUS_PATH, get(api::status))
        .fallback(proxy::proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the edge on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
