//! Admin HTTP surface
//!
//! - `GET  /api/v1/health` (public)
//! - `POST /api/v1/orders/{id}/submit` (owner or admin)
//! - `POST /api/v1/admin/balance`
//! - `PATCH /api/v1/admin/orders/{id}`
//! - `POST /api/v1/admin/poll`

pub mod auth;
pub mod handlers;
pub mod state;
pub mod types;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, patch, post},
};
use tracing::info;

pub use auth::{Claims, JwtAuth};
pub use state::AppState;
pub use types::{ApiError, ErrorBody};

pub fn router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route("/balance", post(handlers::balance_action))
        .route("/orders/{id}", patch(handlers::update_order_status))
        .route("/poll", post(handlers::trigger_poll))
        .route_layer(from_fn(auth::require_admin));

    let private_routes = Router::new()
        .route("/orders/{id}/submit", post(handlers::submit_order))
        .nest("/admin", admin_routes)
        .route_layer(from_fn_with_state(state.clone(), auth::jwt_auth_middleware));

    Router::new()
        .route("/api/v1/health", get(handlers::health_check))
        .nest("/api/v1", private_routes)
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Admin gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
