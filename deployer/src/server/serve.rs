//! HTTP server setup

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DeployerError;
use crate::server::handlers::{
    create_server_handler, delete_server_handler, deploy_handler, deploy_ws_handler,
    destroy_handler, get_server_handler, health_handler, list_jobs_handler,
    list_servers_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the API router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Server records
        .route(
            "/servers",
            get(list_servers_handler).post(create_server_handler),
        )
        .route(
            "/servers/{id}",
            get(get_server_handler).delete(delete_server_handler),
        )
        // Deployments
        .route("/servers/{id}/deploy", post(deploy_handler))
        .route("/servers/{id}/deploy/ws", get(deploy_ws_handler))
        .route("/servers/{id}/destroy", post(destroy_handler))
        .route("/jobs", get(list_jobs_handler))
        // State and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, JoinHandle<Result<(), DeployerError>>), DeployerError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DeployerError::ServerError(e.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| DeployerError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DeployerError::ServerError(e.to_string()))
    });

    Ok((local_addr, handle))
}
