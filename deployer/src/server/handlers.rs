//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{Sink, SinkExt, StreamExt};
use tracing::{debug, info, warn};

use deployer_api::{
    CreateServerBody, DeployBody, DestroyBody, ErrorResponse, HealthResponse,
    JobAcceptedResponse, JobListResponse, JobSummary, ProgressMessage, ServerListResponse,
    ServerResponse, VersionResponse,
};

use crate::deploy::coordinator::JobHandle;
use crate::errors::DeployerError;
use crate::models::progress::ProgressEvent;
use crate::models::request::{validate_server_id, DeploymentRequest};
use crate::models::server::Provider;
use crate::server::state::ServerState;
use crate::store::JsonServerStore;
use crate::utils::version_info;

/// Error returned by handlers, rendered as an `ErrorResponse` body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DeployerError> for ApiError {
    fn from(err: DeployerError) -> Self {
        let status = match &err {
            DeployerError::ValidationError(_) | DeployerError::JsonError(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployerError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployerError::JobAlreadyActive(_) => StatusCode::CONFLICT,
            DeployerError::Pipeline(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn local_store(state: &ServerState) -> Result<&Arc<JsonServerStore>, ApiError> {
    state.local_store.as_ref().ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_IMPLEMENTED,
            "Server records are managed by the record API",
        )
    })
}

// ================================ SERVICE ======================================= //

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "mineclifford-deployer".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ================================ SERVERS ======================================= //

pub async fn list_servers_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ApiError> {
    let store = local_store(&state)?;
    let servers: Vec<ServerResponse> = store.list().await.iter().map(ServerResponse::from).collect();
    let total = servers.len();
    Ok(Json(ServerListResponse { servers, total }))
}

pub async fn create_server_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateServerBody>,
) -> Result<impl IntoResponse, ApiError> {
    let store = local_store(&state)?;
    let provider: Provider = body
        .provider
        .parse()
        .map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    let record = store.create(&body.name, provider).await?;
    info!("Registered server {} ({}, {})", record.id, record.name, provider);
    Ok((StatusCode::CREATED, Json(ServerResponse::from(&record))))
}

pub async fn get_server_handler(
    State(state): State<Arc<ServerState>>,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_server_id(&server_id)?;
    let record = state.coordinator.store().get_server(&server_id).await?;
    Ok(Json(ServerResponse::from(&record)))
}

pub async fn delete_server_handler(
    State(state): State<Arc<ServerState>>,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = local_store(&state)?;
    if state.coordinator.is_active(&server_id) {
        return Err(DeployerError::JobAlreadyActive(server_id).into());
    }
    store.remove(&server_id).await?;
    info!("Deleted server {}", server_id);
    Ok(StatusCode::NO_CONTENT)
}

// ============================== DEPLOYMENTS ===================================== //

/// Start a deployment without a progress subscriber
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(server_id): Path<String>,
    Json(body): Json<DeployBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = DeploymentRequest::from_body(&server_id, &body)?;
    let handle = state.coordinator.submit(request).await?;

    let accepted = JobAcceptedResponse {
        job_id: handle.job_id.clone(),
        server_id: handle.server_id.clone(),
    };
    // The job keeps running once its handle is dropped
    drop(handle);

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Start a deployment and stream its progress over a WebSocket.
///
/// The client sends one `DeployBody` as a text message and then receives
/// `ProgressMessage`s until the terminal one.
pub async fn deploy_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path(server_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_deploy_socket(socket, state, server_id))
}

async fn handle_deploy_socket(socket: WebSocket, state: Arc<ServerState>, server_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let body = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<DeployBody>(text.as_str()),
            Some(Ok(Message::Close(_))) | None => {
                debug!("Client left before sending a deployment for {}", server_id);
                return;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("WebSocket error before deployment of {}: {}", server_id, e);
                return;
            }
        }
    };

    let accepted = match body {
        Ok(body) => match DeploymentRequest::from_body(&server_id, &body) {
            Ok(request) => state.coordinator.submit(request).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(DeployerError::from(e)),
    };

    let handle = match accepted {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Rejected deployment of {}: {}", server_id, e);
            let event = ProgressEvent::error(format!("Deployment rejected: {}", e));
            let _ = send_event(&mut sender, &event).await;
            let _ = sender.close().await;
            return;
        }
    };

    forward_progress(handle, &mut sender).await;
    let _ = sender.close().await;
}

/// Relay events until the terminal one or until the client goes away
async fn forward_progress<S>(handle: JobHandle, sender: &mut S)
where
    S: Sink<Message> + Unpin,
{
    let (mut events, _task) = handle.into_parts();
    while let Some(event) = events.recv().await {
        let terminal = event.is_terminal();
        if send_event(sender, &event).await.is_err() {
            info!("Progress subscriber disconnected, deployment continues");
            return;
        }
        if terminal {
            return;
        }
    }
}

async fn send_event<S>(sender: &mut S, event: &ProgressEvent) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = serde_json::to_string(&ProgressMessage::from(event)).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Tear a server's infrastructure down and return the updated record
pub async fn destroy_handler(
    State(state): State<Arc<ServerState>>,
    Path(server_id): Path<String>,
    Json(body): Json<DestroyBody>,
) -> Result<impl IntoResponse, ApiError> {
    validate_server_id(&server_id)?;
    let record = state.coordinator.store().get_server(&server_id).await?;
    let request = DeploymentRequest::for_teardown(&server_id, record.provider, &body)?;
    state.coordinator.destroy(request).await?;

    let record = state.coordinator.store().get_server(&server_id).await?;
    Ok(Json(ServerResponse::from(&record)))
}

pub async fn list_jobs_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let jobs: Vec<JobSummary> = state
        .coordinator
        .active_jobs()
        .into_iter()
        .map(|job| JobSummary {
            job_id: job.job_id,
            server_id: job.server_id,
            stage: job.state.as_str().to_string(),
            started_at: job.started_at,
        })
        .collect();
    let total = jobs.len();
    Json(JobListResponse { jobs, total })
}
