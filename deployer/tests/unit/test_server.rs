//! HTTP API tests

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use mcdeploy::deploy::configure::{AnsibleConfigurator, ConfigureOptions};
use mcdeploy::deploy::coordinator::{CoordinatorOptions, DeploymentCoordinator};
use mcdeploy::deploy::provision::{ProvisionOptions, TerraformProvisioner};
use mcdeploy::deploy::stage::{StageCommand, StageProcess, StageRunner};
use mcdeploy::errors::PipelineError;
use mcdeploy::server::serve::router;
use mcdeploy::server::state::ServerState;
use mcdeploy::store::JsonServerStore;

/// Every tool is missing, so accepted jobs fail fast in the background
struct MissingTools;

#[async_trait]
impl StageRunner for MissingTools {
    async fn spawn(&self, command: StageCommand) -> Result<StageProcess, PipelineError> {
        Err(PipelineError::ToolUnavailable {
            program: command.program,
            reason: "not installed".to_string(),
        })
    }
}

fn app(dir: &tempfile::TempDir, local: bool) -> Router {
    let runner: Arc<dyn StageRunner> = Arc::new(MissingTools);
    let store = Arc::new(JsonServerStore::in_memory());
    let coordinator = DeploymentCoordinator::new(
        store.clone(),
        Arc::new(TerraformProvisioner::new(
            runner.clone(),
            ProvisionOptions {
                state_dir: dir.path().join("state"),
                ..Default::default()
            },
        )),
        Arc::new(AnsibleConfigurator::new(runner, ConfigureOptions::default())),
        CoordinatorOptions {
            jobs_dir: dir.path().join("jobs"),
            game_port: 25565,
            rollback_on_failure: false,
            keep_workspaces: false,
        },
    );

    let local_store = if local { Some(store) } else { None };
    router(Arc::new(ServerState::new(Arc::new(coordinator), local_store)))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, true);

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "mineclifford-deployer");
}

#[tokio::test]
async fn test_server_crud() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, true);

    let (status, created) = send(
        &app,
        "POST",
        "/servers",
        Some(json!({"name": "survival", "provider": "azure"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "creating");
    assert_eq!(created["provider"], "azure");
    assert!(created["ip_address"].is_null());
    let id = created["id"].as_str().unwrap().to_string();

    let (status, list) = send(&app, "GET", "/servers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);

    let (status, fetched) = send(&app, "GET", &format!("/servers/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "survival");

    let (status, _) = send(&app, "DELETE", &format!("/servers/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "GET", &format!("/servers/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains(&id));
}

#[tokio::test]
async fn test_create_rejects_unknown_provider() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, true);

    let (status, body) = send(
        &app,
        "POST",
        "/servers",
        Some(json!({"name": "survival", "provider": "gcp"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("gcp"));
}

#[tokio::test]
async fn test_deploy_validation_and_acceptance() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, true);

    let (_, created) = send(
        &app,
        "POST",
        "/servers",
        Some(json!({"name": "survival", "provider": "aws"})),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();
    let deploy_uri = format!("/servers/{}/deploy", id);

    let (status, _) = send(
        &app,
        "POST",
        &deploy_uri,
        Some(json!({"provider": "aws", "instances": ["1bad"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/servers/unknown/deploy",
        Some(json!({"provider": "aws"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, accepted) = send(&app, "POST", &deploy_uri, Some(json!({"provider": "aws"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["server_id"], id.as_str());
    assert!(accepted["job_id"].as_str().is_some());
}

#[tokio::test]
async fn test_jobs_listing_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, true);

    let (status, body) = send(&app, "GET", "/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
    assert_eq!(body["jobs"], json!([]));
}

#[tokio::test]
async fn test_record_routes_need_local_store() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, false);

    let (status, body) = send(&app, "GET", "/servers", None).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_server_id_must_be_a_plain_segment() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, true);

    for uri in ["/servers/%2E%2E/deploy", "/servers/a%2Fb/deploy", "/servers/s1.bak/deploy"] {
        let (status, body) = send(&app, "POST", uri, Some(json!({"provider": "aws"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert!(body["error"].as_str().unwrap().contains("Invalid server id"));
    }

    let (status, _) = send(&app, "GET", "/servers/%2E%2E", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!dir.path().join("state").exists());
}
