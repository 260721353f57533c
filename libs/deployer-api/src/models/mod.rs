//! Deployer API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// One progress message as delivered to the observer.
///
/// `stage` is one of `provisioning`, `configuration`, `complete`, `error`.
/// `server_ip` and `port` are only present on the terminal success message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub stage: String,
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ProgressMessage {
    /// Whether no further messages follow this one
    pub fn is_terminal(&self) -> bool {
        self.stage == "complete" || self.stage == "error"
    }
}

/// Server creation body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServerBody {
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "aws".to_string()
}

/// Server record as exposed over the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResponse {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub status: String,
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Server list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerListResponse {
    pub servers: Vec<ServerResponse>,
    pub total: usize,
}

/// Deployment request body.
///
/// Enumerated fields travel as strings and are validated by the deployer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployBody {
    pub provider: String,
    #[serde(default = "default_orchestration")]
    pub orchestration: String,
    #[serde(default = "default_instances")]
    pub instances: Vec<String>,
    #[serde(default)]
    pub sizing: SizingBody,
    #[serde(default)]
    pub game: GameBody,
}

fn default_orchestration() -> String {
    "swarm".to_string()
}

fn default_instances() -> Vec<String> {
    vec!["instance1".to_string()]
}

/// Resource sizing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SizingBody {
    pub instance_size: Option<String>,
    pub region: Option<String>,
    pub disk_size_gb: Option<u32>,
}

/// Game configuration, passed through to the configuration tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameBody {
    pub name: Option<String>,
    pub server_type: Option<String>,
    pub version: Option<String>,
    pub memory: Option<String>,
    pub game_mode: Option<String>,
    pub difficulty: Option<String>,
    #[serde(default)]
    pub enable_bedrock: bool,
    pub timezone: Option<String>,
}

/// Explicit teardown body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyBody {
    pub provider: Option<String>,
    #[serde(default = "default_orchestration")]
    pub orchestration: String,
    #[serde(default = "default_instances")]
    pub instances: Vec<String>,
}

/// Response to an accepted deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAcceptedResponse {
    pub job_id: String,
    pub server_id: String,
}

/// Active job summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub server_id: String,
    pub stage: String,
    pub started_at: DateTime<Utc>,
}

/// Active job list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
    pub total: usize,
}
