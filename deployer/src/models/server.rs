//! Server record models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use deployer_api::ServerResponse;

use crate::errors::DeployerError;

/// Where a server runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    /// Managed by the local container runtime, never by the cloud pipeline
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Local => "local",
        }
    }

    /// Whether the cloud pipeline can deploy to this provider
    pub fn is_cloud(&self) -> bool {
        !matches!(self, Provider::Local)
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Provider::Aws),
            "azure" => Ok(Provider::Azure),
            "local" => Ok(Provider::Local),
            _ => Err(format!("Invalid provider: {}", s)),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Creating => "creating",
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(ServerStatus::Creating),
            "running" => Ok(ServerStatus::Running),
            "stopped" => Ok(ServerStatus::Stopped),
            "error" => Ok(ServerStatus::Error),
            _ => Err(format!("Invalid server status: {}", s)),
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A game server record.
///
/// `address` and `port` are set if and only if `status` is `Running`; the
/// mutators below are the only way to change either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    status: ServerStatus,
    address: Option<String>,
    port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Create a new record in the `Creating` state
    pub fn new(id: impl Into<String>, name: impl Into<String>, provider: Provider) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            provider,
            status: ServerStatus::Creating,
            address: None,
            port: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Set a non-running status; clears any published address
    pub fn set_status(&mut self, status: ServerStatus) {
        self.status = status;
        if status != ServerStatus::Running {
            self.address = None;
            self.port = None;
        }
        self.updated_at = Utc::now();
    }

    /// Publish the reachable address, which marks the server running
    pub fn set_address(&mut self, address: impl Into<String>, port: u16) {
        self.status = ServerStatus::Running;
        self.address = Some(address.into());
        self.port = Some(port);
        self.updated_at = Utc::now();
    }

    /// Check the address/status invariant
    pub fn is_consistent(&self) -> bool {
        let published = self.address.is_some() && self.port.is_some();
        let unpublished = self.address.is_none() && self.port.is_none();
        match self.status {
            ServerStatus::Running => published,
            _ => unpublished,
        }
    }
}

impl From<&ServerRecord> for ServerResponse {
    fn from(record: &ServerRecord) -> Self {
        ServerResponse {
            id: record.id.clone(),
            name: record.name.clone(),
            provider: record.provider.as_str().to_string(),
            status: record.status.as_str().to_string(),
            ip_address: record.address.clone(),
            port: record.port,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl TryFrom<ServerResponse> for ServerRecord {
    type Error = DeployerError;

    /// Rebuild a record from the wire. A `running` record without a full
    /// address is downgraded to `error` so the invariant holds locally.
    fn try_from(response: ServerResponse) -> Result<Self, Self::Error> {
        let provider: Provider = response
            .provider
            .parse()
            .map_err(DeployerError::StorageError)?;
        let status: ServerStatus = response
            .status
            .parse()
            .map_err(DeployerError::StorageError)?;

        let mut record = ServerRecord::new(response.id, response.name, provider);
        match (status, response.ip_address, response.port) {
            (ServerStatus::Running, Some(address), Some(port)) => record.set_address(address, port),
            (ServerStatus::Running, _, _) => record.set_status(ServerStatus::Error),
            (other, _, _) => record.set_status(other),
        }
        record.created_at = response.created_at;
        record.updated_at = response.updated_at;
        Ok(record)
    }
}
