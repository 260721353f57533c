//! Server record API client

use serde::Serialize;

use deployer_api::ServerResponse;

use crate::errors::DeployerError;
use crate::http::client::HttpClient;
use crate::models::server::ServerStatus;

/// Partial record update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerUpdate {
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ServerUpdate {
    /// Status change without an address; the API clears any published address
    pub fn status(status: ServerStatus) -> Self {
        Self {
            status,
            ip_address: None,
            port: None,
        }
    }

    /// Publish the address of a running server
    pub fn running(address: &str, port: u16) -> Self {
        Self {
            status: ServerStatus::Running,
            ip_address: Some(address.to_string()),
            port: Some(port),
        }
    }
}

impl HttpClient {
    /// Fetch one server record
    pub async fn get_server(&self, server_id: &str) -> Result<ServerResponse, DeployerError> {
        let path = format!("servers/{}", server_id);
        self.get(&path).await
    }

    /// Apply a partial update to a server record
    pub async fn update_server(
        &self,
        server_id: &str,
        update: &ServerUpdate,
    ) -> Result<ServerResponse, DeployerError> {
        let path = format!("servers/{}", server_id);
        self.patch(&path, update).await
    }
}
