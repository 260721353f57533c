//! Record store backed by an external record API

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::debug;

use crate::errors::DeployerError;
use crate::http::client::HttpClient;
use crate::http::servers::ServerUpdate;
use crate::models::server::{ServerRecord, ServerStatus};
use crate::storage::settings::StoreSettings;
use crate::store::ServerStore;

pub struct HttpServerStore {
    client: HttpClient,
}

impl HttpServerStore {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    pub fn from_settings(settings: &StoreSettings) -> Result<Self, DeployerError> {
        let mut client = HttpClient::new(&settings.base_url)?;
        if let Some(token) = &settings.api_token {
            client = client.with_token(SecretString::from(token.clone()));
        }
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ServerStore for HttpServerStore {
    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, DeployerError> {
        let response = self.client.get_server(server_id).await?;
        ServerRecord::try_from(response)
    }

    async fn set_server_status(
        &self,
        server_id: &str,
        status: ServerStatus,
    ) -> Result<(), DeployerError> {
        debug!("Setting server {} status to {}", server_id, status);
        self.client
            .update_server(server_id, &ServerUpdate::status(status))
            .await?;
        Ok(())
    }

    async fn set_server_address(
        &self,
        server_id: &str,
        address: &str,
        port: u16,
    ) -> Result<(), DeployerError> {
        debug!("Publishing {}:{} for server {}", address, port, server_id);
        self.client
            .update_server(server_id, &ServerUpdate::running(address, port))
            .await?;
        Ok(())
    }
}
