//! Local record store, optionally persisted to a JSON file

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::models::server::{Provider, ServerRecord, ServerStatus};
use crate::store::ServerStore;
use crate::utils::generate_uuid;

/// Records kept in memory and mirrored to `servers.json` after every change
pub struct JsonServerStore {
    records: RwLock<BTreeMap<String, ServerRecord>>,
    file: Option<File>,
}

impl JsonServerStore {
    /// A store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            file: None,
        }
    }

    /// Load the store from `file`, starting empty if it does not exist yet
    pub async fn open(file: File) -> Result<Self, DeployerError> {
        let mut records = BTreeMap::new();

        if file.exists().await {
            let stored: Vec<ServerRecord> = file.read_json().await?;
            for mut record in stored {
                if !record.is_consistent() {
                    warn!(
                        "Server {} has an address without running status, marking it as error",
                        record.id
                    );
                    record.set_status(ServerStatus::Error);
                }
                records.insert(record.id.clone(), record);
            }
            info!(
                "Loaded {} server record(s) from {}",
                records.len(),
                file.path().display()
            );
        }

        Ok(Self {
            records: RwLock::new(records),
            file: Some(file),
        })
    }

    /// Create a new record in the `creating` state
    pub async fn create(&self, name: &str, provider: Provider) -> Result<ServerRecord, DeployerError> {
        if name.trim().is_empty() {
            return Err(DeployerError::ValidationError(
                "Server name must not be empty".to_string(),
            ));
        }

        let record = ServerRecord::new(generate_uuid(), name.trim(), provider);
        self.insert(record.clone()).await?;
        debug!("Created server {} ({})", record.id, record.name);
        Ok(record)
    }

    /// Insert or replace a record
    pub async fn insert(&self, record: ServerRecord) -> Result<(), DeployerError> {
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record);
        self.persist(&records).await
    }

    /// All records, oldest first
    pub async fn list(&self) -> Vec<ServerRecord> {
        let mut records: Vec<ServerRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Delete a record
    pub async fn remove(&self, server_id: &str) -> Result<ServerRecord, DeployerError> {
        let mut records = self.records.write().await;
        let record = records
            .remove(server_id)
            .ok_or_else(|| DeployerError::NotFound(format!("Server {}", server_id)))?;
        self.persist(&records).await?;
        Ok(record)
    }

    async fn update<F>(&self, server_id: &str, apply: F) -> Result<(), DeployerError>
    where
        F: FnOnce(&mut ServerRecord),
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(server_id)
            .ok_or_else(|| DeployerError::NotFound(format!("Server {}", server_id)))?;
        apply(record);
        self.persist(&records).await
    }

    async fn persist(&self, records: &BTreeMap<String, ServerRecord>) -> Result<(), DeployerError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let list: Vec<&ServerRecord> = records.values().collect();
        file.write_json(&list).await
    }
}

#[async_trait]
impl ServerStore for JsonServerStore {
    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, DeployerError> {
        self.records
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| DeployerError::NotFound(format!("Server {}", server_id)))
    }

    async fn set_server_status(
        &self,
        server_id: &str,
        status: ServerStatus,
    ) -> Result<(), DeployerError> {
        self.update(server_id, |record| record.set_status(status))
            .await
    }

    async fn set_server_address(
        &self,
        server_id: &str,
        address: &str,
        port: u16,
    ) -> Result<(), DeployerError> {
        self.update(server_id, |record| record.set_address(address, port))
            .await
    }
}
