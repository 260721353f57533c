//! Server record storage
//!
//! The coordinator is the only writer of a record's status and address, and
//! only through this trait.

pub mod json;
pub mod remote;

use async_trait::async_trait;

use crate::errors::DeployerError;
use crate::models::server::{ServerRecord, ServerStatus};

pub use json::JsonServerStore;
pub use remote::HttpServerStore;

#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Fetch a record; `NotFound` if it does not exist
    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, DeployerError>;

    /// Set a status; any status but `running` clears the address
    async fn set_server_status(
        &self,
        server_id: &str,
        status: ServerStatus,
    ) -> Result<(), DeployerError>;

    /// Publish the address, which marks the record `running`
    async fn set_server_address(
        &self,
        server_id: &str,
        address: &str,
        port: u16,
    ) -> Result<(), DeployerError>;
}
