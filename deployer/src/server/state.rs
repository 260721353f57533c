//! Server state

use std::sync::Arc;

use crate::deploy::coordinator::DeploymentCoordinator;
use crate::store::JsonServerStore;

/// Server state shared across handlers
pub struct ServerState {
    pub coordinator: Arc<DeploymentCoordinator>,
    /// Set when records live in the deployer's own file; enables the record
    /// CRUD routes
    pub local_store: Option<Arc<JsonServerStore>>,
}

impl ServerState {
    pub fn new(
        coordinator: Arc<DeploymentCoordinator>,
        local_store: Option<Arc<JsonServerStore>>,
    ) -> Self {
        Self {
            coordinator,
            local_store,
        }
    }
}
