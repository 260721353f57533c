//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::deploy::configure::{AnsibleConfigurator, ConfigureOptions};
use crate::deploy::coordinator::{CoordinatorOptions, DeploymentCoordinator};
use crate::deploy::provision::{ProvisionOptions, TerraformProvisioner};
use crate::deploy::stage::{StageRunner, TokioStageRunner};
use crate::errors::DeployerError;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{Settings, StoreBackend};
use crate::store::{HttpServerStore, JsonServerStore, ServerStore};

/// Main application state
pub struct AppState {
    /// Runs deployments and teardowns
    pub coordinator: Arc<DeploymentCoordinator>,

    /// Local record store, when records are kept by the deployer itself
    pub local_store: Option<Arc<JsonServerStore>>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(layout: &StorageLayout, settings: &Settings) -> Result<Self, DeployerError> {
        info!("Initializing application state...");

        layout.setup().await?;

        let (store, local_store): (Arc<dyn ServerStore>, Option<Arc<JsonServerStore>>) =
            match settings.store.backend {
                StoreBackend::File => {
                    let store = Arc::new(JsonServerStore::open(layout.servers_file()).await?);
                    (store.clone() as Arc<dyn ServerStore>, Some(store))
                }
                StoreBackend::Http => {
                    info!("Using record API at {}", settings.store.base_url);
                    let store: Arc<dyn ServerStore> =
                        Arc::new(HttpServerStore::from_settings(&settings.store)?);
                    (store, None)
                }
            };

        let runner: Arc<dyn StageRunner> = Arc::new(TokioStageRunner);
        let provisioner = Arc::new(TerraformProvisioner::new(
            runner.clone(),
            ProvisionOptions::from_settings(settings, layout),
        ));
        let configurator = Arc::new(AnsibleConfigurator::new(
            runner,
            ConfigureOptions::from_settings(settings),
        ));

        let coordinator = Arc::new(DeploymentCoordinator::new(
            store,
            provisioner,
            configurator,
            CoordinatorOptions::from_settings(settings, layout),
        ));

        Ok(Self {
            coordinator,
            local_store,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), DeployerError> {
        info!("Shutting down application state...");
        let active = self.coordinator.active_jobs();
        if !active.is_empty() {
            info!(
                "{} deployment(s) still in flight will be abandoned: {}",
                active.len(),
                active
                    .iter()
                    .map(|job| job.server_id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(())
    }
}
