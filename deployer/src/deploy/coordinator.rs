//! Deployment coordinator
//!
//! Owns every deployment job: reserves the server, runs provisioning then
//! configuration on a dedicated task, turns stage results into progress
//! events and writes the server record at each terminal transition. No stage
//! error leaves a job task; each becomes one terminal error event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::deploy::fsm::{JobEvent, JobFsm, JobState};
use crate::deploy::progress::{self, ProgressReceiver, ProgressSender};
use crate::deploy::provision::{AddressMap, Provisioner};
use crate::deploy::configure::Configurator;
use crate::deploy::registry::{ActiveJob, JobGuard, JobRegistry};
use crate::errors::{DeployerError, PipelineError};
use crate::models::progress::{EventStatus, ProgressEvent};
use crate::models::request::DeploymentRequest;
use crate::models::server::ServerStatus;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::store::ServerStore;
use crate::utils::generate_uuid;

/// Coordinator options
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// One workspace directory per job is created here
    pub jobs_dir: PathBuf,
    /// Port published on the record after a successful deployment
    pub game_port: u16,
    /// Destroy the infrastructure after a failed deployment
    pub rollback_on_failure: bool,
    pub keep_workspaces: bool,
}

impl CoordinatorOptions {
    pub fn from_settings(settings: &Settings, layout: &StorageLayout) -> Self {
        Self {
            jobs_dir: layout.jobs_dir().path().to_path_buf(),
            game_port: settings.pipeline.game_port,
            rollback_on_failure: settings.pipeline.rollback_on_failure,
            keep_workspaces: settings.pipeline.keep_workspaces,
        }
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub server_id: String,
    pub state: JobState,
    /// Published address and port, on success
    pub endpoint: Option<(String, u16)>,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Complete
    }
}

/// Handle to an accepted job
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: String,
    pub server_id: String,
    /// The job's progress events; dropping it does not stop the job
    pub events: ProgressReceiver,
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    /// Split into the event stream and the task handle
    pub fn into_parts(self) -> (ProgressReceiver, JoinHandle<JobOutcome>) {
        (self.events, self.task)
    }

    /// Wait for the job to finish, discarding any unread events
    pub async fn join(self) -> Result<JobOutcome, DeployerError> {
        self.task
            .await
            .map_err(|e| DeployerError::ServerError(format!("Deployment task failed: {}", e)))
    }
}

pub struct DeploymentCoordinator {
    store: Arc<dyn ServerStore>,
    provisioner: Arc<dyn Provisioner>,
    configurator: Arc<dyn Configurator>,
    registry: JobRegistry,
    options: CoordinatorOptions,
}

impl DeploymentCoordinator {
    pub fn new(
        store: Arc<dyn ServerStore>,
        provisioner: Arc<dyn Provisioner>,
        configurator: Arc<dyn Configurator>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            store,
            provisioner,
            configurator,
            registry: JobRegistry::new(),
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ServerStore> {
        &self.store
    }

    /// Jobs currently provisioning or configuring
    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        self.registry.list()
    }

    pub fn is_active(&self, server_id: &str) -> bool {
        self.registry.is_active(server_id)
    }

    /// Accept a deployment and start it on its own task.
    ///
    /// Fails without side effects on the record if the server is unknown,
    /// targets another provider, or already has a job in flight.
    pub async fn submit(&self, request: DeploymentRequest) -> Result<JobHandle, DeployerError> {
        let job_id = generate_uuid();
        let server_id = request.server_id().to_string();
        let guard = self.registry.reserve(&server_id, &job_id)?;

        let record = self.store.get_server(&server_id).await?;
        if record.provider != request.provider() {
            return Err(DeployerError::ValidationError(format!(
                "Server {} is registered for {}, not {}",
                server_id,
                record.provider,
                request.provider()
            )));
        }

        let workspace = self.options.jobs_dir.join(&job_id);
        tokio::fs::create_dir_all(&workspace).await.map_err(|e| {
            DeployerError::StorageError(format!(
                "Cannot create job workspace {}: {}",
                workspace.display(),
                e
            ))
        })?;

        if let Err(e) = self
            .store
            .set_server_status(&server_id, ServerStatus::Creating)
            .await
        {
            remove_workspace(&workspace, false).await;
            return Err(e);
        }

        let (sender, receiver) = progress::channel();
        sender.emit(ProgressEvent::provisioning(
            EventStatus::Started,
            format!(
                "Deploying {} to {} with {} instance(s)",
                record.name,
                request.provider(),
                request.instances().len()
            ),
        ));

        info!(
            "Accepted deployment {} for server {} ({}, {})",
            job_id,
            server_id,
            request.provider(),
            request.orchestration().as_str()
        );

        let job = DeploymentJob {
            job_id: job_id.clone(),
            request,
            fsm: JobFsm::new(),
            workspace,
            progress: sender,
            guard,
            store: self.store.clone(),
            provisioner: self.provisioner.clone(),
            configurator: self.configurator.clone(),
            options: self.options.clone(),
        };
        let task = tokio::spawn(job.run());

        Ok(JobHandle {
            job_id,
            server_id,
            events: receiver,
            task,
        })
    }

    /// Tear down a server's infrastructure. Rejected while a job is active.
    pub async fn destroy(&self, request: DeploymentRequest) -> Result<(), DeployerError> {
        let job_id = generate_uuid();
        let server_id = request.server_id().to_string();
        let _guard = self.registry.reserve(&server_id, &job_id)?;

        self.store.get_server(&server_id).await?;

        let workspace = self.options.jobs_dir.join(&job_id);
        tokio::fs::create_dir_all(&workspace).await?;

        info!("Destroying infrastructure of server {}", server_id);
        let result = self.provisioner.destroy(&request, &workspace).await;
        remove_workspace(&workspace, self.options.keep_workspaces).await;

        match result {
            Ok(()) => {
                self.store
                    .set_server_status(&server_id, ServerStatus::Stopped)
                    .await?;
                info!("Server {} destroyed", server_id);
                Ok(())
            }
            Err(e) => {
                error!("Destroying server {} failed: {}", server_id, e);
                if let Err(write) = self
                    .store
                    .set_server_status(&server_id, ServerStatus::Error)
                    .await
                {
                    error!("Failed to mark server {} as error: {}", server_id, write);
                }
                Err(e.into())
            }
        }
    }
}

/// One in-flight deployment. Lives on its own task and is dropped when the
/// pipeline ends, which releases the server reservation.
struct DeploymentJob {
    job_id: String,
    request: DeploymentRequest,
    fsm: JobFsm,
    workspace: PathBuf,
    progress: ProgressSender,
    guard: JobGuard,
    store: Arc<dyn ServerStore>,
    provisioner: Arc<dyn Provisioner>,
    configurator: Arc<dyn Configurator>,
    options: CoordinatorOptions,
}

impl DeploymentJob {
    async fn run(mut self) -> JobOutcome {
        let endpoint = self.execute().await;

        if !self.progress.has_subscriber() {
            info!("Deployment {} finished without a subscriber", self.job_id);
        }

        if self.fsm.state() == JobState::Failed && self.options.rollback_on_failure {
            self.rollback().await;
        }

        remove_workspace(&self.workspace, self.options.keep_workspaces).await;

        JobOutcome {
            job_id: self.job_id.clone(),
            server_id: self.request.server_id().to_string(),
            state: self.fsm.state(),
            endpoint,
            error: self.fsm.error().map(str::to_string),
        }
    }

    /// Run both stages; returns the published endpoint on success
    async fn execute(&mut self) -> Option<(String, u16)> {
        let provisioned = self
            .provisioner
            .provision(&self.request, &self.workspace, &self.progress)
            .await
            .and_then(|result| self.check_addresses(result.addresses));

        let addresses = match provisioned {
            Ok(addresses) => addresses,
            Err(e) => {
                self.fail(JobEvent::ProvisionFailed(e.to_string()), e.kind(), &e.to_string())
                    .await;
                return None;
            }
        };

        self.transition(JobEvent::ProvisionSucceeded);
        self.progress.emit(ProgressEvent::provisioning(
            EventStatus::Success,
            format!(
                "Provisioned {} instance(s): {}",
                addresses.len(),
                addresses
            ),
        ));

        self.progress.emit(ProgressEvent::configuration(
            EventStatus::Started,
            format!("Configuring {} host(s)", addresses.len()),
        ));

        if let Err(e) = self
            .configurator
            .configure(&self.request, &addresses, &self.workspace, &self.progress)
            .await
        {
            self.fail(JobEvent::ConfigureFailed(e.to_string()), e.kind(), &e.to_string())
                .await;
            return None;
        }

        // Present by check_addresses
        let address = addresses
            .get(self.request.primary_instance().as_str())
            .unwrap_or_default()
            .to_string();
        let port = self.options.game_port;

        // The job only completes once the record carries the endpoint
        if let Err(e) = self
            .store
            .set_server_address(self.request.server_id(), &address, port)
            .await
        {
            let reason = format!("Could not publish {}:{}: {}", address, port, e);
            self.fail(JobEvent::ConfigureFailed(reason.clone()), "store_error", &reason)
                .await;
            return None;
        }
        self.transition(JobEvent::ConfigureSucceeded);

        info!(
            "Deployment {} complete: server {} is ready at {}:{}",
            self.job_id,
            self.request.server_id(),
            address,
            port
        );
        self.progress.emit(ProgressEvent::complete(address.clone(), port));
        Some((address, port))
    }

    /// Every requested instance must have an address before configuration
    fn check_addresses(&self, addresses: AddressMap) -> Result<AddressMap, PipelineError> {
        let missing: Vec<&str> = self
            .request
            .instances()
            .iter()
            .map(|name| name.as_str())
            .filter(|name| addresses.get(name).is_none())
            .collect();

        if missing.is_empty() {
            Ok(addresses)
        } else {
            Err(PipelineError::OutputParseError(format!(
                "No address for instance(s): {}",
                missing.join(", ")
            )))
        }
    }

    fn transition(&mut self, event: JobEvent) {
        if let Err(e) = self.fsm.process(event) {
            warn!("Deployment {}: {}", self.job_id, e);
        }
        self.guard.set_state(self.fsm.state());
    }

    async fn fail(&mut self, event: JobEvent, kind: &str, reason: &str) {
        self.transition(event);
        error!(
            "Deployment {} for server {} failed ({}): {}",
            self.job_id,
            self.request.server_id(),
            kind,
            reason
        );

        if let Err(e) = self
            .store
            .set_server_status(self.request.server_id(), ServerStatus::Error)
            .await
        {
            error!(
                "Failed to mark server {} as error: {}",
                self.request.server_id(),
                e
            );
        }

        self.progress
            .emit(ProgressEvent::error(format!("Deployment failed: {}", reason)));
    }

    async fn rollback(&self) {
        warn!(
            "Rolling back infrastructure of server {} after failed deployment {}",
            self.request.server_id(),
            self.job_id
        );
        match self.provisioner.destroy(&self.request, &self.workspace).await {
            Ok(()) => info!("Rollback of server {} complete", self.request.server_id()),
            Err(e) => error!("Rollback of server {} failed: {}", self.request.server_id(), e),
        }
    }
}

async fn remove_workspace(workspace: &Path, keep: bool) {
    if keep {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
        warn!("Failed to remove job workspace {}: {}", workspace.display(), e);
    }
}
