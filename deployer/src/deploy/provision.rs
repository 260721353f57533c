//! Provisioning executor
//!
//! Drives Terraform through init, plan, apply and output for one job, and
//! extracts one public address per requested instance from the outputs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::deploy::progress::ProgressSender;
use crate::deploy::stage::{StageCommand, StageOutput, StageRunner};
use crate::errors::PipelineError;
use crate::models::progress::{EventStatus, ProgressEvent};
use crate::models::request::{DeploymentRequest, InstanceName, OrchestrationMode, Topology};
use crate::models::server::Provider;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Plan file written by `plan` and consumed by `apply`, inside the job workspace
pub const PLAN_FILE: &str = "tfplan";

/// State file name under `<state_dir>/<server_id>/`
pub const STATE_FILE: &str = "terraform.tfstate";

/// Directory inside the job workspace holding the job's copy of the module
pub const MODULE_DIR: &str = "module";

/// Instance name to public address, in request order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    entries: Vec<(String, String)>,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the address of `name`
    pub fn insert(&mut self, name: impl Into<String>, address: impl Into<String>) {
        let name = name.into();
        let address = address.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = address,
            None => self.entries.push((name, address)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), a.as_str()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }
}

impl std::fmt::Display for AddressMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (name, address)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", name, address)?;
        }
        Ok(())
    }
}

/// Outcome of a successful provisioning run
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionResult {
    pub addresses: AddressMap,
    /// Raw `terraform output -json` document
    pub outputs: Value,
}

/// Creates and tears down the infrastructure of a cluster
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the infrastructure and return one address per requested instance
    async fn provision(
        &self,
        request: &DeploymentRequest,
        workspace: &Path,
        progress: &ProgressSender,
    ) -> Result<ProvisionResult, PipelineError>;

    /// Tear down everything a previous `provision` created for the request's server
    async fn destroy(
        &self,
        request: &DeploymentRequest,
        workspace: &Path,
    ) -> Result<(), PipelineError>;
}

/// Terraform module and naming conventions for one provider/orchestration pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionTarget {
    pub module_dir: PathBuf,
    /// Output holding the `{instance name: address}` map
    pub output_key: &'static str,
    pub size_var: &'static str,
    pub region_var: &'static str,
    pub disk_var: &'static str,
}

impl ProvisionTarget {
    pub fn resolve(terraform_root: &Path, topology: Topology) -> Result<Self, PipelineError> {
        let (provider_dir, output_key, size_var, region_var, disk_var) = match topology.provider {
            Provider::Aws => ("aws", "instance_public_ips", "instance_type", "region", "root_volume_size"),
            Provider::Azure => ("azure", "vm_public_ips", "vm_size", "location", "os_disk_size_gb"),
            Provider::Local => {
                return Err(PipelineError::Workspace(format!(
                    "No Terraform module for provider {}",
                    topology.provider
                )))
            }
        };

        let mut module_dir = terraform_root.join(provider_dir);
        if topology.orchestration == OrchestrationMode::Kubernetes {
            module_dir = module_dir.join("kubernetes");
        }

        Ok(Self {
            module_dir,
            output_key,
            size_var,
            region_var,
            disk_var,
        })
    }
}

/// Terraform provisioner options
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub terraform_bin: String,
    /// Directory holding one module per provider
    pub terraform_root: PathBuf,
    /// Directory holding one state directory per server
    pub state_dir: PathBuf,
    pub init_timeout: Duration,
    pub plan_timeout: Duration,
    pub apply_timeout: Duration,
    pub output_timeout: Duration,
    pub destroy_timeout: Duration,
}

impl ProvisionOptions {
    pub fn from_settings(settings: &Settings, layout: &StorageLayout) -> Self {
        let timeouts = &settings.timeouts;
        Self {
            terraform_bin: settings.tools.terraform_bin.clone(),
            terraform_root: PathBuf::from(&settings.tools.terraform_root),
            state_dir: layout.state_dir().path().to_path_buf(),
            init_timeout: Duration::from_secs(timeouts.init_secs),
            plan_timeout: Duration::from_secs(timeouts.plan_secs),
            apply_timeout: Duration::from_secs(timeouts.apply_secs),
            output_timeout: Duration::from_secs(timeouts.output_secs),
            destroy_timeout: Duration::from_secs(timeouts.destroy_secs),
        }
    }
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), &StorageLayout::default())
    }
}

/// Provisioner backed by the Terraform CLI
pub struct TerraformProvisioner {
    runner: Arc<dyn StageRunner>,
    options: ProvisionOptions,
}

impl TerraformProvisioner {
    pub fn new(runner: Arc<dyn StageRunner>, options: ProvisionOptions) -> Self {
        Self { runner, options }
    }

    /// State file of one server, shared by its deploy and destroy runs
    pub fn state_file(&self, server_id: &str) -> PathBuf {
        self.options.state_dir.join(server_id).join(STATE_FILE)
    }

    /// Commands run in the job's own copy of the module, so provider locks and
    /// other files Terraform writes next to the configuration stay per job
    fn command(&self, label: &str, workspace: &Path, timeout: Duration) -> StageCommand {
        StageCommand::new(
            label,
            &self.options.terraform_bin,
            workspace.join(MODULE_DIR),
            timeout,
        )
        .env("TF_IN_AUTOMATION", "1")
        .env("TF_DATA_DIR", workspace.join(".terraform").display().to_string())
    }

    /// Copy the provider module into the job workspace
    async fn stage_module(
        &self,
        target: &ProvisionTarget,
        workspace: &Path,
    ) -> Result<(), PipelineError> {
        let source = &target.module_dir;
        let is_dir = tokio::fs::metadata(source)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(PipelineError::Workspace(format!(
                "Terraform module {} not found",
                source.display()
            )));
        }

        copy_module(source, &workspace.join(MODULE_DIR))
            .await
            .map_err(|e| {
                PipelineError::Workspace(format!(
                    "Cannot copy Terraform module {} into {}: {}",
                    source.display(),
                    workspace.display(),
                    e
                ))
            })
    }

    async fn prepare_state_dir(&self, server_id: &str) -> Result<PathBuf, PipelineError> {
        let state = self.state_file(server_id);
        if let Some(parent) = state.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::Workspace(format!(
                    "Cannot create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(state)
    }

    async fn run_streamed(
        &self,
        command: StageCommand,
        status: EventStatus,
        progress: &ProgressSender,
    ) -> Result<StageOutput, PipelineError> {
        let mut process = self.runner.spawn(command).await?;
        while let Some(line) = process.next_line().await? {
            if !line.trim().is_empty() {
                progress.emit(ProgressEvent::provisioning(status, line));
            }
        }
        process.finish().await
    }

    fn init_command(&self, workspace: &Path) -> StageCommand {
        self.command("terraform init", workspace, self.options.init_timeout)
            .args(["init", "-no-color", "-input=false"])
    }
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn provision(
        &self,
        request: &DeploymentRequest,
        workspace: &Path,
        progress: &ProgressSender,
    ) -> Result<ProvisionResult, PipelineError> {
        let target = ProvisionTarget::resolve(&self.options.terraform_root, request.topology())?;
        let state = self.prepare_state_dir(request.server_id()).await?;
        let plan_file = workspace.join(PLAN_FILE);
        self.stage_module(&target, workspace).await?;

        info!(
            "Provisioning {} on {} from {}",
            request.server_id(),
            request.provider(),
            target.module_dir.display()
        );

        progress.emit(ProgressEvent::provisioning(
            EventStatus::Initializing,
            "Initializing Terraform...",
        ));
        self.run_streamed(
            self.init_command(workspace),
            EventStatus::Initializing,
            progress,
        )
        .await?;

        progress.emit(ProgressEvent::provisioning(
            EventStatus::Planning,
            "Creating execution plan...",
        ));
        let plan = self
            .command("terraform plan", workspace, self.options.plan_timeout)
            .args(["plan", "-no-color", "-input=false"])
            .arg(format!("-out={}", plan_file.display()))
            .arg(format!("-state={}", state.display()))
            .args(plan_variables(request, &target));
        self.run_streamed(plan, EventStatus::Planning, progress).await?;

        progress.emit(ProgressEvent::provisioning(
            EventStatus::Applying,
            "Applying infrastructure changes...",
        ));
        let apply = self
            .command("terraform apply", workspace, self.options.apply_timeout)
            .args(["apply", "-no-color", "-input=false", "-auto-approve"])
            .arg(format!("-state={}", state.display()))
            .arg(format!("-state-out={}", state.display()))
            .arg(plan_file.display().to_string());
        self.run_streamed(apply, EventStatus::Applying, progress).await?;

        progress.emit(ProgressEvent::provisioning(
            EventStatus::ReadingOutputs,
            "Reading provisioning outputs...",
        ));
        let output = self
            .command("terraform output", workspace, self.options.output_timeout)
            .args(["output", "-no-color", "-json"])
            .arg(format!("-state={}", state.display()));
        let output = self.runner.spawn(output).await?.finish().await?;

        // Warnings go to stderr and must not reach the JSON parser
        let raw = output.stdout_text();
        let addresses = extract_addresses(&raw, target.output_key, request.instances())?;
        let outputs = parse_outputs(&raw)?;

        debug!("Provisioned {}: {}", request.server_id(), addresses);
        Ok(ProvisionResult { addresses, outputs })
    }

    async fn destroy(
        &self,
        request: &DeploymentRequest,
        workspace: &Path,
    ) -> Result<(), PipelineError> {
        let target = ProvisionTarget::resolve(&self.options.terraform_root, request.topology())?;
        let state = self.prepare_state_dir(request.server_id()).await?;
        self.stage_module(&target, workspace).await?;

        info!(
            "Destroying infrastructure of {} on {}",
            request.server_id(),
            request.provider()
        );

        self.runner
            .spawn(self.init_command(workspace))
            .await?
            .finish()
            .await?;

        let destroy = self
            .command("terraform destroy", workspace, self.options.destroy_timeout)
            .args(["destroy", "-no-color", "-input=false", "-auto-approve"])
            .arg(format!("-state={}", state.display()))
            .args(["-var".to_string(), server_names_var(request)]);

        let mut process = self.runner.spawn(destroy).await?;
        while let Some(line) = process.next_line().await? {
            debug!("[terraform destroy] {}", line);
        }
        process.finish().await?;

        info!("Destroyed infrastructure of {}", request.server_id());
        Ok(())
    }
}

fn server_names_var(request: &DeploymentRequest) -> String {
    let names: Vec<&str> = request.instances().iter().map(|n| n.as_str()).collect();
    // Names are validated to [A-Za-z0-9_-], so this cannot fail
    let list = serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string());
    format!("server_names={}", list)
}

/// `-var` arguments for plan: instance names, then whichever sizing values are set
fn plan_variables(request: &DeploymentRequest, target: &ProvisionTarget) -> Vec<String> {
    let mut args = vec!["-var".to_string(), server_names_var(request)];
    let sizing = request.sizing();
    if let Some(size) = &sizing.instance_size {
        args.push("-var".to_string());
        args.push(format!("{}={}", target.size_var, size));
    }
    if let Some(region) = &sizing.region {
        args.push("-var".to_string());
        args.push(format!("{}={}", target.region_var, region));
    }
    if let Some(disk) = sizing.disk_size_gb {
        args.push("-var".to_string());
        args.push(format!("{}={}", target.disk_var, disk));
    }
    args
}

/// Copy a module tree, leaving out Terraform's local data and state files
async fn copy_module(source: &Path, dest: &Path) -> std::io::Result<()> {
    let mut pending = vec![(source.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if is_local_terraform_file(&name.to_string_lossy()) {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), to.join(&name)));
            } else {
                tokio::fs::copy(entry.path(), to.join(&name)).await?;
            }
        }
    }
    Ok(())
}

fn is_local_terraform_file(name: &str) -> bool {
    name == ".terraform"
        || name == ".terraform.lock.hcl"
        || name.ends_with(".tfstate")
        || name.ends_with(".tfstate.backup")
}

/// Parse the outputs document, which must be a single JSON value
fn parse_outputs(raw: &str) -> Result<Value, PipelineError> {
    serde_json::from_str(raw).map_err(|e| {
        PipelineError::OutputParseError(format!("Provisioning outputs are not valid JSON: {}", e))
    })
}

/// Extract one address per requested instance from `terraform output -json`.
///
/// The document must hold `{output_key: {"value": {name: address}}}`. Every
/// requested name must be present with a non-empty string address; extra
/// names are ignored.
pub fn extract_addresses(
    raw: &str,
    output_key: &str,
    instances: &[InstanceName],
) -> Result<AddressMap, PipelineError> {
    let outputs = parse_outputs(raw)?;

    let value = outputs
        .get(output_key)
        .ok_or_else(|| {
            PipelineError::OutputParseError(format!(
                "Output '{}' missing from provisioning outputs",
                output_key
            ))
        })?
        .get("value")
        .ok_or_else(|| {
            PipelineError::OutputParseError(format!("Output '{}' has no value", output_key))
        })?;

    let map = value.as_object().ok_or_else(|| {
        PipelineError::OutputParseError(format!(
            "Output '{}' is not a map of instance names to addresses",
            output_key
        ))
    })?;

    let mut addresses = AddressMap::new();
    for name in instances {
        let address = map
            .get(name.as_str())
            .ok_or_else(|| {
                PipelineError::OutputParseError(format!(
                    "Instance '{}' missing from output '{}'",
                    name, output_key
                ))
            })?
            .as_str()
            .map(str::trim)
            .filter(|a| !a.is_empty() && !a.contains(char::is_whitespace))
            .ok_or_else(|| {
                PipelineError::OutputParseError(format!(
                    "Instance '{}' has no usable address in output '{}'",
                    name, output_key
                ))
            })?;
        addresses.insert(name.as_str(), address);
    }

    Ok(addresses)
}
