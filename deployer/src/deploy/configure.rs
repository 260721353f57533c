//! Configuration executor
//!
//! Renders the playbook variables and inventory for a freshly provisioned
//! cluster, waits until every host answers an Ansible ping, then runs the
//! orchestration playbook.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deploy::progress::ProgressSender;
use crate::deploy::provision::AddressMap;
use crate::deploy::stage::{StageCommand, StageOutput, StageRunner};
use crate::errors::PipelineError;
use crate::filesys::file::File;
use crate::models::progress::{EventStatus, ProgressEvent};
use crate::models::request::{DeploymentRequest, Difficulty, GameMode, OrchestrationMode, ServerType};
use crate::models::server::Provider;
use crate::storage::settings::{Settings, SshSettings};
use crate::utils::{calc_exp_backoff, sha256_hash, CooldownOptions};

pub const INVENTORY_FILE: &str = "inventory.ini";
pub const VARS_FILE: &str = "vars.json";

const REDACTED: &str = "[REDACTED]";

/// Configures the hosts of a provisioned cluster
#[async_trait]
pub trait Configurator: Send + Sync {
    async fn configure(
        &self,
        request: &DeploymentRequest,
        addresses: &AddressMap,
        workspace: &Path,
        progress: &ProgressSender,
    ) -> Result<(), PipelineError>;
}

/// Credentials rendered into the playbook variables
#[derive(Debug)]
pub struct ConfigSecrets {
    pub rcon_password: SecretString,
    pub grafana_password: SecretString,
}

impl ConfigSecrets {
    pub fn new(rcon_password: &str, grafana_password: &str) -> Self {
        Self {
            rcon_password: SecretString::from(rcon_password.to_string()),
            grafana_password: SecretString::from(grafana_password.to_string()),
        }
    }

    fn values(&self) -> [&str; 2] {
        [
            self.rcon_password.expose_secret(),
            self.grafana_password.expose_secret(),
        ]
    }
}

/// Ansible configurator options
#[derive(Debug)]
pub struct ConfigureOptions {
    pub ansible_bin: String,
    pub ansible_playbook_bin: String,
    /// Directory holding the playbooks; the playbook runs from here
    pub ansible_dir: PathBuf,
    pub playbook_timeout: Duration,
    /// Timeout of a single ping attempt
    pub probe_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: CooldownOptions,
    /// Upper bound on the whole reachability phase
    pub max_total_wait: Duration,
    pub ssh: SshSettings,
    pub secrets: ConfigSecrets,
    pub remove_vars_file: bool,
}

impl ConfigureOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let reach = &settings.reachability;
        Self {
            ansible_bin: settings.tools.ansible_bin.clone(),
            ansible_playbook_bin: settings.tools.ansible_playbook_bin.clone(),
            ansible_dir: PathBuf::from(&settings.tools.ansible_dir),
            playbook_timeout: Duration::from_secs(settings.timeouts.playbook_secs),
            probe_timeout: Duration::from_secs(settings.timeouts.probe_secs),
            max_attempts: reach.max_attempts.max(1),
            backoff: CooldownOptions {
                base_delay: Duration::from_secs(reach.base_delay_secs),
                max_delay: Duration::from_secs(reach.max_delay_secs),
                multiplier: 2.0,
            },
            max_total_wait: Duration::from_secs(reach.max_total_wait_secs),
            ssh: settings.ssh.clone(),
            secrets: ConfigSecrets::new(
                &settings.credentials.rcon_password,
                &settings.credentials.grafana_password,
            ),
            remove_vars_file: settings.pipeline.remove_vars_file,
        }
    }
}

impl Default for ConfigureOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Playbook for an orchestration mode, relative to the playbook directory
pub fn playbook_for(orchestration: OrchestrationMode) -> &'static str {
    match orchestration {
        OrchestrationMode::Swarm => "swarm_setup.yml",
        OrchestrationMode::Kubernetes => "kubernetes_setup.yml",
    }
}

#[derive(Serialize)]
struct PlaybookVars<'a> {
    minecraft_java_version: &'a str,
    minecraft_java_memory: &'a str,
    minecraft_java_server_type: ServerType,
    minecraft_java_gamemode: GameMode,
    minecraft_java_difficulty: Difficulty,
    minecraft_java_motd: String,
    minecraft_java_allow_nether: bool,
    minecraft_java_enable_command_block: bool,
    minecraft_java_spawn_protection: u32,
    minecraft_java_view_distance: u32,

    minecraft_bedrock_enabled: bool,
    minecraft_bedrock_version: &'a str,
    minecraft_bedrock_memory: &'a str,
    minecraft_bedrock_gamemode: GameMode,
    minecraft_bedrock_difficulty: Difficulty,
    minecraft_bedrock_server_name: String,
    minecraft_bedrock_allow_cheats: bool,

    rcon_password: &'a str,
    grafana_password: &'a str,
    timezone: &'a str,

    server_names: Vec<&'a str>,
    single_node_swarm: bool,
    orchestration: &'a str,
}

/// Render the playbook variables file.
///
/// Pure and deterministic: the same inputs always give byte-identical output.
/// The result is JSON, which `ansible-playbook -e @file` reads as YAML.
pub fn render_parameters(
    request: &DeploymentRequest,
    addresses: &AddressMap,
    secrets: &ConfigSecrets,
) -> Result<String, PipelineError> {
    let game = request.game();
    let vars = PlaybookVars {
        minecraft_java_version: &game.version,
        minecraft_java_memory: &game.memory,
        minecraft_java_server_type: game.server_type,
        minecraft_java_gamemode: game.game_mode,
        minecraft_java_difficulty: game.difficulty,
        minecraft_java_motd: format!("Mineclifford {}", game.name),
        minecraft_java_allow_nether: true,
        minecraft_java_enable_command_block: true,
        minecraft_java_spawn_protection: 0,
        minecraft_java_view_distance: 10,

        minecraft_bedrock_enabled: game.enable_bedrock,
        minecraft_bedrock_version: &game.version,
        minecraft_bedrock_memory: "1G",
        minecraft_bedrock_gamemode: game.game_mode,
        minecraft_bedrock_difficulty: game.difficulty,
        minecraft_bedrock_server_name: format!("Mineclifford {}", game.name),
        minecraft_bedrock_allow_cheats: false,

        rcon_password: secrets.rcon_password.expose_secret(),
        grafana_password: secrets.grafana_password.expose_secret(),
        timezone: &game.timezone,

        server_names: addresses.names(),
        single_node_swarm: addresses.len() == 1,
        orchestration: request.orchestration().as_str(),
    };

    serde_json::to_string_pretty(&vars)
        .map(|mut body| {
            body.push('\n');
            body
        })
        .map_err(|e| PipelineError::Workspace(format!("Cannot render playbook variables: {}", e)))
}

/// Render an INI inventory with one host per instance
pub fn render_inventory(addresses: &AddressMap, provider: Provider, ssh: &SshSettings) -> String {
    let mut inventory = String::from("[minecraft_servers]\n");
    for (name, address) in addresses.iter() {
        inventory.push_str(&format!("{} ansible_host={}\n", name, address));
    }

    let user = match provider {
        Provider::Azure => ssh.azure_user.as_str(),
        Provider::Aws | Provider::Local => ssh.aws_user.as_str(),
    };

    inventory.push_str("\n[all:vars]\n");
    inventory.push_str(&format!("ansible_user={}\n", user));
    inventory.push_str("ansible_python_interpreter=/usr/bin/python3\n");
    if let Some(key) = &ssh.private_key_path {
        inventory.push_str(&format!("ansible_ssh_private_key_file={}\n", key));
    }
    inventory
}

/// Hosts that answered a one-line (`-o`) ping run.
///
/// Lines look like `instance1 | SUCCESS => {...}` or
/// `instance1 | UNREACHABLE! => {...}`.
pub fn parse_ping_output(lines: &[String]) -> Vec<String> {
    let mut reachable = Vec::new();
    for line in lines {
        let Some((host, rest)) = line.split_once(" | ") else {
            continue;
        };
        let host = host.trim();
        if rest.trim_start().starts_with("SUCCESS") && !reachable.iter().any(|h| h == host) {
            reachable.push(host.to_string());
        }
    }
    reachable
}

/// Replaces known secret values in tool output
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<'a>(secrets: impl IntoIterator<Item = &'a str>) -> Self {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        // Longest first so a secret containing another is fully masked
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    pub fn redact_error(&self, err: PipelineError) -> PipelineError {
        match err {
            PipelineError::ExecutionFailed {
                step,
                exit_code,
                tail,
            } => PipelineError::ExecutionFailed {
                step,
                exit_code,
                tail: self.redact(&tail),
            },
            other => other,
        }
    }
}

/// Configurator backed by the Ansible CLI
pub struct AnsibleConfigurator {
    runner: Arc<dyn StageRunner>,
    options: ConfigureOptions,
    redactor: Redactor,
}

impl AnsibleConfigurator {
    pub fn new(runner: Arc<dyn StageRunner>, options: ConfigureOptions) -> Self {
        let redactor = Redactor::new(options.secrets.values());
        Self {
            runner,
            options,
            redactor,
        }
    }

    fn command(&self, label: &str, program: &str, cwd: &Path, timeout: Duration) -> StageCommand {
        StageCommand::new(label, program, cwd, timeout)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_NOCOLOR", "1")
            .env("PYTHONIOENCODING", "utf-8")
    }

    async fn write_inputs(
        &self,
        request: &DeploymentRequest,
        addresses: &AddressMap,
        workspace: &Path,
    ) -> Result<(File, File), PipelineError> {
        let inventory = File::new(workspace.join(INVENTORY_FILE));
        inventory
            .write_string(&render_inventory(addresses, request.provider(), &self.options.ssh))
            .await
            .map_err(|e| PipelineError::Workspace(format!("Cannot write inventory: {}", e)))?;

        let rendered = render_parameters(request, addresses, &self.options.secrets)?;
        let vars = File::new(workspace.join(VARS_FILE));
        vars.write_private(&rendered)
            .await
            .map_err(|e| PipelineError::Workspace(format!("Cannot write playbook variables: {}", e)))?;

        info!(
            "Rendered playbook variables for {} (sha256 {})",
            request.server_id(),
            sha256_hash(rendered.as_bytes())
        );
        Ok((inventory, vars))
    }

    /// One ping run against `hosts`; never fails on unreachable hosts
    async fn probe(
        &self,
        inventory: &Path,
        workspace: &Path,
        hosts: &[String],
        limit: bool,
        progress: &ProgressSender,
    ) -> Result<StageOutput, PipelineError> {
        let mut command = self
            .command(
                "ansible ping",
                &self.options.ansible_bin,
                workspace,
                self.options.probe_timeout,
            )
            .arg("-i")
            .arg(inventory.display().to_string())
            .args(["all", "-m", "ping", "-o"]);
        if limit {
            command = command.arg("--limit").arg(hosts.join(","));
        }

        let mut process = self.runner.spawn(command).await?;
        while let Some(line) = process.next_line().await? {
            if !line.trim().is_empty() {
                progress.emit(ProgressEvent::configuration(
                    EventStatus::TestingConnectivity,
                    self.redactor.redact(&line),
                ));
            }
        }
        process.wait().await
    }

    /// Ping until every host answers, retrying only the silent ones
    async fn wait_for_hosts(
        &self,
        inventory: &Path,
        workspace: &Path,
        addresses: &AddressMap,
        progress: &ProgressSender,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let mut pending: Vec<String> = addresses.names().into_iter().map(String::from).collect();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            progress.emit(ProgressEvent::configuration(
                EventStatus::TestingConnectivity,
                format!(
                    "Testing connectivity to {} (attempt {}/{})",
                    pending.join(", "),
                    attempt,
                    self.options.max_attempts
                ),
            ));

            match self
                .probe(inventory, workspace, &pending, attempt > 1, progress)
                .await
            {
                Ok(output) => {
                    let reachable = parse_ping_output(&output.output);
                    pending.retain(|host| !reachable.contains(host));
                }
                Err(PipelineError::ExecutionTimeout { .. }) => {
                    warn!("Connectivity check attempt {} timed out", attempt);
                }
                Err(e) => return Err(self.redactor.redact_error(e)),
            }

            if pending.is_empty() {
                debug!("All hosts reachable after {} attempt(s)", attempt);
                return Ok(());
            }
            if attempt >= self.options.max_attempts {
                break;
            }

            let delay = calc_exp_backoff(&self.options.backoff, attempt - 1);
            if started.elapsed() + delay > self.options.max_total_wait {
                warn!("Connectivity wait budget exhausted after {} attempt(s)", attempt);
                break;
            }

            warn!(
                "Hosts not reachable yet: {}. Retrying in {:?}",
                pending.join(", "),
                delay
            );
            tokio::time::sleep(delay).await;
        }

        Err(PipelineError::UnreachableHosts { hosts: pending })
    }

    async fn run_playbook(
        &self,
        request: &DeploymentRequest,
        inventory: &Path,
        vars: &Path,
        progress: &ProgressSender,
    ) -> Result<(), PipelineError> {
        let playbook = self.options.ansible_dir.join(playbook_for(request.orchestration()));
        let command = self
            .command(
                "ansible-playbook",
                &self.options.ansible_playbook_bin,
                &self.options.ansible_dir,
                self.options.playbook_timeout,
            )
            .arg("-i")
            .arg(inventory.display().to_string())
            .arg(playbook.display().to_string())
            .arg("-e")
            .arg(format!("@{}", vars.display()));

        let mut process = self.runner.spawn(command).await?;
        while let Some(line) = process.next_line().await? {
            if !line.trim().is_empty() {
                progress.emit(ProgressEvent::configuration(
                    EventStatus::Deploying,
                    self.redactor.redact(&line),
                ));
            }
        }
        process.finish().await?;
        Ok(())
    }
}

#[async_trait]
impl Configurator for AnsibleConfigurator {
    async fn configure(
        &self,
        request: &DeploymentRequest,
        addresses: &AddressMap,
        workspace: &Path,
        progress: &ProgressSender,
    ) -> Result<(), PipelineError> {
        progress.emit(ProgressEvent::configuration(
            EventStatus::Preparing,
            "Preparing Ansible variables...",
        ));
        let (inventory, vars) = self.write_inputs(request, addresses, workspace).await?;

        let result = async {
            self.wait_for_hosts(inventory.path(), workspace, addresses, progress)
                .await?;

            progress.emit(ProgressEvent::configuration(
                EventStatus::Deploying,
                "Executing Ansible playbook...",
            ));
            self.run_playbook(request, inventory.path(), vars.path(), progress)
                .await
        }
        .await
        .map_err(|e| self.redactor.redact_error(e));

        if self.options.remove_vars_file {
            if let Err(e) = vars.delete().await {
                warn!("Failed to remove playbook variables file: {}", e);
            }
        }

        if result.is_ok() {
            info!("Configured {} host(s) for {}", addresses.len(), request.server_id());
        }
        result
    }
}
