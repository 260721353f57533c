//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Deployer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write logs to daily files under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Local HTTP server
    #[serde(default)]
    pub server: ServerSettings,

    /// Server record storage
    #[serde(default)]
    pub store: StoreSettings,

    /// External tool locations
    #[serde(default)]
    pub tools: ToolSettings,

    /// Per-step timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Connectivity probe retry policy
    #[serde(default)]
    pub reachability: ReachabilitySettings,

    /// SSH access to provisioned hosts
    #[serde(default)]
    pub ssh: SshSettings,

    /// Service credentials rendered into the configuration variables
    #[serde(default)]
    pub credentials: CredentialSettings,

    /// Deployment policy
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

fn default_true() -> bool {
    true
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Which record store backs the deployer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// `servers.json` under the base directory
    #[default]
    File,
    /// An external record API
    Http,
}

/// Record storage settings
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Base URL of the record API (http backend only)
    #[serde(default = "default_store_url")]
    pub base_url: String,

    /// Bearer token for the record API
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
}

fn default_store_url() -> String {
    "http://localhost:8080/api".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            base_url: default_store_url(),
            api_token: None,
        }
    }
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("backend", &self.backend)
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// External tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_terraform_bin")]
    pub terraform_bin: String,

    #[serde(default = "default_ansible_bin")]
    pub ansible_bin: String,

    #[serde(default = "default_ansible_playbook_bin")]
    pub ansible_playbook_bin: String,

    /// Directory containing one Terraform module per provider
    #[serde(default = "default_terraform_root")]
    pub terraform_root: String,

    /// Directory containing the Ansible playbooks
    #[serde(default = "default_ansible_dir")]
    pub ansible_dir: String,
}

fn default_terraform_bin() -> String {
    "terraform".to_string()
}

fn default_ansible_bin() -> String {
    "ansible".to_string()
}

fn default_ansible_playbook_bin() -> String {
    "ansible-playbook".to_string()
}

fn default_terraform_root() -> String {
    "terraform".to_string()
}

fn default_ansible_dir() -> String {
    "deployment/ansible".to_string()
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            terraform_bin: default_terraform_bin(),
            ansible_bin: default_ansible_bin(),
            ansible_playbook_bin: default_ansible_playbook_bin(),
            terraform_root: default_terraform_root(),
            ansible_dir: default_ansible_dir(),
        }
    }
}

/// Step timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_init_secs")]
    pub init_secs: u64,

    #[serde(default = "default_plan_secs")]
    pub plan_secs: u64,

    #[serde(default = "default_apply_secs")]
    pub apply_secs: u64,

    #[serde(default = "default_output_secs")]
    pub output_secs: u64,

    #[serde(default = "default_destroy_secs")]
    pub destroy_secs: u64,

    #[serde(default = "default_playbook_secs")]
    pub playbook_secs: u64,

    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
}

fn default_init_secs() -> u64 {
    600
}

fn default_plan_secs() -> u64 {
    600
}

fn default_apply_secs() -> u64 {
    1800
}

fn default_output_secs() -> u64 {
    120
}

fn default_destroy_secs() -> u64 {
    1800
}

fn default_playbook_secs() -> u64 {
    1800
}

fn default_probe_secs() -> u64 {
    30
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            init_secs: default_init_secs(),
            plan_secs: default_plan_secs(),
            apply_secs: default_apply_secs(),
            output_secs: default_output_secs(),
            destroy_secs: default_destroy_secs(),
            playbook_secs: default_playbook_secs(),
            probe_secs: default_probe_secs(),
        }
    }
}

/// Connectivity probe retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilitySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Upper bound on the whole probe phase, sleeps included
    #[serde(default = "default_max_total_wait_secs")]
    pub max_total_wait_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_max_total_wait_secs() -> u64 {
    300
}

impl Default for ReachabilitySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_total_wait_secs: default_max_total_wait_secs(),
        }
    }
}

/// SSH settings for the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_aws_user")]
    pub aws_user: String,

    #[serde(default = "default_azure_user")]
    pub azure_user: String,

    #[serde(default)]
    pub private_key_path: Option<String>,
}

fn default_aws_user() -> String {
    "ubuntu".to_string()
}

fn default_azure_user() -> String {
    "azureuser".to_string()
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            aws_user: default_aws_user(),
            azure_user: default_azure_user(),
            private_key_path: None,
        }
    }
}

/// Credentials for services installed on the hosts
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialSettings {
    #[serde(default = "default_rcon_password")]
    pub rcon_password: String,

    #[serde(default = "default_grafana_password")]
    pub grafana_password: String,
}

fn default_rcon_password() -> String {
    "minecraft".to_string()
}

fn default_grafana_password() -> String {
    "admin".to_string()
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            rcon_password: default_rcon_password(),
            grafana_password: default_grafana_password(),
        }
    }
}

impl std::fmt::Debug for CredentialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSettings")
            .field("rcon_password", &"[REDACTED]")
            .field("grafana_password", &"[REDACTED]")
            .finish()
    }
}

/// Deployment policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Port published on the server record after a successful deployment
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Tear the infrastructure down when a deployment fails
    #[serde(default)]
    pub rollback_on_failure: bool,

    /// Keep job workspaces after the job finishes
    #[serde(default)]
    pub keep_workspaces: bool,

    /// Remove the rendered variables file once the playbook has run
    #[serde(default = "default_true")]
    pub remove_vars_file: bool,
}

fn default_game_port() -> u16 {
    25565
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            game_port: default_game_port(),
            rollback_on_failure: false,
            keep_workspaces: false,
            remove_vars_file: true,
        }
    }
}
