//! Deployment request models

use serde::{Deserialize, Serialize};

use deployer_api::{DeployBody, DestroyBody, GameBody, SizingBody};

use crate::errors::DeployerError;
use crate::models::server::Provider;

/// Maximum length of a logical instance name
pub const MAX_INSTANCE_NAME_LEN: usize = 63;

/// Maximum length of a server id
pub const MAX_SERVER_ID_LEN: usize = 128;

/// How the game servers are orchestrated on the provisioned hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationMode {
    Swarm,
    Kubernetes,
}

impl OrchestrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationMode::Swarm => "swarm",
            OrchestrationMode::Kubernetes => "kubernetes",
        }
    }
}

impl std::str::FromStr for OrchestrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "swarm" => Ok(OrchestrationMode::Swarm),
            "kubernetes" | "k8s" => Ok(OrchestrationMode::Kubernetes),
            _ => Err(format!("Invalid orchestration mode: {}", s)),
        }
    }
}

/// A logical instance name, safe to use as a host alias and a variable value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct InstanceName(String);

impl InstanceName {
    pub fn new(name: &str) -> Result<Self, DeployerError> {
        let mut chars = name.chars();
        let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if !starts_with_letter || !rest_ok || name.len() > MAX_INSTANCE_NAME_LEN {
            return Err(DeployerError::ValidationError(format!(
                "Invalid instance name '{}': must start with a letter and contain only letters, digits, '-' or '_' (max {} chars)",
                name, MAX_INSTANCE_NAME_LEN
            )));
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute resources to provision for a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topology {
    pub provider: Provider,
    pub orchestration: OrchestrationMode,
}

/// Cloud sizing parameters, all optional; the provisioning module has defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSizing {
    pub instance_size: Option<String>,
    pub region: Option<String>,
    pub disk_size_gb: Option<u32>,
}

impl From<&SizingBody> for ResourceSizing {
    fn from(body: &SizingBody) -> Self {
        Self {
            instance_size: body.instance_size.clone(),
            region: body.region.clone(),
            disk_size_gb: body.disk_size_gb,
        }
    }
}

/// Minecraft server distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Vanilla,
    Paper,
    Spigot,
    Forge,
    Fabric,
}

impl std::str::FromStr for ServerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vanilla" => Ok(ServerType::Vanilla),
            "paper" => Ok(ServerType::Paper),
            "spigot" => Ok(ServerType::Spigot),
            "forge" => Ok(ServerType::Forge),
            "fabric" => Ok(ServerType::Fabric),
            _ => Err(format!("Invalid server type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Survival,
    Creative,
    Adventure,
    Spectator,
}

impl std::str::FromStr for GameMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "survival" => Ok(GameMode::Survival),
            "creative" => Ok(GameMode::Creative),
            "adventure" => Ok(GameMode::Adventure),
            "spectator" => Ok(GameMode::Spectator),
            _ => Err(format!("Invalid game mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Peaceful,
    Easy,
    Normal,
    Hard,
}

impl std::str::FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "peaceful" => Ok(Difficulty::Peaceful),
            "easy" => Ok(Difficulty::Easy),
            "normal" => Ok(Difficulty::Normal),
            "hard" => Ok(Difficulty::Hard),
            _ => Err(format!("Invalid difficulty: {}", s)),
        }
    }
}

/// Game parameters. The pipeline only renders them for the configuration tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    pub name: String,
    pub server_type: ServerType,
    pub version: String,
    pub memory: String,
    pub game_mode: GameMode,
    pub difficulty: Difficulty,
    pub enable_bedrock: bool,
    pub timezone: String,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            name: "Server".to_string(),
            server_type: ServerType::Vanilla,
            version: "latest".to_string(),
            memory: "2G".to_string(),
            game_mode: GameMode::Survival,
            difficulty: Difficulty::Normal,
            enable_bedrock: false,
            timezone: "America/Sao_Paulo".to_string(),
        }
    }
}

impl TryFrom<&GameBody> for GameConfig {
    type Error = DeployerError;

    fn try_from(body: &GameBody) -> Result<Self, Self::Error> {
        let defaults = GameConfig::default();
        Ok(Self {
            name: body.name.clone().unwrap_or(defaults.name),
            server_type: parse_opt(body.server_type.as_deref(), defaults.server_type)?,
            version: body.version.clone().unwrap_or(defaults.version),
            memory: body.memory.clone().unwrap_or(defaults.memory),
            game_mode: parse_opt(body.game_mode.as_deref(), defaults.game_mode)?,
            difficulty: parse_opt(body.difficulty.as_deref(), defaults.difficulty)?,
            enable_bedrock: body.enable_bedrock,
            timezone: body.timezone.clone().unwrap_or(defaults.timezone),
        })
    }
}

fn parse_opt<T>(value: Option<&str>, default: T) -> Result<T, DeployerError>
where
    T: std::str::FromStr<Err = String>,
{
    match value {
        Some(v) => v.parse().map_err(DeployerError::ValidationError),
        None => Ok(default),
    }
}

/// One deployment request. Validated on construction and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRequest {
    server_id: String,
    topology: Topology,
    instances: Vec<InstanceName>,
    sizing: ResourceSizing,
    game: GameConfig,
}

impl DeploymentRequest {
    /// Create a swarm request with default sizing and game parameters
    pub fn new(
        server_id: &str,
        provider: Provider,
        instances: &[&str],
    ) -> Result<Self, DeployerError> {
        let instances = instances
            .iter()
            .map(|name| InstanceName::new(name))
            .collect::<Result<Vec<_>, _>>()?;

        Self::validated(
            server_id,
            Topology {
                provider,
                orchestration: OrchestrationMode::Swarm,
            },
            instances,
            ResourceSizing::default(),
            GameConfig::default(),
        )
    }

    /// Build a request from an API body
    pub fn from_body(server_id: &str, body: &DeployBody) -> Result<Self, DeployerError> {
        let provider: Provider = body.provider.parse().map_err(DeployerError::ValidationError)?;
        let orchestration: OrchestrationMode = body
            .orchestration
            .parse()
            .map_err(DeployerError::ValidationError)?;
        let instances = body
            .instances
            .iter()
            .map(|name| InstanceName::new(name))
            .collect::<Result<Vec<_>, _>>()?;

        Self::validated(
            server_id,
            Topology {
                provider,
                orchestration,
            },
            instances,
            ResourceSizing::from(&body.sizing),
            GameConfig::try_from(&body.game)?,
        )
    }

    /// Build the minimal request needed to tear a cluster down
    pub fn for_teardown(
        server_id: &str,
        provider: Provider,
        body: &DestroyBody,
    ) -> Result<Self, DeployerError> {
        let provider = match body.provider.as_deref() {
            Some(p) => p.parse().map_err(DeployerError::ValidationError)?,
            None => provider,
        };
        let orchestration: OrchestrationMode = body
            .orchestration
            .parse()
            .map_err(DeployerError::ValidationError)?;
        let instances = body
            .instances
            .iter()
            .map(|name| InstanceName::new(name))
            .collect::<Result<Vec<_>, _>>()?;

        Self::validated(
            server_id,
            Topology {
                provider,
                orchestration,
            },
            instances,
            ResourceSizing::default(),
            GameConfig::default(),
        )
    }

    fn validated(
        server_id: &str,
        topology: Topology,
        instances: Vec<InstanceName>,
        sizing: ResourceSizing,
        game: GameConfig,
    ) -> Result<Self, DeployerError> {
        validate_server_id(server_id)?;
        if !topology.provider.is_cloud() {
            return Err(DeployerError::ValidationError(format!(
                "Provider '{}' is not a cloud provider",
                topology.provider
            )));
        }
        if instances.is_empty() {
            return Err(DeployerError::ValidationError(
                "At least one instance name is required".to_string(),
            ));
        }
        for (i, name) in instances.iter().enumerate() {
            if instances[..i].contains(name) {
                return Err(DeployerError::ValidationError(format!(
                    "Duplicate instance name '{}'",
                    name
                )));
            }
        }

        Ok(Self {
            server_id: server_id.to_string(),
            topology,
            instances,
            sizing,
            game,
        })
    }

    pub fn with_orchestration(mut self, orchestration: OrchestrationMode) -> Self {
        self.topology.orchestration = orchestration;
        self
    }

    pub fn with_sizing(mut self, sizing: ResourceSizing) -> Self {
        self.sizing = sizing;
        self
    }

    pub fn with_game(mut self, game: GameConfig) -> Self {
        self.game = game;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn provider(&self) -> Provider {
        self.topology.provider
    }

    pub fn orchestration(&self) -> OrchestrationMode {
        self.topology.orchestration
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Requested instance names, in request order
    pub fn instances(&self) -> &[InstanceName] {
        &self.instances
    }

    /// The instance whose address is published on the server record
    pub fn primary_instance(&self) -> &InstanceName {
        &self.instances[0]
    }

    pub fn sizing(&self) -> &ResourceSizing {
        &self.sizing
    }

    pub fn game(&self) -> &GameConfig {
        &self.game
    }
}

/// A server id names a state directory and a URL path segment, so it must be
/// one plain segment of letters, digits, '-' or '_'
pub fn validate_server_id(server_id: &str) -> Result<(), DeployerError> {
    if server_id.is_empty() {
        return Err(DeployerError::ValidationError(
            "Server id must not be empty".to_string(),
        ));
    }
    let safe = server_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !safe || server_id.len() > MAX_SERVER_ID_LEN {
        return Err(DeployerError::ValidationError(format!(
            "Invalid server id '{}': only letters, digits, '-' or '_' are allowed (max {} chars)",
            server_id, MAX_SERVER_ID_LEN
        )));
    }
    Ok(())
}
