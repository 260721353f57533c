//! Progress event models

use serde::{Deserialize, Serialize};

use deployer_api::ProgressMessage;

/// Pipeline phase an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStage {
    Provisioning,
    Configuration,
    Complete,
    Error,
}

impl EventStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStage::Provisioning => "provisioning",
            EventStage::Configuration => "configuration",
            EventStage::Complete => "complete",
            EventStage::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStage::Complete | EventStage::Error)
    }

    /// Position in the stage order; `Error` may follow either stage
    pub(crate) fn rank(&self) -> u8 {
        match self {
            EventStage::Provisioning => 0,
            EventStage::Configuration => 1,
            EventStage::Complete | EventStage::Error => 2,
        }
    }
}

/// Step within a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventStatus {
    Started,
    Initializing,
    Planning,
    Applying,
    ReadingOutputs,
    Preparing,
    TestingConnectivity,
    Deploying,
    Success,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Started => "started",
            EventStatus::Initializing => "initializing",
            EventStatus::Planning => "planning",
            EventStatus::Applying => "applying",
            EventStatus::ReadingOutputs => "reading-outputs",
            EventStatus::Preparing => "preparing",
            EventStatus::TestingConnectivity => "testing-connectivity",
            EventStatus::Deploying => "deploying",
            EventStatus::Success => "success",
            EventStatus::Error => "error",
        }
    }
}

/// One progress event of a deployment job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: EventStage,
    pub status: EventStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ProgressEvent {
    pub fn new(stage: EventStage, status: EventStatus, message: impl Into<String>) -> Self {
        Self {
            stage,
            status,
            message: message.into(),
            server_ip: None,
            port: None,
        }
    }

    pub fn provisioning(status: EventStatus, message: impl Into<String>) -> Self {
        Self::new(EventStage::Provisioning, status, message)
    }

    pub fn configuration(status: EventStatus, message: impl Into<String>) -> Self {
        Self::new(EventStage::Configuration, status, message)
    }

    /// Terminal success event, the only one that carries an address
    pub fn complete(server_ip: impl Into<String>, port: u16) -> Self {
        let server_ip = server_ip.into();
        Self {
            stage: EventStage::Complete,
            status: EventStatus::Success,
            message: format!("Server is ready at {}:{}", server_ip, port),
            server_ip: Some(server_ip),
            port: Some(port),
        }
    }

    /// Terminal error event
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventStage::Error, EventStatus::Error, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

impl From<&ProgressEvent> for ProgressMessage {
    fn from(event: &ProgressEvent) -> Self {
        ProgressMessage {
            stage: event.stage.as_str().to_string(),
            status: event.status.as_str().to_string(),
            message: event.message.clone(),
            server_ip: event.server_ip.clone(),
            port: event.port,
        }
    }
}
