//! Finite State Machine for deployment jobs

use serde::{Deserialize, Serialize};

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Infrastructure is being created
    Provisioning,

    /// Hosts are being configured
    Configuring,

    /// Server is up and published on the record
    Complete,

    /// A stage failed
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Provisioning => "provisioning",
            JobState::Configuring => "configuring",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }

    /// Whether the job still owns its server id
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Provisioning | JobState::Configuring)
    }
}

/// Job event
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Provisioning produced an address for every instance
    ProvisionSucceeded,

    /// Provisioning failed
    ProvisionFailed(String),

    /// The playbook ran successfully
    ConfigureSucceeded,

    /// Configuration failed
    ConfigureFailed(String),
}

/// Job FSM. A job starts in `Provisioning` once its request is accepted.
#[derive(Debug, Clone)]
pub struct JobFsm {
    state: JobState,
    error: Option<String>,
}

impl JobFsm {
    /// Create a new FSM in provisioning state
    pub fn new() -> Self {
        Self {
            state: JobState::Provisioning,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Get the failure reason if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        !self.state.is_active()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: JobEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            // From Provisioning
            (JobState::Provisioning, JobEvent::ProvisionSucceeded) => JobState::Configuring,
            (JobState::Provisioning, JobEvent::ProvisionFailed(err)) => {
                self.error = Some(err.clone());
                JobState::Failed
            }

            // From Configuring
            (JobState::Configuring, JobEvent::ConfigureSucceeded) => JobState::Complete,
            (JobState::Configuring, JobEvent::ConfigureFailed(err)) => {
                self.error = Some(err.clone());
                JobState::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for JobFsm {
    fn default() -> Self {
        Self::new()
    }
}
