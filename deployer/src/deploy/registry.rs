//! Active job registry
//!
//! Holds at most one in-flight job per server id. A reservation is released
//! when its `JobGuard` is dropped, so a panicking job task cannot leave the
//! server locked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::deploy::fsm::JobState;
use crate::errors::DeployerError;

/// Snapshot of one active job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveJob {
    pub job_id: String,
    pub server_id: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, ActiveJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `server_id` for `job_id`. Fails if the server already has a job.
    pub fn reserve(&self, server_id: &str, job_id: &str) -> Result<JobGuard, DeployerError> {
        let mut jobs = self.lock();
        if let Some(existing) = jobs.get(server_id) {
            return Err(DeployerError::JobAlreadyActive(format!(
                "Server {} already has deployment {} in progress",
                server_id, existing.job_id
            )));
        }

        jobs.insert(
            server_id.to_string(),
            ActiveJob {
                job_id: job_id.to_string(),
                server_id: server_id.to_string(),
                state: JobState::Provisioning,
                started_at: Utc::now(),
            },
        );

        Ok(JobGuard {
            registry: self.clone(),
            server_id: server_id.to_string(),
            job_id: job_id.to_string(),
        })
    }

    pub fn is_active(&self, server_id: &str) -> bool {
        self.lock().contains_key(server_id)
    }

    pub fn get(&self, server_id: &str) -> Option<ActiveJob> {
        self.lock().get(server_id).cloned()
    }

    /// Active jobs, oldest first
    pub fn list(&self) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reservation of one server id by one job
#[derive(Debug)]
pub struct JobGuard {
    registry: JobRegistry,
    server_id: String,
    job_id: String,
}

impl JobGuard {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Record the job's current state for listings
    pub fn set_state(&self, state: JobState) {
        if let Some(job) = self.registry.lock().get_mut(&self.server_id) {
            if job.job_id == self.job_id {
                job.state = state;
            }
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut jobs = self.registry.lock();
        if jobs
            .get(&self.server_id)
            .is_some_and(|job| job.job_id == self.job_id)
        {
            jobs.remove(&self.server_id);
        }
    }
}
