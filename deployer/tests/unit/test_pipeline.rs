//! Deployment pipeline tests against a scripted tool runner

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use mcdeploy::deploy::configure::{
    AnsibleConfigurator, ConfigSecrets, ConfigureOptions, VARS_FILE,
};
use mcdeploy::deploy::coordinator::{CoordinatorOptions, DeploymentCoordinator};
use mcdeploy::deploy::fsm::JobState;
use mcdeploy::deploy::provision::{ProvisionOptions, TerraformProvisioner, MODULE_DIR};
use mcdeploy::deploy::stage::{StageCommand, StageProcess, StageRunner};
use mcdeploy::errors::{DeployerError, PipelineError};
use mcdeploy::models::progress::{EventStage, EventStatus, ProgressEvent};
use mcdeploy::models::request::DeploymentRequest;
use mcdeploy::models::server::{Provider, ServerRecord, ServerStatus};
use mcdeploy::store::{JsonServerStore, ServerStore};
use mcdeploy::utils::CooldownOptions;

type Script = dyn Fn(&StageCommand) -> Result<(Vec<String>, i32), PipelineError> + Send + Sync;

/// Replays canned tool output and records every command it was asked to run
struct ScriptedRunner {
    script: Box<Script>,
    calls: Mutex<Vec<StageCommand>>,
    /// Step that never exits on its own and runs into a short deadline
    hang: Option<&'static str>,
}

impl ScriptedRunner {
    fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&StageCommand) -> Result<(Vec<String>, i32), PipelineError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            hang: None,
        })
    }

    fn hanging<F>(step: &'static str, script: F) -> Arc<Self>
    where
        F: Fn(&StageCommand) -> Result<(Vec<String>, i32), PipelineError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            hang: Some(step),
        })
    }

    fn labels(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.label.clone())
            .collect()
    }

    fn count(&self, label: &str) -> usize {
        self.labels().iter().filter(|l| l.as_str() == label).count()
    }

    fn call(&self, label: &str) -> Option<StageCommand> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.label == label)
            .cloned()
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn spawn(&self, command: StageCommand) -> Result<StageProcess, PipelineError> {
        self.calls.lock().unwrap().push(command.clone());
        if self.hang == Some(command.label.as_str()) {
            return Ok(hung_process(command.label));
        }
        let (lines, exit_code) = (self.script)(&command)?;
        Ok(StageProcess::completed(command.label, lines, exit_code))
    }
}

/// A process that keeps its output open until it is killed
fn hung_process(label: String) -> StageProcess {
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let exit = async move {
        let _output = line_tx;
        let _ = kill_rx.await;
        Err::<i32, String>("killed".to_string())
    };
    StageProcess::from_parts(label, Duration::from_millis(50), line_rx, exit, Some(kill_tx))
}

/// Which record write the store refuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreFault {
    MarkCreating,
    PublishAddress,
}

/// Delegates to an in-memory store, failing one kind of write
struct FaultyStore {
    inner: Arc<JsonServerStore>,
    fault: StoreFault,
}

#[async_trait]
impl ServerStore for FaultyStore {
    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, DeployerError> {
        self.inner.get_server(server_id).await
    }

    async fn set_server_status(
        &self,
        server_id: &str,
        status: ServerStatus,
    ) -> Result<(), DeployerError> {
        if self.fault == StoreFault::MarkCreating && status == ServerStatus::Creating {
            return Err(DeployerError::StorageError("record API unavailable".to_string()));
        }
        self.inner.set_server_status(server_id, status).await
    }

    async fn set_server_address(
        &self,
        server_id: &str,
        address: &str,
        port: u16,
    ) -> Result<(), DeployerError> {
        if self.fault == StoreFault::PublishAddress {
            return Err(DeployerError::StorageError("record API unavailable".to_string()));
        }
        self.inner.set_server_address(server_id, address, port).await
    }
}

fn lines(list: &[&str]) -> Vec<String> {
    list.iter().map(|l| l.to_string()).collect()
}

fn aws_outputs(entries: &[(&str, &str)]) -> String {
    let map: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .map(|(name, ip)| (name.to_string(), serde_json::json!(ip)))
        .collect();
    serde_json::json!({
        "instance_public_ips": {"sensitive": false, "type": "map", "value": map}
    })
    .to_string()
}

/// Script for a run where every tool succeeds
fn happy_script(
    outputs: String,
) -> impl Fn(&StageCommand) -> Result<(Vec<String>, i32), PipelineError> + Send + Sync + 'static {
    move |command| {
        let result = match command.label.as_str() {
            "terraform init" => (lines(&["Terraform has been successfully initialized!"]), 0),
            "terraform plan" => (lines(&["Plan: 3 to add, 0 to change, 0 to destroy."]), 0),
            "terraform apply" => (
                lines(&["aws_instance.server[0]: Creating...", "Apply complete! Resources: 3 added."]),
                0,
            ),
            "terraform output" => (vec![outputs.clone()], 0),
            "terraform destroy" => (lines(&["Destroy complete! Resources: 3 destroyed."]), 0),
            "ansible ping" => (
                lines(&[r#"instance1 | SUCCESS => {"changed": false, "ping": "pong"}"#]),
                0,
            ),
            "ansible-playbook" => (
                lines(&["PLAY [all] ****", "ok: [instance1]", "PLAY RECAP ****"]),
                0,
            ),
            other => panic!("unexpected command {}", other),
        };
        Ok(result)
    }
}

struct HarnessOptions {
    max_attempts: u32,
    rollback_on_failure: bool,
    store_fault: Option<StoreFault>,
    secrets: Option<ConfigSecrets>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rollback_on_failure: false,
            store_fault: None,
            secrets: None,
        }
    }
}

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<JsonServerStore>,
    runner: Arc<ScriptedRunner>,
    coordinator: DeploymentCoordinator,
}

impl Harness {
    fn new(runner: Arc<ScriptedRunner>) -> Self {
        Self::build(runner, HarnessOptions::default())
    }

    fn with_attempts(runner: Arc<ScriptedRunner>, max_attempts: u32) -> Self {
        Self::build(
            runner,
            HarnessOptions {
                max_attempts,
                ..Default::default()
            },
        )
    }

    fn build(runner: Arc<ScriptedRunner>, options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let module = root.join("terraform").join("aws");
        std::fs::create_dir_all(&module).unwrap();
        std::fs::write(module.join("main.tf"), "# aws module").unwrap();

        let provisioner = TerraformProvisioner::new(
            runner.clone(),
            ProvisionOptions {
                terraform_root: root.join("terraform"),
                state_dir: root.join("state"),
                ..Default::default()
            },
        );
        let mut configure = ConfigureOptions {
            ansible_dir: root.join("ansible"),
            max_attempts: options.max_attempts,
            backoff: CooldownOptions {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            },
            ..Default::default()
        };
        if let Some(secrets) = options.secrets {
            configure.secrets = secrets;
        }
        let configurator = AnsibleConfigurator::new(runner.clone(), configure);

        let store = Arc::new(JsonServerStore::in_memory());
        let coordinator_store: Arc<dyn ServerStore> = match options.store_fault {
            Some(fault) => Arc::new(FaultyStore {
                inner: store.clone(),
                fault,
            }),
            None => store.clone(),
        };
        let coordinator = DeploymentCoordinator::new(
            coordinator_store,
            Arc::new(provisioner),
            Arc::new(configurator),
            CoordinatorOptions {
                jobs_dir: root.join("jobs"),
                game_port: 25565,
                rollback_on_failure: options.rollback_on_failure,
                keep_workspaces: false,
            },
        );

        Self {
            dir,
            store,
            runner,
            coordinator,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }
}

fn assert_stage_order(events: &[ProgressEvent]) {
    let rank = |stage: EventStage| match stage {
        EventStage::Provisioning => 0,
        EventStage::Configuration => 1,
        EventStage::Complete | EventStage::Error => 2,
    };
    for pair in events.windows(2) {
        assert!(
            rank(pair[0].stage) <= rank(pair[1].stage),
            "stage went backwards: {:?} -> {:?}",
            pair[0],
            pair[1]
        );
    }
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "expected exactly one terminal event");
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn test_successful_deployment_publishes_address() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let handle = harness.coordinator.submit(request).await.unwrap();
    assert!(harness.coordinator.is_active(&record.id));

    let (events, task) = handle.into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert!(outcome.succeeded());
    assert_eq!(outcome.endpoint, Some(("3.1.2.3".to_string(), 25565)));
    assert_stage_order(&events);

    let first = &events[0];
    assert_eq!(first.stage, EventStage::Provisioning);
    assert_eq!(first.status, EventStatus::Started);

    let last = events.last().unwrap();
    assert_eq!(last.stage, EventStage::Complete);
    assert_eq!(last.status, EventStatus::Success);
    assert_eq!(last.server_ip.as_deref(), Some("3.1.2.3"));
    assert_eq!(last.port, Some(25565));

    // Streamed tool output shows up as progress
    assert!(events
        .iter()
        .any(|e| e.status == EventStatus::Applying && e.message.contains("Apply complete")));
    assert!(events
        .iter()
        .any(|e| e.status == EventStatus::Deploying && e.message.contains("ok: [instance1]")));

    let record = harness.store.get_server(&record.id).await.unwrap();
    assert_eq!(record.status(), ServerStatus::Running);
    assert_eq!(record.address(), Some("3.1.2.3"));
    assert_eq!(record.port(), Some(25565));

    assert_eq!(
        harness.runner.labels(),
        vec![
            "terraform init",
            "terraform plan",
            "terraform apply",
            "terraform output",
            "ansible ping",
            "ansible-playbook",
        ]
    );
    let plan = harness.runner.call("terraform plan").unwrap();
    assert!(plan.has_arg(r#"server_names=["instance1"]"#));
    // Terraform runs in the job's own copy of the module
    let jobs_dir = harness.root().join("jobs");
    for label in ["terraform init", "terraform plan", "terraform apply", "terraform output"] {
        let command = harness.runner.call(label).unwrap();
        assert!(command.working_dir.starts_with(&jobs_dir), "{} ran in {:?}", label, command.working_dir);
        assert!(command.working_dir.ends_with(MODULE_DIR));
    }
    let playbook = harness.runner.call("ansible-playbook").unwrap();
    assert!(playbook.args.iter().any(|a| a.ends_with("swarm_setup.yml")));
    assert!(playbook
        .env
        .contains(&("ANSIBLE_HOST_KEY_CHECKING".to_string(), "False".to_string())));

    assert!(!harness.coordinator.is_active(&record.id));
}

#[tokio::test]
async fn test_apply_failure_skips_configuration() {
    let happy = happy_script(aws_outputs(&[("instance1", "3.1.2.3")]));
    let runner = ScriptedRunner::new(move |command| {
        if command.label == "terraform apply" {
            return Ok((lines(&["Error: VcpuLimitExceeded: quota exceeded"]), 1));
        }
        happy(command)
    });
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    assert_stage_order(&events);

    let last = events.last().unwrap();
    assert_eq!(last.stage, EventStage::Error);
    assert!(last.message.contains("terraform apply failed with exit code 1"));
    assert!(last.message.contains("quota exceeded"));
    assert!(events.iter().all(|e| e.stage != EventStage::Configuration));

    let record = harness.store.get_server(&record.id).await.unwrap();
    assert_eq!(record.status(), ServerStatus::Error);
    assert!(record.address().is_none());

    assert_eq!(harness.runner.count("terraform output"), 0);
    assert_eq!(harness.runner.count("ansible ping"), 0);
    assert_eq!(harness.runner.count("ansible-playbook"), 0);
}

#[tokio::test]
async fn test_unreachable_hosts_skip_playbook() {
    let happy = happy_script(aws_outputs(&[("instance1", "3.1.2.3")]));
    let runner = ScriptedRunner::new(move |command| {
        if command.label == "ansible ping" {
            return Ok((
                lines(&[r#"instance1 | UNREACHABLE! => {"msg": "Connection timed out"}"#]),
                4,
            ));
        }
        happy(command)
    });
    let harness = Harness::with_attempts(runner, 3);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    assert_stage_order(&events);

    let last = events.last().unwrap();
    assert_eq!(last.stage, EventStage::Error);
    assert!(last.message.contains("unreachable"));
    assert!(last.message.contains("instance1"));

    assert_eq!(harness.runner.count("ansible ping"), 3);
    assert_eq!(harness.runner.count("ansible-playbook"), 0);

    // Retries only target the hosts that have not answered
    let retries: Vec<StageCommand> = harness
        .runner
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.label == "ansible ping")
        .skip(1)
        .cloned()
        .collect();
    assert!(retries.iter().all(|c| c.has_arg("--limit")));

    let record = harness.store.get_server(&record.id).await.unwrap();
    assert_eq!(record.status(), ServerStatus::Error);
}

#[tokio::test]
async fn test_missing_instance_address_fails_provisioning() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request =
        DeploymentRequest::new(&record.id, Provider::Aws, &["instance1", "instance2"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    let last = events.last().unwrap();
    assert_eq!(last.stage, EventStage::Error);
    assert!(last.message.contains("instance2"));
    assert!(events.iter().all(|e| e.stage != EventStage::Configuration));
    assert_eq!(harness.runner.count("ansible ping"), 0);
}

#[tokio::test]
async fn test_missing_tool_is_reported_as_error_event() {
    let runner = ScriptedRunner::new(|command| {
        Err(PipelineError::ToolUnavailable {
            program: command.program.clone(),
            reason: "No such file or directory (os error 2)".to_string(),
        })
    });
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    task.await.unwrap();

    let last = events.last().unwrap();
    assert_eq!(last.stage, EventStage::Error);
    assert!(last.message.contains("terraform could not be started"));
    assert_eq!(
        harness.store.get_server(&record.id).await.unwrap().status(),
        ServerStatus::Error
    );
}

#[tokio::test]
async fn test_second_deployment_for_same_server_is_rejected() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let first = harness.coordinator.submit(request.clone()).await.unwrap();

    let second = harness.coordinator.submit(request).await;
    assert!(matches!(second, Err(DeployerError::JobAlreadyActive(_))));

    // The original job is unaffected
    let (events, task) = first.into_parts();
    let events = events.collect().await;
    assert!(task.await.unwrap().succeeded());
    assert_eq!(events.last().unwrap().stage, EventStage::Complete);
    assert_eq!(harness.runner.count("terraform apply"), 1);
}

#[tokio::test]
async fn test_dropped_subscriber_does_not_stop_job() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    drop(events);

    let outcome = task.await.unwrap();
    assert!(outcome.succeeded());
    assert_eq!(
        harness.store.get_server(&record.id).await.unwrap().status(),
        ServerStatus::Running
    );
}

#[tokio::test]
async fn test_rejected_requests_leave_record_untouched() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::new(runner);
    let mut record = harness.store.create("survival", Provider::Azure).await.unwrap();
    record.set_status(ServerStatus::Stopped);
    harness.store.insert(record.clone()).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let result = harness.coordinator.submit(request).await;
    let err = tokio_test::assert_err!(result);
    assert!(matches!(err, DeployerError::ValidationError(_)));

    let unknown = DeploymentRequest::new("no-such-server", Provider::Aws, &["instance1"]).unwrap();
    let result = harness.coordinator.submit(unknown).await;
    assert!(matches!(result, Err(DeployerError::NotFound(_))));

    let stored = harness.store.get_server(&record.id).await.unwrap();
    assert_eq!(stored.status(), ServerStatus::Stopped);
    assert!(!harness.coordinator.is_active(&record.id));
    assert!(harness.runner.labels().is_empty());
}

#[tokio::test]
async fn test_vars_file_is_removed_after_playbook() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let handle = harness.coordinator.submit(request).await.unwrap();
    let job_id = handle.job_id.clone();
    assert!(handle.join().await.unwrap().succeeded());

    // Workspaces are removed along with the rendered variables
    let workspace = harness.root().join("jobs").join(&job_id);
    assert!(!workspace.join(VARS_FILE).exists());
    assert!(!workspace.exists());
}

#[tokio::test]
async fn test_destroy_marks_server_stopped() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let handle = harness.coordinator.submit(request.clone()).await.unwrap();
    assert!(handle.join().await.unwrap().succeeded());

    tokio_test::assert_ok!(harness.coordinator.destroy(request).await);

    let stored = harness.store.get_server(&record.id).await.unwrap();
    assert_eq!(stored.status(), ServerStatus::Stopped);
    assert!(stored.address().is_none());

    let destroy = harness.runner.call("terraform destroy").unwrap();
    assert!(destroy.has_arg("-auto-approve"));
}

#[tokio::test]
async fn test_module_is_copied_before_terraform_runs() {
    let happy = happy_script(aws_outputs(&[("instance1", "3.1.2.3")]));
    let runner = ScriptedRunner::new(move |command| {
        if command.label.starts_with("terraform") {
            assert!(
                command.working_dir.join("main.tf").is_file(),
                "module missing for {}",
                command.label
            );
        }
        happy(command)
    });
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let handle = harness.coordinator.submit(request).await.unwrap();
    assert!(handle.join().await.unwrap().succeeded());

    // Nothing is written next to the shared module
    let shared: Vec<_> = std::fs::read_dir(harness.root().join("terraform/aws"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(shared, vec![std::ffi::OsString::from("main.tf")]);
}

#[tokio::test]
async fn test_text_around_outputs_fails_provisioning() {
    let happy = happy_script(aws_outputs(&[("instance1", "3.1.2.3")]));
    let runner = ScriptedRunner::new(move |command| {
        if command.label == "terraform output" {
            return Ok((
                vec![
                    "Warning: Deprecated attribute".to_string(),
                    aws_outputs(&[("instance1", "3.1.2.3")]),
                ],
                0,
            ));
        }
        happy(command)
    });
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    let last = events.last().unwrap();
    assert_eq!(last.stage, EventStage::Error);
    assert!(last.message.contains("not valid JSON"));
    assert_eq!(harness.runner.count("ansible ping"), 0);
}

#[tokio::test]
async fn test_plan_failure_skips_apply() {
    let happy = happy_script(aws_outputs(&[("instance1", "3.1.2.3")]));
    let runner = ScriptedRunner::new(move |command| {
        if command.label == "terraform plan" {
            return Ok((lines(&["Error: Invalid value for variable \"region\""]), 1));
        }
        happy(command)
    });
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    assert_stage_order(&events);
    let last = events.last().unwrap();
    assert_eq!(last.stage, EventStage::Error);
    assert!(last.message.contains("terraform plan failed with exit code 1"));

    assert_eq!(harness.runner.count("terraform apply"), 0);
    assert_eq!(harness.runner.count("terraform output"), 0);
    assert_eq!(
        harness.store.get_server(&record.id).await.unwrap().status(),
        ServerStatus::Error
    );
}

#[tokio::test]
async fn test_stage_timeout_ends_in_error() {
    let runner = ScriptedRunner::hanging(
        "terraform apply",
        happy_script(aws_outputs(&[("instance1", "3.1.2.3")])),
    );
    let harness = Harness::new(runner);
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    assert_stage_order(&events);
    let errors: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| e.stage == EventStage::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("terraform apply timed out"));

    assert_eq!(harness.runner.count("terraform output"), 0);
    assert_eq!(
        harness.store.get_server(&record.id).await.unwrap().status(),
        ServerStatus::Error
    );
}

#[tokio::test]
async fn test_rollback_destroys_once_after_failure() {
    let happy = happy_script(aws_outputs(&[("instance1", "3.1.2.3")]));
    let runner = ScriptedRunner::new(move |command| {
        if command.label == "ansible-playbook" {
            return Ok((lines(&["fatal: [instance1]: FAILED!"]), 2));
        }
        happy(command)
    });
    let harness = Harness::build(
        runner,
        HarnessOptions {
            rollback_on_failure: true,
            ..Default::default()
        },
    );
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    assert_stage_order(&events);
    assert_eq!(events.last().unwrap().stage, EventStage::Error);

    assert_eq!(harness.runner.count("terraform destroy"), 1);
    let labels = harness.runner.labels();
    let playbook = labels.iter().position(|l| l == "ansible-playbook").unwrap();
    let destroy = labels.iter().position(|l| l == "terraform destroy").unwrap();
    assert!(playbook < destroy);
    assert_eq!(
        harness.store.get_server(&record.id).await.unwrap().status(),
        ServerStatus::Error
    );
}

#[tokio::test]
async fn test_rollback_is_skipped_on_success() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::build(
        runner,
        HarnessOptions {
            rollback_on_failure: true,
            ..Default::default()
        },
    );
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let handle = harness.coordinator.submit(request).await.unwrap();
    assert!(handle.join().await.unwrap().succeeded());
    assert_eq!(harness.runner.count("terraform destroy"), 0);
}

#[tokio::test]
async fn test_credentials_never_reach_progress_events() {
    let happy = happy_script(aws_outputs(&[("instance1", "3.1.2.3")]));
    let runner = ScriptedRunner::new(move |command| {
        if command.label == "ansible-playbook" {
            return Ok((
                lines(&[
                    "TASK [minecraft : Configure RCON] ****",
                    r#"fatal: [instance1]: FAILED! => {"msg": "rcon.password=rcon-hunter2 rejected"}"#,
                    "grafana admin password is grafana-hunter2",
                ]),
                2,
            ));
        }
        happy(command)
    });
    let harness = Harness::build(
        runner,
        HarnessOptions {
            secrets: Some(ConfigSecrets::new("rcon-hunter2", "grafana-hunter2")),
            ..Default::default()
        },
    );
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    assert!(!events.is_empty());
    for event in &events {
        assert!(!event.message.contains("hunter2"), "leaked in {:?}", event);
    }
    assert!(!outcome.error.unwrap_or_default().contains("hunter2"));

    let last = events.last().unwrap();
    assert_eq!(last.stage, EventStage::Error);
    assert!(last.message.contains("rcon.password=[REDACTED]"));
}

#[tokio::test]
async fn test_unpublished_address_fails_deployment() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::build(
        runner,
        HarnessOptions {
            store_fault: Some(StoreFault::PublishAddress),
            ..Default::default()
        },
    );
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let (events, task) = harness.coordinator.submit(request).await.unwrap().into_parts();
    let events = events.collect().await;
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    assert!(outcome.endpoint.is_none());
    assert_stage_order(&events);
    assert!(events.iter().all(|e| e.stage != EventStage::Complete));
    let last = events.last().unwrap();
    assert_eq!(last.stage, EventStage::Error);
    assert!(last.message.contains("Could not publish 3.1.2.3:25565"));

    let stored = harness.store.get_server(&record.id).await.unwrap();
    assert_eq!(stored.status(), ServerStatus::Error);
    assert!(stored.address().is_none());
}

#[tokio::test]
async fn test_failed_status_write_leaves_no_workspace() {
    let runner = ScriptedRunner::new(happy_script(aws_outputs(&[("instance1", "3.1.2.3")])));
    let harness = Harness::build(
        runner,
        HarnessOptions {
            store_fault: Some(StoreFault::MarkCreating),
            ..Default::default()
        },
    );
    let record = harness.store.create("survival", Provider::Aws).await.unwrap();

    let request = DeploymentRequest::new(&record.id, Provider::Aws, &["instance1"]).unwrap();
    let result = harness.coordinator.submit(request).await;
    assert!(matches!(result, Err(DeployerError::StorageError(_))));

    let jobs_dir = harness.root().join("jobs");
    let leftovers = std::fs::read_dir(&jobs_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
    assert!(!harness.coordinator.is_active(&record.id));
    assert!(harness.runner.labels().is_empty());
}
