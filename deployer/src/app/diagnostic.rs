//! Environment diagnostics

use std::path::{Path, PathBuf};
use std::time::Duration;

use colored::Colorize;

use crate::deploy::stage::{StageCommand, StageRunner, TokioStageRunner};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of one diagnostic check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Check the tools and directories a deployment needs. Returns whether all
/// checks passed.
pub async fn run_diagnostic(layout: &StorageLayout, settings: &Settings) -> bool {
    println!("{}", "Mineclifford deployer diagnostics".bold());
    println!("  base directory: {}", layout.base_dir.display());

    let runner = TokioStageRunner;
    let tools = &settings.tools;
    let mut results = vec![
        check_tool(&runner, "terraform", &tools.terraform_bin, "version").await,
        check_tool(&runner, "ansible", &tools.ansible_bin, "--version").await,
        check_tool(
            &runner,
            "ansible-playbook",
            &tools.ansible_playbook_bin,
            "--version",
        )
        .await,
    ];

    for provider in ["aws", "azure"] {
        let dir = PathBuf::from(&tools.terraform_root).join(provider);
        results.push(check_dir(&format!("terraform module ({})", provider), &dir).await);
    }
    results.push(check_dir("ansible playbooks", Path::new(&tools.ansible_dir)).await);

    for result in &results {
        let mark = if result.passed {
            "ok".green()
        } else {
            "FAIL".red()
        };
        println!("  [{}] {}: {}", mark, result.name, result.detail);
    }

    let passed = results.iter().all(|r| r.passed);
    if passed {
        println!("{}", "All checks passed".green());
    } else {
        println!("{}", "Some checks failed".red().bold());
    }
    passed
}

async fn check_tool(
    runner: &dyn StageRunner,
    name: &str,
    program: &str,
    version_arg: &str,
) -> CheckResult {
    let command = StageCommand::new(
        format!("{} {}", name, version_arg),
        program,
        PathBuf::from("."),
        PROBE_TIMEOUT,
    )
    .arg(version_arg);

    let outcome = match runner.spawn(command).await {
        Ok(process) => process.finish().await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(output) => CheckResult {
            name: name.to_string(),
            passed: true,
            detail: output
                .text()
                .lines()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("installed")
                .trim()
                .to_string(),
        },
        Err(e) => CheckResult {
            name: name.to_string(),
            passed: false,
            detail: e.to_string(),
        },
    }
}

async fn check_dir(name: &str, dir: &Path) -> CheckResult {
    let passed = tokio::fs::metadata(dir)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    CheckResult {
        name: name.to_string(),
        passed,
        detail: if passed {
            dir.display().to_string()
        } else {
            format!("{} is missing", dir.display())
        },
    }
}
