//! Mineclifford Deployer - Entry Point
//!
//! Serves the deployment API and runs Terraform and Ansible on behalf of the
//! presentation layer.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use mcdeploy::app::diagnostic::run_diagnostic;
use mcdeploy::app::options::AppOptions;
use mcdeploy::app::run::run;
use mcdeploy::logs::{init_logging, LogLevel, LogOptions};
use mcdeploy::storage::layout::StorageLayout;
use mcdeploy::storage::settings::Settings;
use mcdeploy::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to render version info: {}", e),
        }
        return ExitCode::SUCCESS;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file, falling back to defaults when absent
    let settings_file = layout.settings_file();
    let mut settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Settings::default()
    };

    if let Some(level) = cli_args.get("log-level") {
        match level.parse::<LogLevel>() {
            Ok(level) => settings.log_level = level,
            Err(e) => eprintln!("Ignoring --log-level: {}", e),
        }
    }
    if let Some(port) = cli_args.get("port") {
        match port.parse::<u16>() {
            Ok(port) => settings.server.port = port,
            Err(e) => eprintln!("Ignoring --port: {}", e),
        }
    }

    // Run diagnostics
    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        return if run_diagnostic(&layout, &settings).await {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Run the server
    let options = AppOptions::from_settings(layout, settings);
    info!(
        "Running Mineclifford deployer {} with options: {:?}",
        version.version, options
    );
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run the deployer: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let signals = signal(SignalKind::terminate())
            .and_then(|term| signal(SignalKind::interrupt()).map(|int| (term, int)));

        let (mut sigterm, mut sigint) = match signals {
            Ok(signals) => signals,
            Err(e) => {
                warn!("Unable to install signal handlers, falling back to Ctrl+C: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
