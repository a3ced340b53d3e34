//! Merge Pull Subscription Sync Tool
//!
//! Provides CLI interface for synchronizing a replication pull subscription
//! with live progress reporting

// replsync/src/main.rs
mod agent;
mod config;
mod errors;
mod sync;
mod utils;

use anyhow::{Context, Result};
use config::{AppConfig, load_sync_config_from_json};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use sync::OutputFormat;
use sync::controller::RunState;
use tracing_subscriber::EnvFilter;

const CONFIG_PATH_ENV: &str = "REPLSYNC_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the sync tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    match run_app().await {
        Ok(RunState::Succeeded) | Ok(RunState::Idle) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Ok(RunState::Cancelled) => {
            println!("⏹ Synchronization was cancelled.");
            ExitCode::from(130)
        }
        Ok(state) => {
            eprintln!("❌ Synchronization ended in state {:?}.", state);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_app() -> Result<RunState> {
    let config_path = env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;
    let sync_config = load_sync_config_from_json(&app_config.raw_json_config)
        .context("Failed to load subscription configuration from JSON")?;

    let args: Vec<String> = env::args().skip(1).collect();
    let simulate = args.iter().any(|a| a == "--simulate");
    let format = if args.iter().any(|a| a == "--json") {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let choice = match args.iter().find(|a| !a.starts_with("--")) {
        Some(choice) => choice.trim().to_string(),
        None => prompt_choice()?,
    };

    match choice.as_str() {
        "1" | "sync" => {
            sync::print_subscription(&app_config, &sync_config);
            println!("⚙️ Starting Synchronization...");
            let provider = agent::build_provider(&app_config, simulate);
            sync::run_sync_flow(sync_config, provider, format)
                .await
                .context("Sync process failed")
        }
        "2" | "show" => {
            sync::print_subscription(&app_config, &sync_config);
            Ok(RunState::Idle)
        }
        _ => {
            println!("❌ Invalid choice. Please enter '1' (sync) or '2' (show).");
            anyhow::bail!("Invalid operation choice");
        }
    }
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Synchronize Subscription (or type 'sync')");
    println!("2. Show Subscription (or type 'show')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
