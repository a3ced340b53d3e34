// replsync/src/sync/mod.rs
pub mod channel;
pub mod controller;
pub mod provider;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{AppConfig, SyncConfig};
use channel::ProgressEvent;
use controller::{RunState, SyncController};
use provider::SyncProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Public entry point for the sync process.
/// Starts one run, prints every event as it arrives and returns the final state.
pub async fn run_sync_flow(
    sync_config: SyncConfig,
    provider: Arc<dyn SyncProvider>,
    format: OutputFormat,
) -> Result<RunState> {
    let controller = Arc::new(SyncController::new(provider));
    let mut handle = controller
        .start(sync_config)
        .context("Failed to start synchronization")?;
    let run_id = handle.id();
    info!(%run_id, "synchronization started");

    // Ctrl-C asks the run to stop; the agent gets to wind down on its own.
    let interrupt = tokio::spawn({
        let controller = controller.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() && controller.cancel(run_id) {
                eprintln!("⏹ Cancellation requested, waiting for the merge agent to stop...");
            }
        }
    });

    while let Some(event) = handle.next_event().await {
        render_event(&event, format)?;
        if event.is_terminal() {
            let run = handle.snapshot();
            info!(
                %run_id,
                state = ?run.state,
                started_at = %run.started_at,
                finished_at = ?run.finished_at,
                "synchronization finished"
            );
        }
    }
    interrupt.abort();

    debug!(%run_id, state = ?controller.state(), "acknowledging run");
    controller.acknowledge(&handle);
    Ok(handle.wait().await)
}

fn render_event(event: &ProgressEvent, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let line = serde_json::to_string(event).context("Failed to serialize progress event")?;
            println!("{}", line);
        }
        OutputFormat::Text => match event {
            ProgressEvent::Progress { .. } => println!("{}", event),
            ProgressEvent::Completed => println!("✅ {}", event),
            ProgressEvent::Cancelled => println!("⏹ {}", event),
            ProgressEvent::Failed { .. } => eprintln!("❌ {}", event),
        },
    }
    Ok(())
}

/// Prints the subscription and publication the configuration points at.
pub fn print_subscription(app_config: &AppConfig, sync_config: &SyncConfig) {
    println!("Subscription: {}", sync_config.subscription_label());
    println!("Publication:  {}", sync_config.publication);
    println!("Subscriber:   {}", sync_config.subscriber);
    println!("Distributor:  {}", sync_config.distributor);
    println!("Merge agent:  {}", app_config.agent_config.program);
}
