// replsync/src/agent/mod.rs
pub mod command;
pub mod simulated;

use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::sync::provider::SyncProvider;
use command::AgentCommandProvider;
use simulated::SimulatedProvider;

/// Picks the provider for this invocation: the real merge agent, or the
/// scripted one for dry runs.
pub fn build_provider(app_config: &AppConfig, simulate: bool) -> Arc<dyn SyncProvider> {
    if simulate {
        info!("using simulated merge agent");
        Arc::new(SimulatedProvider::new(
            app_config.simulation.clone().unwrap_or_default(),
        ))
    } else {
        Arc::new(AgentCommandProvider::new(app_config.agent_config.clone()))
    }
}
