// replsync/src/agent/simulated.rs
//! Scripted stand-in for the merge agent, used for dry runs.

use serde::Deserialize;
use std::thread;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::errors::{AgentError, Result, SyncError};
use crate::sync::controller::StatusReporter;
use crate::sync::provider::{ProviderSession, SyncProvider};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulatedStep {
    pub percent: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulatedFailure {
    pub code: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulationScript {
    #[serde(default = "default_subscription_exists")]
    pub subscription_exists: bool,
    #[serde(default)]
    pub connect_failure: Option<String>,
    #[serde(default = "default_steps")]
    pub steps: Vec<SimulatedStep>,
    #[serde(default)]
    pub step_delay_ms: u64,
    /// Raised by the agent after the last step.
    #[serde(default)]
    pub failure: Option<SimulatedFailure>,
}

fn default_subscription_exists() -> bool {
    true
}

fn default_steps() -> Vec<SimulatedStep> {
    [
        (0.0, "Initializing"),
        (10.0, "Connecting to Publisher"),
        (20.0, "Retrieving subscription information."),
        (50.0, "Uploading data changes to the Publisher"),
        (80.0, "Downloading data changes to the Subscriber"),
        (100.0, "Merge completed after processing 0 data change(s)"),
    ]
    .into_iter()
    .map(|(percent, message)| SimulatedStep {
        percent,
        message: message.to_string(),
    })
    .collect()
}

impl Default for SimulationScript {
    fn default() -> Self {
        SimulationScript {
            subscription_exists: default_subscription_exists(),
            connect_failure: None,
            steps: default_steps(),
            step_delay_ms: 0,
            failure: None,
        }
    }
}

pub struct SimulatedProvider {
    script: SimulationScript,
}

impl SimulatedProvider {
    pub fn new(script: SimulationScript) -> Self {
        SimulatedProvider { script }
    }
}

impl SyncProvider for SimulatedProvider {
    fn connect(&self, config: &SyncConfig) -> Result<Box<dyn ProviderSession>> {
        if let Some(reason) = &self.script.connect_failure {
            return Err(SyncError::ConnectionFailed {
                subscriber: config.subscriber.clone(),
                reason: reason.clone(),
            });
        }
        Ok(Box::new(SimulatedSession {
            script: self.script.clone(),
        }))
    }
}

struct SimulatedSession {
    script: SimulationScript,
}

impl ProviderSession for SimulatedSession {
    fn load_subscription_properties(&mut self) -> Result<bool> {
        Ok(self.script.subscription_exists)
    }

    fn synchronize(&mut self, status: &StatusReporter) -> std::result::Result<(), AgentError> {
        let delay = Duration::from_millis(self.script.step_delay_ms);
        for step in &self.script.steps {
            if status.is_cancelled() {
                return Err(AgentError::new(None, "The merge process was stopped at the user's request."));
            }
            status.report(step.percent, &step.message);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        match &self.script.failure {
            Some(failure) => Err(AgentError::new(failure.code, failure.message.clone())),
            None => Ok(()),
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}
