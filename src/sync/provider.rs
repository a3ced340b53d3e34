// replsync/src/sync/provider.rs
//! Seam between the controller and whatever actually runs the merge agent.

use tracing::warn;

use crate::config::SyncConfig;
use crate::errors::{AgentError, Result};
use crate::sync::controller::StatusReporter;

/// Factory for subscriber sessions. Implementations must be shareable across
/// runs because the controller keeps one provider for its whole lifetime.
pub trait SyncProvider: Send + Sync + 'static {
    /// Opens a connection to the subscriber named in `config`.
    ///
    /// Failures should be reported as `SyncError::ConnectionFailed`.
    fn connect(&self, config: &SyncConfig) -> Result<Box<dyn ProviderSession>>;
}

/// One open connection to a subscriber. All calls happen on the worker thread.
pub trait ProviderSession: Send {
    /// Returns `false` when the pull subscription is not defined at the subscriber.
    fn load_subscription_properties(&mut self) -> Result<bool>;

    /// Runs the merge agent to completion. Blocks for as long as the agent runs.
    ///
    /// `status` may be called any number of times while this runs. Implementations
    /// that can stop early should poll `status.is_cancelled()`.
    fn synchronize(&mut self, status: &StatusReporter) -> std::result::Result<(), AgentError>;

    fn disconnect(&mut self) -> Result<()>;
}

/// Disconnects the wrapped session when dropped, so every exit path of the
/// worker releases the subscriber connection.
pub(crate) struct SessionGuard {
    session: Box<dyn ProviderSession>,
    closed: bool,
}

impl SessionGuard {
    pub(crate) fn new(session: Box<dyn ProviderSession>) -> Self {
        SessionGuard {
            session,
            closed: false,
        }
    }

    pub(crate) fn session_mut(&mut self) -> &mut dyn ProviderSession {
        self.session.as_mut()
    }

    /// Disconnects explicitly and hands the teardown result to the caller.
    pub(crate) fn close(mut self) -> Result<()> {
        self.closed = true;
        self.session.disconnect()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.session.disconnect() {
            warn!(error = %e, "failed to disconnect subscriber session during unwind");
        }
    }
}
