// replsync/src/sync/controller.rs
//! Drives one merge synchronization at a time on a blocking worker thread and
//! turns the agent's status callbacks into a progress stream.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::{self, JoinError, JoinHandle};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::errors::{AgentError, Result, SyncError};
use crate::sync::channel::{ErrorInfo, ProgressEvent, ProgressReceiver, ProgressSender, progress_channel};
use crate::sync::provider::{SessionGuard, SyncProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Cancelled)
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub state: RunState,
}

#[derive(Debug)]
struct RunStatus {
    state: RunState,
    finished_at: Option<DateTime<Local>>,
}

/// State shared between the caller, the worker thread and the supervisor task.
#[derive(Debug)]
pub(crate) struct RunShared {
    id: Uuid,
    started_at: DateTime<Local>,
    status: Mutex<RunStatus>,
    cancel_requested: AtomicBool,
    events: ProgressSender,
}

impl RunShared {
    fn new(events: ProgressSender) -> Self {
        RunShared {
            id: Uuid::new_v4(),
            started_at: Local::now(),
            status: Mutex::new(RunStatus {
                state: RunState::Running,
                finished_at: None,
            }),
            cancel_requested: AtomicBool::new(false),
            events,
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, RunStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> RunState {
        self.lock_status().state
    }

    fn snapshot(&self) -> SyncRun {
        let status = self.lock_status();
        SyncRun {
            id: self.id,
            started_at: self.started_at,
            finished_at: status.finished_at,
            state: status.state,
        }
    }

    fn request_cancel(&self) -> bool {
        let status = self.lock_status();
        if status.state != RunState::Running {
            return false;
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        info!(run_id = %self.id, "cancellation requested");
        true
    }

    /// Tells a worker that outlived its run to stop the agent at its next poll.
    /// The run's terminal state is left as it is.
    fn stop_worker(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Performs the single terminal transition. Later calls leave the run untouched.
    fn finish(&self, outcome: Result<()>) -> RunState {
        let mut status = self.lock_status();
        if status.state != RunState::Running {
            if let Err(e) = outcome {
                debug!(run_id = %self.id, error = %e, "discarding outcome of a run that already ended");
            }
            return status.state;
        }

        let (state, event) = if self.cancel_requested.load(Ordering::SeqCst) {
            if let Err(e) = &outcome {
                info!(run_id = %self.id, error = %e, "agent failed after cancellation was requested");
            }
            (RunState::Cancelled, ProgressEvent::Cancelled)
        } else {
            match outcome {
                Ok(()) => (RunState::Succeeded, ProgressEvent::Completed),
                Err(e) => {
                    error!(run_id = %self.id, error = %e, "synchronization failed");
                    (
                        RunState::Failed,
                        ProgressEvent::Failed {
                            error: ErrorInfo::from(&e),
                        },
                    )
                }
            }
        };

        status.state = state;
        status.finished_at = Some(Local::now());
        if self.events.send(event).is_err() {
            debug!(run_id = %self.id, "observer went away before the terminal event");
        }
        self.events.close();
        info!(run_id = %self.id, state = ?state, "synchronization run finished");
        state
    }
}

/// Status callback handed to the provider for the duration of one run.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    run: Arc<RunShared>,
}

impl StatusReporter {
    /// Queues a progress event. Never blocks and never panics; events arriving
    /// after cancellation or after the run ended are dropped.
    pub fn report(&self, percent: f64, message: &str) {
        if self.is_cancelled() {
            debug!(run_id = %self.run.id, status_message = message, "dropping progress reported after cancellation");
            return;
        }
        let status = self.run.lock_status();
        if status.state != RunState::Running {
            debug!(run_id = %self.run.id, status_message = message, "dropping progress reported after the run ended");
            return;
        }
        let event = ProgressEvent::Progress {
            percent: clamp_percent(percent),
            message: message.to_string(),
        };
        if let Err(e) = self.run.events.send(event) {
            warn!(run_id = %self.run.id, error = %e, "could not queue progress event");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.cancel_requested.load(Ordering::SeqCst)
    }
}

fn clamp_percent(percent: f64) -> u8 {
    if percent.is_nan() {
        return 0;
    }
    percent.round().clamp(0.0, 100.0) as u8
}

/// Caller's view of a started run.
#[derive(Debug)]
pub struct RunHandle {
    run: Arc<RunShared>,
    events: ProgressReceiver,
    completion: JoinHandle<RunState>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.run.id
    }

    #[cfg(test)]
    pub fn state(&self) -> RunState {
        self.run.state()
    }

    pub fn snapshot(&self) -> SyncRun {
        self.run.snapshot()
    }

    /// Next event in emission order; `None` once the terminal event has been read.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Waits for the terminal transition and returns the final state.
    pub async fn wait(self) -> RunState {
        match self.completion.await {
            Ok(state) => state,
            Err(e) => {
                error!(run_id = %self.run.id, error = %e, "run supervisor aborted");
                self.run.finish(Err(worker_lost(e)))
            }
        }
    }
}

pub struct SyncController {
    provider: Arc<dyn SyncProvider>,
    current: Mutex<Option<Arc<RunShared>>>,
}

impl SyncController {
    pub fn new(provider: Arc<dyn SyncProvider>) -> Self {
        SyncController {
            provider,
            current: Mutex::new(None),
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Arc<RunShared>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts a run without blocking the caller. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self, config: SyncConfig) -> Result<RunHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Config(format!("no async runtime available: {}", e)))?;

        let (run, events) = {
            let mut current = self.lock_current();
            if let Some(active) = current.as_ref() {
                if active.state() == RunState::Running {
                    warn!(run_id = %active.id, "start rejected: a run is already in progress");
                    return Err(SyncError::AlreadyRunning);
                }
            }
            let (events, receiver) = progress_channel();
            let run = Arc::new(RunShared::new(events));
            *current = Some(run.clone());
            (run, receiver)
        };

        info!(
            run_id = %run.id,
            subscription = %config.subscription_label(),
            publication = %config.publication,
            "starting synchronization"
        );
        let completion = runtime.spawn(supervise(self.provider.clone(), config, run.clone()));

        Ok(RunHandle {
            run,
            events,
            completion,
        })
    }

    /// Best-effort cancellation of the run with id `run_id`. Returns `false`
    /// if that run is not current or has already ended.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.lock_current().as_ref() {
            Some(run) if run.id == run_id => run.request_cancel(),
            _ => false,
        }
    }

    /// State of the most recent run, or `Idle` if there is none.
    pub fn state(&self) -> RunState {
        self.lock_current()
            .as_ref()
            .map_or(RunState::Idle, |run| run.state())
    }

    #[cfg(test)]
    pub fn current_run(&self) -> Option<SyncRun> {
        self.lock_current().as_ref().map(|run| run.snapshot())
    }

    /// Forgets a finished run. Returns `false` if `handle` is not the current
    /// run or has not ended yet.
    pub fn acknowledge(&self, handle: &RunHandle) -> bool {
        let mut current = self.lock_current();
        match current.as_ref() {
            Some(run) if run.id == handle.id() && run.state().is_terminal() => {
                *current = None;
                true
            }
            _ => false,
        }
    }
}

async fn supervise(provider: Arc<dyn SyncProvider>, config: SyncConfig, run: Arc<RunShared>) -> RunState {
    let deadline = config.timeout;
    let reporter = StatusReporter { run: run.clone() };
    let worker = task::spawn_blocking(move || run_attempt(provider.as_ref(), &config, &reporter));

    let outcome = match deadline {
        Some(limit) => match time::timeout(limit, worker).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                warn!(run_id = %run.id, deadline = ?limit, "merge agent did not finish before the deadline");
                let state = run.finish(Err(SyncError::TimedOut(limit)));
                run.stop_worker();
                return state;
            }
        },
        None => flatten(worker.await),
    };
    run.finish(outcome)
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.unwrap_or_else(|e| Err(worker_lost(e)))
}

fn worker_lost(e: JoinError) -> SyncError {
    AgentError::new(None, format!("merge agent worker terminated unexpectedly: {}", e)).into()
}

/// Connect, check the subscription, synchronize, disconnect. Runs on the
/// blocking worker thread.
fn run_attempt(provider: &dyn SyncProvider, config: &SyncConfig, status: &StatusReporter) -> Result<()> {
    debug!(subscriber = %config.subscriber, "connecting to subscriber");
    let mut guard = SessionGuard::new(provider.connect(config)?);

    let outcome = synchronize_subscription(&mut guard, config, status);
    let teardown = guard.close();

    match (outcome, teardown) {
        (Ok(()), teardown) => teardown,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown_err)) => {
            warn!(error = %teardown_err, "disconnect failed after an unsuccessful run");
            Err(e)
        }
    }
}

fn synchronize_subscription(guard: &mut SessionGuard, config: &SyncConfig, status: &StatusReporter) -> Result<()> {
    let session = guard.session_mut();
    if !session.load_subscription_properties()? {
        return Err(SyncError::NotFound {
            publication: config.publication.clone(),
            subscriber: config.subscriber.clone(),
        });
    }
    if status.is_cancelled() {
        debug!("cancelled before the merge agent was started");
        return Ok(());
    }
    session.synchronize(status)?;
    Ok(())
}
