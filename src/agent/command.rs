// replsync/src/agent/command.rs
//! Runs the external merge agent executable for a pull subscription and turns
//! its console output into status callbacks.

use regex::Regex;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, SecurityMode, SyncConfig};
use crate::errors::{AgentError, Result, SyncError};
use crate::sync::controller::StatusReporter;
use crate::sync::provider::{ProviderSession, SyncProvider};
use crate::utils::find_agent_executable;

// Pull subscription, as understood by -SubscriptionType.
const PULL_SUBSCRIPTION: &str = "1";

const AGENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

static PERCENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("percent pattern is valid")
});

/// Extracts a completion percentage such as `45%` from an agent output line.
pub fn parse_percent(line: &str) -> Option<f64> {
    PERCENT_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|p| *p <= 100.0)
}

/// Builds the merge agent command line for `config`.
pub fn build_agent_args(config: &SyncConfig, extra_args: &[String]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-Publisher".into(),
        config.publisher.clone(),
        "-PublisherDB".into(),
        config.publication_db.clone(),
        "-Publication".into(),
        config.publication.clone(),
        "-Subscriber".into(),
        config.subscriber.clone(),
        "-SubscriberDB".into(),
        config.subscription_db.clone(),
        "-SubscriptionType".into(),
        PULL_SUBSCRIPTION.into(),
        "-Distributor".into(),
        config.distributor.clone(),
    ];

    push_security_args(&mut args, "Publisher", &config.publisher_security);
    push_security_args(&mut args, "Distributor", &config.distributor_security);

    args.push("-OutputVerboseLevel".into());
    args.push(config.output_verbose_level.to_string());
    if let Some(path) = &config.output_log_path {
        args.push("-Output".into());
        args.push(path.display().to_string());
    }

    args.extend(extra_args.iter().cloned());
    args
}

fn push_security_args(args: &mut Vec<String>, role: &str, mode: &SecurityMode) {
    args.push(format!("-{}SecurityMode", role));
    args.push(mode.agent_flag().into());
    if let SecurityMode::Standard { login, password } = mode {
        args.push(format!("-{}Login", role));
        args.push(login.clone());
        args.push(format!("-{}Password", role));
        args.push(password.clone());
    }
}

pub struct AgentCommandProvider {
    agent: AgentConfig,
}

impl AgentCommandProvider {
    pub fn new(agent: AgentConfig) -> Self {
        AgentCommandProvider { agent }
    }
}

impl SyncProvider for AgentCommandProvider {
    fn connect(&self, config: &SyncConfig) -> Result<Box<dyn ProviderSession>> {
        let program = find_agent_executable(&self.agent.program).map_err(|e| SyncError::ConnectionFailed {
            subscriber: config.subscriber.clone(),
            reason: format!("{:#}", e),
        })?;
        info!(agent = %program.display(), "using merge agent");

        Ok(Box::new(AgentSession {
            program,
            args: build_agent_args(config, &self.agent.extra_args),
            check_args: self.agent.check_args.clone(),
            subscriber: config.subscriber.clone(),
        }))
    }
}

struct AgentSession {
    program: PathBuf,
    args: Vec<String>,
    check_args: Option<Vec<String>>,
    subscriber: String,
}

/// Feeds every non-blank line of `reader` to `on_line`, decoding lossily so a
/// stray non-UTF-8 byte never ends the stream early.
fn for_each_line<R: Read>(reader: R, mut on_line: impl FnMut(&str)) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.is_empty() {
                    on_line(line);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "failed to read merge agent output");
                break;
            }
        }
    }
}

/// Waits for the agent, killing it as soon as the run asks to stop.
/// Returns the exit status and whether the agent was killed.
fn watch_agent(mut child: Child, status: StatusReporter) -> std::io::Result<(ExitStatus, bool)> {
    let mut stopped = false;
    loop {
        if let Some(exit) = child.try_wait()? {
            return Ok((exit, stopped));
        }
        if !stopped && status.is_cancelled() {
            if let Err(e) = child.kill() {
                warn!(error = %e, "failed to stop merge agent after cancellation");
            }
            stopped = true;
        }
        thread::sleep(AGENT_POLL_INTERVAL);
    }
}

impl ProviderSession for AgentSession {
    fn load_subscription_properties(&mut self) -> Result<bool> {
        let Some(check_args) = &self.check_args else {
            return Ok(true);
        };
        let status = Command::new(&self.program)
            .args(check_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| SyncError::ConnectionFailed {
                subscriber: self.subscriber.clone(),
                reason: format!("Failed to run subscription check {}: {}", self.program.display(), e),
            })?;
        debug!(status = %status, "subscription check finished");
        Ok(status.success())
    }

    fn synchronize(&mut self, status: &StatusReporter) -> std::result::Result<(), AgentError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::new(None, format!("Failed to start merge agent {}: {}", self.program.display(), e)))?;

        // Drain stderr on its own thread so a chatty agent cannot stall on a full pipe.
        let stderr_reader = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut last = None;
                for_each_line(stderr, |line| last = Some(line.to_string()));
                last
            })
        });
        let stdout = child.stdout.take();
        let watcher = {
            let status = status.clone();
            thread::spawn(move || watch_agent(child, status))
        };

        let mut percent = 0.0;
        let mut last_line = None;
        if let Some(stdout) = stdout {
            // Keep draining after a stop request so the agent never sees a closed pipe.
            for_each_line(stdout, |line| {
                if let Some(p) = parse_percent(line) {
                    percent = p;
                }
                status.report(percent, line);
                last_line = Some(line.to_string());
            });
        }

        let (exit, stopped) = watcher
            .join()
            .map_err(|_| AgentError::new(None, "Merge agent watcher thread panicked"))?
            .map_err(|e| AgentError::new(None, format!("Failed to wait for merge agent: {}", e)))?;
        let last_error_line = stderr_reader.and_then(|reader| reader.join().ok().flatten());

        if stopped {
            return Err(AgentError::new(None, "The merge agent was stopped at the user's request."));
        }
        if !exit.success() {
            let message = last_error_line
                .or(last_line)
                .unwrap_or_else(|| format!("Merge agent exited with {}", exit));
            return Err(AgentError::new(exit.code().map(i64::from), message));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        // The agent owns its own connections; nothing outlives the child process.
        Ok(())
    }
}
