// replsync/src/sync/channel.rs
//! Ordered single-producer/single-consumer stream of progress events.
//!
//! The producer side never blocks: the buffer is unbounded, so a worker thread
//! stuck inside the merge agent can never deadlock on a slow observer.

use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
#[cfg(test)]
use tokio::sync::mpsc::error::TryRecvError;

use crate::errors::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    ConnectionFailed,
    ProviderFailure,
    TimedOut,
}

/// Serializable summary of the error that ended a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: FailureKind,
    pub code: Option<i64>,
    pub message: String,
}

impl From<&SyncError> for ErrorInfo {
    fn from(err: &SyncError) -> Self {
        let (kind, code) = match err {
            SyncError::NotFound { .. } => (FailureKind::NotFound, None),
            SyncError::ConnectionFailed { .. } => (FailureKind::ConnectionFailed, None),
            SyncError::ProviderFailure { code, .. } => (FailureKind::ProviderFailure, *code),
            SyncError::TimedOut(_) => (FailureKind::TimedOut, None),
            // Anything else escaping the worker boundary is still the agent's failure.
            SyncError::AlreadyRunning | SyncError::Config(_) | SyncError::Io(_) => {
                (FailureKind::ProviderFailure, None)
            }
        };
        ErrorInfo {
            kind,
            code,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress { percent: u8, message: String },
    Completed,
    Failed { error: ErrorInfo },
    Cancelled,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Progress { percent, message } => write!(f, "[{:>3}%] {}", percent, message),
            ProgressEvent::Completed => write!(f, "Done!"),
            ProgressEvent::Failed { error } => write!(f, "Error: {}", error.message),
            ProgressEvent::Cancelled => write!(f, "Canceled!"),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("progress channel is closed")]
pub struct ChannelClosed;

/// Creates a connected sender/receiver pair.
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressSender {
            inner: Mutex::new(Some(tx)),
        },
        ProgressReceiver { rx },
    )
}

#[derive(Debug)]
pub struct ProgressSender {
    inner: Mutex<Option<UnboundedSender<ProgressEvent>>>,
}

impl ProgressSender {
    fn lock(&self) -> MutexGuard<'_, Option<UnboundedSender<ProgressEvent>>> {
        // A poisoned lock still holds a usable sender slot.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn send(&self, event: ProgressEvent) -> Result<(), ChannelClosed> {
        match self.lock().as_ref() {
            Some(tx) => tx.send(event).map_err(|_| ChannelClosed),
            None => Err(ChannelClosed),
        }
    }

    /// Closes the channel. Events already sent stay readable.
    pub fn close(&self) {
        self.lock().take();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}

#[derive(Debug)]
pub struct ProgressReceiver {
    rx: UnboundedReceiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// Waits for the next event. `None` means closed and drained, forever after.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Thread-model receive. Must not be called from inside an async context.
    #[cfg(test)]
    pub fn blocking_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.blocking_recv()
    }

    /// `Ok(None)` means nothing is queued yet; `Err(ChannelClosed)` means drained and closed.
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Result<Option<ProgressEvent>, ChannelClosed> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(percent: u8, message: &str) -> ProgressEvent {
        ProgressEvent::Progress {
            percent,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_send_order() {
        let (tx, mut rx) = progress_channel();
        let sent: Vec<ProgressEvent> = (0..=100u8)
            .step_by(10)
            .map(|p| progress(p, &format!("step {}", p)))
            .collect();

        for event in &sent {
            tx.send(event.clone()).unwrap();
        }
        tx.close();

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_closed_is_returned_forever_after_drain() {
        let (tx, mut rx) = progress_channel();
        tx.send(ProgressEvent::Completed).unwrap();
        tx.close();

        assert_eq!(rx.recv().await, Some(ProgressEvent::Completed));
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.try_recv(), Err(ChannelClosed));
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_sends() {
        let (tx, mut rx) = progress_channel();
        tx.send(progress(0, "Connecting to Publisher")).unwrap();
        tx.close();
        tx.close();

        assert!(tx.is_closed());
        assert_eq!(tx.send(ProgressEvent::Completed), Err(ChannelClosed));
        assert_eq!(rx.blocking_recv(), Some(progress(0, "Connecting to Publisher")));
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn test_try_recv_distinguishes_empty_from_closed() {
        let (tx, mut rx) = progress_channel();
        assert_eq!(rx.try_recv(), Ok(None));

        tx.send(ProgressEvent::Cancelled).unwrap();
        assert_eq!(rx.try_recv(), Ok(Some(ProgressEvent::Cancelled)));

        tx.close();
        assert_eq!(rx.try_recv(), Err(ChannelClosed));
    }

    #[test]
    fn test_send_after_receiver_dropped_reports_closed() {
        let (tx, rx) = progress_channel();
        drop(rx);
        assert_eq!(tx.send(ProgressEvent::Completed), Err(ChannelClosed));
    }

    #[test]
    fn test_producer_on_another_thread_keeps_order() {
        let (tx, mut rx) = progress_channel();
        let producer = std::thread::spawn(move || {
            for p in 0..=100u8 {
                tx.send(progress(p, "tick")).unwrap();
            }
            tx.close();
        });

        let mut last = None;
        let mut count = 0;
        while let Some(ProgressEvent::Progress { percent, .. }) = rx.blocking_recv() {
            if let Some(prev) = last {
                assert!(percent > prev);
            }
            last = Some(percent);
            count += 1;
        }
        producer.join().unwrap();
        assert_eq!(count, 101);
    }

    #[test]
    fn test_terminal_events_and_display() {
        let failed = ProgressEvent::Failed {
            error: ErrorInfo::from(&SyncError::NotFound {
                publication: "TestMergePub1".to_string(),
                subscriber: "PACIFIC\\SQLEXPRESS".to_string(),
            }),
        };

        assert!(!progress(50, "x").is_terminal());
        assert!(ProgressEvent::Completed.is_terminal());
        assert!(ProgressEvent::Cancelled.is_terminal());
        assert!(failed.is_terminal());

        assert_eq!(progress(5, "Uploading changes").to_string(), "[  5%] Uploading changes");
        assert_eq!(ProgressEvent::Completed.to_string(), "Done!");
        assert_eq!(ProgressEvent::Cancelled.to_string(), "Canceled!");
        assert_eq!(
            failed.to_string(),
            "Error: A subscription to 'TestMergePub1' does not exist on PACIFIC\\SQLEXPRESS"
        );
    }

    #[test]
    fn test_events_serialize_as_tagged_json() -> anyhow::Result<()> {
        let value = serde_json::to_value(progress(50, "Downloading changes"))?;
        assert_eq!(
            value,
            serde_json::json!({ "event": "progress", "percent": 50, "message": "Downloading changes" })
        );

        let value = serde_json::to_value(ProgressEvent::Failed {
            error: ErrorInfo {
                kind: FailureKind::TimedOut,
                code: None,
                message: "late".to_string(),
            },
        })?;
        assert_eq!(value["event"], "failed");
        assert_eq!(value["error"]["kind"], "timed_out");
        Ok(())
    }
}
