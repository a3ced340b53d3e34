use std::time::Duration;

use thiserror::Error;

/// Failure reported by the external merge agent while it synchronizes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AgentError {
    pub code: Option<i64>,
    pub message: String,
}

impl AgentError {
    pub fn new(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("A subscription to '{publication}' does not exist on {subscriber}")]
    NotFound {
        publication: String,
        subscriber: String,
    },

    #[error("Could not connect to subscriber {subscriber}: {reason}")]
    ConnectionFailed { subscriber: String, reason: String },

    #[error(
        "The subscription could not be synchronized. Verify that the subscription has been defined correctly. ({source})"
    )]
    ProviderFailure {
        code: Option<i64>,
        #[source]
        source: AgentError,
    },

    #[error("A synchronization run is already in progress")]
    AlreadyRunning,

    #[error("Synchronization did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AgentError> for SyncError {
    fn from(source: AgentError) -> Self {
        SyncError::ProviderFailure {
            code: source.code,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_failure_keeps_agent_message_and_code() {
        let err: SyncError = AgentError::new(Some(20046), "The merge process failed").into();

        match &err {
            SyncError::ProviderFailure { code, source } => {
                assert_eq!(*code, Some(20046));
                assert_eq!(source.message, "The merge process failed");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("could not be synchronized"));
        assert!(err.to_string().contains("The merge process failed"));
    }

    #[test]
    fn test_timed_out_message_keeps_sub_second_deadlines() {
        assert_eq!(
            SyncError::TimedOut(Duration::from_millis(200)).to_string(),
            "Synchronization did not finish within 200ms"
        );
        assert_eq!(
            SyncError::TimedOut(Duration::from_secs(90)).to_string(),
            "Synchronization did not finish within 90s"
        );
    }

    #[test]
    fn test_not_found_message_names_publication_and_subscriber() {
        let err = SyncError::NotFound {
            publication: "TestMergePub1".to_string(),
            subscriber: "PACIFIC\\SQLEXPRESS".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "A subscription to 'TestMergePub1' does not exist on PACIFIC\\SQLEXPRESS"
        );
    }
}
