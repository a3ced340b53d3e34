use anyhow::{Context, Result};
use std::path::PathBuf;
use which::which;

/// Finds the merge agent executable, either by absolute path or in the system PATH.
pub fn find_agent_executable(program: &str) -> Result<PathBuf> {
    which(program).with_context(|| {
        format!(
            "{} executable not found. Please ensure the replication merge agent is installed and in your PATH, or set agent.program in config.json.",
            program
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_agent_executable_is_reported() {
        let err = find_agent_executable("replsync-no-such-agent-binary").unwrap_err();
        assert!(err.to_string().contains("replsync-no-such-agent-binary executable not found"));
    }
}
