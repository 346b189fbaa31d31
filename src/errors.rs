//! Typed error hierarchy for the orchestrator.
//!
//! Two top-level enums cover the two subsystems:
//! - `LifecycleError` — provisioning and teardown of execution environments
//! - `WorkError` — per-work-item failures inside the worker control loop
//!
//! Lifecycle errors are fatal to the operation that raised them; work errors
//! are recorded on the message or group and never crash the loop.

use thiserror::Error;

/// Errors from provisioning, probing, or tearing down an environment.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Required environment variables absent from the supplied configuration.
    /// Detected before any process or machine is created.
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),

    #[error("Image build failed: {0}")]
    ImageBuild(String),

    /// The environment process exited before becoming healthy. Carries the
    /// tail of its output so the failure is diagnosable.
    #[error("Environment exited before becoming healthy:\n{log_tail}")]
    ExitedEarly { log_tail: String },

    /// Still running but never answered the health probe.
    #[error("Environment did not become healthy within {timeout_secs}s")]
    HealthTimeout { timeout_secs: u64 },

    #[error("No free port found in range {base}..{base_end}")]
    NoFreePort { base: u16, base_end: u16 },

    #[error("Container '{0}' not found in registry")]
    NotFound(String),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Machine API error: {0}")]
    Machine(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from one unit of work (message or backlog group).
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Agent exited with non-zero code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    /// The in-flight run was cancelled via `/interrupt` or `/stop`.
    #[error("Agent run was interrupted")]
    Interrupted,

    #[error("Agent stream ended without a result event")]
    MissingResult,

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_lists_variables() {
        let err = LifecycleError::MissingEnv(vec!["API_KEY".into(), "REPO_URL".into()]);
        let msg = err.to_string();
        assert!(msg.contains("API_KEY"));
        assert!(msg.contains("REPO_URL"));
    }

    #[test]
    fn exited_early_carries_log_tail() {
        let err = LifecycleError::ExitedEarly {
            log_tail: "panic: clone failed".into(),
        };
        assert!(err.to_string().contains("clone failed"));
    }

    #[test]
    fn work_error_interrupted_is_matchable() {
        let err = WorkError::Interrupted;
        assert!(matches!(err, WorkError::Interrupted));
    }

    #[test]
    fn non_zero_exit_carries_code_and_stderr() {
        let err = WorkError::NonZeroExit {
            exit_code: 2,
            stderr: "boom".into(),
        };
        match &err {
            WorkError::NonZeroExit { exit_code, stderr } => {
                assert_eq!(*exit_code, 2);
                assert_eq!(stderr, "boom");
            }
            _ => panic!("Expected NonZeroExit"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&LifecycleError::NotFound("x".into()));
        assert_std_error(&WorkError::Interrupted);
    }
}
