use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = GateError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("setup failure: {0}")]
    Setup(String),

    #[error("duplicate stage name in plan: {0}")]
    DuplicateStage(String),

    #[error("stage plan error: {0}")]
    Plan(String),

    #[error("stage {stage} failed with exit code {exit_code} (log: {})", .log_path.display())]
    StageFailed {
        stage: String,
        exit_code: i32,
        log_path: PathBuf,
    },

    #[error("failed to start instance {label}: {detail}")]
    Launch { label: String, detail: String },

    #[error("instance at {endpoint} did not become ready within {deadline_secs}s")]
    ReadinessTimeout { endpoint: String, deadline_secs: u64 },

    #[error("unexpected response from {operation}: {detail}")]
    UnexpectedResponse { operation: String, detail: String },

    #[error("search on {collection} returned no hits")]
    SearchEmpty { collection: String },

    #[error(
        "persistence violation on {collection}: expected at least {expected} records after restart, observed {observed}"
    )]
    PersistenceViolation {
        collection: String,
        expected: u64,
        observed: u64,
    },

    #[error("snapshot file did not appear: {}", .0.display())]
    SnapshotMissing(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GateError {
    pub fn unexpected(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        GateError::UnexpectedResponse {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Process exit status the CLI should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            GateError::StageFailed { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_keeps_its_exit_code() {
        let err = GateError::StageFailed {
            stage: "build".to_string(),
            exit_code: 101,
            log_path: PathBuf::from("/tmp/build.log"),
        };
        assert_eq!(err.exit_code(), 101);
        assert!(err.to_string().contains("stage build failed"));
    }

    #[test]
    fn non_stage_errors_exit_one() {
        assert_eq!(GateError::Setup("no docker".into()).exit_code(), 1);
        let violation = GateError::PersistenceViolation {
            collection: "c".into(),
            expected: 3,
            observed: 1,
        };
        assert_eq!(violation.exit_code(), 1);
        assert!(violation.to_string().contains("observed 1"));
    }
}
