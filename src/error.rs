//! Error taxonomy for the integration pipeline
//!
//! Component errors are typed so that phases can decide between partial and
//! fatal outcomes. The runner and CLI wrap them with `anyhow` context.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid environment input, raised before any work starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: '{value}' (accepted values: {})", .accepted.join(", "))]
    InvalidValue {
        key: &'static str,
        value: String,
        accepted: &'static [&'static str],
    },

    #[error("invalid {key}: '{value}': {reason}")]
    Malformed {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("missing {key}: {reason}")]
    Missing { key: &'static str, reason: String },

    #[error("conflicting {key}: {reason}")]
    Conflict { key: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(
        key: &'static str,
        value: &str,
        accepted: &'static [&'static str],
    ) -> Self {
        ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            accepted,
        }
    }
}

/// Why a blocking call stopped before completing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// A concurrent unit panicked instead of reporting an outcome
#[derive(Debug, Clone, Error)]
#[error("worker for '{name}' panicked: {message}")]
pub struct WorkerPanic {
    pub name: String,
    pub message: String,
}

/// Failure of an external job
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("entry point for job '{job}' not found at {}", .path.display())]
    NotFound { job: String, path: PathBuf },

    #[error("failed to spawn job '{job}'")]
    Spawn {
        job: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job '{job}' exited with {}", exit_description(.code))]
    NonZeroExit { job: String, code: Option<i32> },

    #[error("job '{job}' interrupted: {reason}")]
    Interrupted { job: String, reason: Interrupted },

    /// Failure reported by an in-process task
    #[cfg_attr(not(test), allow(dead_code))]
    #[error("job '{job}' failed: {message}")]
    Failed { job: String, message: String },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// Failure of an object store call
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("{operation} failed for '{key}': {message}")]
    Backend {
        operation: &'static str,
        key: String,
        message: String,
    },
}

/// Failure to gather one source into its destination directory
#[derive(Debug, Error)]
pub enum GatherError {
    #[error("source directory {} does not exist for '{source_name}'", .path.display())]
    MissingDirectory { source_name: String, path: PathBuf },

    #[error("no files found in {} for '{source_name}'", .path.display())]
    EmptyDirectory { source_name: String, path: PathBuf },

    #[error("no objects found under '{prefix}' for '{source_name}'")]
    EmptyPrefix { source_name: String, prefix: String },

    #[error("{operation} failed for '{source_name}' at {}", .path.display())]
    Io {
        source_name: String,
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote fetch failed for '{source_name}'")]
    Store {
        source_name: String,
        #[source]
        source: StoreError,
    },

    #[error("gather of '{source_name}' interrupted: {reason}")]
    Interrupted {
        source_name: String,
        reason: Interrupted,
    },

    #[error(transparent)]
    Panicked(#[from] WorkerPanic),
}

/// Failure to publish one named output
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("nothing uploaded for '{name}' from {} ({attempted} file(s) attempted)", .dir.display())]
    NothingUploaded {
        name: String,
        dir: PathBuf,
        attempted: usize,
    },

    #[error("publish of '{name}' interrupted: {reason}")]
    Interrupted { name: String, reason: Interrupted },

    #[error(transparent)]
    Panicked(#[from] WorkerPanic),
}

/// Pipeline phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Refresh,
    RefreshPublish,
    Gather,
    Transform,
    Publish,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Refresh => "refresh",
            Phase::RefreshPublish => "refresh publish",
            Phase::Gather => "gather",
            Phase::Transform => "transform",
            Phase::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// Some, not all, units of a fan-out failed. Logged, never fatal.
#[derive(Debug, Clone)]
pub struct PartialFailure {
    pub phase: Phase,
    pub total: usize,
    pub failed: Vec<String>,
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} phase: {}/{} unit(s) failed: {}",
            self.phase,
            self.failed.len(),
            self.total,
            self.failed.join(", ")
        )
    }
}

/// A failure that halts the pipeline before later phases run
#[derive(Debug, Error)]
#[error(
    "{phase} phase failed: {}/{total} unit(s) failed ({}); first error: {first}",
    .failed.len(),
    .failed.join(", ")
)]
pub struct FatalFailure {
    pub phase: Phase,
    pub total: usize,
    pub failed: Vec<String>,
    #[source]
    pub first: Box<dyn std::error::Error + Send + Sync>,
}

/// Terminal error surfaced by the orchestrator
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("source mode '{0}' needs a remote object store but none was configured")]
    StoreUnavailable(crate::config::SourceMode),

    #[error(transparent)]
    Fatal(#[from] FatalFailure),
}

impl PipelineError {
    /// Phase that failed, if the error came from a running pipeline
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn phase(&self) -> Option<Phase> {
        match self {
            PipelineError::Fatal(fatal) => Some(fatal.phase),
            _ => None,
        }
    }
}

/// Render an error followed by its chain of causes, for log lines
pub fn display_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        rendered.push_str(": ");
        rendered.push_str(&inner.to_string());
        cause = inner.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_chain_includes_causes() {
        let err = GatherError::Store {
            source_name: "grades".to_string(),
            source: StoreError::NotFound("grades/a.csv".to_string()),
        };
        assert_eq!(
            display_chain(&err),
            "remote fetch failed for 'grades': object 'grades/a.csv' not found"
        );
    }

    #[test]
    fn test_fatal_failure_names_failed_units() {
        let fatal = FatalFailure {
            phase: Phase::Gather,
            total: 3,
            failed: vec!["b".to_string()],
            first: Box::new(GatherError::EmptyDirectory {
                source_name: "b".to_string(),
                path: PathBuf::from("scripts/b/out"),
            }),
        };
        let message = fatal.to_string();
        assert!(message.starts_with("gather phase failed: 1/3"));
        assert!(message.contains("(b)"));
        assert!(message.contains("no files found in scripts/b/out for 'b'"));
    }

    #[test]
    fn test_exit_code_rendering() {
        let err = ExecutionError::NonZeroExit {
            job: "grades".to_string(),
            code: Some(2),
        };
        assert_eq!(err.to_string(), "job 'grades' exited with exit code 2");

        let err = ExecutionError::NonZeroExit {
            job: "grades".to_string(),
            code: None,
        };
        assert!(err.to_string().contains("terminated by signal"));
    }
}
