//! Error types for the harness.
//!
//! Configuration problems, port exhaustion, startup failures and script
//! failures are always surfaced to the caller. Shutdown failures never show
//! up here; they are collected in a [`crate::shutdown::ShutdownReport`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::ports::PortName;

/// Top-level error returned by every fallible harness operation.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(
        "An embedded instance is already listening on {name} port '{bound}', \
         the requested {name} port '{requested}' does not match"
    )]
    PortConflict {
        name: PortName,
        bound: u16,
        requested: i64,
    },

    #[error("No available port found between {start} and {end} after {attempts} attempts")]
    ResourceExhausted { start: u16, end: u16, attempts: u32 },

    #[error("Engine did not signal readiness within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    #[error("Engine startup failed: {0}")]
    StartupFailed(String),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("Session error: {0:#}")]
    Session(#[source] anyhow::Error),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `true` for errors that leave the process unable to start an engine again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StartupTimeout { .. } | Self::StartupFailed(_) | Self::PortConflict { .. }
        )
    }
}

/// Failures while loading, tokenizing or replaying a CQL script.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Cannot find value for variable ${{{0}}} in the provided template variables")]
    MissingVariable(String),

    #[error("Cannot find CQL script file at location '{0}'")]
    ResourceNotFound(String),

    #[error("Cannot read CQL script '{}': {source}", path.display())]
    ResourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unterminated {mode} at end of script: '{fragment}'")]
    Unterminated { mode: &'static str, fragment: String },

    #[error("Statement {index} of '{location}' failed: {statement}")]
    Execution {
        location: String,
        index: usize,
        statement: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_conflict_message() {
        let err = HarnessError::PortConflict {
            name: PortName::Cql,
            bound: 9042,
            requested: 9043,
        };
        let msg = err.to_string();
        assert!(msg.contains("'9042'"), "{msg}");
        assert!(msg.contains("'9043'"), "{msg}");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_variable_message() {
        let err = HarnessError::from(ScriptError::MissingVariable("id".into()));
        assert!(err.to_string().contains("${id}"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_exhaustion_reports_attempts() {
        let err = HarnessError::ResourceExhausted {
            start: 7001,
            end: 7001,
            attempts: 100,
        };
        assert!(err.to_string().contains("after 100 attempts"));
    }
}
