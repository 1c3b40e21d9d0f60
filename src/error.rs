//! Error types for sandbox operations
//!
//! Resource-limit violations are never errors: timeouts and memory
//! exhaustion are reported through `Outcome` flags. Errors are reserved for
//! conditions that stop the child from running at all, plus cleanup and
//! configuration problems.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur during sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The child could not be started (not found, permission denied, ...)
    #[error("failed to start process {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Job object creation, configuration or assignment failed
    #[error("job object setup failed: {0}")]
    JobSetup(String),

    /// A cgroup control file could not be written or read
    #[error("cgroup error at {}: {source}", path.display())]
    Cgroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Releasing the enforcement resource failed
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    /// Configuration could not be parsed
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SandboxError {
    pub(crate) fn spawn(command: &str, source: io::Error) -> Self {
        SandboxError::Spawn {
            command: command.to_string(),
            source,
        }
    }

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pub(crate) fn cgroup(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SandboxError::Cgroup {
            path: path.into(),
            source,
        }
    }
}
