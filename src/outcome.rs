//! Outcome of a sandboxed run and the exit-status classifier
//!
//! The classifier keeps three cases apart:
//! - the program exited on its own (its exit code is reported as-is)
//! - the program died from a signal it did not expect (`128 + signal`)
//! - the sandbox killed it (timeout or cancellation; exit code `-1`, the
//!   reason lives in `timed_out` / `termination`)

use serde::{Serialize, Serializer};
use std::process::ExitStatus;
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Exit code reported when the program never produced one of its own
pub const NO_EXIT_CODE: i32 = -1;

/// Why the sandbox killed the process tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    Timeout,
    Cancelled,
}

/// How the child's run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// Program exited normally with given exit code
    Exited { code: i32 },
    /// Killed by a signal the sandbox did not send
    Signaled { signal: i32 },
    /// Killed by the sandbox
    Killed { reason: KillReason },
    /// Never spawned (setup or spawn failure)
    NotStarted,
}

impl Termination {
    /// Caller-visible exit code
    pub fn exit_code(&self) -> i32 {
        match *self {
            Termination::Exited { code } => code,
            Termination::Signaled { signal } => 128 + signal,
            Termination::Killed { .. } | Termination::NotStarted => NO_EXIT_CODE,
        }
    }
}

/// Which isolation mechanism actually constrained the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "reason", rename_all = "snake_case")]
pub enum Enforcement {
    /// Limits were attached through a kernel primitive (cgroup, job object)
    Active,
    /// Limits were applied after start with reduced effect (rlimits)
    BestEffort,
    /// No limits could be applied; the run proceeded unenforced
    Degraded(String),
}

impl Enforcement {
    pub fn is_active(&self) -> bool {
        matches!(self, Enforcement::Active)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Enforcement::Degraded(_))
    }
}

/// Result of one `Sandbox::run` call
#[derive(Debug, Serialize)]
pub struct Outcome {
    pub exit_code: i32,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub termination: Termination,
    pub enforcement: Enforcement,
    /// Set only when the child could not be run at all
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SandboxError>,
}

impl Outcome {
    /// Outcome for a run that never got a child process
    pub(crate) fn failed(error: SandboxError, enforcement: Enforcement) -> Self {
        Self {
            exit_code: NO_EXIT_CODE,
            elapsed: Duration::ZERO,
            timed_out: false,
            memory_exceeded: false,
            termination: Termination::NotStarted,
            enforcement,
            error: Some(error),
        }
    }

    /// Outcome for a child that was spawned and reaped
    pub(crate) fn completed(
        termination: Termination,
        elapsed: Duration,
        memory_exceeded: bool,
        enforcement: Enforcement,
    ) -> Self {
        Self {
            exit_code: termination.exit_code(),
            elapsed,
            timed_out: termination
                == Termination::Killed {
                    reason: KillReason::Timeout,
                },
            memory_exceeded,
            termination,
            enforcement,
            error: None,
        }
    }

    /// Program exited on its own with code 0
    pub fn is_success(&self) -> bool {
        self.termination == Termination::Exited { code: 0 }
    }

    /// True when the sandbox itself ended the process
    pub fn killed_by_sandbox(&self) -> bool {
        matches!(self.termination, Termination::Killed { .. })
    }

    /// Move a carried error into `Err`, for callers that prefer `?`
    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Classify a reaped child's status.
///
/// `killed` is the sandbox's own kill, if it sent one; it takes precedence
/// over whatever the status says so that a forced kill is never reported as
/// the program's own exit code.
pub fn classify(status: &ExitStatus, killed: Option<KillReason>) -> Termination {
    if let Some(reason) = killed {
        return Termination::Killed { reason };
    }
    if let Some(code) = status.code() {
        return Termination::Exited { code };
    }
    match termination_signal(status) {
        Some(signal) => Termination::Signaled { signal },
        None => Termination::Exited { code: NO_EXIT_CODE },
    }
}

#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

fn serialize_error<S: Serializer>(
    err: &Option<SandboxError>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match err {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}
