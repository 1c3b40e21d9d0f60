//! proc_sandbox - Run a child process under OS-native resource limits
//!
//! The crate picks the enforcement mechanism the host offers:
//! - Linux: cgroup v2 (memory, CPU quota, pid count, OOM detection)
//! - Windows: job objects (per-process memory, active-process count)
//! - Other Unix: rlimits applied to the running child (best effort)
//!
//! Every backend shares one execution monitor, which races the child
//! against a wall-clock deadline and a `CancellationToken` and kills the
//! whole process tree when either fires.
//!
//! ```no_run
//! # async fn demo() -> proc_sandbox::Result<()> {
//! use proc_sandbox::{SandboxConfig, Sandbox};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = SandboxConfig::new().with_timeout(Duration::from_secs(2));
//! let mut sandbox = proc_sandbox::new(Some(config))?;
//! let args = vec!["-c".to_string(), "exit 7".to_string()];
//! let outcome = sandbox.run(&CancellationToken::new(), "sh", &args).await;
//! assert_eq!(outcome.exit_code, 7);
//! sandbox.cleanup()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod enforcer;
pub mod error;
mod monitor;
pub mod outcome;

pub use config::{
    resolve, CaptureBuffer, EffectiveConfig, Environment, Input, Output, SandboxConfig,
};
pub use enforcer::{new, Sandbox};
pub use error::{Result, SandboxError};
pub use outcome::{Enforcement, KillReason, Outcome, Termination, NO_EXIT_CODE};
