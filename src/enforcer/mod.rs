//! Enforcer module - Per-platform resource-limit backends
//!
//! Each backend implements `Sandbox` and owns at most one enforcement
//! handle:
//! - `CgroupSandbox`: cgroup v2 directory (Linux)
//! - `JobSandbox`: kernel job object (Windows)
//! - `RlimitSandbox`: post-spawn rlimits and a process group (other Unix)
//!
//! The backend is chosen once, in `new`, from the host platform.
//!
//! No backend does:
//! - Network or filesystem isolation
//! - Syscall filtering
//! - Concurrent runs on one instance (`run` takes `&mut self`)

#[cfg(target_os = "linux")]
pub mod cgroup;
#[cfg(unix)]
mod group;
#[cfg(windows)]
pub mod job;
#[cfg(unix)]
pub mod rlimit;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{resolve, EffectiveConfig, SandboxConfig};
use crate::error::Result;
use crate::outcome::Outcome;

#[cfg(target_os = "linux")]
pub use cgroup::CgroupSandbox;
#[cfg(windows)]
pub use job::{JobSandbox, Kernel32};
#[cfg(unix)]
pub use rlimit::RlimitSandbox;

/// A child-process runner with resource limits
#[async_trait]
pub trait Sandbox: Send {
    /// Run `command` with `args` to completion, timeout or cancellation.
    ///
    /// Never returns early: spawn and setup failures are reported through
    /// `Outcome::error`. Cancelling `cancel` kills the whole process tree.
    async fn run(&mut self, cancel: &CancellationToken, command: &str, args: &[String]) -> Outcome;

    /// Release the enforcement handle. Safe to call any number of times,
    /// including when `run` was never called.
    fn cleanup(&mut self) -> Result<()>;

    /// Configuration every run uses
    fn config(&self) -> &EffectiveConfig;
}

/// Create the sandbox for this platform; `None` uses all defaults
pub fn new(config: Option<SandboxConfig>) -> Result<Box<dyn Sandbox>> {
    let effective = resolve(config.as_ref());
    debug!(
        "Sandbox limits: cpu={}% memory={} bytes timeout={:?} max_processes={}",
        effective.cpu_limit, effective.memory_limit, effective.timeout, effective.max_processes
    );
    platform_sandbox(effective)
}

#[cfg(target_os = "linux")]
fn platform_sandbox(config: EffectiveConfig) -> Result<Box<dyn Sandbox>> {
    Ok(Box::new(CgroupSandbox::new(config)))
}

#[cfg(windows)]
fn platform_sandbox(config: EffectiveConfig) -> Result<Box<dyn Sandbox>> {
    Ok(Box::new(JobSandbox::new(config, Kernel32::bind())))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn platform_sandbox(config: EffectiveConfig) -> Result<Box<dyn Sandbox>> {
    Ok(Box::new(RlimitSandbox::new(config)))
}

#[cfg(not(any(unix, windows)))]
fn platform_sandbox(_config: EffectiveConfig) -> Result<Box<dyn Sandbox>> {
    Err(crate::error::SandboxError::Config(
        "no sandbox backend for this platform".to_string(),
    ))
}
