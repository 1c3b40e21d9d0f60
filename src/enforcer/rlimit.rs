//! POSIX rlimit enforcer (fallback for Unix hosts without cgroup v2)
//!
//! Best effort only. Limits are written into the child's rlimit table
//! *after* it has started, because setting them needs a live target and
//! this enforcer deliberately installs no pre-exec hook. Anything the child
//! allocates or forks before that point is not constrained. On Linux the
//! limits are applied with `prlimit(2)`; other Unix kernels offer no way to
//! change another process's limits, so the plan is logged and skipped.
//! Values above the child's hard limit are clamped to it, and each limit
//! is applied independently; the run is degraded only if none took effect.
//!
//! Memory exhaustion is inferred: a SIGKILL the sandbox did not send is
//! reported as `memory_exceeded`. A SIGKILL from any other source is
//! misclassified the same way.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::group::{new_group, ProcessGroup};
use super::Sandbox;
use crate::config::EffectiveConfig;
use crate::error::{Result, SandboxError};
use crate::monitor::{build_command, spawn};
use crate::outcome::{classify, Enforcement, Outcome, Termination};

/// A resource constrained through the rlimit table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// `RLIMIT_AS`: virtual address space in bytes
    AddressSpace,
    /// `RLIMIT_DATA`: data segment in bytes
    Data,
    /// `RLIMIT_NPROC`: processes for the child's real user id, system-wide
    Processes,
}

impl Limit {
    pub fn name(&self) -> &'static str {
        match self {
            Limit::AddressSpace => "RLIMIT_AS",
            Limit::Data => "RLIMIT_DATA",
            Limit::Processes => "RLIMIT_NPROC",
        }
    }
}

/// Soft and hard values to install for each limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlimitPlan {
    entries: Vec<(Limit, u64)>,
}

impl RlimitPlan {
    pub fn from_config(config: &EffectiveConfig) -> Self {
        let mut entries = Vec::new();
        if config.memory_limit > 0 {
            entries.push((Limit::AddressSpace, config.memory_limit));
            entries.push((Limit::Data, config.memory_limit));
        }
        if config.max_processes > 0 {
            entries.push((Limit::Processes, u64::from(config.max_processes)));
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[(Limit, u64)] {
        &self.entries
    }

    /// Install every entry on a running process. Each limit is applied on
    /// its own, so one refusal does not undo the others.
    pub fn apply_to(&self, pid: u32) -> Applied {
        let mut applied = Applied::default();
        for &(limit, value) in &self.entries {
            match set_limit(pid, limit, value) {
                Ok(installed) => {
                    if installed < value {
                        debug!(
                            "{}={} clamped to hard limit {} for pid {}",
                            limit.name(),
                            value,
                            installed,
                            pid
                        );
                    } else {
                        debug!("{}={} applied to pid {}", limit.name(), value, pid);
                    }
                    applied.limits.push((limit, installed));
                }
                Err(e) => applied.failures.push((limit, e)),
            }
        }
        applied
    }
}

/// What `RlimitPlan::apply_to` managed to install
#[derive(Debug, Default)]
pub struct Applied {
    /// Limits in force, with the value actually installed
    pub limits: Vec<(Limit, u64)>,
    pub failures: Vec<(Limit, SandboxError)>,
}

impl Applied {
    /// `Degraded` only when limits were wanted and none took effect
    pub fn enforcement(&self) -> Enforcement {
        if self.limits.is_empty() && !self.failures.is_empty() {
            Enforcement::Degraded(self.describe_failures())
        } else {
            Enforcement::BestEffort
        }
    }

    pub fn describe_failures(&self) -> String {
        self.failures
            .iter()
            .map(|(limit, e)| format!("{}: {}", limit.name(), e))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Returns the value installed, which is clamped to the target's current
/// hard limit: raising it needs CAP_SYS_RESOURCE.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_limit(pid: u32, limit: Limit, value: u64) -> Result<u64> {
    let resource = match limit {
        Limit::AddressSpace => libc::RLIMIT_AS,
        Limit::Data => libc::RLIMIT_DATA,
        Limit::Processes => libc::RLIMIT_NPROC,
    };
    let pid = pid as libc::pid_t;

    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: a null new-limit pointer only reads the current limits
    let ret = unsafe { libc::prlimit(pid, resource, std::ptr::null(), &mut current) };
    if ret != 0 {
        return Err(SandboxError::Io(std::io::Error::last_os_error()));
    }

    let value = (value as libc::rlim_t).min(current.rlim_max);
    let rlim = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: `rlim` outlives the call and the old-limit pointer may be null
    let ret = unsafe { libc::prlimit(pid, resource, &rlim, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(SandboxError::Io(std::io::Error::last_os_error()));
    }
    Ok(value as u64)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_limit(_pid: u32, limit: Limit, _value: u64) -> Result<u64> {
    Err(SandboxError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{} cannot be set on a running process on this platform", limit.name()),
    )))
}

/// Sandbox that relies on post-spawn rlimits and process groups
pub struct RlimitSandbox {
    config: EffectiveConfig,
    plan: RlimitPlan,
}

impl RlimitSandbox {
    pub fn new(config: EffectiveConfig) -> Self {
        let plan = RlimitPlan::from_config(&config);
        Self { config, plan }
    }
}

#[async_trait]
impl Sandbox for RlimitSandbox {
    async fn run(&mut self, cancel: &CancellationToken, command: &str, args: &[String]) -> Outcome {
        for warning in self.config.validate() {
            warn!("{}", warning);
        }

        let mut cmd = build_command(&self.config, command, args);
        new_group(&mut cmd);
        let running = match spawn(cmd, &self.config, command) {
            Ok(running) => running,
            Err(e) => return Outcome::failed(e, Enforcement::BestEffort),
        };

        let pid = running.id();
        let enforcement = match pid.map(|pid| self.plan.apply_to(pid)) {
            Some(applied) => {
                let enforcement = applied.enforcement();
                if !applied.failures.is_empty() {
                    if enforcement.is_degraded() {
                        warn!("rlimits not applied, running unenforced: {}", applied.describe_failures());
                    } else {
                        warn!("Some rlimits not applied: {}", applied.describe_failures());
                    }
                }
                enforcement
            }
            None => Enforcement::Degraded("child exited before limits were applied".to_string()),
        };

        let group = ProcessGroup::led_by(pid);
        let supervised = match running.supervise(&group, self.config.timeout, cancel).await {
            Ok(supervised) => supervised,
            Err(e) => return Outcome::failed(SandboxError::Io(e), enforcement),
        };

        let termination = classify(&supervised.status, supervised.killed);
        // The sandbox's own kills are already `Killed`, so this is a foreign SIGKILL
        let memory_exceeded = termination
            == Termination::Signaled {
                signal: libc::SIGKILL,
            };
        debug!(
            "{} finished: {:?} in {:?} (oom heuristic: {})",
            command, termination, supervised.elapsed, memory_exceeded
        );

        Outcome::completed(termination, supervised.elapsed, memory_exceeded, enforcement)
    }

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    fn config(&self) -> &EffectiveConfig {
        &self.config
    }
}
