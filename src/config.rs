//! Sandbox configuration
//!
//! A `SandboxConfig` is the sparse, caller-facing limit specification: any
//! zero or unset field means "use the default". `resolve` turns it into an
//! `EffectiveConfig` with every field populated. Resolution only fills in
//! defaults; out-of-range values pass through unchanged and are reported by
//! `EffectiveConfig::validate` instead.
//!
//! Configuration can also be loaded from a TOML document or from
//! `SANDBOX_*` environment variables.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Default CPU share, in percent of one core
pub const DEFAULT_CPU_LIMIT: u32 = 100;
/// Default memory ceiling (512 MiB)
pub const DEFAULT_MEMORY_LIMIT: u64 = 512 * 1024 * 1024;
/// Default wall-clock timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default cap on simultaneously active processes
pub const DEFAULT_MAX_PROCESSES: u32 = 50;

/// Environment handed to the child
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Environment {
    /// Child inherits the caller's environment
    #[default]
    Inherit,
    /// Child sees exactly these variables and nothing else
    Exact(Vec<(String, String)>),
    /// Caller's environment plus these variables (which win on conflict)
    Overlay(Vec<(String, String)>),
}

/// Binding for the child's standard input
#[derive(Debug, Clone, Default)]
pub enum Input {
    #[default]
    Inherit,
    Null,
    /// Bytes written to the child's stdin, after which stdin is closed
    Bytes(Vec<u8>),
}

/// Binding for the child's stdout or stderr
#[derive(Debug, Clone, Default)]
pub enum Output {
    #[default]
    Inherit,
    Null,
    /// Collect everything the child writes, byte for byte
    Capture(CaptureBuffer),
}

/// Shared, growable byte sink for captured child output.
///
/// Clones share the same storage, so the caller keeps one clone and hands
/// the other to the configuration.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything captured so far
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Sparse limit specification supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    /// CPU share in percent of one core (0 = default)
    pub cpu_limit: u32,
    /// Memory ceiling in bytes (0 = default)
    pub memory_limit: u64,
    /// Wall-clock timeout (zero = default)
    pub timeout: Duration,
    /// Maximum simultaneously active processes (0 = default)
    pub max_processes: u32,
    /// Child working directory (None = caller's cwd)
    pub working_dir: Option<PathBuf>,
    pub env: Environment,
    pub stdin: Input,
    pub stdout: Output,
    pub stderr: Output,
    /// Advisory only: network isolation is not implemented
    pub network_access: bool,
    /// Override for the cgroup v2 mount point (Linux only)
    pub cgroup_root: Option<PathBuf>,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpu_limit(mut self, percent: u32) -> Self {
        self.cpu_limit = percent;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = count;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn with_stdin(mut self, stdin: Input) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_stdout(mut self, stdout: Output) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn with_stderr(mut self, stderr: Output) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_network_access(mut self, allowed: bool) -> Self {
        self.network_access = allowed;
        self
    }

    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = Some(root.into());
        self
    }

    /// Fill in defaults for every unset field
    pub fn resolve(&self) -> EffectiveConfig {
        EffectiveConfig {
            cpu_limit: if self.cpu_limit == 0 {
                DEFAULT_CPU_LIMIT
            } else {
                self.cpu_limit
            },
            memory_limit: if self.memory_limit == 0 {
                DEFAULT_MEMORY_LIMIT
            } else {
                self.memory_limit
            },
            timeout: if self.timeout.is_zero() {
                DEFAULT_TIMEOUT
            } else {
                self.timeout
            },
            max_processes: if self.max_processes == 0 {
                DEFAULT_MAX_PROCESSES
            } else {
                self.max_processes
            },
            working_dir: self.working_dir.clone(),
            env: match &self.env {
                Environment::Exact(vars) | Environment::Overlay(vars) if vars.is_empty() => {
                    Environment::Inherit
                }
                other => other.clone(),
            },
            stdin: self.stdin.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            network_access: self.network_access,
            cgroup_root: self.cgroup_root.clone(),
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawSandboxConfig =
            toml::from_str(content).map_err(|e| SandboxError::Config(e.to_string()))?;
        Ok(raw.into())
    }

    /// Load from `SANDBOX_*` environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Override fields from `SANDBOX_*` variables looked up through `lookup`
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = parse_var(&lookup, "SANDBOX_CPU_LIMIT")? {
            self.cpu_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_MEMORY_LIMIT")? {
            self.memory_limit = v;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SANDBOX_TIMEOUT_MS")? {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_MAX_PROCESSES")? {
            self.max_processes = v;
        }
        if let Some(dir) = lookup("SANDBOX_WORKING_DIR") {
            self.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(root) = lookup("SANDBOX_CGROUP_ROOT") {
            self.cgroup_root = Some(PathBuf::from(root));
        }
        Ok(self)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SandboxError::Config(format!("{}={:?}: {}", name, value, e))),
    }
}

/// Resolve an optional configuration; `None` yields all defaults
pub fn resolve(config: Option<&SandboxConfig>) -> EffectiveConfig {
    match config {
        Some(config) => config.resolve(),
        None => SandboxConfig::default().resolve(),
    }
}

/// Fully-defaulted configuration used for one run
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub cpu_limit: u32,
    pub memory_limit: u64,
    pub timeout: Duration,
    pub max_processes: u32,
    pub working_dir: Option<PathBuf>,
    pub env: Environment,
    pub stdin: Input,
    pub stdout: Output,
    pub stderr: Output,
    pub network_access: bool,
    pub cgroup_root: Option<PathBuf>,
}

impl EffectiveConfig {
    /// Human-readable warnings for values outside their documented range
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.cpu_limit > 100 {
            warnings.push(format!(
                "cpu_limit {}% exceeds one core; no CPU quota will be applied",
                self.cpu_limit
            ));
        }
        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                warnings.push(format!(
                    "working_dir {} is not a directory",
                    dir.display()
                ));
            }
        }
        warnings
    }
}

/// On-disk TOML representation
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSandboxConfig {
    cpu_limit: Option<u32>,
    memory_limit: Option<u64>,
    timeout_ms: Option<u64>,
    max_processes: Option<u32>,
    working_dir: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "default_inherit_env")]
    inherit_env: bool,
    #[serde(default)]
    network_access: bool,
    cgroup_root: Option<PathBuf>,
}

fn default_inherit_env() -> bool {
    true
}

impl From<RawSandboxConfig> for SandboxConfig {
    fn from(raw: RawSandboxConfig) -> Self {
        let vars: Vec<(String, String)> = raw.env.into_iter().collect();
        let env = match (vars.is_empty(), raw.inherit_env) {
            (true, _) => Environment::Inherit,
            (false, true) => Environment::Overlay(vars),
            (false, false) => Environment::Exact(vars),
        };

        SandboxConfig {
            cpu_limit: raw.cpu_limit.unwrap_or(0),
            memory_limit: raw.memory_limit.unwrap_or(0),
            timeout: raw.timeout_ms.map(Duration::from_millis).unwrap_or_default(),
            max_processes: raw.max_processes.unwrap_or(0),
            working_dir: raw.working_dir,
            env,
            network_access: raw.network_access,
            cgroup_root: raw.cgroup_root,
            ..Default::default()
        }
    }
}
