//! Linux cgroup v2 enforcer
//!
//! Lifecycle of one run:
//! 1. detect a cgroup2 mount (once, at construction)
//! 2. create `proc-sandbox-<pid>-<seq>` and write `memory.max`, `cpu.max`,
//!    `pids.max`
//! 3. spawn the child as a process-group leader
//! 4. write the child pid to `cgroup.procs`
//! 5. supervise; on timeout/cancel kill the group and the cgroup
//! 6. read `memory.events` after the wait to detect OOM kills
//!
//! The directory outlives the run and is removed by `cleanup`; later runs
//! on the same sandbox reuse it. Any failure to create or configure the
//! cgroup degrades to an unenforced run instead of failing it: unprivileged
//! callers are expected.
//!
//! The child runs outside the cgroup between spawn and step 4. Limits are
//! therefore not guaranteed from its first instruction.

use async_trait::async_trait;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::group::{new_group, ProcessGroup};
use super::Sandbox;
use crate::config::EffectiveConfig;
use crate::error::{Result, SandboxError};
use crate::monitor::{build_command, spawn, TreeKill};
use crate::outcome::{classify, Enforcement, Outcome};

const PROC_MOUNTS: &str = "/proc/mounts";
const NAME_PREFIX: &str = "proc-sandbox";
/// `cpu.max` period in microseconds
const CPU_PERIOD_US: u64 = 100_000;
const CONTROLLERS: [&str; 3] = ["+cpu", "+memory", "+pids"];

/// Distinguishes sandboxes living in the same process
static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Find the cgroup2 mount point in `/proc/mounts`-formatted text
pub fn parse_cgroup2_mount(mounts: &str) -> Option<PathBuf> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let mount_point = fields.next()?;
        let fs_type = fields.next()?;
        (fs_type == "cgroup2").then(|| PathBuf::from(mount_point))
    })
}

/// Detect the host's cgroup v2 mount point
pub fn detect_cgroup_root() -> Option<PathBuf> {
    let mounts = fs::read_to_string(PROC_MOUNTS).ok()?;
    parse_cgroup2_mount(&mounts)
}

/// Count of OOM kills recorded in a `memory.events` file
pub fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("oom_kill"), Some(count)) => count.parse().ok(),
                _ => None,
            }
        })
        .unwrap_or(0)
}

/// One cgroup v2 directory
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create (or reuse) `root/name`
    pub fn create(root: &Path, name: &str) -> Result<Self> {
        enable_controllers(root);
        let path = root.join(name);
        fs::create_dir_all(&path).map_err(|e| SandboxError::cgroup(&path, e))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write memory, CPU and pid ceilings
    pub fn apply_limits(&self, config: &EffectiveConfig) -> Result<()> {
        self.write("memory.max", &config.memory_limit.to_string())?;
        // Without this the ceiling can be dodged through swap
        if let Err(e) = self.write("memory.swap.max", "0") {
            debug!("memory.swap.max not set: {}", e);
        }

        if config.cpu_limit > 0 && config.cpu_limit < 100 {
            let quota = u64::from(config.cpu_limit) * 1000;
            self.write("cpu.max", &format!("{} {}", quota, CPU_PERIOD_US))?;
        }

        self.write("pids.max", &config.max_processes.to_string())?;
        Ok(())
    }

    /// Move a process into this cgroup
    pub fn add_process(&self, pid: u32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    /// OOM kills recorded so far (0 when unreadable)
    pub fn oom_kill_count(&self) -> u64 {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|events| parse_oom_kills(&events))
            .unwrap_or(0)
    }

    /// SIGKILL every process in the cgroup (kernel 5.14+)
    pub fn kill(&self) -> Result<()> {
        self.write("cgroup.kill", "1")
    }

    /// Remove the directory, retrying briefly while members exit
    pub fn remove(&self) -> Result<()> {
        if let Err(e) = self.kill() {
            debug!("cgroup.kill unavailable before removal: {}", e);
        }

        let mut attempts = 0;
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempts < 10 => {
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(SandboxError::cgroup(&self.path, e)),
            }
        }
    }

    fn write(&self, file: &str, content: &str) -> Result<()> {
        let path = self.path.join(file);
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|mut f| f.write_all(content.as_bytes()))
            .map_err(|e| SandboxError::cgroup(&path, e))
    }
}

/// Delegate controllers to children of `root`; failures are expected when
/// the root already holds processes or is not writable
fn enable_controllers(root: &Path) {
    let control = root.join("cgroup.subtree_control");
    for controller in CONTROLLERS {
        let result = fs::OpenOptions::new()
            .write(true)
            .open(&control)
            .and_then(|mut f| f.write_all(controller.as_bytes()));
        if let Err(e) = result {
            debug!("Could not enable {} in {}: {}", controller, control.display(), e);
        }
    }
}

/// Kill target: the child's process group plus, when attached, the cgroup
struct CgroupTree<'a> {
    group: Option<ProcessGroup>,
    cgroup: Option<&'a Cgroup>,
}

impl TreeKill for CgroupTree<'_> {
    fn kill_tree(&self) -> io::Result<()> {
        let group_result = self.group.kill_tree();
        let cgroup_killed = self.cgroup.map(|cg| cg.kill().is_ok()).unwrap_or(false);
        if cgroup_killed {
            Ok(())
        } else {
            group_result
        }
    }
}

/// Sandbox backed by a cgroup v2 directory
pub struct CgroupSandbox {
    config: EffectiveConfig,
    root: Option<PathBuf>,
    name: String,
    cgroup: Option<Cgroup>,
}

impl CgroupSandbox {
    pub fn new(config: EffectiveConfig) -> Self {
        let root = config.cgroup_root.clone().or_else(detect_cgroup_root);
        match &root {
            Some(root) => debug!("Using cgroup v2 hierarchy at {}", root.display()),
            None => info!("cgroup v2 not available, commands will run without enforcement"),
        }

        let name = format!(
            "{}-{}-{}",
            NAME_PREFIX,
            std::process::id(),
            INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        Self {
            config,
            root,
            name,
            cgroup: None,
        }
    }

    /// Path of the live cgroup directory, if one exists
    pub fn cgroup_path(&self) -> Option<&Path> {
        self.cgroup.as_ref().map(Cgroup::path)
    }

    /// Create (or reuse) the cgroup and write limits into it
    fn prepare(&mut self) -> Enforcement {
        let Some(root) = &self.root else {
            return Enforcement::Degraded("cgroup v2 is not mounted".to_string());
        };

        if self.cgroup.is_none() {
            match Cgroup::create(root, &self.name) {
                Ok(cgroup) => self.cgroup = Some(cgroup),
                Err(e) => {
                    debug!("Running unenforced: {}", e);
                    return Enforcement::Degraded(e.to_string());
                }
            }
        }

        match &self.cgroup {
            Some(cgroup) => match cgroup.apply_limits(&self.config) {
                Ok(()) => Enforcement::Active,
                Err(e) => {
                    debug!("Running unenforced: {}", e);
                    Enforcement::Degraded(e.to_string())
                }
            },
            None => Enforcement::Degraded("cgroup was not created".to_string()),
        }
    }
}

#[async_trait]
impl Sandbox for CgroupSandbox {
    async fn run(&mut self, cancel: &CancellationToken, command: &str, args: &[String]) -> Outcome {
        for warning in self.config.validate() {
            warn!("{}", warning);
        }

        let mut enforcement = self.prepare();
        let mut cgroup = if enforcement.is_active() {
            self.cgroup.as_ref()
        } else {
            None
        };
        let baseline_ooms = cgroup.map(Cgroup::oom_kill_count).unwrap_or(0);

        let mut cmd = build_command(&self.config, command, args);
        new_group(&mut cmd);
        let running = match spawn(cmd, &self.config, command) {
            Ok(running) => running,
            Err(e) => return Outcome::failed(e, enforcement),
        };

        if let (Some(cg), Some(pid)) = (cgroup, running.id()) {
            if let Err(e) = cg.add_process(pid) {
                warn!("Could not attach pid {} to cgroup, running unenforced: {}", pid, e);
                enforcement = Enforcement::Degraded(e.to_string());
                cgroup = None;
            }
        }

        let tree = CgroupTree {
            group: ProcessGroup::led_by(running.id()),
            cgroup,
        };
        let supervised = match running.supervise(&tree, self.config.timeout, cancel).await {
            Ok(supervised) => supervised,
            Err(e) => return Outcome::failed(SandboxError::Io(e), enforcement),
        };

        // Only meaningful once the wait has completed
        let memory_exceeded = cgroup
            .map(|cg| cg.oom_kill_count() > baseline_ooms)
            .unwrap_or(false);
        let termination = classify(&supervised.status, supervised.killed);
        debug!(
            "{} finished: {:?} in {:?} (oom: {})",
            command, termination, supervised.elapsed, memory_exceeded
        );

        Outcome::completed(termination, supervised.elapsed, memory_exceeded, enforcement)
    }

    fn cleanup(&mut self) -> Result<()> {
        let Some(cgroup) = self.cgroup.take() else {
            return Ok(());
        };
        match cgroup.remove() {
            Ok(()) => {
                debug!("Removed cgroup {}", cgroup.path().display());
                Ok(())
            }
            Err(e) => {
                // Keep the handle so a later cleanup can retry
                self.cgroup = Some(cgroup);
                Err(SandboxError::Cleanup(e.to_string()))
            }
        }
    }

    fn config(&self) -> &EffectiveConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Input, SandboxConfig};
    use tempfile::tempdir;

    const CONTROL_FILES: [&str; 6] = [
        "memory.max",
        "memory.swap.max",
        "cpu.max",
        "pids.max",
        "cgroup.procs",
        "memory.events",
    ];

    /// Fake cgroup directory with the control files pre-created
    fn prepare_cgroup_dir(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        fs::create_dir_all(&path).unwrap();
        for file in CONTROL_FILES {
            fs::write(path.join(file), "").unwrap();
        }
        fs::write(path.join("memory.events"), "low 0\nhigh 0\nmax 0\noom 0\noom_kill 0\n").unwrap();
        path
    }

    fn empty_cgroup_dir(path: &Path) {
        for entry in fs::read_dir(path).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
    }

    #[test]
    fn test_parse_cgroup2_mount() {
        let mounts = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
cgroup2 /sys/fs/cgroup cgroup2 rw,nosuid,nodev,noexec,relatime 0 0
tmpfs /run tmpfs rw 0 0
";
        assert_eq!(
            parse_cgroup2_mount(mounts),
            Some(PathBuf::from("/sys/fs/cgroup"))
        );
    }

    #[test]
    fn test_parse_cgroup2_mount_v1_only() {
        let mounts = "cgroup /sys/fs/cgroup/memory cgroup rw,memory 0 0\n";
        assert_eq!(parse_cgroup2_mount(mounts), None);
    }

    #[test]
    fn test_parse_oom_kills() {
        assert_eq!(parse_oom_kills("low 0\noom 2\noom_kill 2\n"), 2);
        assert_eq!(parse_oom_kills("oom_kill 0\n"), 0);
        assert_eq!(parse_oom_kills("oom_group_kill 4\n"), 0);
        assert_eq!(parse_oom_kills(""), 0);
    }

    #[test]
    fn test_apply_limits_writes_files() {
        let tmp = tempdir().unwrap();
        let path = prepare_cgroup_dir(tmp.path(), "cg");
        let cgroup = Cgroup::create(tmp.path(), "cg").unwrap();
        let config = SandboxConfig::new()
            .with_cpu_limit(50)
            .with_memory_limit(2048)
            .with_max_processes(32)
            .resolve();

        cgroup.apply_limits(&config).unwrap();

        assert_eq!(fs::read_to_string(path.join("memory.max")).unwrap(), "2048");
        assert_eq!(fs::read_to_string(path.join("memory.swap.max")).unwrap(), "0");
        assert_eq!(fs::read_to_string(path.join("cpu.max")).unwrap(), "50000 100000");
        assert_eq!(fs::read_to_string(path.join("pids.max")).unwrap(), "32");
    }

    #[test]
    fn test_full_cpu_leaves_quota_unset() {
        let tmp = tempdir().unwrap();
        let path = prepare_cgroup_dir(tmp.path(), "cg");
        let cgroup = Cgroup::create(tmp.path(), "cg").unwrap();

        cgroup.apply_limits(&SandboxConfig::new().resolve()).unwrap();

        assert_eq!(fs::read_to_string(path.join("cpu.max")).unwrap(), "");
    }

    #[test]
    fn test_remove_missing_directory_is_ok() {
        let tmp = tempdir().unwrap();
        let cgroup = Cgroup::create(tmp.path(), "gone").unwrap();
        fs::remove_dir(cgroup.path()).unwrap();
        assert!(cgroup.remove().is_ok());
    }

    #[test]
    fn test_unmounted_root_degrades() {
        let tmp = tempdir().unwrap();
        let config = SandboxConfig::new()
            .with_cgroup_root(tmp.path().join("missing/root"))
            .resolve();
        let mut sandbox = CgroupSandbox::new(config);
        // The directory gets created, but it has no control files to write
        let enforcement = sandbox.prepare();
        assert!(!enforcement.is_active());
    }

    #[tokio::test]
    async fn test_run_attaches_child_and_reports_exit() {
        let tmp = tempdir().unwrap();
        let config = SandboxConfig::new()
            .with_cgroup_root(tmp.path())
            .with_stdin(Input::Null)
            .resolve();
        let mut sandbox = CgroupSandbox::new(config);
        let path = prepare_cgroup_dir(tmp.path(), &sandbox.name);

        let args = vec!["-c".to_string(), "exit 3".to_string()];
        let outcome = sandbox.run(&CancellationToken::new(), "sh", &args).await;

        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.enforcement.is_active());
        assert!(!outcome.memory_exceeded);
        let attached = fs::read_to_string(path.join("cgroup.procs")).unwrap();
        assert!(attached.parse::<u32>().is_ok());
        assert_eq!(sandbox.cgroup_path(), Some(path.as_path()));

        empty_cgroup_dir(&path);
        sandbox.cleanup().unwrap();
        assert!(!path.exists());
        sandbox.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_oom_kill_counter_growth_sets_memory_exceeded() {
        let tmp = tempdir().unwrap();
        let config = SandboxConfig::new().with_cgroup_root(tmp.path()).resolve();
        let mut sandbox = CgroupSandbox::new(config);
        let path = prepare_cgroup_dir(tmp.path(), &sandbox.name);

        // Stand in for the kernel by bumping the counter from inside the run
        let script = format!(
            "printf 'oom 1\\noom_kill 1\\n' > '{}'",
            path.join("memory.events").display()
        );
        let args = vec!["-c".to_string(), script];
        let outcome = sandbox.run(&CancellationToken::new(), "sh", &args).await;
        assert!(outcome.memory_exceeded);

        // Counter unchanged on the next run: not attributed again
        let args = vec!["-c".to_string(), "true".to_string()];
        let outcome = sandbox.run(&CancellationToken::new(), "sh", &args).await;
        assert!(!outcome.memory_exceeded);

        empty_cgroup_dir(&path);
        sandbox.cleanup().unwrap();
    }
}
