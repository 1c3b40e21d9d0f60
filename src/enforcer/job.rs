//! Windows job-object enforcer
//!
//! Every run gets a fresh job object configured with a per-process memory
//! ceiling, an active-process cap and kill-on-close. The child is assigned
//! to the job right after spawn, so it runs unconfined for a brief window;
//! it is not created suspended because the standard library offers no way
//! to resume its primary thread.
//!
//! The job is the kill target: terminating it ends every process in the
//! tree. Memory exhaustion is not detected on this platform and
//! `memory_exceeded` is always false.

use async_trait::async_trait;
use std::io;
use std::mem;
use std::ptr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use winapi::shared::minwindef::{BOOL, DWORD, FALSE, LPVOID, UINT};
use winapi::um::handleapi::CloseHandle;
use winapi::um::jobapi2::{
    AssignProcessToJobObject, CreateJobObjectW, SetInformationJobObject, TerminateJobObject,
};
use winapi::shared::ntdef::LPCWSTR;
use winapi::um::minwinbase::LPSECURITY_ATTRIBUTES;
use winapi::um::winnt::{
    JobObjectExtendedLimitInformation, HANDLE, JOBOBJECTINFOCLASS,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_ACTIVE_PROCESS,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOB_OBJECT_LIMIT_PROCESS_MEMORY,
};

use super::Sandbox;
use crate::config::EffectiveConfig;
use crate::error::{Result, SandboxError};
use crate::monitor::{build_command, spawn, TreeKill};
use crate::outcome::{classify, Enforcement, Outcome};

/// Exit code given to processes ended by `TerminateJobObject`
const JOB_KILL_EXIT_CODE: u32 = 1;

/// Raw job object handle
#[derive(Debug)]
pub struct JobHandle(HANDLE);

// SAFETY: a job handle is a kernel object reference usable from any thread
unsafe impl Send for JobHandle {}
unsafe impl Sync for JobHandle {}

type CreateJobObjectFn = unsafe extern "system" fn(LPSECURITY_ATTRIBUTES, LPCWSTR) -> HANDLE;
type SetInformationJobObjectFn =
    unsafe extern "system" fn(HANDLE, JOBOBJECTINFOCLASS, LPVOID, DWORD) -> BOOL;
type AssignProcessToJobObjectFn = unsafe extern "system" fn(HANDLE, HANDLE) -> BOOL;
type TerminateJobObjectFn = unsafe extern "system" fn(HANDLE, UINT) -> BOOL;
type CloseHandleFn = unsafe extern "system" fn(HANDLE) -> BOOL;

/// Explicit binding to the kernel32 job-object API.
///
/// Holds the entry points the sandbox calls. `bind` resolves them to
/// kernel32; every `JobSandbox` receives its binding at construction
/// instead of reaching for process-global state.
pub struct Kernel32 {
    create_job_object: CreateJobObjectFn,
    set_information_job_object: SetInformationJobObjectFn,
    assign_process_to_job_object: AssignProcessToJobObjectFn,
    terminate_job_object: TerminateJobObjectFn,
    close_handle: CloseHandleFn,
}

impl Kernel32 {
    pub fn bind() -> Arc<Self> {
        Arc::new(Self::binding())
    }

    fn binding() -> Self {
        Self {
            create_job_object: CreateJobObjectW,
            set_information_job_object: SetInformationJobObject,
            assign_process_to_job_object: AssignProcessToJobObject,
            terminate_job_object: TerminateJobObject,
            close_handle: CloseHandle,
        }
    }

    pub fn create_job(&self) -> io::Result<JobHandle> {
        // SAFETY: null attributes and name create an anonymous job
        let handle = unsafe { (self.create_job_object)(ptr::null_mut(), ptr::null()) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(JobHandle(handle))
    }

    pub fn set_limits(&self, job: &JobHandle, config: &EffectiveConfig) -> io::Result<()> {
        // SAFETY: the limit record is plain old data; all-zero means "no limit"
        let mut limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };

        if config.memory_limit > 0 {
            limits.ProcessMemoryLimit = config.memory_limit as usize;
            limits.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
        }
        if config.max_processes > 0 {
            limits.BasicLimitInformation.ActiveProcessLimit = config.max_processes as DWORD;
            limits.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_ACTIVE_PROCESS;
        }
        // Closing the handle during cleanup takes the whole tree down
        limits.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

        // SAFETY: pointer and size describe `limits`, which outlives the call
        let ok = unsafe {
            (self.set_information_job_object)(
                job.0,
                JobObjectExtendedLimitInformation,
                &mut limits as *mut JOBOBJECT_EXTENDED_LIMIT_INFORMATION as LPVOID,
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
            )
        };
        if ok == FALSE {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn assign(&self, job: &JobHandle, process: HANDLE) -> io::Result<()> {
        // SAFETY: both handles are live; the process handle is owned by the Child
        let ok = unsafe { (self.assign_process_to_job_object)(job.0, process) };
        if ok == FALSE {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn terminate(&self, job: &JobHandle) -> io::Result<()> {
        // SAFETY: the job handle is live until `close`
        let ok = unsafe { (self.terminate_job_object)(job.0, JOB_KILL_EXIT_CODE) };
        if ok == FALSE {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn close(&self, job: JobHandle) -> io::Result<()> {
        // SAFETY: consumes the handle so it cannot be closed twice
        let ok = unsafe { (self.close_handle)(job.0) };
        if ok == FALSE {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Kill target: every process assigned to the job
struct JobTree<'a> {
    api: &'a Kernel32,
    job: &'a JobHandle,
}

impl TreeKill for JobTree<'_> {
    fn kill_tree(&self) -> io::Result<()> {
        self.api.terminate(self.job)
    }
}

/// Sandbox backed by a Windows job object
pub struct JobSandbox {
    config: EffectiveConfig,
    api: Arc<Kernel32>,
    job: Option<JobHandle>,
}

impl JobSandbox {
    pub fn new(config: EffectiveConfig, api: Arc<Kernel32>) -> Self {
        Self {
            config,
            api,
            job: None,
        }
    }

    /// Create and configure a fresh job, replacing any previous one
    fn prepare(&mut self) -> Result<()> {
        self.release()?;

        let job = self
            .api
            .create_job()
            .map_err(|e| SandboxError::JobSetup(format!("failed to create job object: {}", e)))?;
        if let Err(e) = self.api.set_limits(&job, &self.config) {
            let _ = self.api.close(job);
            return Err(SandboxError::JobSetup(format!(
                "failed to set job object limits: {}",
                e
            )));
        }

        self.job = Some(job);
        Ok(())
    }

    /// Terminate and close the current job, if any
    fn release(&mut self) -> Result<()> {
        let Some(job) = self.job.take() else {
            return Ok(());
        };
        if let Err(e) = self.api.terminate(&job) {
            // Usually the job is already empty
            debug!("TerminateJobObject before close: {}", e);
        }
        self.api
            .close(job)
            .map_err(|e| SandboxError::Cleanup(format!("failed to close job handle: {}", e)))
    }
}

#[async_trait]
impl Sandbox for JobSandbox {
    async fn run(&mut self, cancel: &CancellationToken, command: &str, args: &[String]) -> Outcome {
        for warning in self.config.validate() {
            warn!("{}", warning);
        }

        // No unenforced fallback on this platform
        if let Err(e) = self.prepare() {
            return Outcome::failed(e, Enforcement::Degraded("job object unavailable".to_string()));
        }
        let Some(job) = self.job.as_ref() else {
            return Outcome::failed(
                SandboxError::JobSetup("job object missing after setup".to_string()),
                Enforcement::Degraded("job object unavailable".to_string()),
            );
        };

        let cmd = build_command(&self.config, command, args);
        let running = match spawn(cmd, &self.config, command) {
            Ok(running) => running,
            Err(e) => return Outcome::failed(e, Enforcement::Active),
        };

        let tree = JobTree {
            api: &self.api,
            job,
        };
        let assigned = match running.child().raw_handle() {
            Some(process) => self.api.assign(job, process as HANDLE),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "process exited before job assignment",
            )),
        };
        if let Err(e) = assigned {
            warn!("Could not assign {} to job object: {}", command, e);
            running.abort(&tree).await;
            return Outcome::failed(
                SandboxError::JobSetup(format!("failed to assign process to job: {}", e)),
                Enforcement::Active,
            );
        }

        let supervised = match running.supervise(&tree, self.config.timeout, cancel).await {
            Ok(supervised) => supervised,
            Err(e) => return Outcome::failed(SandboxError::Io(e), Enforcement::Active),
        };

        let termination = classify(&supervised.status, supervised.killed);
        debug!(
            "{} finished: {:?} in {:?}",
            command, termination, supervised.elapsed
        );

        Outcome::completed(termination, supervised.elapsed, false, Enforcement::Active)
    }

    fn cleanup(&mut self) -> Result<()> {
        self.release()
    }

    fn config(&self) -> &EffectiveConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Output, SandboxConfig};
    use crate::outcome::{KillReason, Termination, NO_EXIT_CODE};
    use std::time::Duration;

    fn cmd(script: &str) -> Vec<String> {
        vec!["/C".to_string(), script.to_string()]
    }

    unsafe extern "system" fn refuse_job(_: LPSECURITY_ATTRIBUTES, _: LPCWSTR) -> HANDLE {
        ptr::null_mut()
    }

    #[tokio::test]
    async fn test_job_timeout_terminates_tree() {
        let config = SandboxConfig::new()
            .with_timeout(Duration::from_secs(1))
            .with_stdout(Output::Null)
            .resolve();
        let mut sandbox = JobSandbox::new(config, Kernel32::bind());
        let outcome = sandbox
            .run(&CancellationToken::new(), "cmd", &cmd("ping -n 30 127.0.0.1"))
            .await;

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, NO_EXIT_CODE);
        assert!(outcome.elapsed >= Duration::from_secs(1));
        assert!(outcome.elapsed < Duration::from_secs(5));
        sandbox.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_job_cancellation_terminates_tree() {
        let mut sandbox = JobSandbox::new(
            SandboxConfig::new().with_stdout(Output::Null).resolve(),
            Kernel32::bind(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let outcome = sandbox
            .run(&cancel, "cmd", &cmd("ping -n 30 127.0.0.1"))
            .await;

        assert_eq!(
            outcome.termination,
            Termination::Killed {
                reason: KillReason::Cancelled
            }
        );
        assert!(outcome.elapsed < Duration::from_secs(5));
        sandbox.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_job_creation_failure_is_reported() {
        let api = Arc::new(Kernel32 {
            create_job_object: refuse_job,
            ..Kernel32::binding()
        });
        let mut sandbox = JobSandbox::new(SandboxConfig::new().resolve(), api);
        let outcome = sandbox.run(&CancellationToken::new(), "cmd", &cmd("exit 0")).await;

        assert_eq!(outcome.termination, Termination::NotStarted);
        assert!(outcome.enforcement.is_degraded());
        assert!(matches!(outcome.error, Some(SandboxError::JobSetup(_))));
        sandbox.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_job_exit_code() {
        let mut sandbox = JobSandbox::new(SandboxConfig::new().resolve(), Kernel32::bind());
        let outcome = sandbox.run(&CancellationToken::new(), "cmd", &cmd("exit 42")).await;

        assert_eq!(outcome.exit_code, 42);
        assert!(!outcome.memory_exceeded);
        assert!(outcome.enforcement.is_active());
        sandbox.cleanup().unwrap();
        sandbox.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_second_run_replaces_job() {
        let mut sandbox = JobSandbox::new(SandboxConfig::new().resolve(), Kernel32::bind());
        sandbox.run(&CancellationToken::new(), "cmd", &cmd("exit 0")).await;
        let first = sandbox.job.as_ref().map(|job| job.0 as usize);
        sandbox.run(&CancellationToken::new(), "cmd", &cmd("exit 0")).await;
        let second = sandbox.job.as_ref().map(|job| job.0 as usize);

        assert!(first.is_some());
        assert!(second.is_some());
        sandbox.cleanup().unwrap();
        assert!(sandbox.job.is_none());
    }
}
