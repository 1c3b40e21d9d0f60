//! Execution monitor
//!
//! Shared by every enforcer: builds the child command from an
//! `EffectiveConfig`, spawns it, wires up the I/O pumps and races the child
//! against its deadline and the caller's cancellation token.
//!
//! The monitor never kills a pid directly. Enforcers hand it a `TreeKill`
//! (process group, cgroup, job object) so descendants die with the child.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{CaptureBuffer, EffectiveConfig, Environment, Input, Output};
use crate::error::{Result, SandboxError};
use crate::outcome::KillReason;

/// How long output pumps may keep draining after the tree was killed
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Something that can kill the child together with all its descendants
pub(crate) trait TreeKill {
    fn kill_tree(&self) -> io::Result<()>;
}

/// Build the child command: program, args, working dir, environment, stdio
pub(crate) fn build_command(config: &EffectiveConfig, program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    match &config.env {
        Environment::Inherit => {}
        Environment::Exact(vars) => {
            cmd.env_clear();
            cmd.envs(vars.iter().map(|(k, v)| (k, v)));
        }
        Environment::Overlay(vars) => {
            cmd.envs(vars.iter().map(|(k, v)| (k, v)));
        }
    }

    cmd.stdin(match config.stdin {
        Input::Inherit => Stdio::inherit(),
        Input::Null => Stdio::null(),
        Input::Bytes(_) => Stdio::piped(),
    });
    cmd.stdout(output_stdio(&config.stdout));
    cmd.stderr(output_stdio(&config.stderr));

    if !config.network_access {
        debug!("network_access=false is advisory; no network isolation is applied");
    }

    cmd
}

fn output_stdio(output: &Output) -> Stdio {
    match output {
        Output::Inherit => Stdio::inherit(),
        Output::Null => Stdio::null(),
        Output::Capture(_) => Stdio::piped(),
    }
}

/// A spawned child with its timer already running
pub(crate) struct Running {
    child: Child,
    started: Instant,
    pumps: Pumps,
}

/// Spawn the child and start the wall-clock timer
pub(crate) fn spawn(mut cmd: Command, config: &EffectiveConfig, program: &str) -> Result<Running> {
    let mut child = cmd.spawn().map_err(|e| SandboxError::spawn(program, e))?;
    let started = Instant::now();
    debug!("Spawned {} as pid {:?}", program, child.id());

    let mut pumps = Pumps::default();

    if let (Input::Bytes(bytes), Some(mut stdin)) = (&config.stdin, child.stdin.take()) {
        let bytes = bytes.clone();
        pumps.handles.push(tokio::spawn(async move {
            // Broken pipe just means the child stopped reading
            if let Err(e) = stdin.write_all(&bytes).await {
                debug!("stdin pump stopped: {}", e);
            }
        }));
    }
    if let (Output::Capture(sink), Some(stdout)) = (&config.stdout, child.stdout.take()) {
        pumps.handles.push(tokio::spawn(capture(stdout, sink.clone())));
    }
    if let (Output::Capture(sink), Some(stderr)) = (&config.stderr, child.stderr.take()) {
        pumps.handles.push(tokio::spawn(capture(stderr, sink.clone())));
    }

    Ok(Running {
        child,
        started,
        pumps,
    })
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, sink: CaptureBuffer) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.append(&buf[..n]),
            Err(e) => {
                debug!("output pump stopped: {}", e);
                break;
            }
        }
    }
}

/// What happened while supervising the child
#[derive(Debug)]
pub(crate) struct Supervised {
    pub status: ExitStatus,
    pub killed: Option<KillReason>,
    pub elapsed: Duration,
}

impl Running {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub fn child(&self) -> &Child {
        &self.child
    }

    /// Kill the tree without waiting for the deadline (attach failures)
    #[cfg_attr(not(windows), allow(dead_code))]
    pub async fn abort(self, killer: &impl TreeKill) {
        let Running {
            mut child,
            mut pumps,
            ..
        } = self;
        kill(killer, &mut child);
        let _ = child.wait().await;
        pumps.finish_within(DRAIN_GRACE).await;
    }

    /// Race the child against the deadline and the cancellation token.
    ///
    /// On timeout or cancellation the whole tree is killed and the child is
    /// still reaped before returning, so `elapsed` includes the kill.
    pub async fn supervise(
        self,
        killer: &impl TreeKill,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> io::Result<Supervised> {
        let Running {
            mut child,
            started,
            mut pumps,
        } = self;
        let deadline = tokio::time::Instant::from_std(started) + timeout;
        let mut killed = None;

        // Exit wins ties, so a child that finished as the token fired keeps its status
        let status = tokio::select! {
            biased;
            status = child.wait() => status?,
            _ = tokio::time::sleep_until(deadline) => {
                debug!("Deadline of {:?} reached, killing process tree", timeout);
                let (status, sent) = stop(killer, &mut child).await?;
                if sent {
                    killed = Some(KillReason::Timeout);
                }
                status
            }
            _ = cancel.cancelled() => {
                debug!("Run cancelled, killing process tree");
                let (status, sent) = stop(killer, &mut child).await?;
                if sent {
                    killed = Some(KillReason::Cancelled);
                }
                status
            }
        };

        if killed.is_some() {
            pumps.finish_within(DRAIN_GRACE).await;
        } else {
            // A descendant may still hold the output pipes open
            tokio::select! {
                biased;
                _ = pumps.finish() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Descendants kept output open past the deadline, killing process tree");
                    killed = Some(KillReason::Timeout);
                    kill(killer, &mut child);
                    pumps.finish_within(DRAIN_GRACE).await;
                }
                _ = cancel.cancelled() => {
                    killed = Some(KillReason::Cancelled);
                    kill(killer, &mut child);
                    pumps.finish_within(DRAIN_GRACE).await;
                }
            }
        }

        Ok(Supervised {
            status,
            killed,
            elapsed: started.elapsed(),
        })
    }
}

/// Kill the tree unless the child already exited. Returns the reaped status
/// and whether a kill was sent.
async fn stop(killer: &impl TreeKill, child: &mut Child) -> io::Result<(ExitStatus, bool)> {
    if let Some(status) = child.try_wait()? {
        return Ok((status, false));
    }
    kill(killer, child);
    Ok((child.wait().await?, true))
}

fn kill(killer: &impl TreeKill, child: &mut Child) {
    if let Err(e) = killer.kill_tree() {
        // Tree already gone, or the kill target was never set up
        debug!("Process tree kill failed ({}), killing direct child", e);
        let _ = child.start_kill();
    }
}

/// Background I/O tasks attached to one child
#[derive(Default)]
struct Pumps {
    handles: Vec<JoinHandle<()>>,
}

impl Pumps {
    /// Wait for every pump. Cancel-safe: finished handles are dropped as
    /// they complete, so a re-poll never touches a completed handle.
    async fn finish(&mut self) {
        while let Some(handle) = self.handles.last_mut() {
            let _ = handle.await;
            self.handles.pop();
        }
    }

    async fn finish_within(&mut self, grace: Duration) {
        if tokio::time::timeout(grace, self.finish()).await.is_err() {
            warn!("Output pumps still blocked after kill, abandoning them");
            for handle in self.handles.drain(..) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records kill requests and always reports failure, so the monitor
    /// falls back to killing the direct child
    #[derive(Default)]
    struct CountingKill(AtomicUsize);

    impl TreeKill for CountingKill {
        fn kill_tree(&self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "no tree"))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervise_normal_exit() {
        let config = SandboxConfig::new().resolve();
        let cmd = build_command(&config, "true", &[]);
        let running = spawn(cmd, &config, "true").unwrap();
        let killer = CountingKill::default();

        let supervised = running
            .supervise(&killer, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert!(supervised.status.success());
        assert!(supervised.killed.is_none());
        assert_eq!(killer.0.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervise_timeout_kills_and_reaps() {
        let config = SandboxConfig::new().resolve();
        let args = vec!["10".to_string()];
        let cmd = build_command(&config, "sleep", &args);
        let running = spawn(cmd, &config, "sleep").unwrap();
        let killer = CountingKill::default();

        let supervised = running
            .supervise(&killer, Duration::from_millis(200), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(supervised.killed, Some(KillReason::Timeout));
        assert!(supervised.elapsed >= Duration::from_millis(200));
        assert!(supervised.elapsed < Duration::from_secs(5));
        assert_eq!(killer.0.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervise_cancellation() {
        let config = SandboxConfig::new().resolve();
        let args = vec!["10".to_string()];
        let cmd = build_command(&config, "sleep", &args);
        let running = spawn(cmd, &config, "sleep").unwrap();
        let killer = CountingKill::default();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let supervised = running
            .supervise(&killer, Duration::from_secs(30), &cancel)
            .await
            .unwrap();

        assert_eq!(supervised.killed, Some(KillReason::Cancelled));
        assert!(supervised.elapsed < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_beats_pending_cancellation() {
        let config = SandboxConfig::new().resolve();
        let cmd = build_command(&config, "true", &[]);
        let running = spawn(cmd, &config, "true").unwrap();
        let killer = CountingKill::default();
        let cancel = CancellationToken::new();

        // Both the exit and the token are ready by the time we supervise
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let supervised = running
            .supervise(&killer, Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        assert!(supervised.status.success());
        assert!(supervised.killed.is_none());
        assert_eq!(killer.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let config = SandboxConfig::new().resolve();
        let cmd = build_command(&config, "/definitely/not/a/program", &[]);
        let err = spawn(cmd, &config, "/definitely/not/a/program")
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_bytes_round_trip_through_cat() {
        let stdout = CaptureBuffer::new();
        let config = SandboxConfig::new()
            .with_stdin(Input::Bytes(b"line one\n\x00binary\xff".to_vec()))
            .with_stdout(Output::Capture(stdout.clone()))
            .resolve();
        let cmd = build_command(&config, "cat", &[]);
        let running = spawn(cmd, &config, "cat").unwrap();

        let supervised = running
            .supervise(
                &CountingKill::default(),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(supervised.status.success());
        assert_eq!(stdout.contents(), b"line one\n\x00binary\xff");
    }
}
