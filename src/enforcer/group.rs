//! Process-group kill target for Unix enforcers
//!
//! Children are spawned as leaders of a fresh process group, so the group
//! id equals the child pid and `killpg` reaches every descendant that did
//! not deliberately leave the group.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use tokio::process::Command;

use crate::monitor::TreeKill;

/// Make the child the leader of its own process group
pub(crate) fn new_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcessGroup(Pid);

impl ProcessGroup {
    /// Group led by the given child pid (`None` once the child was reaped)
    pub fn led_by(pid: Option<u32>) -> Option<Self> {
        pid.map(|pid| ProcessGroup(Pid::from_raw(pid as i32)))
    }

    pub fn pgid(&self) -> Pid {
        self.0
    }
}

impl TreeKill for ProcessGroup {
    fn kill_tree(&self) -> io::Result<()> {
        match killpg(self.pgid(), Signal::SIGKILL) {
            // Whole group already exited
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

/// A child reaped before its pid was read has no group left to kill
impl TreeKill for Option<ProcessGroup> {
    fn kill_tree(&self) -> io::Result<()> {
        match self {
            Some(group) => group.kill_tree(),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "child has no process group",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_killpg_reaches_grandchildren() {
        let mut cmd = Command::new("sh");
        // The inner sleep is a grandchild of this test
        cmd.args(["-c", "sleep 30 & wait"]);
        new_group(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let group = ProcessGroup::led_by(child.id()).unwrap();
        assert_eq!(group.pgid().as_raw() as u32, child.id().unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        group.kill_tree().unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("group kill should end the shell")
            .unwrap();
        assert!(!status.success());

        // Second kill on a dead group is not an error
        assert!(group.kill_tree().is_ok());
    }
}
