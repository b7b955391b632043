//! Forked node processes: stages, acceptors and per-request runners.
//!
//! Everything under this module runs on the far side of a fork. The only
//! ties back to the supervisor are the two inherited datagram sockets in
//! [`NodeLinks`]: the report channel (pid/feature telemetry for the process
//! tree) and the registration channel (acceptors donating their work fd).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::ExitStatus;
use std::sync::Arc;

use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::wait::WaitStatus;

use crate::ipc::{self, RegistrationMsg, ReportSender};

pub mod acceptor;
pub mod runner;
pub mod stage;

/// Lifecycle of a forked child as its parent sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Running,
    Crashed,
}

/// The supervisor-facing sockets every node inherits.
#[derive(Clone)]
pub struct NodeLinks {
    pub report: ReportSender,
    reg_tx: Arc<OwnedFd>,
}

impl NodeLinks {
    pub fn new(report: ReportSender, reg_tx: OwnedFd) -> Self {
        Self {
            report,
            reg_tx: Arc::new(reg_tx),
        }
    }

    /// Announce an acceptor: registration metadata plus its donated work fd.
    pub fn send_registration(&self, msg: &RegistrationMsg, work_fd: RawFd) -> std::io::Result<()> {
        let payload = serde_json::to_vec(msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        ipc::send_with_fds_retrying(self.reg_tx.as_raw_fd(), &payload, &[work_fd])?;
        Ok(())
    }
}

/// Supervisor-only fds that must not leak into forked children, plus the
/// signal state to undo. Built once before the first fork.
pub struct ForkContext {
    close_in_child: Vec<RawFd>,
}

impl ForkContext {
    pub fn new(close_in_child: Vec<RawFd>) -> Self {
        Self { close_in_child }
    }

    /// Run immediately after fork, in the child.
    pub fn apply_in_child(&self) {
        for &fd in &self.close_in_child {
            // SAFETY: plain close of fds the child inherited but must not
            // hold; errors (already closed) are irrelevant here.
            unsafe {
                libc::close(fd);
            }
        }
        // The supervisor's handlers flip its shutdown flag; a child
        // inheriting them would swallow its own termination.
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: restoring the default disposition is always valid.
            let _ = unsafe { signal(sig, SigHandler::SigDfl) };
        }
    }
}

/// Map an exit status to the shell convention: the code if the process
/// exited, 128 + signal number if it was killed.
pub fn exit_code_from_status(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Same convention for a raw wait status.
pub fn exit_code_from_wait(status: &WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => *code,
        WaitStatus::Signaled(_, sig, _) => 128 + *sig as i32,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_exit_code_from_status() {
        use std::process::Command;
        let ok = Command::new("true").status().unwrap();
        assert_eq!(exit_code_from_status(ok), 0);
        let fail = Command::new("sh").arg("-c").arg("exit 3").status().unwrap();
        assert_eq!(exit_code_from_status(fail), 3);
    }

    #[test]
    fn test_exit_code_from_wait() {
        let exited = WaitStatus::Exited(Pid::from_raw(100), 2);
        assert_eq!(exit_code_from_wait(&exited), 2);
        let signaled = WaitStatus::Signaled(Pid::from_raw(100), Signal::SIGKILL, false);
        assert_eq!(exit_code_from_wait(&signaled), 137);
    }
}
