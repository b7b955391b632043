//! The per-request worker: a fresh fork of an acceptor that becomes the
//! client's command for exactly one invocation.
//!
//! Reply-channel protocol, in order: our pid followed by a newline (so the
//! client can start forwarding terminal signals before the command produces
//! any output), then after the command finishes its exit status followed by
//! a newline. Both lines travel on the dedicated reply socket, never on the
//! terminal, so command output can't corrupt them.

use std::os::fd::{AsRawFd, OwnedFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{Pid, getpid, setsid};

use crate::ipc::{self, WorkRequest};
use crate::log::log_debug;
use crate::plan::{CommandFn, Plan};

/// How often the orphan watchdog probes the client.
const CLIENT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Run one dispatched request to completion. Never returns; the process
/// exits with the command's status.
pub fn run(
    plan: &Plan,
    command: &str,
    req: &WorkRequest,
    terminal: OwnedFd,
    reply: OwnedFd,
) -> ! {
    // Own session: terminal signals from the client's tty are forwarded by
    // the client process, not delivered through the acceptor's group.
    let _ = setsid();

    // Runners stay out of the process tree: nobody waits on them (the
    // acceptor ignores SIGCHLD), so a tree entry would outlive the process
    // and leave a recycled pid as a kill target on invalidation.
    let pid = getpid().as_raw();

    if let Some(hook) = &plan.runner_hook {
        hook();
    }

    if ipc::write_line(&reply, &pid.to_string()).is_err() {
        // Client handler is gone; nobody is listening for this request.
        std::process::exit(1);
    }

    if req.client_pid > 0 {
        watch_client(req.client_pid);
    }

    // From here on the command owns the client's terminal. dup2 clears
    // close-on-exec, so shell-backed commands inherit it too.
    let term_fd = terminal.as_raw_fd();
    // SAFETY: term_fd is a valid open fd; replacing stdio is the point.
    unsafe {
        libc::dup2(term_fd, 0);
        libc::dup2(term_fd, 1);
        libc::dup2(term_fd, 2);
    }
    drop(terminal);

    let status = match plan.command_for(command) {
        Some(f) => run_guarded(f, &req.arguments),
        None => {
            // Dispatch and plan disagree; can only happen if the plan file
            // changed under a running supervisor.
            eprintln!("no such command: {command}");
            1
        }
    };

    let _ = ipc::write_line(&reply, &status.to_string());
    log_debug(
        "runner",
        "finished",
        &format!("command={command} status={status}"),
    );
    std::process::exit(status);
}

/// A panicking command must still produce a status line; turn the panic
/// into output on the client's terminal and status 1.
fn run_guarded(f: &CommandFn, arguments: &[String]) -> i32 {
    match catch_unwind(AssertUnwindSafe(|| f(arguments))) {
        Ok(status) => status,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "command panicked".to_string());
            eprintln!("command failed: {msg}");
            1
        }
    }
}

/// If the client dies mid-command (closed terminal, kill -9), the command
/// would keep running headless and hold the acceptor's resources. Probe the
/// client pid and take the whole session down when it disappears.
fn watch_client(client_pid: i32) {
    thread::spawn(move || {
        loop {
            thread::sleep(CLIENT_PROBE_INTERVAL);
            if let Err(Errno::ESRCH) = kill(Pid::from_raw(client_pid), None) {
                // SAFETY: signalling our own process group.
                unsafe {
                    libc::kill(0, libc::SIGKILL);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::LineReader;
    use crate::plan::Plan;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::ForkResult;

    #[test]
    fn test_forked_runner_completes_the_reply_handshake() {
        let plan = Plan::new(vec![])
            .command_action("count", Box::new(|args: &[String]| args.len() as i32));
        let req = WorkRequest {
            arguments: vec!["a".to_string(), "b".to_string()],
            client_pid: 0,
        };
        let (term_ours, term_theirs) = ipc::stream_pair().unwrap();
        let (reply_ours, reply_theirs) = ipc::stream_pair().unwrap();

        // SAFETY: the child never returns into the harness; run() exits.
        match unsafe { nix::unistd::fork() }.unwrap() {
            ForkResult::Child => {
                drop(term_ours);
                drop(reply_ours);
                run(&plan, "count", &req, term_theirs, reply_theirs);
            }
            ForkResult::Parent { child } => {
                drop(term_theirs);
                drop(reply_theirs);
                let mut reply = LineReader::new(reply_ours);
                // first line is the runner's own pid, second its status
                let pid_line = reply.read_line().unwrap().unwrap();
                assert_eq!(pid_line.parse::<i32>().unwrap(), child.as_raw());
                assert_eq!(reply.read_line().unwrap().as_deref(), Some("2"));
                assert!(matches!(
                    waitpid(child, None).unwrap(),
                    WaitStatus::Exited(_, 2)
                ));
            }
        }
    }

    #[test]
    fn test_run_guarded_passes_through_status() {
        let plan = Plan::new(vec![]).command_action("ok", Box::new(|_| 7));
        let f = plan.command_for("ok").unwrap();
        assert_eq!(run_guarded(f, &[]), 7);
    }

    #[test]
    fn test_run_guarded_turns_panic_into_failure() {
        let plan = Plan::new(vec![]).command_action("boom", Box::new(|_| panic!("nope")));
        let f = plan.command_for("boom").unwrap();
        assert_eq!(run_guarded(f, &[]), 1);
    }

    #[test]
    fn test_run_guarded_sees_arguments() {
        let plan = Plan::new(vec![]).command_action(
            "count",
            Box::new(|args: &[String]| args.len() as i32),
        );
        let f = plan.command_for("count").unwrap();
        let args = vec!["a".to_string(), "b".to_string()];
        assert_eq!(run_guarded(f, &args), 2);
    }
}
