//! Acceptors: the leaves of the process tree. An acceptor boots once (via
//! its ancestor stages), registers a work channel with the supervisor, and
//! then forks a fresh runner for every dispatched request.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{ForkResult, fork, getpid, getppid};

use crate::ipc::{self, RegistrationMsg, WorkRequest};
use crate::log::{log_error, log_info, log_warn};
use crate::node::{NodeLinks, runner};
use crate::plan::{AcceptorSpec, Plan};

/// Commands this acceptor answers to: its name plus every alias.
fn command_words(spec: &AcceptorSpec) -> Vec<String> {
    let mut words = vec![spec.name.clone()];
    words.extend(spec.aliases.iter().cloned());
    words
}

/// Run a booted acceptor. Never returns.
pub fn run(plan: &Plan, spec: &AcceptorSpec, links: &NodeLinks) -> ! {
    let pid = getpid().as_raw();
    let _ = links.report.started(pid, getppid().as_raw(), &spec.name);

    // Runners are fire-and-forget from our side; let the kernel reap them.
    // SAFETY: SIG_IGN on SIGCHLD is a valid disposition.
    let _ = unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) };

    let work = match register(spec, links) {
        Ok(fd) => fd,
        Err(e) => {
            log_error("acceptor", "register_failed", &e.to_string());
            std::process::exit(1);
        }
    };
    log_info("acceptor", "ready", &spec.name);

    let mut buf = vec![0u8; ipc::MAX_DATAGRAM];
    loop {
        let (n, fds) = match ipc::recv_with_fds(work.as_raw_fd(), &mut buf) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                // One truncated datagram; the channel itself is fine.
                log_warn("acceptor", "bad_request", &e.to_string());
                continue;
            }
            Err(e) => {
                log_error("acceptor", "work_recv_failed", &e.to_string());
                std::process::exit(1);
            }
        };
        if n == 0 && fds.is_empty() {
            // Supervisor closed its end; we are orphaned.
            std::process::exit(0);
        }
        let req: WorkRequest = match serde_json::from_slice(&buf[..n]) {
            Ok(req) => req,
            Err(e) => {
                log_warn("acceptor", "bad_request", &e.to_string());
                continue;
            }
        };
        let mut fds = fds.into_iter();
        let (Some(terminal), Some(reply)) = (fds.next(), fds.next()) else {
            log_warn("acceptor", "bad_request", "request arrived without fds");
            continue;
        };

        // SAFETY: single-threaded apart from signal dispositions; the child
        // immediately takes over as the runner.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // The runner must not hold the work channel open: a dead
                // acceptor is detected by its channel breaking.
                drop(work);
                runner::run(plan, &spec.name, &req, terminal, reply);
            }
            Ok(ForkResult::Parent { .. }) => {
                drop(terminal);
                drop(reply);
            }
            Err(e) => {
                log_error("acceptor", "fork_failed", &e.to_string());
                let _ = ipc::write_all(&terminal, b"could not fork a worker\n");
                let _ = ipc::write_line(&reply, "0");
                let _ = ipc::write_line(&reply, "1");
            }
        }
    }
}

/// Create the work channel and donate the supervisor's end of it along with
/// the registration metadata. Returns our end.
fn register(spec: &AcceptorSpec, links: &NodeLinks) -> std::io::Result<OwnedFd> {
    let (local, remote) = ipc::dgram_pair().map_err(std::io::Error::other)?;
    let msg = RegistrationMsg {
        pid: getpid().as_raw(),
        commands: command_words(spec),
    };
    links.send_registration(&msg, remote.as_raw_fd())?;
    drop(remote);
    Ok(local)
}

/// Serve an acceptor's command words without an acceptor process behind
/// them: every request gets the boot error on its terminal and status 1.
/// Used by stages whose boot action failed, so the user sees the error from
/// any command they try instead of a hang. Loops until the stage dies.
pub fn run_error_stub(spec: &AcceptorSpec, links: &NodeLinks, error_text: &str) {
    let work = match register(spec, links) {
        Ok(fd) => fd,
        Err(e) => {
            log_error("acceptor", "stub_register_failed", &e.to_string());
            return;
        }
    };
    let mut buf = vec![0u8; ipc::MAX_DATAGRAM];
    loop {
        let (n, fds) = match ipc::recv_with_fds(work.as_raw_fd(), &mut buf) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => continue,
            Err(_) => return,
        };
        if n == 0 && fds.is_empty() {
            return;
        }
        let mut fds = fds.into_iter();
        let (Some(terminal), Some(reply)) = (fds.next(), fds.next()) else {
            continue;
        };
        let _ = ipc::write_all(&terminal, error_text.as_bytes());
        let _ = ipc::write_all(&terminal, b"\n");
        // pid 0 tells the client there is no process to forward signals to
        let _ = ipc::write_line(&reply, "0");
        let _ = ipc::write_line(&reply, "1");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{LineReader, ReportSender};
    use std::thread;

    #[test]
    fn test_command_words_include_aliases() {
        let spec = AcceptorSpec {
            name: "test".to_string(),
            aliases: vec!["t".to_string(), "rspec".to_string()],
            description: String::new(),
        };
        assert_eq!(command_words(&spec), vec!["test", "t", "rspec"]);
    }

    #[test]
    fn test_error_stub_relays_the_boot_error_to_requests() {
        let (report_tx, _report_rx) = ipc::dgram_pair().unwrap();
        let (reg_tx, reg_rx) = ipc::dgram_pair().unwrap();
        let links = NodeLinks::new(ReportSender::new(report_tx), reg_tx);
        let spec = AcceptorSpec {
            name: "console".to_string(),
            aliases: vec![],
            description: String::new(),
        };
        thread::spawn(move || {
            run_error_stub(&spec, &links, "app failed to boot:\nboom");
        });

        // the stub registers like a real acceptor would
        let mut buf = vec![0u8; ipc::MAX_DATAGRAM];
        let (n, fds) = ipc::recv_with_fds(reg_rx.as_raw_fd(), &mut buf).unwrap();
        let msg: RegistrationMsg = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(msg.commands, vec!["console"]);
        let work = fds.into_iter().next().unwrap();

        let (term_ours, term_theirs) = ipc::stream_pair().unwrap();
        let (reply_ours, reply_theirs) = ipc::stream_pair().unwrap();
        let req = serde_json::to_vec(&WorkRequest {
            arguments: vec![],
            client_pid: 0,
        })
        .unwrap();
        ipc::send_with_fds(
            work.as_raw_fd(),
            &req,
            &[term_theirs.as_raw_fd(), reply_theirs.as_raw_fd()],
        )
        .unwrap();
        drop(term_theirs);
        drop(reply_theirs);

        // handshake shape of a failed dispatch: pid 0, then status 1
        let mut reply = LineReader::new(reply_ours);
        assert_eq!(reply.read_line().unwrap().as_deref(), Some("0"));
        assert_eq!(reply.read_line().unwrap().as_deref(), Some("1"));

        let mut terminal = LineReader::new(term_ours);
        assert_eq!(
            terminal.read_line().unwrap().as_deref(),
            Some("app failed to boot:")
        );
        assert_eq!(terminal.read_line().unwrap().as_deref(), Some("boom"));
    }
}
