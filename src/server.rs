//! The supervisor: owns the process tree, the file monitor, the acceptor
//! registry and the client socket, and ties them together in one poll loop.
//!
//! Concurrency model: the tree and the monitor are touched only on this
//! thread; forked processes reach them exclusively through report datagrams.
//! The registry is the one shared structure, because client handler threads
//! look acceptors up while registrations land here.

use std::fs;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};

use crate::client_handler;
use crate::ipc::{self, RegistrationMsg, ReportMessage, ReportSender};
use crate::log::{log_error, log_info, log_warn};
use crate::node::{ForkContext, NodeLinks, NodeState, acceptor, stage};
use crate::paths;
use crate::plan::{self, NodeSpec, Plan};
use crate::registry::Registry;
use crate::tree::ProcessTree;
use crate::watch::{self, FileMonitor};

const TICK_MS: u16 = 1000;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

struct RootSlot {
    name: String,
    pid: i32,
    state: NodeState,
}

/// Run the supervisor until SIGINT/SIGTERM. Blocks the calling thread.
pub fn run() -> Result<()> {
    let loaded = plan::load_plan_file(&paths::plan_path())
        .with_context(|| format!("could not load {}", paths::plan_path().display()))?;
    let plan = Arc::new(loaded.plan);

    watch::raise_open_file_limit();
    install_signal_handlers()?;

    let sock_path = paths::socket_path();
    let listener = bind_listener(&sock_path)?;

    let (report_rx, report_tx) = ipc::dgram_pair()?;
    let (reg_rx, reg_tx) = ipc::dgram_pair()?;
    if loaded.watcher.is_empty() {
        bail!("hearth.json must set \"watcher\" to a watch-helper command");
    }
    let mut monitor = FileMonitor::spawn(&loaded.watcher)?;

    // Everything the supervisor holds but the tree must not.
    let fork_ctx = ForkContext::new(vec![
        listener.as_raw_fd(),
        report_rx.as_raw_fd(),
        reg_rx.as_raw_fd(),
        monitor.poll_fd().as_raw_fd(),
        monitor.stdin_fd().as_raw_fd(),
    ]);
    let links = NodeLinks::new(ReportSender::new(report_tx), reg_tx);

    let mut tree = ProcessTree::new(getpid().as_raw());
    let mut roots = Vec::new();
    for root in &plan.roots {
        let pid = spawn_root(&plan, root, &links, &fork_ctx)?;
        roots.push(RootSlot {
            name: root.name().to_string(),
            pid,
            state: NodeState::Running,
        });
        log_info("server", "spawned", &format!("{} (pid {pid})", root.name()));
    }

    let registry = Registry::new();
    {
        let registry = registry.clone();
        let plan = Arc::clone(&plan);
        thread::spawn(move || client_handler::serve(listener, registry, plan));
    }
    log_info(
        "server",
        "ready",
        &format!("listening on {}", sock_path.display()),
    );

    let mut report_buf = vec![0u8; ipc::MAX_DATAGRAM];
    while !SHUTDOWN.load(Ordering::SeqCst) {
        let mut pfds = [
            PollFd::new(report_rx.as_fd(), PollFlags::POLLIN),
            PollFd::new(reg_rx.as_fd(), PollFlags::POLLIN),
            PollFd::new(monitor.poll_fd(), PollFlags::POLLIN),
        ];
        let report_ready;
        let reg_ready;
        let watch_ready;
        match poll(&mut pfds, PollTimeout::from(TICK_MS)) {
            Ok(_) => {
                let ready =
                    |p: &PollFd| p.revents().is_some_and(|r| r.intersects(PollFlags::POLLIN));
                report_ready = ready(&pfds[0]);
                reg_ready = ready(&pfds[1]);
                watch_ready = ready(&pfds[2]);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("poll failed"),
        }

        if report_ready {
            drain_report(report_rx.as_raw_fd(), &mut report_buf, &mut tree, &mut monitor)?;
        }
        if reg_ready {
            accept_registration(reg_rx.as_raw_fd(), &mut report_buf, &registry);
        }
        if watch_ready {
            match monitor.read_events()? {
                Some(changed) => {
                    for path in changed {
                        invalidate(&mut tree, &path);
                    }
                }
                None => bail!("watch helper exited; cannot track changes any more"),
            }
        }

        reap_roots(&mut roots);
        monitor.retry_pending()?;
    }

    log_info("server", "shutdown", "terminating process tree");
    for root in roots.iter().filter(|r| r.state == NodeState::Running) {
        kill_pids(&tree.subtree_pids(root.pid));
    }
    while let Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) =
        waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG))
    {}
    let _ = fs::remove_file(&sock_path);
    Ok(())
}

fn install_signal_handlers() -> Result<()> {
    // SAFETY: handlers only touch an atomic; SIGPIPE must not kill us when
    // a client disappears mid-write.
    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(request_shutdown))
            .context("could not install SIGINT handler")?;
        signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown))
            .context("could not install SIGTERM handler")?;
        signal(Signal::SIGPIPE, SigHandler::SigIgn).context("could not ignore SIGPIPE")?;
    }
    Ok(())
}

/// Bind the supervisor socket. A leftover socket file from a crashed
/// supervisor is unlinked and replaced; a live one is an error.
fn bind_listener(path: &Path) -> Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(l) => Ok(l),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).is_ok() {
                bail!("a supervisor is already running on {}", path.display());
            }
            log_warn(
                "server",
                "stale_socket",
                &format!("removing leftover {}", path.display()),
            );
            fs::remove_file(path)
                .with_context(|| format!("could not remove stale {}", path.display()))?;
            UnixListener::bind(path)
                .with_context(|| format!("could not bind {}", path.display()))
        }
        Err(e) => Err(e).with_context(|| format!("could not bind {}", path.display())),
    }
}

fn spawn_root(
    plan: &Plan,
    spec: &NodeSpec,
    links: &NodeLinks,
    ctx: &ForkContext,
) -> Result<i32> {
    // SAFETY: the child immediately drops supervisor fds and enters its own
    // run loop; no locks are held across the fork.
    match unsafe { fork() }.context("could not fork root stage")? {
        ForkResult::Child => {
            ctx.apply_in_child();
            match spec {
                NodeSpec::Stage(s) => stage::run(plan, s, links),
                NodeSpec::Acceptor(a) => acceptor::run(plan, a, links),
            }
        }
        ForkResult::Parent { child } => Ok(child.as_raw()),
    }
}

fn drain_report(
    fd: i32,
    buf: &mut [u8],
    tree: &mut ProcessTree,
    monitor: &mut FileMonitor,
) -> Result<()> {
    let (n, _fds) = ipc::recv_with_fds(fd, buf)?;
    let raw = String::from_utf8_lossy(&buf[..n]);
    match ReportMessage::parse(&raw) {
        Some(ReportMessage::Started { pid, ppid, name }) => {
            tree.record_parent(pid, ppid, &name);
        }
        Some(ReportMessage::Feature { pid, path }) => {
            tree.record_feature(pid, &path);
            monitor.watch(&path)?;
        }
        None => log_warn("server", "bad_report", &raw),
    }
    Ok(())
}

fn accept_registration(fd: i32, buf: &mut [u8], registry: &Registry) {
    let (n, fds) = match ipc::recv_with_fds(fd, buf) {
        Ok(r) => r,
        Err(e) => {
            log_warn("server", "registration_recv_failed", &e.to_string());
            return;
        }
    };
    let msg: RegistrationMsg = match serde_json::from_slice(&buf[..n]) {
        Ok(m) => m,
        Err(e) => {
            log_warn("server", "bad_registration", &e.to_string());
            return;
        }
    };
    let Some(work_fd) = fds.into_iter().next() else {
        log_warn("server", "bad_registration", "registration without work fd");
        return;
    };
    registry.register(msg, work_fd);
}

/// Restart every subtree that depends on `path`.
fn invalidate(tree: &mut ProcessTree, path: &Path) {
    let decision = tree.invalidated_by(path);
    for name in &decision.refused {
        log_warn(
            "server",
            "protected",
            &format!(
                "{} depends on {} but will not be restarted automatically; restart the supervisor",
                name,
                path.display()
            ),
        );
    }
    for doomed in decision.doomed {
        let label = doomed
            .root_name
            .clone()
            .unwrap_or_else(|| format!("pid {}", doomed.root_pid));
        log_info(
            "server",
            "restarting",
            &format!("{label} after change to {}", path.display()),
        );
        kill_pids(&doomed.pids);
        tree.remove_subtree(doomed.root_pid);
    }
}

/// Stop the whole set before killing anything: a parent stage that noticed
/// a dying child mid-sweep would respawn it into the kill window.
fn kill_pids(pids: &[i32]) {
    for &pid in pids {
        let _ = kill(Pid::from_raw(pid), Signal::SIGSTOP);
    }
    for &pid in pids {
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// Root stages are not respawned: they are the protected base of the tree,
/// and a crash there needs a human.
fn reap_roots(roots: &mut [RootSlot]) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _)) => {
                if let Some(slot) = roots.iter_mut().find(|r| r.pid == pid.as_raw()) {
                    slot.state = NodeState::Crashed;
                    log_error(
                        "server",
                        "root_died",
                        &format!("{} (pid {}) is gone; restart the supervisor", slot.name, slot.pid),
                    );
                }
            }
            _ => return,
        }
    }
}
