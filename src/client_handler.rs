//! Accepts client connections on the supervisor socket and splices each one
//! to the acceptor that serves its command.
//!
//! The handshake the client sees on its stream socket is two lines: the
//! runner's pid, then (after the command finishes) its exit status. Both are
//! relayed from the per-request reply channel, so a slow command cannot
//! reorder them and command output on the terminal cannot corrupt them. A
//! failed dispatch is reported in the same shape: pid `0`, explanation on
//! the terminal, status `1`.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread;

use crate::ipc::{self, ClientRequest, LineReader, WorkRequest};
use crate::log::{log_debug, log_warn};
use crate::plan::Plan;
use crate::registry::{Lookup, Registry};

pub fn serve(listener: UnixListener, registry: Registry, plan: Arc<Plan>) {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let registry = registry.clone();
                let plan = Arc::clone(&plan);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &registry, &plan) {
                        // A client hanging up mid-handshake is routine.
                        log_debug("client_handler", "connection_ended", &e.to_string());
                    }
                });
            }
            Err(e) => {
                // Listener itself broke; the supervisor is shutting down or
                // the socket was pulled out from under us.
                log_warn("client_handler", "accept_failed", &e.to_string());
                return;
            }
        }
    }
}

fn handle_connection(stream: UnixStream, registry: &Registry, plan: &Plan) -> io::Result<()> {
    let (req, terminal) = read_request(&stream)?;

    if plan.resolve_command(&req.command).is_none() {
        return fail(&stream, &terminal, &unknown_command_listing(plan, &req.command));
    }

    let work = WorkRequest {
        arguments: req.arguments.clone(),
        client_pid: req.client_pid,
    };
    let payload = serde_json::to_vec(&work)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > ipc::MAX_DATAGRAM {
        // The work channel is a datagram socket; an oversized request would
        // be truncated in transit and rejected at the acceptor, leaving the
        // client with no answer at all. Refuse it here with a reason.
        return fail(&stream, &terminal, "arguments too large to dispatch\n");
    }

    let mut announced = false;
    loop {
        let reg = match registry.find_or_wait(&req.command) {
            Lookup::Ready(r) => r,
            Lookup::Pending(rx) => {
                if !announced {
                    ipc::write_all(
                        &terminal,
                        format!("waiting for `{}` to finish booting...\n", req.command)
                            .as_bytes(),
                    )?;
                    announced = true;
                }
                match rx.recv() {
                    Ok(r) => r,
                    Err(_) => return Ok(()),
                }
            }
        };

        let (local, remote) = ipc::stream_pair()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Err(e) = reg.send_work(&work, terminal.as_raw_fd(), remote.as_raw_fd()) {
            // The acceptor behind this registration is gone, most likely
            // killed by an invalidation moments ago. Forget it and wait for
            // the replacement to register.
            log_warn(
                "client_handler",
                "stale_acceptor",
                &format!("pid={} command={}: {e}", reg.pid, req.command),
            );
            registry.remove_pid(reg.pid);
            continue;
        }
        drop(remote);

        let mut reply = LineReader::new(local);
        let Some(pid_line) = reply.read_line()? else {
            // Runner died before announcing itself; retry against whatever
            // registers next rather than leaving the client hanging.
            registry.remove_pid(reg.pid);
            continue;
        };
        ipc::write_line(&stream, &pid_line)?;

        let status_line = reply.read_line()?.unwrap_or_else(|| "1".to_string());
        ipc::write_line(&stream, &status_line)?;
        log_debug(
            "client_handler",
            "dispatched",
            &format!("command={} pid={pid_line} status={status_line}", req.command),
        );
        return Ok(());
    }
}

/// Read the request line and the terminal fd that rides along with it. The
/// line may arrive in pieces; the fd may arrive on any of them.
fn read_request(stream: &UnixStream) -> io::Result<(ClientRequest, OwnedFd)> {
    let mut buf = vec![0u8; ipc::MAX_DATAGRAM];
    let mut line = Vec::new();
    let mut fds: Vec<OwnedFd> = Vec::new();
    loop {
        let (n, mut new_fds) = ipc::recv_with_fds(stream.as_raw_fd(), &mut buf)?;
        if n == 0 && new_fds.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client hung up before sending a request",
            ));
        }
        fds.append(&mut new_fds);
        line.extend_from_slice(&buf[..n]);
        if line.contains(&b'\n') {
            break;
        }
    }
    let terminal = fds.into_iter().next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "request carried no terminal fd")
    })?;
    let end = line.iter().position(|&b| b == b'\n').unwrap();
    let req: ClientRequest = serde_json::from_slice(&line[..end])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((req, terminal))
}

/// What a mistyped command gets on its terminal: every dispatchable
/// command with its aliases and description, straight from the plan.
fn unknown_command_listing(plan: &Plan, word: &str) -> String {
    let mut msg = format!("unknown command `{word}`\ncommands:\n");
    for acc in plan.roots.iter().flat_map(|r| r.descendant_acceptors()) {
        let mut words = acc.name.clone();
        for alias in &acc.aliases {
            words.push_str(", ");
            words.push_str(alias);
        }
        if acc.description.is_empty() {
            msg.push_str(&format!("  {words}\n"));
        } else {
            msg.push_str(&format!("  {words:<16}{}\n", acc.description));
        }
    }
    msg
}

fn fail(stream: &UnixStream, terminal: &OwnedFd, msg: &str) -> io::Result<()> {
    ipc::write_line(stream, "0")?;
    ipc::write_all(terminal, msg.as_bytes())?;
    ipc::write_line(stream, "1")?;
    Ok(())
}
