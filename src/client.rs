//! The thin client behind `hearth <command>`: connect to the supervisor
//! socket, hand over our terminal, then get out of the way.
//!
//! After the request is sent the client does exactly two things: forward
//! terminal signals (Ctrl-C and friends) to the runner pid it was told
//! about, and wait for the status line. All command I/O happens directly
//! between the runner and the donated terminal fd.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::ipc::{self, ClientRequest, LineReader};
use crate::paths;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Runner pid the signal handler forwards to; 0 while there is none.
static FORWARD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: libc::c_int) {
    let pid = FORWARD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: async-signal-safe; kill on a stored pid.
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

/// Run one command through the supervisor. Returns the exit status to pass
/// to the shell.
pub fn run_command(command: &str, arguments: &[String]) -> Result<i32> {
    let sock_path = paths::socket_path();
    let stream = match connect_with_timeout(&sock_path, CONNECT_TIMEOUT) {
        Ok(s) => s,
        Err(_) => {
            bail!("the supervisor doesn't seem to be running. start it with: hearth start");
        }
    };

    let req = ClientRequest {
        command: command.to_string(),
        arguments: arguments.to_vec(),
        client_pid: std::process::id() as i32,
    };
    let mut payload = serde_json::to_vec(&req).context("could not encode request")?;
    payload.push(b'\n');
    // Terminal donation: the runner's stdio becomes our stdin's open file
    // description, so its output lands on our tty without any proxying.
    ipc::send_with_fds(stream.as_raw_fd(), &payload, &[libc::STDIN_FILENO])
        .context("could not send request to supervisor")?;

    let mut reader = LineReader::new(stream);
    let pid_line = reader
        .read_line()?
        .context("supervisor hung up before dispatching")?;
    let runner_pid: i32 = pid_line.trim().parse().unwrap_or(0);
    if runner_pid > 0 {
        FORWARD_PID.store(runner_pid, Ordering::SeqCst);
        install_forwarders();
    }

    let status_line = reader
        .read_line()?
        .context("supervisor hung up before the command finished")?;
    Ok(status_line.trim().parse().unwrap_or(1))
}

fn install_forwarders() {
    for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGTSTP] {
        // SAFETY: handler only touches an atomic and calls kill.
        unsafe {
            libc::signal(
                sig,
                forward_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
            );
        }
    }
}

/// Blocking UnixStream::connect has no timeout; do the non-blocking
/// connect/poll/SO_ERROR dance by hand.
fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<UnixStream> {
    use std::os::unix::ffi::OsStrExt;

    let path_bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    if path_bytes.len() >= addr.sun_path.len() {
        bail!("socket path too long: {}", path.display());
    }
    for (i, &b) in path_bytes.iter().enumerate() {
        addr.sun_path[i] = b as libc::c_char;
    }

    // SAFETY: standard socket creation; fd ownership is taken immediately.
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd < 0 {
        bail!("socket() failed: {}", std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: addr is a fully initialized sockaddr_un of the stated length.
    let rc = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            bail!("connect to {} failed: {err}", path.display());
        }
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        // SAFETY: pfd points at a live pollfd for the duration of the call.
        let n = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if n <= 0 {
            bail!("connect to {} timed out", path.display());
        }
        let mut so_err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: so_err/len are valid out-parameters for SO_ERROR.
        unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            );
        }
        if so_err != 0 {
            bail!(
                "connect to {} failed: {}",
                path.display(),
                std::io::Error::from_raw_os_error(so_err)
            );
        }
    }

    // Back to blocking for the line-oriented handshake.
    // SAFETY: fcntl on an fd we own.
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags & !libc::O_NONBLOCK);
    }
    Ok(UnixStream::from(fd))
}
