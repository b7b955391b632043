//! Internal channels between the supervisor and its forked tree.
//!
//! Everything here rides on AF_UNIX socketpairs created before the relevant
//! fork point:
//! - datagram pairs for the pid/feature report channel, the acceptor
//!   registration channel and the per-acceptor work channel (datagrams keep
//!   message boundaries, so a JSON payload and its SCM_RIGHTS descriptors
//!   arrive as one unit);
//! - stream pairs for the per-request reply channel, which only ever
//!   carries two newline-framed integers (runner pid, then exit status).
//!
//! Descriptor passing uses raw libc sendmsg/recvmsg; nix has wrappers but
//! their lifetimes fight the "receive a datagram plus up to two fds into
//! owned values" shape needed here.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use serde::{Deserialize, Serialize};
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

/// Largest internal datagram: a work request (argument vector) or a
/// registration blob. Anything bigger is a bug, not a tuning problem.
pub const MAX_DATAGRAM: usize = 65536;

/// Backoff before retrying a send that failed with ENOBUFS. Reports are
/// fire-and-forget but must never be dropped, so senders sleep and retry.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Aligned backing storage for control messages. msg_control must be
/// suitably aligned for cmsghdr; a plain [u8; N] on the stack is not.
#[repr(align(8))]
struct CmsgBuf([u8; 128]);

impl CmsgBuf {
    fn new() -> Self {
        CmsgBuf([0u8; 128])
    }
}

/// Create a datagram socketpair (message-boundary-preserving, fd-carrying).
/// CLOEXEC so shell actions exec'd by runners don't inherit internal plumbing;
/// plain fork (our own tree nodes) still inherits everything.
pub fn dgram_pair() -> Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .context("socketpair(DGRAM) failed")
}

/// Create a stream socketpair (for the byte-oriented reply channel).
pub fn stream_pair() -> Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .context("socketpair(STREAM) failed")
}

/// Send `data` with up to two descriptors as SCM_RIGHTS ancillary data.
pub fn send_with_fds(sock: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    assert!(fds.len() <= 2, "at most two fds per message");

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // SAFETY: msghdr is a C struct with no Rust invariants; all-zero is a
    // valid "no name, no control" initial state. Pointers assigned below
    // reference locals that outlive the sendmsg call.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut cmsg_buf = CmsgBuf::new();
    if !fds.is_empty() {
        let fd_bytes = std::mem::size_of_val(fds);
        // SAFETY: CMSG_SPACE/CMSG_LEN are pure size computations.
        let space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
        assert!(space <= cmsg_buf.0.len());
        msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        // SAFETY: msg_control points at an aligned, zeroed buffer of at
        // least `space` bytes, so CMSG_FIRSTHDR returns a valid header and
        // CMSG_DATA a region large enough for fd_bytes.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                fd_bytes,
            );
        }
    }

    loop {
        // SAFETY: sock is a caller-supplied open socket; msg points at
        // valid, initialized iovec/control storage for the duration of the
        // call.
        let n = unsafe { libc::sendmsg(sock, &msg, 0) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

/// Like send_with_fds, but retries ENOBUFS/EAGAIN with a short sleep.
/// Used for report/registration sends which must not be dropped under
/// kernel buffer pressure.
pub fn send_with_fds_retrying(sock: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    loop {
        match send_with_fds(sock, data, fds) {
            Ok(n) => return Ok(n),
            Err(e)
                if e.raw_os_error() == Some(libc::ENOBUFS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                std::thread::sleep(SEND_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Receive one message and any SCM_RIGHTS descriptors that rode along.
/// Returns (bytes read, received fds). A zero-byte read on a stream socket
/// means the peer closed; a datagram that does not fit in `buf` is an
/// error, never a silent truncation.
pub fn recv_with_fds(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = CmsgBuf::new();
    // SAFETY: see send_with_fds; same zeroed-msghdr pattern.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.0.len() as _;

    let n = loop {
        // SAFETY: sock is an open socket; iovec and control buffer are
        // valid for the whole call.
        let n = unsafe { libc::recvmsg(sock, &mut msg, 0) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    };

    let mut fds = Vec::new();
    // SAFETY: recvmsg updated msg_controllen; CMSG_* walk only the region
    // the kernel wrote. Each SCM_RIGHTS payload is a packed array of open
    // descriptors which we take ownership of exactly once.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / std::mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(std::ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    // A datagram bigger than buf would otherwise lose its tail without a
    // trace. Collected fds drop here, so nothing leaks with the error.
    if msg.msg_flags & libc::MSG_TRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "datagram larger than the receive buffer",
        ));
    }

    Ok((n, fds))
}

/// Write all of `data`, retrying on EINTR/EAGAIN.
pub fn write_all<F: AsFd>(fd: &F, data: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match nix::unistd::write(fd, &data[written..]) {
            Ok(n) => written += n,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
    Ok(())
}

/// Write one newline-terminated line.
pub fn write_line<F: AsFd>(fd: &F, line: &str) -> io::Result<()> {
    write_all(fd, line.as_bytes())?;
    write_all(fd, b"\n")
}

/// Buffered newline-framed reader over a raw descriptor. Used on the
/// per-request reply channel and the donated client socket, where the
/// counterparty writes single short lines.
pub struct LineReader<F: AsFd> {
    fd: F,
    buf: Vec<u8>,
}

impl<F: AsFd> LineReader<F> {
    pub fn new(fd: F) -> Self {
        Self {
            fd,
            buf: Vec::new(),
        }
    }

    /// Read the next line (without the newline). Ok(None) on clean EOF.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                return Ok(Some(String::from_utf8_lossy(line).into_owned()));
            }
            let mut chunk = [0u8; 4096];
            match nix::unistd::read(self.fd.as_fd(), &mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Report channel wire format
// ---------------------------------------------------------------------------

/// One datagram on the report channel. Text-framed: `P:<pid>:<ppid>:<name>`
/// binds a freshly forked node to its parent and logical name;
/// `F:<pid>:<path>` records a loaded dependency file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportMessage {
    Started {
        pid: i32,
        ppid: i32,
        name: String,
    },
    Feature {
        pid: i32,
        path: PathBuf,
    },
}

impl ReportMessage {
    pub fn encode(&self) -> String {
        match self {
            ReportMessage::Started { pid, ppid, name } => format!("P:{}:{}:{}", pid, ppid, name),
            ReportMessage::Feature { pid, path } => format!("F:{}:{}", pid, path.display()),
        }
    }

    /// Parse a report datagram. Paths may contain ':' so the feature form
    /// splits at most twice.
    pub fn parse(raw: &str) -> Option<ReportMessage> {
        let (kind, rest) = raw.split_once(':')?;
        match kind {
            "P" => {
                let mut parts = rest.splitn(3, ':');
                let pid = parts.next()?.parse().ok()?;
                let ppid = parts.next()?.parse().ok()?;
                let name = parts.next()?.to_string();
                Some(ReportMessage::Started { pid, ppid, name })
            }
            "F" => {
                let (pid, path) = rest.split_once(':')?;
                Some(ReportMessage::Feature {
                    pid: pid.parse().ok()?,
                    path: PathBuf::from(path),
                })
            }
            _ => None,
        }
    }
}

/// Sender half of the report channel, inherited by every tree node.
/// Cloneable so a node's reporter thread can own a handle while the node's
/// main loop keeps its own.
#[derive(Clone)]
pub struct ReportSender {
    fd: std::sync::Arc<OwnedFd>,
}

impl ReportSender {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd: std::sync::Arc::new(fd),
        }
    }

    pub fn send(&self, msg: &ReportMessage) -> io::Result<()> {
        send_with_fds_retrying(self.fd.as_raw_fd(), msg.encode().as_bytes(), &[])?;
        Ok(())
    }

    pub fn started(&self, pid: i32, ppid: i32, name: &str) -> io::Result<()> {
        self.send(&ReportMessage::Started {
            pid,
            ppid,
            name: name.to_string(),
        })
    }

    pub fn feature(&self, pid: i32, path: &std::path::Path) -> io::Result<()> {
        self.send(&ReportMessage::Feature {
            pid,
            path: path.to_path_buf(),
        })
    }
}

// ---------------------------------------------------------------------------
// JSON payloads
// ---------------------------------------------------------------------------

/// Registration datagram an acceptor sends the supervisor, accompanied by
/// the supervisor-side descriptor of its work channel.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationMsg {
    pub pid: i32,
    pub commands: Vec<String>,
}

/// Work request the client handler sends an acceptor, accompanied by the
/// donated terminal fd and the per-request reply fd (in that order).
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkRequest {
    pub arguments: Vec<String>,
    pub client_pid: i32,
}

/// First line a client writes on the well-known socket, before donating
/// its terminal descriptor.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRequest {
    pub command: String,
    pub arguments: Vec<String>,
    pub client_pid: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_report_roundtrip_started() {
        let msg = ReportMessage::Started {
            pid: 123,
            ppid: 7,
            name: "boot".into(),
        };
        assert_eq!(ReportMessage::parse(&msg.encode()), Some(msg));
    }

    #[test]
    fn test_report_feature_path_with_colons() {
        // load-path entries can contain ':' (e.g. versioned gem dirs)
        let msg = ReportMessage::parse("F:42:/opt/x:y/lib/app.rb").unwrap();
        assert_eq!(
            msg,
            ReportMessage::Feature {
                pid: 42,
                path: PathBuf::from("/opt/x:y/lib/app.rb"),
            }
        );
    }

    #[test]
    fn test_report_parse_garbage() {
        assert_eq!(ReportMessage::parse(""), None);
        assert_eq!(ReportMessage::parse("X:1:2"), None);
        assert_eq!(ReportMessage::parse("P:notanumber:2:x"), None);
    }

    #[test]
    fn test_dgram_preserves_boundaries() {
        let (a, b) = dgram_pair().unwrap();
        send_with_fds(a.as_raw_fd(), b"first", &[]).unwrap();
        send_with_fds(a.as_raw_fd(), b"second", &[]).unwrap();
        let mut buf = [0u8; 64];
        let (n, fds) = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        assert!(fds.is_empty());
        let (n, _) = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn test_recv_rejects_datagram_larger_than_buffer() {
        let (a, b) = dgram_pair().unwrap();
        let big = vec![b'x'; MAX_DATAGRAM + 512];
        send_with_fds(a.as_raw_fd(), &big, &[]).unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let err = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_fd_passing_transfers_open_descriptor() {
        let (a, b) = dgram_pair().unwrap();
        let (pipe_r, pipe_w) = nix::unistd::pipe().unwrap();

        send_with_fds(a.as_raw_fd(), b"here", &[pipe_w.as_raw_fd()]).unwrap();
        drop(pipe_w); // sender's copy gone; received copy must still work

        let mut buf = [0u8; 16];
        let (n, mut fds) = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"here");
        assert_eq!(fds.len(), 1);

        let received = fds.pop().unwrap();
        write_all(&received, b"ping").unwrap();
        drop(received);

        let mut out = [0u8; 16];
        let n = nix::unistd::read(pipe_r.as_fd(), &mut out).unwrap();
        assert_eq!(&out[..n], b"ping");
    }

    #[test]
    fn test_two_fds_in_one_message() {
        let (a, b) = dgram_pair().unwrap();
        let (r1, w1) = nix::unistd::pipe().unwrap();
        let (r2, w2) = nix::unistd::pipe().unwrap();
        send_with_fds(
            a.as_raw_fd(),
            b"pair",
            &[w1.as_raw_fd(), w2.as_raw_fd()],
        )
        .unwrap();
        drop(w1);
        drop(w2);

        let mut buf = [0u8; 16];
        let (_, fds) = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(fds.len(), 2);

        write_all(&fds[0], b"1").unwrap();
        write_all(&fds[1], b"2").unwrap();
        let mut one = [0u8; 4];
        assert_eq!(nix::unistd::read(r1.as_fd(), &mut one).unwrap(), 1);
        assert_eq!(one[0], b'1');
        assert_eq!(nix::unistd::read(r2.as_fd(), &mut one).unwrap(), 1);
        assert_eq!(one[0], b'2');
    }

    #[test]
    fn test_line_reader_handles_split_lines() {
        let (a, b) = stream_pair().unwrap();
        write_all(&a, b"12").unwrap();
        write_all(&a, b"34\n56\n").unwrap();
        drop(a);

        let mut reader = LineReader::new(b);
        assert_eq!(reader.read_line().unwrap(), Some("1234".to_string()));
        assert_eq!(reader.read_line().unwrap(), Some("56".to_string()));
        assert_eq!(reader.read_line().unwrap(), None);
    }
}
