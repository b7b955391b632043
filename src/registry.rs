//! Registry of booted acceptors, keyed by the commands they serve.
//!
//! Acceptors live in other processes; what the supervisor holds is the
//! registration metadata plus the work-channel fd the acceptor donated at
//! registration time. Client handler threads look commands up here and, when
//! the acceptor has not booted yet, park on a waiter that registration
//! drains. The check-then-enqueue is done under one lock so a registration
//! can never slip between a failed lookup and the wait.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::ipc::{self, RegistrationMsg, WorkRequest};
use crate::log::log_info;

/// A booted acceptor as seen from the supervisor.
pub struct Registration {
    pub pid: i32,
    pub commands: Vec<String>,
    chan: Mutex<OwnedFd>,
}

impl Registration {
    /// Dispatch one request to the acceptor: the request datagram carries
    /// the client's terminal fd and the reply-channel fd.
    pub fn send_work(&self, req: &WorkRequest, terminal: i32, reply: i32) -> io::Result<()> {
        let payload = serde_json::to_vec(req)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let chan = self.chan.lock().unwrap();
        ipc::send_with_fds_retrying(chan.as_raw_fd(), &payload, &[terminal, reply])?;
        Ok(())
    }

    pub fn serves(&self, word: &str) -> bool {
        self.commands.iter().any(|c| c == word)
    }
}

/// Outcome of an atomic lookup-or-wait.
pub enum Lookup {
    Ready(Arc<Registration>),
    /// Not registered yet; the receiver fires when it is.
    Pending(mpsc::Receiver<Arc<Registration>>),
}

#[derive(Default)]
struct Inner {
    entries: Vec<Arc<Registration>>,
    waiters: HashMap<String, Vec<mpsc::Sender<Arc<Registration>>>>,
}

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a registration, replacing any earlier one that serves an
    /// overlapping command set (a restarted acceptor re-registers under a
    /// new pid), and wake every thread waiting on one of its commands.
    pub fn register(&self, msg: RegistrationMsg, chan: OwnedFd) {
        let reg = Arc::new(Registration {
            pid: msg.pid,
            commands: msg.commands,
            chan: Mutex::new(chan),
        });
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .retain(|old| !old.commands.iter().any(|c| reg.serves(c)));
        for cmd in &reg.commands {
            if let Some(waiting) = inner.waiters.remove(cmd) {
                for tx in waiting {
                    // Receiver may have given up; that's fine.
                    let _ = tx.send(Arc::clone(&reg));
                }
            }
        }
        log_info(
            "registry",
            "registered",
            &format!("pid={} commands={}", reg.pid, reg.commands.join(",")),
        );
        inner.entries.push(reg);
    }

    /// Drop the registration owned by a dead or unresponsive acceptor.
    /// Lookups for its commands go back to waiting until it re-registers.
    pub fn remove_pid(&self, pid: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|r| r.pid != pid);
    }

    pub fn find(&self, word: &str) -> Option<Arc<Registration>> {
        let inner = self.inner.lock().unwrap();
        inner.entries.iter().find(|r| r.serves(word)).cloned()
    }

    /// Atomic find-or-subscribe for `word`.
    pub fn find_or_wait(&self, word: &str) -> Lookup {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reg) = inner.entries.iter().find(|r| r.serves(word)).cloned() {
            return Lookup::Ready(reg);
        }
        let (tx, rx) = mpsc::channel();
        inner.waiters.entry(word.to_string()).or_default().push(tx);
        Lookup::Pending(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn dummy_fd() -> OwnedFd {
        let (a, _b) = ipc::dgram_pair().unwrap();
        a
    }

    fn msg(pid: i32, commands: &[&str]) -> RegistrationMsg {
        RegistrationMsg {
            pid,
            commands: commands.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_find_by_command_or_alias() {
        let reg = Registry::new();
        reg.register(msg(100, &["test", "t"]), dummy_fd());
        assert_eq!(reg.find("test").unwrap().pid, 100);
        assert_eq!(reg.find("t").unwrap().pid, 100);
        assert!(reg.find("console").is_none());
    }

    #[test]
    fn test_reregistration_replaces_overlapping_entry() {
        let reg = Registry::new();
        reg.register(msg(100, &["test", "t"]), dummy_fd());
        reg.register(msg(200, &["test", "t"]), dummy_fd());
        assert_eq!(reg.find("test").unwrap().pid, 200);
        assert_eq!(reg.find("t").unwrap().pid, 200);
    }

    #[test]
    fn test_waiter_wakes_on_registration() {
        let reg = Registry::new();
        let Lookup::Pending(rx) = reg.find_or_wait("console") else {
            panic!("nothing registered yet");
        };
        let reg2 = reg.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            reg2.register(msg(300, &["console"]), dummy_fd());
        });
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.pid, 300);
        handle.join().unwrap();
    }

    #[test]
    fn test_ready_lookup_skips_waiting() {
        let reg = Registry::new();
        reg.register(msg(100, &["server"]), dummy_fd());
        match reg.find_or_wait("server") {
            Lookup::Ready(r) => assert_eq!(r.pid, 100),
            Lookup::Pending(_) => panic!("should be ready"),
        }
    }

    #[test]
    fn test_remove_pid_unregisters() {
        let reg = Registry::new();
        reg.register(msg(100, &["test"]), dummy_fd());
        reg.remove_pid(100);
        assert!(reg.find("test").is_none());
        assert!(matches!(reg.find_or_wait("test"), Lookup::Pending(_)));
    }
}
