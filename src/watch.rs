//! Dependency file watching via an external helper process.
//!
//! The helper is any program that reads newline-separated paths to watch on
//! stdin and writes newline-separated changed paths to stdout (an
//! fsevents/inotify wrapper). We keep the given->resolved bookkeeping on our
//! side: processes report the paths they loaded, which may be symlinks or
//! relative spellings, while the helper only ever sees canonical paths. A
//! change to one canonical path fans out to every given path that resolved
//! to it.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{Context, Result};

use crate::log::{log_debug, log_warn};

/// Path bookkeeping, separated from the helper process so it can be tested
/// without spawning anything.
#[derive(Default)]
struct WatchState {
    given: HashSet<PathBuf>,
    resolved_to_given: HashMap<PathBuf, HashSet<PathBuf>>,
    /// Previously watched given paths whose file disappeared; re-armed on
    /// the poll tick once the file reappears.
    pending: Vec<PathBuf>,
}

impl WatchState {
    /// Record a given->resolved pair. Returns the resolved path if the
    /// helper has not been told about it yet.
    fn add(&mut self, given: PathBuf, resolved: PathBuf) -> Option<PathBuf> {
        self.given.insert(given.clone());
        let subscribers = self.resolved_to_given.entry(resolved.clone()).or_default();
        let first = subscribers.is_empty();
        subscribers.insert(given);
        first.then_some(resolved)
    }

    fn fan_out(&self, resolved: &Path) -> Vec<PathBuf> {
        self.resolved_to_given
            .get(resolved)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct FileMonitor {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    buf: Vec<u8>,
    state: WatchState,
}

impl FileMonitor {
    /// Spawn the watch helper. `command` is run through the shell, so the
    /// plan can point at anything on PATH with arguments.
    pub fn spawn(command: &str) -> Result<Self> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not start watch helper: {command}"))?;
        let stdin = child.stdin.take().context("watch helper has no stdin")?;
        let stdout = child.stdout.take().context("watch helper has no stdout")?;
        Ok(Self {
            child,
            stdin,
            stdout,
            buf: Vec::new(),
            state: WatchState::default(),
        })
    }

    /// Fd to poll for readability before calling [`read_events`](Self::read_events).
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.stdout.as_fd()
    }

    /// The helper's stdin pipe. Forked tree nodes must close their inherited
    /// copy, or the helper never sees EOF when the supervisor dies.
    pub fn stdin_fd(&self) -> BorrowedFd<'_> {
        self.stdin.as_fd()
    }

    /// Start watching `given`. Idempotent. A path that does not resolve
    /// (nonexistent file, symlink to nowhere) is logged and skipped, not an
    /// error; it is watched only if reported again once it exists.
    pub fn watch(&mut self, given: &Path) -> Result<()> {
        if self.state.given.contains(given) {
            return Ok(());
        }
        match given.canonicalize() {
            Ok(resolved) => {
                if let Some(line) = self.state.add(given.to_path_buf(), resolved) {
                    self.send_watch_line(&line)?;
                }
            }
            Err(_) => {
                log_debug(
                    "watch",
                    "unwatchable",
                    &format!("{} does not resolve; skipped", given.display()),
                );
            }
        }
        Ok(())
    }

    /// Re-arm watched files that disappeared and have come back.
    pub fn retry_pending(&mut self) -> Result<()> {
        if self.state.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.state.pending);
        for given in pending {
            match given.canonicalize() {
                Ok(resolved) => {
                    if let Some(line) = self.state.add(given.clone(), resolved) {
                        self.send_watch_line(&line)?;
                    }
                }
                Err(_) => self.state.pending.push(given),
            }
        }
        Ok(())
    }

    /// Drain whatever the helper has written and translate changed canonical
    /// paths back to the given paths processes reported. Call when
    /// [`poll_fd`](Self::poll_fd) is readable. Returns `Ok(None)` on helper EOF.
    pub fn read_events(&mut self) -> io::Result<Option<Vec<PathBuf>>> {
        let mut chunk = [0u8; 8192];
        let n = self.stdout.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        self.buf.extend_from_slice(&chunk[..n]);

        let mut changed = Vec::new();
        while let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=nl).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if line.is_empty() {
                continue;
            }
            let resolved = PathBuf::from(line);
            for given in self.state.fan_out(&resolved) {
                self.rearm_if_moved(&given, &resolved);
                changed.push(given);
            }
        }
        Ok(Some(changed))
    }

    /// Atomic-save editors replace the file, so the given path may now
    /// resolve somewhere else. Re-point the subscription; a path that no
    /// longer resolves goes back to pending.
    fn rearm_if_moved(&mut self, given: &Path, old_resolved: &Path) {
        match given.canonicalize() {
            Ok(now) if now == old_resolved => {}
            Ok(now) => {
                if let Some(subs) = self.state.resolved_to_given.get_mut(old_resolved) {
                    subs.remove(given);
                }
                if let Some(line) = self.state.add(given.to_path_buf(), now) {
                    if let Err(e) = self.send_watch_line(&line) {
                        log_warn("watch", "rearm_failed", &e.to_string());
                    }
                }
            }
            Err(_) => {
                if let Some(subs) = self.state.resolved_to_given.get_mut(old_resolved) {
                    subs.remove(given);
                }
                self.state.given.remove(given);
                self.state.pending.push(given.to_path_buf());
            }
        }
    }

    fn send_watch_line(&mut self, resolved: &Path) -> Result<()> {
        self.stdin
            .write_all(format!("{}\n", resolved.display()).as_bytes())
            .context("watch helper went away")?;
        self.stdin.flush().context("watch helper went away")?;
        Ok(())
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Watching one fd per dependency file blows through the default soft
/// open-file limit on most systems. Best effort: a failure is logged, not
/// fatal, since small projects fit under the default anyway.
pub fn raise_open_file_limit() {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};
    const WANT: u64 = 8192;
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) => {
            if soft >= WANT {
                return;
            }
            let target = WANT.min(hard);
            if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, target, hard) {
                log_warn("watch", "rlimit", &format!("could not raise RLIMIT_NOFILE: {e}"));
            }
        }
        Err(e) => log_warn("watch", "rlimit", &format!("could not read RLIMIT_NOFILE: {e}")),
    }
}
