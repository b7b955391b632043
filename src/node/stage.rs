//! Stages: the interior nodes of the process tree. A stage runs its boot
//! action exactly once, then forks its children and spends the rest of its
//! life respawning whichever of them die. The boot work is inherited by the
//! children through fork, which is the entire point: descendants start from
//! an already-loaded image instead of booting from scratch.

use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid, getppid};

use crate::log::{log_error, log_info, log_warn};
use crate::node::{NodeLinks, acceptor, exit_code_from_wait};
use crate::plan::{BootContext, NodeSpec, Plan, StageSpec};

struct ChildSlot {
    spec: NodeSpec,
    pid: i32,
}

/// Run a stage process. Never returns.
pub fn run(plan: &Plan, spec: &StageSpec, links: &NodeLinks) -> ! {
    let pid = getpid().as_raw();
    let _ = links.report.started(pid, getppid().as_raw(), &spec.name);

    let mut boot_ctx = BootContext::default();
    if let Some(boot) = plan.boot_for(&spec.name) {
        let outcome = boot(&mut boot_ctx);
        // Loaded files are reported even after a failed boot: a save to any
        // of them invalidates this stage, which is how a broken boot gets
        // retried without restarting the supervisor.
        for path in boot_ctx.loaded_files() {
            let _ = links.report.feature(pid, path);
        }
        if let Err(err) = outcome {
            error_state(spec, links, &err);
        }
        log_info("stage", "booted", &spec.name);
    }

    let mut children: Vec<ChildSlot> = Vec::new();
    for child_spec in &spec.children {
        match spawn_child(plan, child_spec, links) {
            Ok(child_pid) => children.push(ChildSlot {
                spec: child_spec.clone(),
                pid: child_pid,
            }),
            Err(e) => {
                log_error(
                    "stage",
                    "fork_failed",
                    &format!("{}: {e}", child_spec.name()),
                );
                std::process::exit(1);
            }
        }
    }

    // Reap-and-respawn until we are killed ourselves. Children die for two
    // reasons: invalidation (the supervisor killed their subtree) or a
    // crash; the response is the same.
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status @ (WaitStatus::Exited(dead, _) | WaitStatus::Signaled(dead, _, _))) => {
                let dead = dead.as_raw();
                let Some(slot) = children.iter_mut().find(|c| c.pid == dead) else {
                    continue;
                };
                log_warn(
                    "stage",
                    "child_died",
                    &format!(
                        "{} (pid {dead}, status {}), respawning",
                        slot.spec.name(),
                        exit_code_from_wait(&status)
                    ),
                );
                match spawn_child(plan, &slot.spec, links) {
                    Ok(new_pid) => slot.pid = new_pid,
                    Err(e) => {
                        log_error(
                            "stage",
                            "respawn_failed",
                            &format!("{}: {e}", slot.spec.name()),
                        );
                        std::process::exit(1);
                    }
                }
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(e) => {
                // ECHILD: every child vanished without us noticing a death,
                // which means the bookkeeping is broken. Bail.
                log_error("stage", "wait_failed", &e.to_string());
                std::process::exit(1);
            }
        }
    }
}

fn spawn_child(plan: &Plan, spec: &NodeSpec, links: &NodeLinks) -> nix::Result<i32> {
    // SAFETY: the child re-execs nothing and only touches fork-safe state
    // before entering its own run loop.
    match unsafe { fork() }? {
        ForkResult::Child => match spec {
            NodeSpec::Stage(s) => run(plan, s, links),
            NodeSpec::Acceptor(a) => acceptor::run(plan, a, links),
        },
        ForkResult::Parent { child } => Ok(child.as_raw()),
    }
}

/// A stage that failed to boot parks here instead of exiting. Its acceptors
/// can never serve, so stub threads answer their commands with the boot
/// error; the process stays alive so the tree keeps its shape and the
/// error keeps being reachable until an invalidation kills us.
fn error_state(spec: &StageSpec, links: &NodeLinks, err: &anyhow::Error) -> ! {
    let error_text = format!("{} failed to boot:\n{err:#}", spec.name);
    log_error("stage", "boot_failed", &error_text);
    eprintln!("{error_text}");

    let stubs: Vec<_> = spec
        .children
        .iter()
        .flat_map(|c| c.descendant_acceptors())
        .cloned()
        .collect();
    for acc in stubs {
        let links = links.clone();
        let text = error_text.clone();
        thread::spawn(move || acceptor::run_error_stub(&acc, &links, &text));
    }
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
