//! hearth: a preforking command supervisor.
//!
//! `hearth start` boots the process tree described by hearth.json and keeps
//! it warm; `hearth <command> [args]` dispatches against it and behaves like
//! the command itself, exit status included.

mod client;
mod client_handler;
mod config;
mod ipc;
mod log;
mod node;
mod paths;
mod plan;
mod registry;
mod server;
mod tree;
mod watch;

use crate::config::Config;
use crate::log::log_error;

#[derive(Debug, PartialEq)]
enum MainAction {
    Start,
    Init,
    Help,
    Version,
    RunCommand {
        command: String,
        arguments: Vec<String>,
    },
}

fn determine_action(args: &[String]) -> MainAction {
    match args.first().map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => MainAction::Help,
        Some("version") | Some("--version") => MainAction::Version,
        Some("start") => MainAction::Start,
        Some("init") => MainAction::Init,
        Some(command) => MainAction::RunCommand {
            command: command.to_string(),
            arguments: args[1..].to_vec(),
        },
    }
}

fn print_usage() {
    println!("hearth {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("usage:");
    println!("  hearth init               write a starter hearth.json");
    println!("  hearth start              boot the supervisor in this project");
    println!("  hearth <command> [args]   run a command against the booted tree");
    println!();
    println!("the supervisor socket, plan file and scratch directory default to");
    println!(".hearth.sock, hearth.json and .hearth in the working directory;");
    println!("override with HEARTH_SOCK, HEARTH_PLAN and HEARTH_DIR.");
}

const STARTER_PLAN: &str = r#"{
  "watcher": "hearth-watch",
  "tree": {
    "boot": {
      "run": "true",
      "children": {
        "console": { "command": "exec $SHELL" },
        "test": { "command": "echo configure me in hearth.json", "aliases": ["t"] }
      }
    }
  }
}
"#;

fn init_plan() -> anyhow::Result<()> {
    let path = paths::plan_path();
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    std::fs::write(&path, STARTER_PLAN)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        log_error("panic", "panic", &info.to_string());
        eprintln!("hearth panicked: {info}");
    }));
}

fn main() {
    Config::init();
    install_panic_hook();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match determine_action(&args) {
        MainAction::Help => print_usage(),
        MainAction::Version => println!("hearth {}", env!("CARGO_PKG_VERSION")),
        MainAction::Init => {
            if let Err(e) = init_plan() {
                eprintln!("hearth: {e:#}");
                std::process::exit(1);
            }
        }
        MainAction::Start => {
            log::enable_stderr_echo();
            if let Err(e) = server::run() {
                log_error("main", "fatal", &format!("{e:#}"));
                std::process::exit(1);
            }
        }
        MainAction::RunCommand { command, arguments } => {
            match client::run_command(&command, &arguments) {
                Ok(status) => std::process::exit(status),
                Err(e) => {
                    eprintln!("hearth: {e:#}");
                    std::process::exit(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_determine_action_help() {
        assert_eq!(determine_action(&[]), MainAction::Help);
        assert_eq!(determine_action(&args(&["--help"])), MainAction::Help);
        assert_eq!(determine_action(&args(&["help"])), MainAction::Help);
    }

    #[test]
    fn test_determine_action_builtins() {
        assert_eq!(determine_action(&args(&["start"])), MainAction::Start);
        assert_eq!(determine_action(&args(&["init"])), MainAction::Init);
        assert_eq!(determine_action(&args(&["version"])), MainAction::Version);
    }

    #[test]
    fn test_determine_action_dispatches_everything_else() {
        assert_eq!(
            determine_action(&args(&["test", "spec/a_spec.rb", "-v"])),
            MainAction::RunCommand {
                command: "test".to_string(),
                arguments: args(&["spec/a_spec.rb", "-v"]),
            }
        );
    }
}
