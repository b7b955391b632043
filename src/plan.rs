//! The plan: tree shape plus the actions each node runs.
//!
//! A plan is the boundary with the supervised application. Actions are
//! plain Rust closures; hearth.json compiles into closures that shell out.
//! Either way the core only ever sees a fixed Stage/Acceptor tree and a
//! table of named actions, resolved once at load time, never at dispatch
//! time.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A boot action runs once per (re)boot of its stage. It records every
/// dependency file it pulls in through the context so the supervisor can
/// watch them.
pub type BootFn = Box<dyn Fn(&mut BootContext) -> Result<()> + Send + Sync>;

/// A command action serves one client request. Its stdio is already the
/// client's terminal and `args` is the client's argument vector; the
/// returned integer becomes the client's exit status.
pub type CommandFn = Box<dyn Fn(&[String]) -> i32 + Send + Sync>;

/// Named actions are a closed set: a node either boots or serves commands.
pub enum Action {
    Boot(BootFn),
    Command(CommandFn),
}

/// Fresh per-boot-attempt accumulator of loaded dependency files. Each node
/// process starts with an empty one and reports the delta over its report
/// channel; there is no process-global load hook.
#[derive(Default)]
pub struct BootContext {
    loaded: Vec<PathBuf>,
}

impl BootContext {
    /// Record that this boot attempt loaded `path`. Relative paths are
    /// resolved against the working directory.
    pub fn loaded(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        let abs = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&path))
                .unwrap_or(path)
        };
        self.loaded.push(abs);
    }

    pub fn loaded_files(&self) -> &[PathBuf] {
        &self.loaded
    }
}

/// Static description of one tree node. Shape is fixed at plan load; only
/// process identities churn at runtime.
#[derive(Debug, Clone)]
pub enum NodeSpec {
    Stage(StageSpec),
    Acceptor(AcceptorSpec),
}

#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub children: Vec<NodeSpec>,
}

#[derive(Debug, Clone)]
pub struct AcceptorSpec {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
}

impl NodeSpec {
    pub fn name(&self) -> &str {
        match self {
            NodeSpec::Stage(s) => &s.name,
            NodeSpec::Acceptor(a) => &a.name,
        }
    }

    /// All acceptors at or below this node, in tree order.
    pub fn descendant_acceptors(&self) -> Vec<&AcceptorSpec> {
        match self {
            NodeSpec::Acceptor(a) => vec![a],
            NodeSpec::Stage(s) => s
                .children
                .iter()
                .flat_map(|c| c.descendant_acceptors())
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    /// A stage must terminate in at least one acceptor; an empty stage is a
    /// static tree-shape defect, surfaced loudly rather than ignored.
    #[error("stage `{0}` has no children; every stage must terminate in an acceptor")]
    StageWithoutChildren(String),
    #[error("duplicate node or command name `{0}` in plan")]
    DuplicateName(String),
    #[error("acceptor `{0}` has no command action")]
    MissingCommandAction(String),
    #[error("plan has no top-level stages")]
    EmptyPlan,
    #[error("cannot read plan file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse plan file {path}: {source}")]
    Unparseable {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// The full plan: tree roots, action table, and the optional post-fork hook
/// runners invoke before serving (e.g. reopening pooled connections the
/// fork invalidated).
pub struct Plan {
    pub roots: Vec<NodeSpec>,
    actions: HashMap<String, Action>,
    pub runner_hook: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Plan {
    pub fn new(roots: Vec<NodeSpec>) -> Self {
        Self {
            roots,
            actions: HashMap::new(),
            runner_hook: None,
        }
    }

    pub fn boot_action(mut self, name: &str, f: BootFn) -> Self {
        self.actions.insert(name.to_string(), Action::Boot(f));
        self
    }

    pub fn command_action(mut self, name: &str, f: CommandFn) -> Self {
        self.actions.insert(name.to_string(), Action::Command(f));
        self
    }

    /// Validate tree shape and action coverage. Errors here are fatal to
    /// `hearth start`: a malformed plan never half-boots.
    pub fn validate(&self) -> std::result::Result<(), PlanError> {
        if self.roots.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        let mut seen: HashMap<String, ()> = HashMap::new();
        let mut stack: Vec<&NodeSpec> = self.roots.iter().collect();
        while let Some(node) = stack.pop() {
            let mut claim = |name: &str| {
                if seen.insert(name.to_string(), ()).is_some() {
                    Err(PlanError::DuplicateName(name.to_string()))
                } else {
                    Ok(())
                }
            };
            match node {
                NodeSpec::Stage(s) => {
                    claim(&s.name)?;
                    if s.children.is_empty() {
                        return Err(PlanError::StageWithoutChildren(s.name.clone()));
                    }
                    stack.extend(s.children.iter());
                }
                NodeSpec::Acceptor(a) => {
                    claim(&a.name)?;
                    for alias in &a.aliases {
                        claim(alias)?;
                    }
                    match self.actions.get(&a.name) {
                        Some(Action::Command(_)) => {}
                        _ => return Err(PlanError::MissingCommandAction(a.name.clone())),
                    }
                }
            }
        }
        Ok(())
    }

    /// The boot action for a stage, if it has one (a stage with no boot
    /// action is legal: it exists purely to group restartable children).
    pub fn boot_for(&self, name: &str) -> Option<&BootFn> {
        match self.actions.get(name) {
            Some(Action::Boot(f)) => Some(f),
            _ => None,
        }
    }

    pub fn command_for(&self, name: &str) -> Option<&CommandFn> {
        match self.actions.get(name) {
            Some(Action::Command(f)) => Some(f),
            _ => None,
        }
    }

    /// Resolve a command word (name or alias) to its acceptor spec.
    pub fn resolve_command(&self, word: &str) -> Option<&AcceptorSpec> {
        self.roots
            .iter()
            .flat_map(|r| r.descendant_acceptors())
            .find(|acc| acc.name == word || acc.aliases.iter().any(|a| a == word))
    }
}

// ---------------------------------------------------------------------------
// Shell-backed plan file (hearth.json)
// ---------------------------------------------------------------------------

/// hearth.json shape. A node with "children" is a stage (optional "run"
/// shell snippet, optional "files" it depends on); a node with "command" is
/// an acceptor.
///
/// ```json
/// {
///   "watcher": "watchman-wait -m 0 -",
///   "on_fork": "./script/reopen-sockets",
///   "tree": {
///     "app": {
///       "run": "./script/warm-boot",
///       "files": ["config/app.toml"],
///       "children": {
///         "shell": { "command": "bin/console", "aliases": ["c"],
///                    "description": "interactive console" }
///       }
///     }
///   }
/// }
/// ```
#[derive(Debug, Deserialize)]
struct PlanFile {
    /// Shell snippet for the watch-helper process: reads paths to watch on
    /// stdin, writes changed paths to stdout, one per line.
    #[serde(default)]
    watcher: String,
    /// Optional shell snippet every runner executes right after fork,
    /// before its command (e.g. reopening pooled connections).
    #[serde(default)]
    on_fork: Option<String>,
    tree: HashMap<String, PlanFileNode>,
}

#[derive(Debug, Deserialize)]
struct PlanFileNode {
    #[serde(default)]
    run: Option<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    children: Option<HashMap<String, PlanFileNode>>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    description: String,
}

/// A plan plus the watch-helper command configured alongside it.
pub struct LoadedPlan {
    pub plan: Plan,
    pub watcher: String,
}

/// Load the shell-backed plan the binary runs with.
pub fn load_plan_file(path: &Path) -> std::result::Result<LoadedPlan, PlanError> {
    let raw = std::fs::read_to_string(path).map_err(|source| PlanError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let file: PlanFile =
        serde_json::from_str(&raw).map_err(|source| PlanError::Unparseable {
            path: path.to_path_buf(),
            source,
        })?;

    let mut plan = Plan::new(Vec::new());
    let mut roots = Vec::new();
    // Sort for a stable tree order; HashMap iteration order is not.
    let mut entries: Vec<_> = file.tree.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, node) in entries {
        let (spec, actions) = build_node(name, node);
        roots.push(spec);
        for (name, action) in actions {
            plan = match action {
                Action::Boot(f) => plan.boot_action(&name, f),
                Action::Command(f) => plan.command_action(&name, f),
            };
        }
    }
    plan.roots = roots;
    if let Some(snippet) = file.on_fork {
        plan.runner_hook = Some(Box::new(move || {
            let _ = std::process::Command::new("sh").arg("-c").arg(&snippet).status();
        }));
    }
    plan.validate()?;
    Ok(LoadedPlan {
        plan,
        watcher: file.watcher,
    })
}

fn build_node(name: String, node: PlanFileNode) -> (NodeSpec, Vec<(String, Action)>) {
    let mut actions: Vec<(String, Action)> = Vec::new();

    if let Some(children) = node.children {
        if let Some(run) = node.run {
            let files = node.files.clone();
            actions.push((
                name.clone(),
                Action::Boot(Box::new(move |ctx: &mut BootContext| {
                    for f in &files {
                        ctx.loaded(f.clone());
                    }
                    shell_boot(&run)
                })),
            ));
        }
        let mut entries: Vec<_> = children.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut child_specs = Vec::new();
        for (cname, cnode) in entries {
            let (spec, sub) = build_node(cname, cnode);
            child_specs.push(spec);
            actions.extend(sub);
        }
        (
            NodeSpec::Stage(StageSpec {
                name,
                children: child_specs,
            }),
            actions,
        )
    } else {
        let command = node.command.unwrap_or_default();
        actions.push((
            name.clone(),
            Action::Command(Box::new(move |args: &[String]| shell_command(&command, args))),
        ));
        (
            NodeSpec::Acceptor(AcceptorSpec {
                name,
                aliases: node.aliases,
                description: node.description,
            }),
            actions,
        )
    }
}

/// Run a boot snippet through the shell, inheriting the stage's stdio.
fn shell_boot(snippet: &str) -> Result<()> {
    use anyhow::{Context, bail};
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(snippet)
        .status()
        .with_context(|| format!("failed to run boot command `{}`", snippet))?;
    if !status.success() {
        bail!("boot command `{}` exited with {}", snippet, status);
    }
    Ok(())
}

/// Run a command snippet with the client's arguments appended as "$@".
/// Stdio is already the donated terminal at this point.
fn shell_command(snippet: &str, args: &[String]) -> i32 {
    let wrapped = format!("{} \"$@\"", snippet);
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(&wrapped)
        .arg("sh")
        .args(args)
        .status();
    match status {
        Ok(s) => crate::node::exit_code_from_status(s),
        Err(e) => {
            eprintln!("[hearth] cannot run `{}`: {}", snippet, e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acceptor(name: &str) -> NodeSpec {
        NodeSpec::Acceptor(AcceptorSpec {
            name: name.into(),
            aliases: vec![],
            description: String::new(),
        })
    }

    fn noop_command() -> CommandFn {
        Box::new(|_args| 0)
    }

    #[test]
    fn test_validate_accepts_minimal_tree() {
        let plan = Plan::new(vec![NodeSpec::Stage(StageSpec {
            name: "app".into(),
            children: vec![acceptor("shell")],
        })])
        .command_action("shell", noop_command());
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_childless_stage() {
        let plan = Plan::new(vec![NodeSpec::Stage(StageSpec {
            name: "app".into(),
            children: vec![],
        })]);
        match plan.validate() {
            Err(PlanError::StageWithoutChildren(name)) => assert_eq!(name, "app"),
            other => panic!("expected StageWithoutChildren, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_validate_rejects_acceptor_without_action() {
        let plan = Plan::new(vec![NodeSpec::Stage(StageSpec {
            name: "app".into(),
            children: vec![acceptor("shell")],
        })]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::MissingCommandAction(_))
        ));
    }

    #[test]
    fn test_validate_rejects_alias_colliding_with_name() {
        let plan = Plan::new(vec![NodeSpec::Stage(StageSpec {
            name: "app".into(),
            children: vec![
                NodeSpec::Acceptor(AcceptorSpec {
                    name: "shell".into(),
                    aliases: vec!["test".into()],
                    description: String::new(),
                }),
                acceptor("test"),
            ],
        })])
        .command_action("shell", noop_command())
        .command_action("test", noop_command());
        assert!(matches!(plan.validate(), Err(PlanError::DuplicateName(_))));
    }

    #[test]
    fn test_resolve_command_follows_aliases() {
        let plan = Plan::new(vec![NodeSpec::Stage(StageSpec {
            name: "app".into(),
            children: vec![NodeSpec::Acceptor(AcceptorSpec {
                name: "console".into(),
                aliases: vec!["c".into()],
                description: "repl".into(),
            })],
        })])
        .command_action("console", noop_command());

        assert_eq!(plan.resolve_command("c").unwrap().name, "console");
        assert_eq!(plan.resolve_command("console").unwrap().name, "console");
        assert!(plan.resolve_command("missing").is_none());
    }

    #[test]
    fn test_boot_context_absolutizes_relative_paths() {
        let mut ctx = BootContext::default();
        ctx.loaded("config/app.toml");
        assert!(ctx.loaded_files()[0].is_absolute());
    }

    #[test]
    fn test_plan_file_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("hearth_plan_test_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{
                "watcher": "watchman-wait -m 0 -",
                "on_fork": "true",
                "tree": {
                    "app": {
                        "run": "true",
                        "files": ["config/app.toml"],
                        "children": {
                            "shell": { "command": "echo", "aliases": ["sh"],
                                       "description": "echo args" }
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        let loaded = load_plan_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.watcher, "watchman-wait -m 0 -");
        assert!(loaded.plan.runner_hook.is_some());
        assert_eq!(loaded.plan.roots.len(), 1);
        assert_eq!(loaded.plan.resolve_command("sh").unwrap().name, "shell");
        assert!(loaded.plan.boot_for("app").is_some());
        assert!(loaded.plan.command_for("shell").is_some());
    }

    #[test]
    fn test_plan_file_rejects_empty_stage() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("hearth_plan_bad_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{ "tree": { "app": { "run": "true", "children": {} } } }"#,
        )
        .unwrap();
        let err = load_plan_file(&path).err().unwrap();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, PlanError::StageWithoutChildren(_)));
    }
}
