//! In-memory process tree: who forked whom, and which dependency files each
//! process loaded.
//!
//! Pure data structure. It is owned by the supervisor and mutated only on
//! its control thread; forked processes feed it exclusively through report
//! datagrams (see ipc.rs). Invalidation answers are computed here but the
//! actual signalling is the supervisor's job, which keeps this testable
//! without forking.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// One live (or placeholder) process in the tree.
struct Node {
    pid: i32,
    name: Option<String>,
    parent: Option<usize>,
    children: Vec<usize>,
    features: HashSet<PathBuf>,
}

impl Node {
    fn new(pid: i32) -> Self {
        Self {
            pid,
            name: None,
            parent: None,
            children: Vec::new(),
            features: HashSet::new(),
        }
    }
}

/// A subtree picked for termination by an invalidation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoomedSubtree {
    pub root_pid: i32,
    pub root_name: Option<String>,
    /// Every pid in the subtree, root included.
    pub pids: Vec<i32>,
}

/// What an invalidation pass decided.
#[derive(Debug, Default)]
pub struct Invalidation {
    pub doomed: Vec<DoomedSubtree>,
    /// Names/pids of protected nodes that matched but were spared.
    pub refused: Vec<String>,
}

pub struct ProcessTree {
    nodes: Vec<Node>,
    by_pid: HashMap<i32, usize>,
    root: usize,
}

impl ProcessTree {
    /// `root_pid` is the supervisor itself: the synthetic root that anchors
    /// the top-level stages.
    pub fn new(root_pid: i32) -> Self {
        let root = Node::new(root_pid);
        let mut by_pid = HashMap::new();
        by_pid.insert(root_pid, 0);
        Self {
            nodes: vec![root],
            by_pid,
            root: 0,
        }
    }

    fn index_for(&mut self, pid: i32) -> usize {
        if let Some(&idx) = self.by_pid.get(&pid) {
            return idx;
        }
        // Unknown pids get a placeholder, reconciled when the process (or
        // its parent) reports itself. Never fails.
        let idx = self.nodes.len();
        self.nodes.push(Node::new(pid));
        self.by_pid.insert(pid, idx);
        idx
    }

    /// Record that `pid` is a child of `ppid`, with its logical node name.
    /// Idempotent; unknown parents create a placeholder.
    pub fn record_parent(&mut self, pid: i32, ppid: i32, name: &str) {
        let child = self.index_for(pid);
        let parent = self.index_for(ppid);
        self.nodes[child].name = Some(name.to_string());
        if self.nodes[child].parent == Some(parent) {
            return;
        }
        if let Some(old) = self.nodes[child].parent {
            self.nodes[old].children.retain(|&c| c != child);
        }
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    /// Record that `pid` loaded `path`. Idempotent; features are only ever
    /// removed by removing the node.
    pub fn record_feature(&mut self, pid: i32, path: &Path) {
        let idx = self.index_for(pid);
        self.nodes[idx].features.insert(path.to_path_buf());
    }

    pub fn contains_pid(&self, pid: i32) -> bool {
        self.by_pid.contains_key(&pid)
    }

    /// All pids in the subtree rooted at `pid` (root included), or empty if
    /// unknown.
    pub fn subtree_pids(&self, pid: i32) -> Vec<i32> {
        let Some(&idx) = self.by_pid.get(&pid) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            out.push(self.nodes[i].pid);
            stack.extend(self.nodes[i].children.iter().copied());
        }
        out
    }

    /// Decide which subtrees a change to `path` invalidates.
    ///
    /// A node owns the dependency only if its own feature set contains the
    /// path; ancestors of an owner are untouched, and the walk never
    /// descends into a subtree already picked (those processes are doomed
    /// wholesale). The synthetic root and its immediate children (the
    /// top-level stages) are protected: a match there is refused with a
    /// warning, because killing a first-level stage stops everything with
    /// no automatic recovery.
    ///
    /// This does not mutate the tree; the caller terminates the doomed
    /// processes and then calls [`remove_subtree`](Self::remove_subtree).
    pub fn invalidated_by(&self, path: &Path) -> Invalidation {
        let mut result = Invalidation::default();
        self.walk_for_feature(self.root, path, &mut result);
        result
    }

    fn walk_for_feature(&self, idx: usize, path: &Path, result: &mut Invalidation) {
        let node = &self.nodes[idx];
        if node.features.contains(path) {
            if idx == self.root || node.parent == Some(self.root) {
                let label = node
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("pid {}", node.pid));
                result.refused.push(label);
                return;
            }
            result.doomed.push(DoomedSubtree {
                root_pid: node.pid,
                root_name: node.name.clone(),
                pids: self.subtree_pids(node.pid),
            });
            return; // no descent into a doomed subtree
        }
        for &child in &node.children {
            self.walk_for_feature(child, path, result);
        }
    }

    /// Remove a subtree after its processes were terminated. Returns the
    /// removed pids. The tree keeps no memory of the old pids: a respawned
    /// node re-reports itself under its new pid.
    pub fn remove_subtree(&mut self, root_pid: i32) -> Vec<i32> {
        let Some(&idx) = self.by_pid.get(&root_pid) else {
            return Vec::new();
        };
        if idx == self.root {
            return Vec::new();
        }
        if let Some(parent) = self.nodes[idx].parent {
            self.nodes[parent].children.retain(|&c| c != idx);
        }
        let mut removed = Vec::new();
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            stack.extend(self.nodes[i].children.iter().copied());
            let pid = self.nodes[i].pid;
            self.by_pid.remove(&pid);
            removed.push(pid);
            // Tombstone: slot stays but is unreachable. Slots are not
            // recycled; tree shape is fixed and churn is bounded by
            // respawns, not request volume.
            self.nodes[i].children.clear();
            self.nodes[i].features.clear();
            self.nodes[i].parent = None;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: i32 = 1;

    /// root(1) -> app(10) -> { web(20), test(30) -> worker(31) }
    fn sample_tree() -> ProcessTree {
        let mut t = ProcessTree::new(ROOT);
        t.record_parent(10, ROOT, "app");
        t.record_parent(20, 10, "web");
        t.record_parent(30, 10, "test");
        t.record_parent(31, 30, "worker");
        t
    }

    #[test]
    fn test_invalidation_kills_only_owning_subtree() {
        let mut t = sample_tree();
        t.record_feature(30, Path::new("/src/test_helper.rb"));

        let inv = t.invalidated_by(Path::new("/src/test_helper.rb"));
        assert_eq!(inv.doomed.len(), 1);
        assert_eq!(inv.doomed[0].root_pid, 30);
        let mut pids = inv.doomed[0].pids.clone();
        pids.sort();
        assert_eq!(pids, vec![30, 31]);
        assert!(inv.refused.is_empty());
    }

    #[test]
    fn test_ancestor_of_owner_is_untouched() {
        // Only the node that actually loaded the file owns it; the parent
        // stage (which never loaded it) must survive.
        let mut t = sample_tree();
        t.record_feature(31, Path::new("/src/deep.rb"));

        let inv = t.invalidated_by(Path::new("/src/deep.rb"));
        assert_eq!(inv.doomed.len(), 1);
        assert_eq!(inv.doomed[0].root_pid, 31);
        assert_eq!(inv.doomed[0].pids, vec![31]);
    }

    #[test]
    fn test_walk_does_not_descend_into_doomed_subtree() {
        let mut t = sample_tree();
        t.record_feature(30, Path::new("/src/shared.rb"));
        t.record_feature(31, Path::new("/src/shared.rb"));

        let inv = t.invalidated_by(Path::new("/src/shared.rb"));
        // 31 is inside the doomed subtree of 30 and must not be a second root
        assert_eq!(inv.doomed.len(), 1);
        assert_eq!(inv.doomed[0].root_pid, 30);
    }

    #[test]
    fn test_multiple_independent_owners() {
        let mut t = sample_tree();
        t.record_feature(20, Path::new("/src/common.rb"));
        t.record_feature(30, Path::new("/src/common.rb"));

        let inv = t.invalidated_by(Path::new("/src/common.rb"));
        let mut roots: Vec<i32> = inv.doomed.iter().map(|d| d.root_pid).collect();
        roots.sort();
        assert_eq!(roots, vec![20, 30]);
    }

    #[test]
    fn test_top_level_stage_is_protected() {
        let mut t = sample_tree();
        t.record_feature(10, Path::new("/src/boot.rb"));

        let inv = t.invalidated_by(Path::new("/src/boot.rb"));
        assert!(inv.doomed.is_empty());
        assert_eq!(inv.refused, vec!["app".to_string()]);
    }

    #[test]
    fn test_root_itself_is_protected() {
        let mut t = sample_tree();
        t.record_feature(ROOT, Path::new("/src/supervisor.rb"));
        let inv = t.invalidated_by(Path::new("/src/supervisor.rb"));
        assert!(inv.doomed.is_empty());
        assert_eq!(inv.refused.len(), 1);
    }

    #[test]
    fn test_unrelated_file_invalidates_nothing() {
        let mut t = sample_tree();
        t.record_feature(30, Path::new("/src/a.rb"));
        let inv = t.invalidated_by(Path::new("/src/b.rb"));
        assert!(inv.doomed.is_empty());
        assert!(inv.refused.is_empty());
    }

    #[test]
    fn test_respawn_reflects_only_new_pid() {
        let mut t = sample_tree();
        t.record_feature(30, Path::new("/src/test_helper.rb"));

        let removed = t.remove_subtree(30);
        assert_eq!(
            {
                let mut r = removed.clone();
                r.sort();
                r
            },
            vec![30, 31]
        );
        assert!(!t.contains_pid(30));
        assert!(!t.contains_pid(31));

        // Respawned under a new pid, old pid is no longer a dependency target
        t.record_parent(40, 10, "test");
        t.record_feature(40, Path::new("/src/test_helper.rb"));

        let inv = t.invalidated_by(Path::new("/src/test_helper.rb"));
        assert_eq!(inv.doomed.len(), 1);
        assert_eq!(inv.doomed[0].root_pid, 40);
        assert_eq!(inv.doomed[0].root_name.as_deref(), Some("test"));
    }

    #[test]
    fn test_unknown_parent_creates_placeholder_then_reconciles() {
        let mut t = ProcessTree::new(ROOT);
        // Child reports before its parent's own report arrives
        t.record_parent(31, 30, "worker");
        t.record_feature(31, Path::new("/src/w.rb"));
        // Parent reconciles into the tree
        t.record_parent(30, ROOT, "test");

        // Placeholder 30 is a top-level stage here, so 31 is killable
        let inv = t.invalidated_by(Path::new("/src/w.rb"));
        assert_eq!(inv.doomed.len(), 1);
        assert_eq!(inv.doomed[0].root_pid, 31);
    }

    #[test]
    fn test_record_parent_is_idempotent() {
        let mut t = sample_tree();
        t.record_parent(20, 10, "web");
        t.record_parent(20, 10, "web");
        assert_eq!(t.subtree_pids(10).len(), 4); // 10, 20, 30, 31
    }

    #[test]
    fn test_record_feature_is_idempotent() {
        let mut t = sample_tree();
        t.record_feature(20, Path::new("/src/a.rb"));
        t.record_feature(20, Path::new("/src/a.rb"));
        let inv = t.invalidated_by(Path::new("/src/a.rb"));
        assert_eq!(inv.doomed.len(), 1);
    }
}
