//! Read-side traversal of the tree and the path -> state mapping used to
//! persist expansion and disable flags between sessions.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::tree::{NodeId, NodeKind, Tree};

/// One row of the flattened, display-ordered tree
#[derive(Debug, Clone, Serialize)]
pub struct FlatEntry {
    #[serde(skip)]
    pub id: NodeId,
    pub path: PathBuf,
    pub name: String,
    pub depth: usize,
    pub is_dir: bool,
    pub expanded: bool,
    pub disabled: bool,
    pub token_count: usize,
    /// Whether a renderer should print the count next to this row
    pub show_tokens: bool,
}

/// Persisted per-node flag, keyed by path relative to the scan root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeViewState {
    Expanded(bool),
    Disabled(bool),
}

pub type ViewState = BTreeMap<String, NodeViewState>;

impl Tree {
    /// Pre-order walk honoring expansion: children of collapsed directories
    /// are not visited.
    pub fn walk<F>(&self, mut visit: F)
    where
        F: FnMut(NodeId, usize, bool),
    {
        let mut stack = vec![(self.root(), 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = self.get(id) else { continue };
            let show_tokens = node.token_count > 0
                && (id == self.root() || node.contributes());
            visit(id, depth, show_tokens);

            if node.is_expanded() {
                stack.extend(node.children.iter().rev().map(|child| (*child, depth + 1)));
            }
        }
    }

    pub fn flatten(&self) -> Vec<FlatEntry> {
        let mut entries = Vec::with_capacity(self.len());
        self.walk(|id, depth, show_tokens| {
            let node = &self[id];
            entries.push(FlatEntry {
                id,
                path: node.path.clone(),
                name: node.display_name.clone(),
                depth,
                is_dir: node.is_dir(),
                expanded: node.is_expanded(),
                disabled: node.is_disabled(),
                token_count: node.token_count,
                show_tokens,
            });
        });
        entries
    }

    /// Enabled files reachable through expanded directories, in display order
    pub fn selected_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        self.walk(|id, _, _| {
            let node = &self[id];
            if !node.is_dir() && !node.is_disabled() {
                files.push(node.path.clone());
            }
        });
        files
    }

    /// Up to `limit` enabled files that were never measured. Files visible
    /// through expanded directories come first, hidden ones fill the rest.
    pub fn unmeasured_files(&self, limit: usize) -> Vec<PathBuf> {
        let wanted = |id: NodeId| {
            matches!(self[id].kind, NodeKind::File { disabled: false, measured: false })
        };

        let mut picked = Vec::new();
        let mut seen = HashSet::new();
        self.walk(|id, _, _| {
            if picked.len() < limit && wanted(id) {
                picked.push(id);
                seen.insert(id);
            }
        });

        if picked.len() < limit {
            let mut stack = vec![self.root()];
            while let Some(id) = stack.pop() {
                if picked.len() >= limit {
                    break;
                }
                let node = &self[id];
                if wanted(id) && !seen.contains(&id) {
                    picked.push(id);
                }
                stack.extend(node.children.iter().rev().copied());
            }
        }

        picked.into_iter().map(|id| self[id].path.clone()).collect()
    }

    /// Gather every node's flag, leaves first
    pub fn view_state(&self) -> ViewState {
        let mut order = Vec::with_capacity(self.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self[id].children.iter().copied());
        }

        let mut state = ViewState::new();
        for id in order.into_iter().rev() {
            let node = &self[id];
            let key = relative_key(self.root_path(), &node.path);
            let flag = match node.kind {
                NodeKind::Directory { expanded } => NodeViewState::Expanded(expanded),
                NodeKind::File { disabled, .. } => NodeViewState::Disabled(disabled),
            };
            state.insert(key, flag);
        }
        state
    }

    /// Restore saved flags from the root downwards, then rebuild aggregates.
    ///
    /// Entries for paths that no longer exist, or whose kind changed, are
    /// ignored. Returns how many nodes were updated.
    pub fn apply_view_state(&mut self, state: &ViewState) -> usize {
        let mut applied = 0;
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            let key = relative_key(self.root_path(), &self[id].path);
            if let Some(flag) = state.get(&key) {
                if self.restore_flag(id, *flag) {
                    applied += 1;
                }
            }
            stack.extend(self[id].children.iter().rev().copied());
        }

        let root = self.root();
        self.recompute_aggregate(root);
        applied
    }
}

fn relative_key(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}
