//! In-memory file tree with aggregate token counts
//!
//! Nodes live in an arena owned by [`Tree`] and refer to each other by
//! [`NodeId`]. Children are owned through the parent's `children` list; the
//! `parent` field is a plain index used only to walk upwards. The tree also
//! owns the path index, so a node exists exactly when its path is indexed.

use std::collections::HashMap;
use std::ops::Index;
use std::path::{Path, PathBuf};

use super::view::NodeViewState;

/// Handle to a node slot in a [`Tree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory { expanded: bool },
    File { disabled: bool, measured: bool },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub path: PathBuf,
    pub display_name: String,
    pub kind: NodeKind,
    /// Files: the measured weight. Directories: sum of contributing children,
    /// 0 while collapsed.
    pub token_count: usize,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl Node {
    fn new(path: PathBuf, is_dir: bool, parent: Option<NodeId>) -> Self {
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let kind = if is_dir {
            NodeKind::Directory { expanded: false }
        } else {
            NodeKind::File { disabled: false, measured: false }
        };

        Self {
            path,
            display_name,
            kind,
            token_count: 0,
            children: Vec::new(),
            parent,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn is_expanded(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { expanded: true })
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.kind, NodeKind::File { disabled: true, .. })
    }

    pub fn is_measured(&self) -> bool {
        matches!(self.kind, NodeKind::File { measured: true, .. })
    }

    /// Whether this node's count is part of its parent's aggregate
    pub fn contributes(&self) -> bool {
        match self.kind {
            NodeKind::Directory { expanded } => expanded,
            NodeKind::File { disabled, .. } => !disabled,
        }
    }

    /// What this node currently adds to its parent's aggregate
    pub fn contribution(&self) -> usize {
        if self.contributes() {
            self.token_count
        } else {
            0
        }
    }

    fn sort_key(&self) -> (bool, String) {
        (!self.is_dir(), self.display_name.to_lowercase())
    }
}

pub struct Tree {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<PathBuf, NodeId>,
    root: NodeId,
}

impl Tree {
    /// Create a tree holding only the (expanded) root directory
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        let root_path = root_path.into();
        let mut root = Node::new(root_path.clone(), true, None);
        root.kind = NodeKind::Directory { expanded: true };

        let mut index = HashMap::new();
        index.insert(root_path, NodeId(0));

        Self {
            slots: vec![Some(root)],
            free: Vec::new(),
            index,
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_path(&self) -> &Path {
        &self[self.root].path
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn lookup(&self, path: &Path) -> Option<NodeId> {
        self.index.get(path).copied()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.index.contains_key(path)
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Append `child` to `parent`'s children. Callers re-sort afterwards.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.get_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.get_mut(parent) {
            node.children.push(child);
        }
    }

    /// Directories first, then case-insensitive display name
    pub fn sort_children(&mut self, id: NodeId) {
        let Some(node) = self.get_mut(id) else { return };
        let mut children = std::mem::take(&mut node.children);
        children.sort_by_cached_key(|child| self.slots[child.0].as_ref().map(Node::sort_key));
        if let Some(node) = self.get_mut(id) {
            node.children = children;
        }
    }

    /// Create and register a node under `parent`, keeping sibling order.
    ///
    /// Returns `None` when the path already has a node or `parent` is not a
    /// live directory. The new node contributes nothing until it is measured
    /// (files) or expanded (directories), so no counts change here.
    pub fn insert(&mut self, parent: NodeId, path: PathBuf, is_dir: bool) -> Option<NodeId> {
        let id = self.create(parent, path, is_dir)?;
        self.sort_children(parent);
        Some(id)
    }

    /// Like [`Tree::insert`] but appends without sorting, for callers adding
    /// a whole directory at once.
    pub fn create(&mut self, parent: NodeId, path: PathBuf, is_dir: bool) -> Option<NodeId> {
        if self.index.contains_key(&path) || !self.get(parent).is_some_and(Node::is_dir) {
            return None;
        }

        let node = Node::new(path.clone(), is_dir, Some(parent));
        let id = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        };

        self.index.insert(path, id);
        self.add_child(parent, id);
        Some(id)
    }

    /// Detach the node at `path` and drop it with its whole subtree.
    ///
    /// A contributing node's weight is withdrawn from its ancestors. The root
    /// cannot be removed.
    pub fn remove(&mut self, path: &Path) -> Option<RemovedNode> {
        let id = self.lookup(path)?;
        if id == self.root {
            return None;
        }

        let (parent, is_dir, token_count, withdrawn) = {
            let node = &self[id];
            (node.parent, node.is_dir(), node.token_count, node.contribution())
        };

        if let Some(parent) = parent {
            self.bubble(parent, -(withdrawn as isize));
            if let Some(node) = self.get_mut(parent) {
                node.children.retain(|child| *child != id);
            }
        }

        let mut stack = vec![id];
        let mut dropped = 0;
        while let Some(current) = stack.pop() {
            if let Some(node) = self.slots[current.0].take() {
                self.index.remove(&node.path);
                stack.extend(node.children);
                self.free.push(current.0);
                dropped += 1;
            }
        }

        Some(RemovedNode {
            path: path.to_path_buf(),
            is_dir,
            token_count,
            withdrawn,
            dropped,
        })
    }

    /// Recompute the aggregate of `id` bottom-up.
    ///
    /// Collapsed directories short-circuit to 0 without descending.
    pub fn recompute_aggregate(&mut self, id: NodeId) -> usize {
        let Some(node) = self.get(id) else { return 0 };
        match node.kind {
            NodeKind::File { disabled, .. } => {
                if disabled {
                    0
                } else {
                    node.token_count
                }
            }
            NodeKind::Directory { expanded: false } => {
                if let Some(node) = self.get_mut(id) {
                    node.token_count = 0;
                }
                0
            }
            NodeKind::Directory { expanded: true } => {
                let children = node.children.clone();
                let mut total = 0;
                for child in children {
                    let value = self.recompute_aggregate(child);
                    if self.get(child).is_some_and(Node::contributes) {
                        total += value;
                    }
                }
                if let Some(node) = self.get_mut(id) {
                    node.token_count = total;
                }
                total
            }
        }
    }

    /// Add `delta` to `id` and keep going up while the parent is expanded
    pub fn propagate_delta(&mut self, id: NodeId, delta: isize) {
        if delta == 0 {
            return;
        }
        let mut current = Some(id);
        while let Some(cur) = current {
            let Some(node) = self.get_mut(cur) else { break };
            node.token_count = node.token_count.saturating_add_signed(delta);
            let parent = node.parent;
            current = parent.filter(|p| self.get(*p).is_some_and(Node::is_expanded));
        }
    }

    /// Apply a change in a child's contribution to its parent chain. A
    /// collapsed parent is inert and absorbs nothing.
    fn bubble(&mut self, parent: NodeId, delta: isize) {
        if self.get(parent).is_some_and(Node::is_expanded) {
            self.propagate_delta(parent, delta);
        }
    }

    /// Store a fresh measurement for a file node.
    ///
    /// Returns whether anything changed. Disabled files keep their weight
    /// without contributing it.
    pub fn set_file_tokens(&mut self, id: NodeId, count: usize) -> bool {
        let Some(node) = self.get_mut(id) else { return false };
        let NodeKind::File { disabled, measured } = node.kind else { return false };

        let previous = node.token_count;
        node.token_count = count;
        node.kind = NodeKind::File { disabled, measured: true };
        let parent = node.parent;

        if !disabled {
            if let Some(parent) = parent {
                self.bubble(parent, count as isize - previous as isize);
            }
        }
        previous != count || !measured
    }

    /// Expand or collapse a directory, keeping ancestors consistent
    pub fn set_expanded(&mut self, id: NodeId, expanded: bool) {
        let Some(node) = self.get_mut(id) else { return };
        let NodeKind::Directory { expanded: was } = node.kind else { return };
        if was == expanded {
            return;
        }
        node.kind = NodeKind::Directory { expanded };
        let parent = node.parent;

        let delta = if expanded {
            self.recompute_aggregate(id) as isize
        } else {
            let old = self.get_mut(id).map_or(0, |n| std::mem::take(&mut n.token_count));
            -(old as isize)
        };

        if let Some(parent) = parent {
            self.bubble(parent, delta);
        }
    }

    pub fn toggle_expand(&mut self, id: NodeId) {
        if let Some(node) = self.get(id) {
            let expanded = node.is_expanded();
            self.set_expanded(id, !expanded);
        }
    }

    /// Set the expansion state of a directory and every directory below it
    pub fn set_subtree_expanded(&mut self, id: NodeId, expanded: bool) {
        let Some(node) = self.get(id) else { return };
        if !node.is_dir() {
            return;
        }

        let old = self[id].token_count;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.get_mut(current) {
                if let NodeKind::Directory { .. } = node.kind {
                    node.kind = NodeKind::Directory { expanded };
                    if !expanded {
                        node.token_count = 0;
                    }
                    stack.extend(node.children.iter().copied());
                }
            }
        }

        let new = self.recompute_aggregate(id);
        if let Some(parent) = self[id].parent {
            self.bubble(parent, new as isize - old as isize);
        }
    }

    pub fn toggle_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.get(id) {
            let expanded = node.is_expanded();
            self.set_subtree_expanded(id, !expanded);
        }
    }

    /// Include or exclude a file from its ancestors' aggregates
    pub fn set_disabled(&mut self, id: NodeId, disabled: bool) {
        let Some(node) = self.get_mut(id) else { return };
        let NodeKind::File { disabled: was, measured } = node.kind else { return };
        if was == disabled {
            return;
        }
        node.kind = NodeKind::File { disabled, measured };
        let weight = node.token_count as isize;
        let parent = node.parent;

        if let Some(parent) = parent {
            self.bubble(parent, if disabled { -weight } else { weight });
        }
    }

    /// Enable or disable every file below a directory
    pub fn set_folder_enabled(&mut self, id: NodeId, enabled: bool) {
        let mut files = Vec::new();
        self.collect_files(id, &mut files);
        for file in files {
            self.set_disabled(file, !enabled);
        }
    }

    pub fn all_files_enabled(&self, id: NodeId) -> bool {
        let mut files = Vec::new();
        self.collect_files(id, &mut files);
        files.iter().all(|file| !self[*file].is_disabled())
    }

    fn collect_files(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let Some(node) = self.get(id) else { return };
        if node.is_dir() {
            for child in &node.children {
                self.collect_files(*child, out);
            }
        } else {
            out.push(id);
        }
    }

    /// Overwrite a flag without touching counts; callers recompute afterwards.
    /// Returns false when the flag does not fit the node kind or is unchanged.
    pub(crate) fn restore_flag(&mut self, id: NodeId, flag: NodeViewState) -> bool {
        let Some(node) = self.get_mut(id) else { return false };
        let restored = match (node.kind, flag) {
            (NodeKind::Directory { expanded }, NodeViewState::Expanded(want)) if expanded != want => {
                NodeKind::Directory { expanded: want }
            }
            (NodeKind::File { disabled, measured }, NodeViewState::Disabled(want)) if disabled != want => {
                NodeKind::File { disabled: want, measured }
            }
            _ => return false,
        };
        node.kind = restored;
        true
    }

    /// Check that every expanded directory holds exactly the sum of its
    /// contributing children and every collapsed one holds 0.
    pub fn check_aggregates(&self) -> bool {
        self.slots.iter().flatten().all(|node| match node.kind {
            NodeKind::File { .. } => true,
            NodeKind::Directory { expanded: false } => node.token_count == 0,
            NodeKind::Directory { expanded: true } => {
                let sum: usize = node.children.iter().map(|c| self[*c].contribution()).sum();
                sum == node.token_count
            }
        })
    }

    /// Every live directory node id
    pub fn directories(&self) -> Vec<NodeId> {
        self.index
            .values()
            .copied()
            .filter(|id| self[*id].is_dir())
            .collect()
    }
}

impl Index<NodeId> for Tree {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        match self.slots.get(id.0).and_then(Option::as_ref) {
            Some(node) => node,
            None => panic!("stale node id {:?}", id),
        }
    }
}

/// What a removal took out of the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedNode {
    pub path: PathBuf,
    pub is_dir: bool,
    pub token_count: usize,
    /// Weight subtracted from the parent chain
    pub withdrawn: usize,
    /// Number of nodes dropped, the removed node included
    pub dropped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root/{a/{b.py=10, c.py=5}, d.txt=3}
    fn sample() -> (Tree, NodeId, NodeId, NodeId, NodeId) {
        let mut tree = Tree::new("/p");
        let root = tree.root();
        let a = tree.insert(root, PathBuf::from("/p/a"), true).unwrap();
        let b = tree.insert(a, PathBuf::from("/p/a/b.py"), false).unwrap();
        let c = tree.insert(a, PathBuf::from("/p/a/c.py"), false).unwrap();
        let d = tree.insert(root, PathBuf::from("/p/d.txt"), false).unwrap();
        tree.set_file_tokens(b, 10);
        tree.set_file_tokens(c, 5);
        tree.set_file_tokens(d, 3);
        tree.set_expanded(a, true);
        (tree, a, b, c, d)
    }

    #[test]
    fn test_children_sorted_dirs_first_case_insensitive() {
        let mut tree = Tree::new("/p");
        let root = tree.root();
        tree.insert(root, PathBuf::from("/p/zeta.rs"), false);
        tree.insert(root, PathBuf::from("/p/Beta"), true);
        tree.insert(root, PathBuf::from("/p/alpha.rs"), false);
        tree.insert(root, PathBuf::from("/p/alpha"), true);

        let names: Vec<&str> = tree[root]
            .children
            .iter()
            .map(|c| tree[*c].display_name.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "Beta", "alpha.rs", "zeta.rs"]);
    }

    #[test]
    fn test_insert_rejects_duplicates_and_file_parents() {
        let mut tree = Tree::new("/p");
        let root = tree.root();
        let f = tree.insert(root, PathBuf::from("/p/f.rs"), false).unwrap();
        assert!(tree.insert(root, PathBuf::from("/p/f.rs"), false).is_none());
        assert!(tree.insert(f, PathBuf::from("/p/f.rs/x"), false).is_none());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_incremental_matches_recompute() {
        let (mut tree, _, b, _, d) = sample();
        assert_eq!(tree[tree.root()].token_count, 18);
        assert!(tree.check_aggregates());

        tree.set_file_tokens(b, 4);
        tree.set_disabled(d, true);
        let incremental = tree[tree.root()].token_count;
        let root = tree.root();
        assert_eq!(tree.recompute_aggregate(root), incremental);
        assert_eq!(incremental, 9);
    }

    #[test]
    fn test_collapse_then_expand_restores_counts() {
        let (mut tree, a, ..) = sample();
        let root = tree.root();

        tree.toggle_expand(a);
        assert_eq!(tree[a].token_count, 0);
        assert_eq!(tree[root].token_count, 3);
        assert!(tree.check_aggregates());

        tree.toggle_expand(a);
        assert_eq!(tree[a].token_count, 15);
        assert_eq!(tree[root].token_count, 18);
    }

    #[test]
    fn test_collapsed_parent_stops_propagation() {
        let (mut tree, a, b, ..) = sample();
        let root = tree.root();
        tree.set_expanded(a, false);

        tree.set_file_tokens(b, 100);
        assert_eq!(tree[a].token_count, 0);
        assert_eq!(tree[root].token_count, 3);

        tree.set_expanded(a, true);
        assert_eq!(tree[root].token_count, 108);
        assert!(tree.check_aggregates());
    }

    #[test]
    fn test_add_remove_symmetry() {
        let (mut tree, a, ..) = sample();
        let root = tree.root();
        let before = tree[root].token_count;

        let e = tree.insert(a, PathBuf::from("/p/a/e.py"), false).unwrap();
        tree.set_file_tokens(e, 7);
        assert_eq!(tree[a].token_count, 22);
        assert_eq!(tree[root].token_count, before + 7);

        let removed = tree.remove(Path::new("/p/a/e.py")).unwrap();
        assert_eq!(removed.withdrawn, 7);
        assert_eq!(tree[root].token_count, before);
        assert!(!tree.contains(Path::new("/p/a/e.py")));
        assert!(tree.check_aggregates());
    }

    #[test]
    fn test_disable_and_enable() {
        let (mut tree, a, b, ..) = sample();
        let root = tree.root();

        tree.set_disabled(b, true);
        assert_eq!(tree[a].token_count, 5);
        assert_eq!(tree[root].token_count, 8);
        assert_eq!(tree[b].token_count, 10);

        tree.set_disabled(b, false);
        assert_eq!(tree[root].token_count, 18);
    }

    #[test]
    fn test_removing_directory_drops_subtree() {
        let (mut tree, ..) = sample();
        let root = tree.root();

        let removed = tree.remove(Path::new("/p/a")).unwrap();
        assert_eq!(removed.dropped, 3);
        assert_eq!(removed.withdrawn, 15);
        assert_eq!(tree[root].token_count, 3);
        assert!(!tree.contains(Path::new("/p/a/b.py")));
        assert_eq!(tree.len(), 2);
        assert!(tree.check_aggregates());
    }

    #[test]
    fn test_slots_are_reused_after_removal() {
        let (mut tree, a, ..) = sample();
        tree.remove(Path::new("/p/a/b.py"));
        let slots = tree.slots.len();
        tree.insert(a, PathBuf::from("/p/a/new.py"), false).unwrap();
        assert_eq!(tree.slots.len(), slots);
    }

    #[test]
    fn test_subtree_expand_and_folder_enable() {
        let (mut tree, a, ..) = sample();
        let root = tree.root();
        let inner = tree.insert(a, PathBuf::from("/p/a/inner"), true).unwrap();
        let f = tree.insert(inner, PathBuf::from("/p/a/inner/f.rs"), false).unwrap();
        tree.set_file_tokens(f, 2);
        assert_eq!(tree[root].token_count, 18);

        tree.set_subtree_expanded(root, true);
        assert_eq!(tree[root].token_count, 20);

        tree.set_folder_enabled(a, false);
        assert!(!tree.all_files_enabled(a));
        assert_eq!(tree[root].token_count, 3);

        tree.set_folder_enabled(a, true);
        assert!(tree.all_files_enabled(root));
        assert_eq!(tree[root].token_count, 20);

        tree.toggle_subtree(a);
        assert_eq!(tree[root].token_count, 3);
        assert!(!tree[inner].is_expanded());
        assert!(tree.check_aggregates());
    }

    #[test]
    fn test_subtree_collapse_zeroes_nested_directories() {
        let mut tree = Tree::new("/p");
        let root = tree.root();
        let a = tree.insert(root, PathBuf::from("/p/a"), true).unwrap();
        let inner = tree.insert(a, PathBuf::from("/p/a/inner"), true).unwrap();
        let f = tree.insert(inner, PathBuf::from("/p/a/inner/f.rs"), false).unwrap();
        tree.set_file_tokens(f, 2);

        tree.set_subtree_expanded(root, true);
        assert_eq!(tree[inner].token_count, 2);
        assert_eq!(tree[root].token_count, 2);

        tree.set_subtree_expanded(a, false);
        assert_eq!(tree[a].token_count, 0);
        assert_eq!(tree[inner].token_count, 0);
        assert_eq!(tree[root].token_count, 0);
        assert!(tree.check_aggregates());

        // expanding only the top level leaves the nested directory empty
        tree.set_expanded(a, true);
        assert_eq!(tree[root].token_count, 0);
        tree.set_subtree_expanded(a, true);
        assert_eq!(tree[root].token_count, 2);
        assert!(tree.check_aggregates());
    }

    #[test]
    fn test_measured_flag() {
        let mut tree = Tree::new("/p");
        let root = tree.root();
        let f = tree.insert(root, PathBuf::from("/p/empty.rs"), false).unwrap();
        assert!(!tree[f].is_measured());
        assert!(tree.set_file_tokens(f, 0));
        assert!(tree[f].is_measured());
        assert!(!tree.set_file_tokens(f, 0));
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let mut tree = Tree::new("/p");
        assert!(tree.remove(Path::new("/p")).is_none());
        assert_eq!(tree.len(), 1);
    }
}
