use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::events::ChangeSignal;
use super::tokens::TokenCallback;
use super::tree::Tree;

/// The tree, its path index and the change signal, shared by the builder,
/// the watcher, token workers and the renderer.
///
/// Every traversal or mutation holds the single tree lock for its duration.
/// The lock is not re-entrant: nothing that acquires it may be called while
/// it is held, which includes queueing token counts (a cached count invokes
/// its callback synchronously).
pub struct SharedTree {
    tree: Mutex<Tree>,
    changed: ChangeSignal,
    root_path: PathBuf,
}

impl SharedTree {
    pub fn new(root_path: impl Into<PathBuf>) -> Arc<Self> {
        let root_path = root_path.into();
        Arc::new(Self {
            tree: Mutex::new(Tree::new(root_path.clone())),
            changed: ChangeSignal::new(),
            root_path,
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Acquire the tree lock. A panic in another holder does not make the
    /// tree unusable: its methods leave it consistent between calls.
    pub fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn changed(&self) -> &ChangeSignal {
        &self.changed
    }

    /// Callback that stores a measured count on the node for `path` and
    /// raises the change signal when the tree actually changed. Counts for
    /// paths that vanished in the meantime are dropped.
    pub fn token_callback(self: &Arc<Self>) -> TokenCallback {
        let shared = Arc::clone(self);
        Arc::new(move |path: &Path, count: usize| {
            let changed = {
                let mut tree = shared.lock();
                match tree.lookup(path) {
                    Some(id) => tree.set_file_tokens(id, count),
                    None => false,
                }
            };
            if changed {
                shared.changed.set();
            }
        })
    }
}
