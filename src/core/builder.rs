use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::events::BuildSummary;
use super::filter::FileFilter;
use super::shared::SharedTree;
use super::tokens::TokenCountManager;
use super::tree::NodeId;
use crate::config::BuilderConfig;

/// A directory entry that passed the filter
#[derive(Debug, Clone)]
pub(crate) struct ScannedEntry {
    pub path: PathBuf,
    pub name: String,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
}

/// List `dir` once, dropping filtered names.
///
/// Symlinks are resolved for files only; a link to a directory is left out
/// so cyclic links cannot make the tree infinite. Entries that vanish
/// between listing and stat are skipped.
pub(crate) fn read_entries(dir: &Path, filter: &FileFilter) -> io::Result<Vec<ScannedEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name().to_string_lossy().into_owned();
        if filter.is_ignored(&name) {
            continue;
        }

        let path = entry.path();
        let Ok(file_type) = entry.file_type() else { continue };
        let Ok(metadata) = fs::metadata(&path) else { continue };
        if file_type.is_symlink() && metadata.is_dir() {
            continue;
        }

        let is_dir = metadata.is_dir();
        entries.push(ScannedEntry {
            path,
            name,
            is_dir,
            modified: if is_dir { None } else { metadata.modified().ok() },
        });
    }
    Ok(entries)
}

/// Breadth-first initial scan that fills a [`SharedTree`].
///
/// The tree is visible to other threads while it grows. Only the first
/// `eager_limit` files get a token count requested during the scan; the
/// rest stay unmeasured until the maintenance backfill reaches them.
pub struct TreeBuilder {
    shared: Arc<SharedTree>,
    filter: Arc<FileFilter>,
    tokens: Arc<TokenCountManager>,
    eager_limit: usize,
    expand_all: bool,
}

impl TreeBuilder {
    pub fn new(
        shared: Arc<SharedTree>,
        filter: Arc<FileFilter>,
        tokens: Arc<TokenCountManager>,
    ) -> Self {
        let defaults = BuilderConfig::default();
        Self {
            shared,
            filter,
            tokens,
            eager_limit: defaults.eager_limit,
            expand_all: defaults.expand_all,
        }
    }

    pub fn with_config(mut self, config: &BuilderConfig) -> Self {
        self.eager_limit = config.eager_limit;
        self.expand_all = config.expand_all;
        self
    }

    pub fn eager_limit(mut self, limit: usize) -> Self {
        self.eager_limit = limit;
        self
    }

    pub fn expand_all(mut self, expand: bool) -> Self {
        self.expand_all = expand;
        self
    }

    pub fn build(&self) -> BuildSummary {
        let root_path = self.shared.root_path().to_path_buf();
        let root = self.shared.lock().root();
        let callback = self.shared.token_callback();

        let mut summary = BuildSummary { directories: 1, ..Default::default() };
        let mut queue: VecDeque<(NodeId, PathBuf)> = VecDeque::from([(root, root_path.clone())]);
        let mut visited: HashSet<PathBuf> = HashSet::new();

        while let Some((dir_id, dir_path)) = queue.pop_front() {
            // bind mounts can still alias a directory
            if let Ok(canonical) = fs::canonicalize(&dir_path) {
                if !visited.insert(canonical) {
                    continue;
                }
            }

            let entries = match read_entries(&dir_path, &self.filter) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::debug!("Skipping unreadable directory {}: {}", dir_path.display(), err);
                    summary.skipped_dirs += 1;
                    continue;
                }
            };

            let (mut dirs, mut files): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|entry| entry.is_dir);
            dirs.sort_by_cached_key(|entry| entry.name.to_lowercase());
            files.sort_by_cached_key(|entry| entry.name.to_lowercase());

            let mut eager = Vec::new();
            {
                let mut tree = self.shared.lock();
                for entry in dirs {
                    if let Some(id) = tree.create(dir_id, entry.path.clone(), true) {
                        if self.expand_all {
                            tree.set_expanded(id, true);
                        }
                        queue.push_back((id, entry.path));
                        summary.directories += 1;
                    }
                }
                for entry in files {
                    if tree.create(dir_id, entry.path.clone(), false).is_some() {
                        summary.files += 1;
                        if summary.eager_requests < self.eager_limit {
                            summary.eager_requests += 1;
                            eager.push(entry.path);
                        }
                    }
                }
                tree.sort_children(dir_id);
            }

            // cached counts call back synchronously, so never under the lock
            for path in eager {
                self.tokens.queue_token_count(&path, Arc::clone(&callback), false);
            }
        }

        {
            let mut tree = self.shared.lock();
            let root = tree.root();
            tree.recompute_aggregate(root);
        }
        self.filter.clear_cache();
        self.shared.changed().set();

        tracing::info!(
            "Scanned {}: {} directories, {} files, {} skipped",
            root_path.display(),
            summary.directories,
            summary.files,
            summary.skipped_dirs
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, TokenConfig};
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(root: &Path, filter: FilterConfig) -> (Arc<SharedTree>, Arc<FileFilter>, Arc<TokenCountManager>) {
        let words = |s: &str| s.split_whitespace().count();
        let tokens = TokenCountManager::new(
            Arc::new(words),
            &TokenConfig { max_workers: Some(2), ..Default::default() },
        );
        (
            SharedTree::new(root),
            Arc::new(FileFilter::new(&filter)),
            Arc::new(tokens),
        )
    }

    fn open_filter() -> FilterConfig {
        FilterConfig {
            ignored_patterns: vec!["ignored".to_string(), "*.log".to_string()],
            allowed_extensions: Vec::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_structure_and_filtering() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join("ignored_dir")).unwrap();
        fs::write(root.join("src/lib.rs"), "a b").unwrap();
        fs::write(root.join("src/nested/deep.rs"), "a").unwrap();
        fs::write(root.join("Zed.md"), "a").unwrap();
        fs::write(root.join("alpha.md"), "a").unwrap();
        fs::write(root.join("debug.log"), "a").unwrap();

        let (shared, filter, tokens) = setup(root, open_filter());
        let summary = TreeBuilder::new(shared.clone(), filter, tokens).build();

        assert_eq!(summary.directories, 3);
        assert_eq!(summary.files, 4);
        assert_eq!(summary.skipped_dirs, 0);

        let tree = shared.lock();
        assert!(tree.contains(&root.join("src/nested/deep.rs")));
        assert!(!tree.contains(&root.join("ignored_dir")));
        assert!(!tree.contains(&root.join("debug.log")));

        let names: Vec<&str> = tree[tree.root()]
            .children
            .iter()
            .map(|c| tree[*c].display_name.as_str())
            .collect();
        assert_eq!(names, vec!["src", "alpha.md", "Zed.md"]);
    }

    #[test]
    fn test_eager_limit_caps_requests() {
        let dir = TempDir::new().unwrap();
        for i in 0..10 {
            fs::write(dir.path().join(format!("f{}.txt", i)), "one two").unwrap();
        }

        let (shared, filter, tokens) = setup(dir.path(), open_filter());
        let summary = TreeBuilder::new(shared.clone(), filter, tokens.clone())
            .eager_limit(3)
            .build();
        assert_eq!(summary.eager_requests, 3);
        assert!(tokens.wait_idle(Duration::from_secs(5)));

        let tree = shared.lock();
        assert_eq!(tree[tree.root()].token_count, 6);
        assert_eq!(tree.unmeasured_files(usize::MAX).len(), 7);
        assert!(tree.check_aggregates());
    }

    #[test]
    fn test_expand_all_and_filter_cache_release() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c.txt"), "one two three").unwrap();

        let (shared, filter, tokens) = setup(dir.path(), open_filter());
        TreeBuilder::new(shared.clone(), filter.clone(), tokens.clone())
            .expand_all(true)
            .build();
        assert_eq!(filter.cache_len(), (0, 0));
        assert!(tokens.wait_idle(Duration::from_secs(5)));

        let tree = shared.lock();
        assert_eq!(tree[tree.root()].token_count, 3);
        let b = tree.lookup(&dir.path().join("a/b")).unwrap();
        assert!(tree[b].is_expanded());
    }

    #[test]
    fn test_missing_root_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let (shared, filter, tokens) = setup(&missing, open_filter());

        let summary = TreeBuilder::new(shared.clone(), filter, tokens).build();
        assert_eq!(summary.skipped_dirs, 1);
        assert_eq!(shared.lock().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_symlinks_are_not_followed() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real/x.txt"), "a").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("real/loop")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real/x.txt"), dir.path().join("link.txt")).unwrap();

        let (shared, filter, tokens) = setup(dir.path(), open_filter());
        TreeBuilder::new(shared.clone(), filter, tokens).build();

        let tree = shared.lock();
        assert!(!tree.contains(&dir.path().join("real/loop")));
        assert!(tree.contains(&dir.path().join("link.txt")));
    }
}
