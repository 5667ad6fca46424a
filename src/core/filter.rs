use std::path::Path;
use std::sync::{Mutex, PoisonError};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use lru::LruCache;

use crate::cache::non_zero;
use crate::config::FilterConfig;

/// Name classifier shared by the tree builder and the watcher.
///
/// A name is ignored when it contains any plain ignore pattern, matches any
/// glob ignore pattern, or carries an extension outside the allow-list (when
/// an allow-list is configured). Answers are remembered in two bounded,
/// recency-ordered caches: one per full name and one per extension.
pub struct FileFilter {
    substrings: Vec<String>,
    globs: Gitignore,
    allowed_extensions: Vec<String>,
    names: Mutex<LruCache<String, bool>>,
    extensions: Mutex<LruCache<String, bool>>,
}

impl FileFilter {
    pub fn new(config: &FilterConfig) -> Self {
        let mut substrings = Vec::new();
        let mut builder = GitignoreBuilder::new(".");

        for pattern in &config.ignored_patterns {
            if is_glob(pattern) {
                if let Err(err) = builder.add_line(None, pattern) {
                    tracing::warn!("Skipping invalid ignore pattern {:?}: {}", pattern, err);
                }
            } else if !pattern.is_empty() {
                substrings.push(pattern.clone());
            }
        }

        let globs = builder.build().unwrap_or_else(|err| {
            tracing::warn!("Failed to compile ignore patterns: {}", err);
            Gitignore::empty()
        });

        let allowed_extensions = config
            .allowed_extensions
            .iter()
            .map(|ext| normalize_extension(ext))
            .filter(|ext| !ext.is_empty())
            .collect();

        Self {
            substrings,
            globs,
            allowed_extensions,
            names: Mutex::new(LruCache::new(non_zero(config.name_cache_size))),
            extensions: Mutex::new(LruCache::new(non_zero(config.extension_cache_size))),
        }
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        if let Some(&cached) = self.lock_names().get(name) {
            return cached;
        }

        let ignored = self.matches_pattern(name) || self.extension_rejected(name);
        self.lock_names().put(name.to_string(), ignored);
        ignored
    }

    pub fn clear_cache(&self) {
        self.lock_names().clear();
        self.lock_extensions().clear();
    }

    /// (cached names, cached extensions)
    pub fn cache_len(&self) -> (usize, usize) {
        (self.lock_names().len(), self.lock_extensions().len())
    }

    fn matches_pattern(&self, name: &str) -> bool {
        self.substrings.iter().any(|pattern| name.contains(pattern.as_str()))
            || self.globs.matched(name, false).is_ignore()
    }

    fn extension_rejected(&self, name: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return false;
        }
        let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.to_lowercase();

        if let Some(&cached) = self.lock_extensions().get(&ext) {
            return cached;
        }
        let rejected = !self.allowed_extensions.contains(&ext);
        self.lock_extensions().put(ext, rejected);
        rejected
    }

    fn lock_names(&self) -> std::sync::MutexGuard<'_, LruCache<String, bool>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_extensions(&self) -> std::sync::MutexGuard<'_, LruCache<String, bool>> {
        self.extensions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}
