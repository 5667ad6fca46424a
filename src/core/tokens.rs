//! Asynchronous, cached token counting
//!
//! A [`TokenCountManager`] owns a bounded pool of worker threads and a
//! bounded path -> (count, mtime) cache. Requests for the same path that are
//! still waiting in the queue are merged, so a burst of modification events
//! costs at most one extra read per path. Failures never reach the caller:
//! an unreadable or vanished file is reported as 0 tokens.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};

use crate::cache::{CachedCount, TokenCache};
use crate::config::TokenConfig;

/// Receives `(path, count)` once a count is known
pub type TokenCallback = Arc<dyn Fn(&Path, usize) + Send + Sync>;

/// Turns text into a token count. Must be pure.
pub trait Tokenizer: Send + Sync {
    fn count(&self, content: &str) -> usize;
}

impl<F> Tokenizer for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count(&self, content: &str) -> usize {
        self(content)
    }
}

/// Exact counts with the o200k BPE encoding (gpt-4o family)
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenTokenizer {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::o200k_base().context("Failed to load o200k_base encoding")?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn count(&self, content: &str) -> usize {
        self.bpe.encode_with_special_tokens(content).len()
    }
}

/// Roughly four characters per token
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateTokenizer;

impl Tokenizer for EstimateTokenizer {
    fn count(&self, content: &str) -> usize {
        content.chars().count() / 4
    }
}

struct PendingRequest {
    force: bool,
    callbacks: Vec<TokenCallback>,
}

struct Inner {
    tokenizer: Arc<dyn Tokenizer>,
    cache: Mutex<TokenCache>,
    pending: Mutex<HashMap<PathBuf, PendingRequest>>,
    /// Requests queued or being processed
    outstanding: Mutex<usize>,
    idle: Condvar,
    running: AtomicBool,
    large_file_threshold: u64,
    bytes_per_token: u64,
}

pub struct TokenCountManager {
    inner: Arc<Inner>,
    sender: Mutex<Option<Sender<PathBuf>>>,
    workers: usize,
    trim_target: usize,
}

impl TokenCountManager {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, config: &TokenConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                tokenizer,
                cache: Mutex::new(TokenCache::new(config.cache_size)),
                pending: Mutex::new(HashMap::new()),
                outstanding: Mutex::new(0),
                idle: Condvar::new(),
                running: AtomicBool::new(false),
                large_file_threshold: config.large_file_threshold,
                bytes_per_token: config.bytes_per_token.max(1),
            }),
            sender: Mutex::new(None),
            workers: config.worker_count(),
            trim_target: config.trim_target(),
        }
    }

    /// Spawn the worker pool if it is not running. Idempotent.
    pub fn start(&self) {
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel::<PathBuf>();
        let rx = Arc::new(Mutex::new(rx));
        self.inner.running.store(true, Ordering::Release);

        for i in 0..self.workers {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&rx);
            let spawned = thread::Builder::new()
                .name(format!("tokenmap-count-{}", i))
                .spawn(move || worker_loop(inner, rx));
            if let Err(err) = spawned {
                tracing::error!("Failed to spawn token worker: {}", err);
            }
        }

        tracing::debug!("Started {} token workers", self.workers);
        *sender = Some(tx);
    }

    /// Stop accepting work without waiting for it. Workers finish the file
    /// they are reading and exit; queued requests are dropped. Idempotent.
    pub fn stop(&self) {
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.take().is_none() {
            return;
        }
        self.inner.running.store(false, Ordering::Release);

        let dropped = {
            let mut pending = self.inner.lock_pending();
            let n = pending.len();
            pending.clear();
            n
        };
        self.inner.reset_outstanding();
        tracing::debug!("Stopped token workers, dropped {} queued requests", dropped);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Ask for the token count of `path`.
    ///
    /// Without `force_update` a cached count that is still fresh for the
    /// file's current mtime is handed to `callback` immediately, on the
    /// calling thread. Otherwise the request goes to the
    /// worker pool, which starts lazily.
    pub fn queue_token_count(&self, path: &Path, callback: TokenCallback, force_update: bool) {
        if !force_update {
            let modified = modified_time(path);
            let fresh = self.inner.lock_cache().get_fresh(path, modified);
            if let Some(count) = fresh {
                callback(path, count);
                return;
            }
        }

        self.start();

        let is_new = {
            let mut pending = self.inner.lock_pending();
            match pending.entry(path.to_path_buf()) {
                Entry::Occupied(mut waiting) => {
                    let request = waiting.get_mut();
                    request.force |= force_update;
                    request.callbacks.push(callback);
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(PendingRequest {
                        force: force_update,
                        callbacks: vec![callback],
                    });
                    self.inner.begin();
                    true
                }
            }
        };
        if !is_new {
            return;
        }

        let sent = {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            sender.as_ref().is_some_and(|tx| tx.send(path.to_path_buf()).is_ok())
        };
        if !sent {
            // stopped between start() and send
            if self.inner.lock_pending().remove(path).is_some() {
                self.inner.finish();
            }
            tracing::debug!("Token manager stopped, dropping request for {}", path.display());
        }
    }

    /// Whether a request for `path` is still waiting for a worker
    pub fn is_pending(&self, path: &Path) -> bool {
        self.inner.lock_pending().contains_key(path)
    }

    /// Whether the cached count for `path` was taken at or after `modified`
    pub fn is_fresh(&self, path: &Path, modified: Option<SystemTime>) -> bool {
        self.inner.lock_cache().get_fresh(path, modified).is_some()
    }

    /// Forget the cached count for `path`
    pub fn invalidate(&self, path: &Path) {
        self.inner.lock_cache().invalidate(path);
    }

    /// Shrink the cache to its trim target ahead of the hard cap
    pub fn trim_cache(&self) -> usize {
        let evicted = self.inner.lock_cache().trim_to(self.trim_target);
        if evicted > 0 {
            tracing::debug!("Trimmed {} token cache entries", evicted);
        }
        evicted
    }

    /// (entries, capacity)
    pub fn cache_stats(&self) -> (usize, usize) {
        self.inner.lock_cache().stats()
    }

    /// Block until nothing is queued or running, or `timeout` passes.
    /// Returns whether the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.inner.lock_outstanding();
        while *outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            outstanding = self
                .inner
                .idle
                .wait_timeout(outstanding, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Drop for TokenCountManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}

fn worker_loop(inner: Arc<Inner>, rx: Arc<Mutex<Receiver<PathBuf>>>) {
    loop {
        let next = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        let Ok(path) = next else { break };
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        let Some(request) = inner.lock_pending().remove(&path) else {
            continue;
        };

        let count = inner.process(&path, request.force);
        for callback in &request.callbacks {
            callback(&path, count);
        }
        inner.finish();
    }
}

impl Inner {
    /// Stat, consult the cache, then count. Runs outside the tree lock.
    fn process(&self, path: &Path, force: bool) -> usize {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => return self.fail(path, &err),
        };
        let modified = metadata.modified().ok();
        let size = metadata.len();

        if !force {
            if let Some(count) = self.lock_cache().get_fresh(path, modified) {
                return count;
            }
        }

        let count = if size > self.large_file_threshold {
            (size / self.bytes_per_token).max(1) as usize
        } else {
            match fs::read(path) {
                Ok(bytes) => self.tokenizer.count(&String::from_utf8_lossy(&bytes)),
                Err(err) => return self.fail(path, &err),
            }
        };

        self.lock_cache().put(
            path.to_path_buf(),
            CachedCount { count, modified, size },
        );
        count
    }

    fn fail(&self, path: &Path, err: &std::io::Error) -> usize {
        if err.kind() == ErrorKind::NotFound {
            self.lock_cache().invalidate(path);
            tracing::debug!("File vanished before counting: {}", path.display());
        } else {
            tracing::warn!("Failed to count tokens in {}: {}", path.display(), err);
        }
        0
    }

    fn begin(&self) {
        *self.lock_outstanding() += 1;
    }

    fn finish(&self) {
        let mut outstanding = self.lock_outstanding();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn reset_outstanding(&self) {
        *self.lock_outstanding() = 0;
        self.idle.notify_all();
    }

    fn lock_cache(&self) -> MutexGuard<'_, TokenCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<PathBuf, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outstanding(&self) -> MutexGuard<'_, usize> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::sync::mpsc::channel;
    use tempfile::TempDir;

    fn words(content: &str) -> usize {
        content.split_whitespace().count()
    }

    fn manager(config: TokenConfig) -> TokenCountManager {
        TokenCountManager::new(Arc::new(words), &config)
    }

    fn small_pool() -> TokenConfig {
        TokenConfig { max_workers: Some(2), ..Default::default() }
    }

    fn recorder() -> (TokenCallback, Receiver<(PathBuf, usize)>) {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let callback: TokenCallback = Arc::new(move |path: &Path, count: usize| {
            let _ = tx.lock().unwrap().send((path.to_path_buf(), count));
        });
        (callback, rx)
    }

    fn recv(rx: &Receiver<(PathBuf, usize)>) -> usize {
        rx.recv_timeout(Duration::from_secs(5)).expect("callback not invoked").1
    }

    #[test]
    fn test_counts_file_on_worker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "one two three four").unwrap();

        let tokens = manager(small_pool());
        let (callback, rx) = recorder();
        tokens.queue_token_count(&path, callback, false);

        assert_eq!(recv(&rx), 4);
        assert!(tokens.wait_idle(Duration::from_secs(5)));
        assert_eq!(tokens.cache_stats().0, 1);
    }

    #[test]
    fn test_cached_count_is_delivered_synchronously() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "one two").unwrap();

        let tokens = manager(small_pool());
        let (callback, rx) = recorder();
        tokens.queue_token_count(&path, callback.clone(), false);
        assert_eq!(recv(&rx), 2);
        assert!(tokens.wait_idle(Duration::from_secs(5)));

        tokens.queue_token_count(&path, callback, false);
        assert_eq!(rx.try_recv().map(|(_, n)| n), Ok(2));
    }

    #[test]
    fn test_force_update_bypasses_stale_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "a b c").unwrap();
        let original_mtime = fs::metadata(&path).unwrap().modified().unwrap();

        let tokens = manager(small_pool());
        let (callback, rx) = recorder();
        tokens.queue_token_count(&path, callback.clone(), false);
        assert_eq!(recv(&rx), 3);
        assert!(tokens.wait_idle(Duration::from_secs(5)));

        // new content, same modification time
        fs::write(&path, "a b c d e").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(original_mtime)
            .unwrap();

        tokens.queue_token_count(&path, callback.clone(), false);
        assert_eq!(recv(&rx), 3);
        assert_eq!(tokens.inner.process(&path, false), 3);

        tokens.queue_token_count(&path, callback, true);
        assert_eq!(recv(&rx), 5);
    }

    #[test]
    fn test_stale_cache_entry_is_not_returned_synchronously() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "a b c").unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();

        let tokens = manager(small_pool());
        let (callback, rx) = recorder();
        tokens.queue_token_count(&path, callback.clone(), false);
        assert_eq!(recv(&rx), 3);
        assert!(tokens.wait_idle(Duration::from_secs(5)));
        assert!(tokens.is_fresh(&path, Some(mtime)));

        fs::write(&path, "a b c d e f g").unwrap();
        let bumped = mtime + Duration::from_secs(10);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(bumped)
            .unwrap();
        assert!(!tokens.is_fresh(&path, Some(bumped)));

        tokens.queue_token_count(&path, callback, false);
        assert_eq!(recv(&rx), 7);
        assert!(tokens.wait_idle(Duration::from_secs(5)));
        assert!(tokens.is_fresh(&path, Some(bumped)));
    }

    #[test]
    fn test_newer_mtime_invalidates_on_worker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "a b c").unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();

        let tokens = manager(small_pool());
        assert_eq!(tokens.inner.process(&path, false), 3);

        fs::write(&path, "a b").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime + Duration::from_secs(10))
            .unwrap();
        assert_eq!(tokens.inner.process(&path, false), 2);
    }

    #[test]
    fn test_missing_file_counts_zero_and_evicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.py");
        fs::write(&path, "x y").unwrap();

        let tokens = manager(small_pool());
        assert_eq!(tokens.inner.process(&path, false), 2);
        fs::remove_file(&path).unwrap();

        let (callback, rx) = recorder();
        tokens.queue_token_count(&path, callback, true);
        assert_eq!(recv(&rx), 0);
        assert!(tokens.wait_idle(Duration::from_secs(5)));
        assert_eq!(tokens.cache_stats().0, 0);
    }

    #[test]
    fn test_unreadable_path_counts_zero() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(small_pool());
        // a directory stats fine but cannot be read as a file
        assert_eq!(tokens.inner.process(dir.path(), true), 0);
    }

    #[test]
    fn test_large_files_are_estimated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.txt");
        fs::write(&path, "x".repeat(100)).unwrap();

        let tokens = manager(TokenConfig {
            large_file_threshold: 10,
            bytes_per_token: 4,
            ..small_pool()
        });
        assert_eq!(tokens.inner.process(&path, true), 25);
    }

    #[test]
    fn test_every_callback_is_invoked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "a b").unwrap();

        let tokens = manager(small_pool());
        let (first, rx1) = recorder();
        let (second, rx2) = recorder();
        tokens.queue_token_count(&path, first, true);
        tokens.queue_token_count(&path, second, true);

        assert_eq!(recv(&rx1), 2);
        assert_eq!(recv(&rx2), 2);
        assert!(tokens.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_stop_is_idempotent_and_restartable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "a b c").unwrap();

        let tokens = manager(small_pool());
        tokens.stop();
        tokens.start();
        tokens.start();
        assert!(tokens.is_running());
        tokens.stop();
        tokens.stop();
        assert!(!tokens.is_running());
        assert!(tokens.wait_idle(Duration::from_millis(10)));

        let (callback, rx) = recorder();
        tokens.queue_token_count(&path, callback, false);
        assert_eq!(recv(&rx), 3);
    }

    #[test]
    fn test_trim_cache_shrinks_to_target() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(TokenConfig {
            cache_size: 10,
            trim_ratio: 0.3,
            ..small_pool()
        });
        for i in 0..8 {
            let path = dir.path().join(format!("f{}.py", i));
            fs::write(&path, "a").unwrap();
            tokens.inner.process(&path, false);
        }
        assert_eq!(tokens.cache_stats(), (8, 10));
        assert_eq!(tokens.trim_cache(), 5);
        assert_eq!(tokens.cache_stats().0, 3);
    }

    #[test]
    fn test_estimate_tokenizer() {
        assert_eq!(EstimateTokenizer.count("abcdefgh"), 2);
        assert_eq!(EstimateTokenizer.count("abc"), 0);
    }
}
