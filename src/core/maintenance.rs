use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::filter::FileFilter;
use super::shared::SharedTree;
use super::tokens::TokenCountManager;
use crate::config::MaintenanceConfig;

const STOP_CHECK: Duration = Duration::from_millis(100);

/// Background upkeep: counts files the initial scan skipped, a few at a
/// time, and periodically trims the token cache and the filter caches.
pub struct Maintenance {
    shared: Arc<SharedTree>,
    filter: Arc<FileFilter>,
    tokens: Arc<TokenCountManager>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(
        shared: Arc<SharedTree>,
        filter: Arc<FileFilter>,
        tokens: Arc<TokenCountManager>,
        config: &MaintenanceConfig,
    ) -> Self {
        Self {
            shared,
            filter,
            tokens,
            config: config.clone(),
        }
    }

    /// Queue counts for up to `limit` unmeasured files, visible ones first.
    /// Files already waiting for a worker are skipped. Returns how many
    /// requests were queued.
    pub fn backfill(&self, limit: usize) -> usize {
        let candidates = self.shared.lock().unmeasured_files(limit);
        let callback = self.shared.token_callback();

        let mut queued = 0;
        for path in candidates {
            if self.tokens.is_pending(&path) {
                continue;
            }
            self.tokens.queue_token_count(&path, Arc::clone(&callback), false);
            queued += 1;
        }
        queued
    }

    /// Measure every file in the tree, waiting up to `timeout` in total
    pub fn backfill_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let queued = self.backfill(usize::MAX);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.tokens.wait_idle(remaining) {
                return false;
            }
            if queued == 0 {
                return true;
            }
        }
    }

    /// Trim the token cache to its target and release the filter caches
    pub fn sweep(&self) {
        let evicted = self.tokens.trim_cache();
        self.filter.clear_cache();
        let (entries, capacity) = self.tokens.cache_stats();
        tracing::debug!(
            "Maintenance sweep: evicted {}, token cache {}/{}",
            evicted,
            entries,
            capacity
        );
    }

    pub fn run(&self, stop: &AtomicBool) {
        let mut last_sweep = Instant::now();
        while !stop.load(Ordering::Acquire) {
            self.backfill(self.config.backfill_batch);
            if last_sweep.elapsed() >= self.config.interval() {
                self.sweep();
                last_sweep = Instant::now();
            }
            sleep_unless_stopped(stop, self.config.backfill_interval());
        }
        tracing::debug!("Maintenance stopped");
    }

    pub fn spawn(self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tokenmap-maintenance".to_string())
            .spawn(move || self.run(&stop))
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(STOP_CHECK));
    }
}
