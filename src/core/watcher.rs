//! Incremental reconciliation of the tree with the file system
//!
//! The watcher keeps the previous listing of every known directory and,
//! each cycle, re-lists a bounded batch of them. Differences become tree
//! edits under the tree lock; token counts for new or modified files are
//! queued after the lock is released. Native file system events, when
//! available, only decide which directories are listed first and wake the
//! loop early; polling stays the source of truth.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use super::builder::read_entries;
use super::events::CycleSummary;
use super::filter::FileFilter;
use super::shared::SharedTree;
use super::tokens::TokenCountManager;
use crate::config::{WatchMode, WatcherConfig};

/// Longest stretch the loop sleeps without checking the stop flag
const STOP_CHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryState {
    is_dir: bool,
    /// Unknown for entries seeded from the tree. On their first listing such
    /// files are checked against the token cache instead.
    modified: Option<SystemTime>,
}

type Listing = HashMap<PathBuf, EntryState>;

enum ListOutcome {
    Listed(Listing),
    Vanished,
    Failed,
}

/// Native event subscription; dropping it unsubscribes
struct PushSubscription {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
}

impl PushSubscription {
    fn new(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = notify::recommended_watcher(tx)
            .context("Failed to create file system watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .context("Failed to start watching directory")?;

        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }
}

pub struct FileWatcher {
    shared: Arc<SharedTree>,
    filter: Arc<FileFilter>,
    tokens: Arc<TokenCountManager>,
    poll_interval: Duration,
    max_dirs_per_cycle: usize,
    snapshot: HashMap<PathBuf, Listing>,
    queue: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
    /// Directories named by native events since the last cycle
    dirty: Vec<PathBuf>,
    push: Option<PushSubscription>,
}

impl FileWatcher {
    /// Seed the per-directory snapshot from the current tree so the first
    /// cycle only reports real differences.
    pub fn new(
        shared: Arc<SharedTree>,
        filter: Arc<FileFilter>,
        tokens: Arc<TokenCountManager>,
        config: &WatcherConfig,
    ) -> Result<Self> {
        let root = shared.root_path().to_path_buf();
        let push = match config.mode {
            WatchMode::Polling => None,
            WatchMode::Native => Some(PushSubscription::new(&root)?),
            WatchMode::Auto => match PushSubscription::new(&root) {
                Ok(subscription) => Some(subscription),
                Err(err) => {
                    tracing::warn!("Native file events unavailable, polling only: {:#}", err);
                    None
                }
            },
        };

        let snapshot = {
            let tree = shared.lock();
            tree.directories()
                .into_iter()
                .map(|dir| {
                    let listing = tree[dir]
                        .children
                        .iter()
                        .map(|child| {
                            let node = &tree[*child];
                            (node.path.clone(), EntryState { is_dir: node.is_dir(), modified: None })
                        })
                        .collect();
                    (tree[dir].path.clone(), listing)
                })
                .collect()
        };

        Ok(Self {
            shared,
            filter,
            tokens,
            poll_interval: config.poll_interval(),
            max_dirs_per_cycle: config.max_dirs_per_cycle.max(1),
            snapshot,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            dirty: Vec::new(),
            push,
        })
    }

    pub fn uses_native_events(&self) -> bool {
        self.push.is_some()
    }

    /// List up to `max_dirs_per_cycle` directories and apply what changed.
    pub fn run_cycle(&mut self) -> CycleSummary {
        self.drain_push_events();
        if self.queue.is_empty() {
            self.refill_queue();
        }

        let mut scanned = Vec::new();
        while scanned.len() < self.max_dirs_per_cycle {
            let Some(dir) = self.queue.pop_front() else { break };
            self.queued.remove(&dir);
            let outcome = self.list_dir(&dir);
            scanned.push((dir, outcome));
        }

        let mut summary = CycleSummary { scanned_dirs: scanned.len(), ..Default::default() };
        let mut added: Vec<(PathBuf, bool)> = Vec::new();
        let mut removed: Vec<PathBuf> = Vec::new();
        let mut modified: Vec<PathBuf> = Vec::new();
        let mut unverified: Vec<(PathBuf, Option<SystemTime>)> = Vec::new();
        let mut listings: Vec<(PathBuf, Listing)> = Vec::new();

        for (dir, outcome) in scanned {
            match outcome {
                ListOutcome::Listed(current) => {
                    let previous = self.snapshot.get(&dir);
                    diff_listing(
                        previous,
                        &current,
                        &mut added,
                        &mut removed,
                        &mut modified,
                        &mut unverified,
                    );
                    listings.push((dir, current));
                }
                // the parent's listing reports the removal
                ListOutcome::Vanished => self.forget_subtree(&dir),
                ListOutcome::Failed => {}
            }
        }

        // seeded files seen for the first time; the count may predate an edit
        let stale: Vec<PathBuf> = unverified
            .into_iter()
            .filter(|(path, mtime)| !self.tokens.is_fresh(path, *mtime))
            .map(|(path, _)| path)
            .collect();

        if added.is_empty() && removed.is_empty() && modified.is_empty() && stale.is_empty() {
            for (dir, listing) in listings {
                self.snapshot.insert(dir, listing);
            }
            return summary;
        }

        // parents before children
        added.sort_by_key(|(path, _)| path.components().count());

        let mut deferred: HashSet<PathBuf> = HashSet::new();
        let mut new_dirs: Vec<PathBuf> = Vec::new();
        let mut removed_dirs: Vec<PathBuf> = Vec::new();
        let mut removed_files: Vec<PathBuf> = Vec::new();
        let mut to_count: Vec<(PathBuf, bool)> = Vec::new();
        {
            let mut tree = self.shared.lock();

            for path in &removed {
                if let Some(node) = tree.remove(path) {
                    summary.removed += 1;
                    if node.is_dir {
                        removed_dirs.push(node.path);
                    } else {
                        removed_files.push(node.path);
                    }
                }
            }

            for (path, is_dir) in &added {
                let parent = path
                    .parent()
                    .and_then(|parent| tree.lookup(parent))
                    .filter(|parent| tree[*parent].is_dir());
                let Some(parent) = parent else {
                    deferred.insert(path.clone());
                    continue;
                };
                if tree.insert(parent, path.clone(), *is_dir).is_some() {
                    summary.added += 1;
                    if *is_dir {
                        new_dirs.push(path.clone());
                    } else {
                        to_count.push((path.clone(), false));
                    }
                }
            }

            for path in &modified {
                if tree.lookup(path).is_some_and(|id| !tree[id].is_dir()) {
                    summary.modified += 1;
                    to_count.push((path.clone(), true));
                }
            }

            // unmeasured files are read fresh whenever they get counted
            for path in &stale {
                if tree.lookup(path).is_some_and(|id| tree[id].is_measured()) {
                    summary.modified += 1;
                    to_count.push((path.clone(), true));
                }
            }
        }

        for path in &removed_files {
            self.tokens.invalidate(path);
        }
        for dir in &removed_dirs {
            self.forget_subtree(dir);
        }
        for (dir, mut listing) in listings {
            // retried once the parent node exists
            listing.retain(|path, _| !deferred.contains(path));
            self.snapshot.insert(dir, listing);
        }
        for dir in new_dirs.into_iter().rev() {
            self.enqueue_front(dir);
        }

        let callback = self.shared.token_callback();
        for (path, force) in &to_count {
            self.tokens.queue_token_count(path, Arc::clone(&callback), *force);
        }

        if summary.has_changes() {
            self.shared.changed().set();
            tracing::debug!(
                "Watcher cycle: {} added, {} removed, {} modified",
                summary.added,
                summary.removed,
                summary.modified
            );
        }
        summary
    }

    /// Run cycles until `stop` is set, then release the native subscription.
    pub fn watch(&mut self, stop: &AtomicBool) {
        tracing::info!(
            "Watching {} ({})",
            self.shared.root_path().display(),
            if self.push.is_some() { "native events + polling" } else { "polling" }
        );

        while !stop.load(Ordering::Acquire) {
            self.run_cycle();
            self.pause(stop);
        }

        self.push = None;
        self.queue.clear();
        self.queued.clear();
        tracing::debug!("Watcher stopped");
    }

    /// Move the watcher onto its own thread
    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tokenmap-watcher".to_string())
            .spawn(move || self.watch(&stop))
    }

    fn list_dir(&self, dir: &Path) -> ListOutcome {
        match read_entries(dir, &self.filter) {
            Ok(entries) => ListOutcome::Listed(
                entries
                    .into_iter()
                    .map(|entry| {
                        let state = EntryState { is_dir: entry.is_dir, modified: entry.modified };
                        (entry.path, state)
                    })
                    .collect(),
            ),
            Err(err) if err.kind() == ErrorKind::NotFound => ListOutcome::Vanished,
            Err(err) => {
                tracing::debug!("Failed to list {}: {}", dir.display(), err);
                ListOutcome::Failed
            }
        }
    }

    /// Queue every known directory, shallowest first
    fn refill_queue(&mut self) {
        let mut dirs: Vec<PathBuf> = self.snapshot.keys().cloned().collect();
        let root = self.shared.root_path().to_path_buf();
        if !self.snapshot.contains_key(&root) {
            dirs.push(root);
        }
        dirs.sort_by(|a, b| {
            a.components()
                .count()
                .cmp(&b.components().count())
                .then_with(|| a.cmp(b))
        });
        for dir in dirs {
            if self.queued.insert(dir.clone()) {
                self.queue.push_back(dir);
            }
        }
    }

    fn enqueue_front(&mut self, dir: PathBuf) {
        if self.queued.insert(dir.clone()) {
            self.queue.push_front(dir);
        } else if let Some(pos) = self.queue.iter().position(|queued| *queued == dir) {
            if let Some(dir) = self.queue.remove(pos) {
                self.queue.push_front(dir);
            }
        }
    }

    /// Drop the listings of `dir` and everything below it. The parent's
    /// listing keeps its entry until the parent is listed again.
    fn forget_subtree(&mut self, dir: &Path) {
        self.snapshot.retain(|path, _| !path.starts_with(dir));
    }

    fn drain_push_events(&mut self) {
        loop {
            let received = match &self.push {
                Some(push) => push.events.try_recv(),
                None => break,
            };
            match received {
                Ok(event) => self.note_event(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::warn!("Native file events stopped, polling only");
                    self.push = None;
                }
            }
        }

        let dirty = std::mem::take(&mut self.dirty);
        for dir in dirty {
            if self.snapshot.contains_key(&dir) {
                self.enqueue_front(dir);
            }
        }
    }

    /// Remember which known directories an event touched
    fn note_event(&mut self, event: notify::Result<Event>) {
        match event {
            Ok(event) => {
                for path in event.paths {
                    if self.snapshot.contains_key(&path) {
                        self.dirty.push(path.clone());
                    }
                    if let Some(parent) = path.parent() {
                        self.dirty.push(parent.to_path_buf());
                    }
                }
            }
            Err(err) => tracing::warn!("File watcher error: {}", err),
        }
    }

    /// Sleep until the next cycle, waking early on a native event or stop
    fn pause(&mut self, stop: &AtomicBool) {
        let deadline = Instant::now() + self.poll_interval;
        while !stop.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = (deadline - now).min(STOP_CHECK);

            let received = match &self.push {
                Some(push) => push.events.recv_timeout(slice),
                None => {
                    thread::sleep(slice);
                    continue;
                }
            };
            match received {
                Ok(event) => {
                    self.note_event(event);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Native file events stopped, polling only");
                    self.push = None;
                }
            }
        }
    }
}

/// Compare one directory's listing with its previous one. A path whose
/// type changed counts as removed and added.
fn diff_listing(
    previous: Option<&Listing>,
    current: &Listing,
    added: &mut Vec<(PathBuf, bool)>,
    removed: &mut Vec<PathBuf>,
    modified: &mut Vec<PathBuf>,
    unverified: &mut Vec<(PathBuf, Option<SystemTime>)>,
) {
    let empty = Listing::new();
    let previous = previous.unwrap_or(&empty);

    for (path, before) in previous {
        match current.get(path) {
            Some(now) if now.is_dir == before.is_dir => {
                if now.is_dir {
                    continue;
                }
                match (before.modified, now.modified) {
                    (Some(a), Some(b)) if a != b => modified.push(path.clone()),
                    (None, Some(_)) => unverified.push((path.clone(), now.modified)),
                    _ => {}
                }
            }
            _ => removed.push(path.clone()),
        }
    }

    for (path, now) in current {
        let known = previous.get(path).is_some_and(|before| before.is_dir == now.is_dir);
        if !known {
            added.push((path.clone(), now.is_dir));
        }
    }
}
