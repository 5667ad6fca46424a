use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// "Something in the tree may have changed" flag, polled once per frame by
/// renderers. It carries no diff: observers re-read the tree when it is set.
#[derive(Debug, Default)]
pub struct ChangeSignal {
    flag: AtomicBool,
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Read and clear in one step
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// What one watcher reconciliation cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub scanned_dirs: usize,
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

impl CycleSummary {
    pub fn has_changes(&self) -> bool {
        self.added + self.removed + self.modified > 0
    }
}

/// What the initial scan produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub directories: usize,
    pub files: usize,
    pub skipped_dirs: usize,
    pub eager_requests: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_set_take_clear() {
        let signal = ChangeSignal::new();
        assert!(!signal.is_set());

        signal.set();
        signal.set();
        assert!(signal.is_set());
        assert!(signal.take());
        assert!(!signal.take());

        signal.set();
        signal.clear();
        assert!(!signal.is_set());
    }

    #[test]
    fn test_cycle_summary_changes() {
        let mut summary = CycleSummary { scanned_dirs: 3, ..Default::default() };
        assert!(!summary.has_changes());
        summary.modified = 1;
        assert!(summary.has_changes());
    }
}
