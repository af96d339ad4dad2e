use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

/// Local paths recently written by a download, with when they were written.
///
/// Writing a downloaded file fires the same filesystem events as a user
/// edit; entries here let the aggregator tell the two apart for a grace
/// window.
#[derive(Debug, Default)]
pub struct DownloadMemo {
    entries: HashMap<PathBuf, Instant>,
}

impl DownloadMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: PathBuf, downloaded_at: Instant) {
        self.entries.insert(path, downloaded_at);
    }

    /// True while `path` was downloaded less than `window` before `now`.
    pub fn is_recent(&self, path: &Path, now: Instant, window: Duration) -> bool {
        self.entries
            .get(path)
            .is_some_and(|at| now.saturating_duration_since(*at) < window)
    }

    /// Drop entries older than `window`.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        self.entries
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn get(&self, path: &Path) -> Option<Instant> {
        self.entries.get(path).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(10);

    #[test]
    fn test_recent_within_window() {
        let t0 = Instant::now();
        let mut memo = DownloadMemo::new();
        memo.record(PathBuf::from("/p/a.txt"), t0);

        assert!(memo.is_recent(Path::new("/p/a.txt"), t0 + Duration::from_secs(9), GRACE));
        assert!(!memo.is_recent(Path::new("/p/a.txt"), t0 + GRACE, GRACE));
        assert!(!memo.is_recent(Path::new("/p/b.txt"), t0, GRACE));
    }

    #[test]
    fn test_rerecord_refreshes() {
        let t0 = Instant::now();
        let mut memo = DownloadMemo::new();
        memo.record(PathBuf::from("/p/a.txt"), t0);
        memo.record(PathBuf::from("/p/a.txt"), t0 + Duration::from_secs(8));

        assert_eq!(memo.len(), 1);
        assert!(memo.is_recent(Path::new("/p/a.txt"), t0 + Duration::from_secs(15), GRACE));
    }

    #[test]
    fn test_prune_drops_expired() {
        let t0 = Instant::now();
        let mut memo = DownloadMemo::new();
        memo.record(PathBuf::from("/p/old.txt"), t0);
        memo.record(PathBuf::from("/p/new.txt"), t0 + Duration::from_secs(5));

        memo.prune(t0 + Duration::from_secs(12), GRACE);
        assert_eq!(memo.len(), 1);
        assert!(memo.get(Path::new("/p/new.txt")).is_some());
    }
}
