use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use crate::transport::{Transport, TransportError};
use crate::util::ignore::IgnoreMatcher;
use crate::util::path::{relative_path, remote_parent, to_remote};

use super::download_memo::DownloadMemo;

/// A local filesystem change, already classified by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
}

impl FsEvent {
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created(p) | FsEvent::Modified(p) | FsEvent::Deleted(p) => p,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub auto_upload: bool,
    pub auto_delete: bool,
    pub auto_create_dirs: bool,
    pub debounce: Duration,
    pub grace_window: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            auto_upload: true,
            auto_delete: true,
            auto_create_dirs: true,
            debounce: Duration::from_millis(500),
            grace_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUpload {
    pub queued_at: Instant,
    pub retried: bool,
}

/// Outcome of one dispatch tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub uploaded: usize,
    pub failed: usize,
    /// The transport reported a dead connection; remaining work stays pending.
    pub connection_lost: bool,
}

/// Turns a burst of filesystem events into debounced uploads and immediate
/// deletes, skipping paths that were just written by a download.
///
/// Deletes that cannot reach the server stay queued and are sent at the start
/// of the next tick, ahead of any upload.
pub struct ChangeAggregator {
    local_root: PathBuf,
    remote_root: String,
    ignore: IgnoreMatcher,
    settings: AggregatorSettings,
    pending: BTreeMap<PathBuf, PendingUpload>,
    deletes: BTreeSet<PathBuf>,
    downloads: DownloadMemo,
}

impl ChangeAggregator {
    pub fn new(
        local_root: PathBuf,
        remote_root: String,
        ignore: IgnoreMatcher,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            local_root,
            remote_root,
            ignore,
            settings,
            pending: BTreeMap::new(),
            deletes: BTreeSet::new(),
            downloads: DownloadMemo::new(),
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_deletes(&self) -> usize {
        self.deletes.len()
    }

    pub fn downloads_mut(&mut self) -> &mut DownloadMemo {
        &mut self.downloads
    }

    /// Relative form of an event path, or `None` when it should be dropped.
    fn admit(&self, path: &Path) -> Option<String> {
        let rel = match relative_path(&self.local_root, path) {
            Ok(rel) => rel,
            Err(e) => {
                tracing::warn!(error = %e, "event outside sync root, dropping");
                return None;
            }
        };
        if rel.is_empty() || self.ignore.matches(Path::new(&rel)) {
            tracing::debug!(path = %rel, "ignored");
            return None;
        }
        Some(rel)
    }

    /// Feed one event and send any delete it produced. Only a dead connection
    /// is returned as an error; the delete then stays queued.
    pub async fn handle<T: Transport + ?Sized>(
        &mut self,
        event: FsEvent,
        transport: &mut T,
        now: Instant,
    ) -> Result<(), TransportError> {
        if self.record(event, now) {
            self.flush_deletes(transport).await?;
        }
        Ok(())
    }

    /// Apply one event without touching the transport. Returns true when a
    /// delete was queued.
    pub fn record(&mut self, event: FsEvent, now: Instant) -> bool {
        match event {
            FsEvent::Created(path) | FsEvent::Modified(path) => {
                if !self.settings.auto_upload {
                    return false;
                }
                let Some(rel) = self.admit(&path) else {
                    return false;
                };
                if self
                    .downloads
                    .is_recent(&path, now, self.settings.grace_window)
                {
                    tracing::debug!(path = %rel, "suppressed, recently downloaded");
                    return false;
                }
                self.pending.insert(
                    path,
                    PendingUpload {
                        queued_at: now,
                        retried: false,
                    },
                );
                false
            }
            FsEvent::Deleted(path) => {
                if !self.settings.auto_delete {
                    return false;
                }
                let Some(rel) = self.admit(&path) else {
                    return false;
                };
                if self.pending.remove(&path).is_some() {
                    tracing::debug!(path = %rel, "pending upload cancelled by delete");
                }
                self.deletes.insert(path);
                true
            }
        }
    }

    /// Send every queued delete. Stops at the first connection error and
    /// leaves that delete and the rest queued.
    pub async fn flush_deletes<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), TransportError> {
        while let Some(path) = self.deletes.first().cloned() {
            self.delete_remote(&path, transport).await?;
            self.deletes.remove(&path);
        }
        Ok(())
    }

    async fn delete_remote<T: Transport + ?Sized>(
        &self,
        path: &Path,
        transport: &mut T,
    ) -> Result<(), TransportError> {
        let rel = relative_path(&self.local_root, path).unwrap_or_else(|_| path.display().to_string());
        let remote = match to_remote(path, &self.local_root, &self.remote_root) {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "cannot map deleted path");
                return Ok(());
            }
        };
        match transport.delete(&remote).await {
            Ok(()) => {
                tracing::info!(path = %rel, remote = %remote, "deleted");
                Ok(())
            }
            Err(TransportError::NotFound(_)) => {
                tracing::debug!(path = %rel, remote = %remote, "already absent on remote");
                Ok(())
            }
            Err(e) if e.is_connection_error() => {
                tracing::warn!(path = %rel, error = %e, "delete failed, connection lost, keeping it queued");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "delete failed");
                Ok(())
            }
        }
    }

    /// Dispatch every pending upload whose debounce interval has elapsed.
    pub async fn tick<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) -> TickReport {
        self.downloads.prune(now, self.settings.grace_window);

        let mut report = TickReport::default();
        if self.flush_deletes(transport).await.is_err() {
            report.connection_lost = true;
            return report;
        }

        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.queued_at) >= self.settings.debounce)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            let Some(entry) = self.pending.remove(&path) else {
                continue;
            };
            let rel = relative_path(&self.local_root, &path).unwrap_or_else(|_| path.display().to_string());

            let is_file = tokio::fs::symlink_metadata(&path)
                .await
                .is_ok_and(|m| m.is_file());
            if !is_file {
                tracing::debug!(path = %rel, "no longer a regular file, skipping");
                continue;
            }

            let remote = match to_remote(&path, &self.local_root, &self.remote_root) {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "cannot map path, skipping");
                    continue;
                }
            };

            if self.settings.auto_create_dirs
                && let Some(parent) = remote_parent(&remote)
                && let Err(e) = transport.ensure_dir(parent).await
            {
                if e.is_connection_error() {
                    tracing::warn!(path = %rel, error = %e, "connection lost before upload");
                    self.pending.insert(path, entry);
                    report.connection_lost = true;
                    break;
                }
                tracing::warn!(dir = %parent, error = %e, "could not create remote directory");
            }

            match transport.upload(&path, &remote).await {
                Ok(()) => {
                    tracing::info!(path = %rel, remote = %remote, "uploaded");
                    report.uploaded += 1;
                }
                Err(e) if e.is_connection_error() => {
                    tracing::warn!(path = %rel, error = %e, "upload failed, connection lost");
                    self.pending.insert(path, entry);
                    report.connection_lost = true;
                    break;
                }
                Err(e) if !entry.retried => {
                    tracing::warn!(path = %rel, error = %e, "upload failed, retrying once");
                    self.pending.insert(
                        path,
                        PendingUpload {
                            queued_at: now,
                            retried: true,
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(path = %rel, error = %e, "upload failed after retry, dropping");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::recording::{Call, RecordingTransport};
    use tempfile::TempDir;

    const DEBOUNCE: Duration = Duration::from_millis(500);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        agg: ChangeAggregator,
        transport: RecordingTransport,
    }

    fn fixture_with(patterns: &[&str], settings: AggregatorSettings) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let agg = ChangeAggregator::new(
            root.clone(),
            "/r".to_string(),
            IgnoreMatcher::new(patterns),
            settings,
        );
        Fixture {
            _dir: dir,
            root,
            agg,
            transport: RecordingTransport::new(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(&["*.log"], AggregatorSettings::default())
    }

    impl Fixture {
        fn file(&self, rel: &str) -> PathBuf {
            let path = self.root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, rel).unwrap();
            path
        }
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_upload() {
        let mut f = fixture();
        let a = f.file("a.txt");
        let t0 = Instant::now();

        f.agg.handle(FsEvent::Created(a.clone()), &mut f.transport, t0).await.unwrap();
        f.agg.handle(FsEvent::Modified(a.clone()), &mut f.transport, t0 + ms(100)).await.unwrap();
        f.agg.handle(FsEvent::Modified(a.clone()), &mut f.transport, t0 + ms(200)).await.unwrap();
        assert_eq!(f.agg.pending_len(), 1);

        // Not yet due: the last event refreshed the timestamp.
        let report = f.agg.tick(&mut f.transport, t0 + ms(600)).await;
        assert_eq!(report.uploaded, 0);
        assert!(f.agg.is_pending(&a));

        let report = f.agg.tick(&mut f.transport, t0 + ms(700)).await;
        assert_eq!(report.uploaded, 1);
        assert_eq!(f.transport.uploads(), vec![(a, "/r/a.txt".to_string())]);
        assert_eq!(f.agg.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_scenario_with_ignored_log_files() {
        let mut f = fixture();
        let a = f.file("a.txt");
        let log = f.file("debug.log");
        let t0 = Instant::now();

        f.agg.handle(FsEvent::Created(a.clone()), &mut f.transport, t0).await.unwrap();
        f.agg.handle(FsEvent::Created(log.clone()), &mut f.transport, t0).await.unwrap();
        f.agg.handle(FsEvent::Modified(a.clone()), &mut f.transport, t0 + ms(100)).await.unwrap();
        f.agg.handle(FsEvent::Deleted(log), &mut f.transport, t0 + ms(150)).await.unwrap();

        let mut now = t0 + ms(100);
        while now <= t0 + ms(100) + DEBOUNCE {
            now += ms(100);
            f.agg.tick(&mut f.transport, now).await;
        }

        assert_eq!(
            f.transport.calls,
            vec![
                Call::EnsureDir("/r".to_string()),
                Call::Upload {
                    local: a,
                    remote: "/r/a.txt".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_cancels_pending_upload() {
        let mut f = fixture();
        let a = f.file("src/a.txt");
        let t0 = Instant::now();

        f.agg.handle(FsEvent::Modified(a.clone()), &mut f.transport, t0).await.unwrap();
        std::fs::remove_file(&a).unwrap();
        f.agg.handle(FsEvent::Deleted(a.clone()), &mut f.transport, t0 + ms(50)).await.unwrap();

        assert!(!f.agg.is_pending(&a));
        f.agg.tick(&mut f.transport, t0 + ms(2000)).await;
        assert!(f.transport.uploads().is_empty());
        assert_eq!(f.transport.deletes(), vec!["/r/src/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let mut f = fixture();
        f.transport.missing_on_delete = true;
        let gone = f.root.join("gone.txt");

        let result = f
            .agg
            .handle(FsEvent::Deleted(gone), &mut f.transport, Instant::now())
            .await;
        assert!(result.is_ok());
        assert_eq!(f.transport.deletes().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_failure_is_swallowed_unless_connection() {
        let mut f = fixture();
        f.transport.failing_deletes = true;
        let gone = f.root.join("gone.txt");
        assert!(f
            .agg
            .handle(FsEvent::Deleted(gone), &mut f.transport, Instant::now())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_delete_kept_across_connection_loss() {
        let mut f = fixture();
        f.transport.drop_connection_on_delete = true;
        let gone = f.root.join("gone.txt");
        let t0 = Instant::now();

        let result = f.agg.handle(FsEvent::Deleted(gone), &mut f.transport, t0).await;
        assert!(result.unwrap_err().is_connection_error());
        assert_eq!(f.agg.queued_deletes(), 1);

        // Still down: the tick reports it and keeps the delete.
        let report = f.agg.tick(&mut f.transport, t0 + ms(100)).await;
        assert!(report.connection_lost);
        assert_eq!(f.agg.queued_deletes(), 1);

        f.transport.connect().await.unwrap();
        let report = f.agg.tick(&mut f.transport, t0 + ms(200)).await;
        assert!(!report.connection_lost);
        assert_eq!(f.agg.queued_deletes(), 0);
        assert_eq!(f.transport.deletes(), vec!["/r/gone.txt", "/r/gone.txt", "/r/gone.txt"]);
    }

    #[tokio::test]
    async fn test_recorded_delete_sent_before_recreated_upload() {
        let mut f = fixture();
        let a = f.root.join("a.txt");
        let t0 = Instant::now();

        // Offline: the delete is only queued.
        assert!(f.agg.record(FsEvent::Deleted(a.clone()), t0));
        assert!(f.transport.calls.is_empty());

        std::fs::write(&a, "again").unwrap();
        assert!(!f.agg.record(FsEvent::Created(a.clone()), t0 + ms(50)));

        f.agg.tick(&mut f.transport, t0 + ms(600)).await;
        assert_eq!(
            f.transport.calls,
            vec![
                Call::Delete("/r/a.txt".to_string()),
                Call::EnsureDir("/r".to_string()),
                Call::Upload {
                    local: a,
                    remote: "/r/a.txt".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_recent_download_suppresses_upload() {
        let mut f = fixture();
        let a = f.file("a.txt");
        let t0 = Instant::now();
        f.agg.downloads_mut().record(a.clone(), t0);

        f.agg.handle(FsEvent::Modified(a.clone()), &mut f.transport, t0 + ms(300)).await.unwrap();
        assert!(!f.agg.is_pending(&a));

        // After the grace window the same edit is a real change.
        let later = t0 + Duration::from_secs(11);
        f.agg.handle(FsEvent::Modified(a.clone()), &mut f.transport, later).await.unwrap();
        assert!(f.agg.is_pending(&a));
        f.agg.tick(&mut f.transport, later + DEBOUNCE).await;
        assert_eq!(f.transport.uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_prunes_expired_memos() {
        let mut f = fixture();
        let t0 = Instant::now();
        f.agg.downloads_mut().record(f.root.join("a.txt"), t0);
        f.agg.tick(&mut f.transport, t0 + Duration::from_secs(1)).await;
        assert_eq!(f.agg.downloads_mut().len(), 1);
        f.agg.tick(&mut f.transport, t0 + Duration::from_secs(10)).await;
        assert_eq!(f.agg.downloads_mut().len(), 0);
    }

    #[tokio::test]
    async fn test_failed_upload_retried_once() {
        let mut f = fixture();
        f.transport.failing_uploads = 2;
        let a = f.file("a.txt");
        let t0 = Instant::now();

        f.agg.handle(FsEvent::Created(a.clone()), &mut f.transport, t0).await.unwrap();
        let report = f.agg.tick(&mut f.transport, t0 + DEBOUNCE).await;
        assert_eq!(report, TickReport::default());
        assert!(f.agg.is_pending(&a));

        let report = f.agg.tick(&mut f.transport, t0 + DEBOUNCE * 2).await;
        assert_eq!(report.failed, 1);
        assert!(!f.agg.is_pending(&a));
        assert_eq!(f.transport.uploads().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds() {
        let mut f = fixture();
        f.transport.failing_uploads = 1;
        let a = f.file("a.txt");
        let t0 = Instant::now();

        f.agg.handle(FsEvent::Created(a), &mut f.transport, t0).await.unwrap();
        f.agg.tick(&mut f.transport, t0 + DEBOUNCE).await;
        let report = f.agg.tick(&mut f.transport, t0 + DEBOUNCE * 2).await;
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_connection_loss_keeps_work_pending() {
        let mut f = fixture();
        f.transport.drop_connection_on_upload = true;
        let a = f.file("a.txt");
        let b = f.file("b.txt");
        let t0 = Instant::now();

        f.agg.handle(FsEvent::Created(a.clone()), &mut f.transport, t0).await.unwrap();
        f.agg.handle(FsEvent::Created(b.clone()), &mut f.transport, t0).await.unwrap();
        let report = f.agg.tick(&mut f.transport, t0 + DEBOUNCE).await;
        assert!(report.connection_lost);
        assert!(f.agg.is_pending(&a));
        assert!(f.agg.is_pending(&b));
        assert_eq!(f.transport.uploads().len(), 1);

        f.transport.connect().await.unwrap();
        let report = f.agg.tick(&mut f.transport, t0 + DEBOUNCE).await;
        assert_eq!(report.uploaded, 2);
    }

    #[tokio::test]
    async fn test_vanished_file_is_skipped() {
        let mut f = fixture();
        let a = f.file("a.txt");
        let t0 = Instant::now();
        f.agg.handle(FsEvent::Created(a.clone()), &mut f.transport, t0).await.unwrap();
        std::fs::remove_file(&a).unwrap();

        let report = f.agg.tick(&mut f.transport, t0 + DEBOUNCE).await;
        assert_eq!(report, TickReport::default());
        assert!(f.transport.calls.is_empty());
    }

    #[tokio::test]
    async fn test_auto_flags_disable_actions() {
        let settings = AggregatorSettings {
            auto_upload: false,
            auto_delete: false,
            ..AggregatorSettings::default()
        };
        let mut f = fixture_with(&[], settings);
        let a = f.file("a.txt");
        let t0 = Instant::now();

        f.agg.handle(FsEvent::Created(a.clone()), &mut f.transport, t0).await.unwrap();
        f.agg.handle(FsEvent::Deleted(a), &mut f.transport, t0).await.unwrap();
        f.agg.tick(&mut f.transport, t0 + DEBOUNCE).await;
        assert!(f.transport.calls.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_dir_skipped_when_disabled_and_failure_tolerated() {
        let settings = AggregatorSettings {
            auto_create_dirs: false,
            ..AggregatorSettings::default()
        };
        let mut f = fixture_with(&[], settings);
        let a = f.file("deep/a.txt");
        let t0 = Instant::now();
        f.agg.handle(FsEvent::Created(a), &mut f.transport, t0).await.unwrap();
        f.agg.tick(&mut f.transport, t0 + DEBOUNCE).await;
        assert!(f.transport.ensured_dirs().is_empty());
        assert_eq!(f.transport.uploads().len(), 1);

        let mut f = fixture();
        f.transport.failing_ensure_dir = true;
        let b = f.file("deep/b.txt");
        f.agg.handle(FsEvent::Created(b), &mut f.transport, t0).await.unwrap();
        let report = f.agg.tick(&mut f.transport, t0 + DEBOUNCE).await;
        assert_eq!(f.transport.ensured_dirs(), vec!["/r/deep".to_string()]);
        assert_eq!(report.uploaded, 1);
    }

    #[tokio::test]
    async fn test_ignore_uses_path_relative_to_root() {
        // The root itself sits under a directory named like an ignore rule.
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("build").join("site");
        std::fs::create_dir_all(&root).unwrap();
        let root = root.canonicalize().unwrap();
        let mut agg = ChangeAggregator::new(
            root.clone(),
            "/r".to_string(),
            IgnoreMatcher::new(&["build"]),
            AggregatorSettings::default(),
        );
        let mut transport = RecordingTransport::new();
        let a = root.join("index.html");
        std::fs::write(&a, "x").unwrap();

        agg.handle(FsEvent::Created(a.clone()), &mut transport, Instant::now())
            .await
            .unwrap();
        assert!(agg.is_pending(&a));
    }
}
