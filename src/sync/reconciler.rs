use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::time::Instant;

use crate::transport::Transport;
use crate::util::ignore::IgnoreMatcher;
use crate::util::path::{relative_path, remote_parent, to_local, to_remote};

use super::download_memo::DownloadMemo;

/// Totals from one bulk pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub transferred: usize,
    pub failed: usize,
}

/// Bulk upload of the local tree and bulk download of the remote tree.
pub struct TreeReconciler {
    local_root: PathBuf,
    remote_root: String,
    ignore: IgnoreMatcher,
    auto_create_dirs: bool,
}

impl TreeReconciler {
    pub fn new(local_root: PathBuf, remote_root: String, ignore: IgnoreMatcher, auto_create_dirs: bool) -> Self {
        Self {
            local_root,
            remote_root,
            ignore,
            auto_create_dirs,
        }
    }

    /// Upload every non-ignored regular file under the local root.
    pub async fn sync_all<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<ReconcileReport> {
        let mut files = Vec::new();
        self.walk_local_dir(&self.local_root, &mut files)
            .await
            .with_context(|| format!("Failed to read local root: {}", self.local_root.display()))?;
        tracing::info!(files = files.len(), "uploading local tree");

        let mut report = ReconcileReport::default();
        let mut ensured: HashSet<String> = HashSet::new();

        for path in files {
            let remote = match to_remote(&path, &self.local_root, &self.remote_root) {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot map path, skipping");
                    report.failed += 1;
                    continue;
                }
            };

            if self.auto_create_dirs
                && let Some(parent) = remote_parent(&remote)
                && ensured.insert(parent.to_string())
                && let Err(e) = transport.ensure_dir(parent).await
            {
                tracing::warn!(dir = %parent, error = %e, "could not create remote directory");
            }

            match transport.upload(&path, &remote).await {
                Ok(()) => {
                    tracing::info!(path = %path.display(), remote = %remote, "uploaded");
                    report.transferred += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "upload failed, skipping");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            uploaded = report.transferred,
            failed = report.failed,
            "local tree sync complete"
        );
        Ok(report)
    }

    /// Download every non-ignored remote file, recording each in `memo` so
    /// the resulting local events are not uploaded straight back.
    pub async fn download_all<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        memo: &mut DownloadMemo,
    ) -> Result<ReconcileReport> {
        let entries = transport
            .walk_remote(&self.remote_root)
            .await
            .with_context(|| format!("Failed to list remote tree: {}", self.remote_root))?;
        tracing::info!(entries = entries.len(), "downloading remote tree");

        let mut report = ReconcileReport::default();
        for entry in entries {
            let local = match to_local(&entry.remote_path, &self.remote_root, &self.local_root) {
                Ok(local) => local,
                Err(e) => {
                    tracing::warn!(remote = %entry.remote_path, error = %e, "cannot map remote path, skipping");
                    report.failed += 1;
                    continue;
                }
            };
            let relative = relative_path(&self.local_root, &local).unwrap_or_default();
            if relative.is_empty() {
                continue;
            }
            if self.ignore.matches(Path::new(&relative)) {
                tracing::debug!(path = %relative, "excluded (remote)");
                continue;
            }

            if entry.is_dir {
                if let Err(e) = tokio::fs::create_dir_all(&local).await {
                    tracing::warn!(path = %relative, error = %e, "cannot create local directory");
                    report.failed += 1;
                }
                continue;
            }

            if let Some(parent) = local.parent()
                && let Err(e) = tokio::fs::create_dir_all(parent).await
            {
                tracing::warn!(path = %relative, error = %e, "cannot create local directory");
                report.failed += 1;
                continue;
            }

            match transport.download(&entry.remote_path, &local).await {
                Ok(()) => {
                    memo.record(local, Instant::now());
                    tracing::info!(path = %relative, remote = %entry.remote_path, "downloaded");
                    report.transferred += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %relative, error = %e, "download failed, skipping");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            downloaded = report.transferred,
            failed = report.failed,
            "remote tree download complete"
        );
        Ok(report)
    }

    /// Depth-first, name-ordered list of the regular files under `dir`.
    fn walk_local_dir<'a>(
        &'a self,
        dir: &'a Path,
        files: &'a mut Vec<PathBuf>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut read_dir = tokio::fs::read_dir(dir).await?;
            let mut children = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                children.push(entry.path());
            }
            children.sort();

            for path in children {
                let meta = match tokio::fs::symlink_metadata(&path).await {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "cannot stat, skipping");
                        continue;
                    }
                };

                // Skip symlinks
                if meta.is_symlink() {
                    tracing::debug!(path = %path.display(), "skipping symlink");
                    continue;
                }

                let Ok(relative) = relative_path(&self.local_root, &path) else {
                    continue;
                };
                if self.ignore.matches(Path::new(&relative)) {
                    tracing::debug!(path = %relative, "excluded (local)");
                    continue;
                }

                if meta.is_dir() {
                    if let Err(e) = self.walk_local_dir(&path, files).await {
                        tracing::warn!(path = %relative, error = %e, "cannot read directory, skipping");
                    }
                } else if meta.is_file() {
                    files.push(path);
                }
            }

            Ok(())
        })
    }
}
