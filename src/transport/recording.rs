//! In-memory transport that records every call, for tests.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{RemoteEntry, Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf },
    Delete(String),
    WalkRemote(String),
    EnsureDir(String),
    Close,
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub calls: Vec<Call>,
    /// Remote files served by `walk_remote`/`download`, path → content.
    pub remote_files: BTreeMap<String, Vec<u8>>,
    /// Extra remote directories reported by `walk_remote`.
    pub remote_dirs: Vec<String>,
    /// Fail this many upcoming uploads with a transfer error.
    pub failing_uploads: usize,
    /// Fail uploads with a connection error instead.
    pub drop_connection_on_upload: bool,
    /// Remote paths that fail to download.
    pub failing_downloads: HashSet<String>,
    /// Report deletes as `NotFound`.
    pub missing_on_delete: bool,
    pub failing_deletes: bool,
    /// Fail deletes with a connection error until the next successful connect.
    pub drop_connection_on_delete: bool,
    pub failing_ensure_dir: bool,
    /// Fail this many upcoming connects.
    pub failing_connects: usize,
    /// Never finish connecting.
    pub hang_on_connect: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Upload { local, remote } => Some((local.clone(), remote.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn downloads(&self) -> Vec<(String, PathBuf)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Download { remote, local } => Some((remote.clone(), local.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Delete(remote) => Some(remote.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn ensured_dirs(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::EnsureDir(remote) => Some(remote.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::Connect);
        if self.hang_on_connect {
            std::future::pending::<()>().await;
        }
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            return Err(TransportError::Connection("connection refused".into()));
        }
        self.drop_connection_on_upload = false;
        self.drop_connection_on_delete = false;
        Ok(())
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.calls.push(Call::Upload {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        if self.drop_connection_on_upload {
            return Err(TransportError::Connection("connection reset".into()));
        }
        if self.failing_uploads > 0 {
            self.failing_uploads -= 1;
            return Err(TransportError::transfer(remote, "injected failure"));
        }
        Ok(())
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.calls.push(Call::Download {
            remote: remote.to_string(),
            local: local.to_path_buf(),
        });
        if self.failing_downloads.contains(remote) {
            return Err(TransportError::transfer(remote, "injected failure"));
        }
        let content = self
            .remote_files
            .get(remote)
            .ok_or_else(|| TransportError::NotFound(remote.to_string()))?;
        std::fs::write(local, content).map_err(|e| TransportError::io(local, e))
    }

    async fn delete(&mut self, remote: &str) -> Result<(), TransportError> {
        self.calls.push(Call::Delete(remote.to_string()));
        if self.drop_connection_on_delete {
            return Err(TransportError::Connection("connection reset".into()));
        }
        if self.missing_on_delete {
            return Err(TransportError::NotFound(remote.to_string()));
        }
        if self.failing_deletes {
            return Err(TransportError::transfer(remote, "injected failure"));
        }
        Ok(())
    }

    async fn walk_remote(&mut self, root: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        self.calls.push(Call::WalkRemote(root.to_string()));
        let mut entries: Vec<RemoteEntry> = self
            .remote_dirs
            .iter()
            .map(|d| RemoteEntry {
                remote_path: d.clone(),
                is_dir: true,
            })
            .chain(self.remote_files.keys().map(|f| RemoteEntry {
                remote_path: f.clone(),
                is_dir: false,
            }))
            .collect();
        entries.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
        Ok(entries)
    }

    async fn ensure_dir(&mut self, remote: &str) -> Result<(), TransportError> {
        self.calls.push(Call::EnsureDir(remote.to_string()));
        if self.failing_ensure_dir {
            return Err(TransportError::Permission {
                path: remote.to_string(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::Close);
        Ok(())
    }
}
