mod ftp;
#[cfg(test)]
pub mod recording;
mod sftp;
mod ssh_client;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, Protocol};

pub use ftp::FtpTransport;
pub use sftp::SftpTransport;

/// A failed transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("permission denied for {path}: {reason}")]
    Permission { path: String, reason: String },
    #[error("local I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    /// The session is gone and every further call will fail until reconnected.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NotConnected)
    }

    pub(crate) fn transfer(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transfer {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// One item found by [`Transport::walk_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub remote_path: String,
    pub is_dir: bool,
}

/// The capability set the sync core needs from a remote server.
///
/// Calls are issued one at a time over a single connection.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError>;

    async fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError>;

    /// Remove a remote file. A missing file yields [`TransportError::NotFound`].
    async fn delete(&mut self, remote: &str) -> Result<(), TransportError>;

    /// Every file and directory below `root`, parents before children.
    async fn walk_remote(&mut self, root: &str) -> Result<Vec<RemoteEntry>, TransportError>;

    /// Create `remote` and any missing ancestors. Existing directories are fine.
    async fn ensure_dir(&mut self, remote: &str) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Build the (not yet connected) transport for the configured protocol.
pub fn from_config(config: &Config) -> Box<dyn Transport> {
    match config.protocol {
        Protocol::Sftp => Box::new(SftpTransport::new(config)),
        Protocol::Ftp | Protocol::Ftps => Box::new(FtpTransport::new(config)),
    }
}
