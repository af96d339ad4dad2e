use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Handle;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::util::path::{remote_ancestors, remote_child, remote_dir};

use super::ssh_client::HostKeyCheck;
use super::{RemoteEntry, Transport, TransportError};

pub struct SftpTransport {
    host: String,
    port: u16,
    username: String,
    password: String,
    key_file: Option<PathBuf>,
    fingerprints: Vec<String>,
    session: Option<Handle<HostKeyCheck>>,
    sftp: Option<SftpSession>,
}

impl SftpTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port(),
            username: config.username.clone(),
            password: config.password.clone(),
            key_file: config.key_file_path(),
            fingerprints: config.host_key_fingerprints.clone(),
            session: None,
            sftp: None,
        }
    }

    fn sftp(&self) -> Result<&SftpSession, TransportError> {
        self.sftp.as_ref().ok_or(TransportError::NotConnected)
    }

    async fn authenticate(&self, session: &mut Handle<HostKeyCheck>) -> Result<(), TransportError> {
        let result = match &self.key_file {
            Some(key_path) => {
                let key = load_secret_key(key_path, None).map_err(|e| {
                    TransportError::Connection(format!(
                        "cannot load key file {}: {e}",
                        key_path.display()
                    ))
                })?;
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(connection)?
                    .flatten();
                session
                    .authenticate_publickey(
                        &self.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
            }
            None => {
                session
                    .authenticate_password(&self.username, &self.password)
                    .await
            }
        }
        .map_err(connection)?;

        if !result.success() {
            return Err(TransportError::Connection(format!(
                "authentication rejected for user {}",
                self.username
            )));
        }
        Ok(())
    }
}

fn connection(e: impl std::fmt::Display) -> TransportError {
    TransportError::Connection(e.to_string())
}

fn is_no_such_file(e: &SftpError) -> bool {
    matches!(e, SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile)
}

/// Map an SFTP failure on `path`; a dead channel is reported as a connection error.
fn classify(path: &str, e: SftpError) -> TransportError {
    match &e {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => TransportError::NotFound(path.to_string()),
            StatusCode::PermissionDenied => TransportError::Permission {
                path: path.to_string(),
                reason: status.error_message.clone(),
            },
            StatusCode::NoConnection | StatusCode::ConnectionLost => connection(&e),
            _ => TransportError::transfer(path, &e),
        },
        SftpError::IO(_) | SftpError::Timeout => connection(&e),
        _ => TransportError::transfer(path, &e),
    }
}

#[async_trait]
impl Transport for SftpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let config = Arc::new(russh::client::Config::default());
        let handler = HostKeyCheck {
            allowed: self.fingerprints.clone(),
        };
        let mut session = russh::client::connect(config, (self.host.as_str(), self.port), handler)
            .await
            .map_err(connection)?;

        self.authenticate(&mut session).await?;

        let channel = session.channel_open_session().await.map_err(connection)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(connection)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(connection)?;

        tracing::info!(host = %self.host, port = self.port, "connected to SFTP server");
        self.session = Some(session);
        self.sftp = Some(sftp);
        Ok(())
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let sftp = self.sftp()?;
        let mut reader = tokio::fs::File::open(local)
            .await
            .map_err(|e| TransportError::io(local, e))?;
        let mut file = sftp.create(remote).await.map_err(|e| classify(remote, e))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        file.shutdown()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        Ok(())
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let sftp = self.sftp()?;
        let mut file = sftp.open(remote).await.map_err(|e| classify(remote, e))?;
        let mut writer = tokio::fs::File::create(local)
            .await
            .map_err(|e| TransportError::io(local, e))?;
        tokio::io::copy(&mut file, &mut writer)
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::io(local, e))?;
        Ok(())
    }

    async fn delete(&mut self, remote: &str) -> Result<(), TransportError> {
        self.sftp()?
            .remove_file(remote)
            .await
            .map_err(|e| classify(remote, e))
    }

    async fn walk_remote(&mut self, root: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let sftp = self.sftp()?;
        let mut entries = Vec::new();
        let mut stack = vec![remote_dir(root).to_string()];

        while let Some(dir) = stack.pop() {
            let listing = sftp.read_dir(dir.as_str()).await.map_err(|e| classify(&dir, e))?;
            let mut children: Vec<(String, bool)> = listing
                .filter(|entry| entry.file_name() != "." && entry.file_name() != "..")
                .map(|entry| (remote_child(&dir, &entry.file_name()), entry.metadata().is_dir()))
                .collect();
            children.sort();

            // Reverse so the stack pops subdirectories in name order.
            for (path, is_dir) in children.iter().rev() {
                if *is_dir {
                    stack.push(path.clone());
                }
            }
            entries.extend(children.into_iter().map(|(remote_path, is_dir)| RemoteEntry {
                remote_path,
                is_dir,
            }));
        }

        Ok(entries)
    }

    async fn ensure_dir(&mut self, remote: &str) -> Result<(), TransportError> {
        let sftp = self.sftp()?;
        for dir in remote_ancestors(remote) {
            match sftp.metadata(dir).await {
                Ok(attrs) if attrs.is_dir() => continue,
                Ok(_) => {
                    return Err(TransportError::Permission {
                        path: dir.to_string(),
                        reason: "a file with that name already exists".into(),
                    });
                }
                Err(e) if is_no_such_file(&e) => {}
                Err(e) => return Err(classify(dir, e)),
            }

            if let Err(e) = sftp.create_dir(dir).await {
                // Lost a race with another client creating the same directory.
                if sftp.metadata(dir).await.is_ok_and(|attrs| attrs.is_dir()) {
                    continue;
                }
                return Err(match classify(dir, e) {
                    TransportError::Transfer { path, reason } => {
                        TransportError::Permission { path, reason }
                    }
                    other => other,
                });
            }
            tracing::debug!(dir, "created remote directory");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(sftp) = self.sftp.take()
            && let Err(e) = sftp.close().await
        {
            tracing::debug!(error = %e, "closing SFTP session failed");
        }
        if let Some(session) = self.session.take() {
            session
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
                .map_err(connection)?;
        }
        tracing::info!(host = %self.host, "SFTP connection closed");
        Ok(())
    }
}
