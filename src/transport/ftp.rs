use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use suppaftp::list::File as ListEntry;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, NativeTlsConnector, NativeTlsFtpStream, Status};

use crate::config::{Config, Protocol};
use crate::util::path::{remote_ancestors, remote_child, remote_dir};

use super::{RemoteEntry, Transport, TransportError};

/// Plain or explicit-TLS control connection.
enum FtpConn {
    Plain(FtpStream),
    Secure(NativeTlsFtpStream),
}

/// Run the same expression against whichever stream type is live.
macro_rules! with_stream {
    ($conn:expr, $stream:ident => $body:expr) => {
        match $conn {
            FtpConn::Plain($stream) => $body,
            FtpConn::Secure($stream) => $body,
        }
    };
}

/// FTP and FTPS transport.
///
/// suppaftp's client is blocking, so every call moves the connection onto
/// the blocking pool and takes it back afterwards.
pub struct FtpTransport {
    secure: bool,
    host: String,
    port: u16,
    username: String,
    password: String,
    passive: bool,
    conn: Option<FtpConn>,
}

impl FtpTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            secure: config.protocol == Protocol::Ftps,
            host: config.host.clone(),
            port: config.port(),
            username: config.username.clone(),
            password: config.password.clone(),
            passive: config.passive_mode,
            conn: None,
        }
    }

    async fn blocking<T, F>(&mut self, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpConn) -> Result<T, TransportError> + Send + 'static,
    {
        let mut conn = self.conn.take().ok_or(TransportError::NotConnected)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| TransportError::Connection(format!("FTP worker failed: {e}")))?;

        // A dropped control connection is not worth keeping around.
        if !matches!(&result, Err(e) if e.is_connection_error()) {
            self.conn = Some(conn);
        }
        result
    }
}

fn open(
    secure: bool,
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    passive: bool,
) -> Result<FtpConn, TransportError> {
    let mut conn = if secure {
        let tls = TlsConnector::new().map_err(|e| TransportError::Connection(e.to_string()))?;
        let stream = NativeTlsFtpStream::connect((host, port))
            .and_then(|s| s.into_secure(NativeTlsConnector::from(tls), host))
            .map_err(connection)?;
        FtpConn::Secure(stream)
    } else {
        FtpConn::Plain(FtpStream::connect((host, port)).map_err(connection)?)
    };

    let mode = if passive { Mode::Passive } else { Mode::Active };
    with_stream!(&mut conn, s => {
        s.login(username, password).map_err(connection)?;
        s.set_mode(mode);
        s.transfer_type(FileType::Binary).map_err(connection)?;
    });
    Ok(conn)
}

fn connection(e: FtpError) -> TransportError {
    TransportError::Connection(e.to_string())
}

/// 550 covers both "no such file" and "access denied"; only the reply text
/// tells them apart.
fn is_permission_reply(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    ["permission", "denied", "not allowed", "access"]
        .iter()
        .any(|w| text.contains(w))
}

fn classify(path: &str, e: FtpError) -> TransportError {
    match &e {
        FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable => {
            let reply = e.to_string();
            if is_permission_reply(&reply) {
                TransportError::Permission {
                    path: path.to_string(),
                    reason: reply,
                }
            } else {
                TransportError::NotFound(path.to_string())
            }
        }
        FtpError::ConnectionError(_) => TransportError::Connection(e.to_string()),
        _ => TransportError::transfer(path, &e),
    }
}

fn put(conn: &mut FtpConn, local: &Path, remote: &str) -> Result<(), TransportError> {
    let mut file = std::fs::File::open(local).map_err(|e| TransportError::io(local, e))?;
    with_stream!(conn, s => s.put_file(remote, &mut file))
        .map(|_| ())
        .map_err(|e| classify(remote, e))
}

fn retrieve(conn: &mut FtpConn, remote: &str, local: &Path) -> Result<(), TransportError> {
    let buffer = with_stream!(conn, s => s.retr_as_buffer(remote)).map_err(|e| classify(remote, e))?;
    std::fs::write(local, buffer.into_inner()).map_err(|e| TransportError::io(local, e))
}

fn list_dir(conn: &mut FtpConn, dir: &str) -> Result<Vec<RemoteEntry>, TransportError> {
    let lines = with_stream!(conn, s => s.list(Some(dir))).map_err(|e| classify(dir, e))?;
    let mut children = Vec::new();
    for line in lines {
        match ListEntry::from_str(&line) {
            Ok(entry) if entry.name() == "." || entry.name() == ".." => {}
            Ok(entry) => children.push(RemoteEntry {
                remote_path: remote_child(dir, entry.name()),
                is_dir: entry.is_directory(),
            }),
            Err(e) => tracing::debug!(line = %line, error = %e, "unparseable LIST line, skipping"),
        }
    }
    children.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
    Ok(children)
}

fn walk(conn: &mut FtpConn, root: &str) -> Result<Vec<RemoteEntry>, TransportError> {
    let mut entries = Vec::new();
    let mut stack = vec![remote_dir(root).to_string()];
    while let Some(dir) = stack.pop() {
        let children = list_dir(conn, &dir)?;
        stack.extend(
            children
                .iter()
                .rev()
                .filter(|c| c.is_dir)
                .map(|c| c.remote_path.clone()),
        );
        entries.extend(children);
    }
    Ok(entries)
}

fn make_dirs(conn: &mut FtpConn, remote: &str) -> Result<(), TransportError> {
    // Probing with CWD moves the session, so restore it afterwards.
    let home = with_stream!(&mut *conn, s => s.pwd()).map_err(connection)?;
    let result = create_chain(conn, &home, remote);
    with_stream!(conn, s => s.cwd(&home)).map_err(connection)?;
    result
}

/// Absolute form of every directory in `remote`'s chain. Relative remote
/// paths are resolved against the login directory `home`, so probing one
/// with CWD cannot change how the next one resolves.
fn chain_targets(home: &str, remote: &str) -> Vec<String> {
    remote_ancestors(remote)
        .into_iter()
        .map(|dir| {
            if dir.starts_with('/') {
                dir.to_string()
            } else {
                remote_child(home, dir)
            }
        })
        .collect()
}

fn create_chain(conn: &mut FtpConn, home: &str, remote: &str) -> Result<(), TransportError> {
    for dir in chain_targets(home, remote) {
        let dir = dir.as_str();
        if with_stream!(&mut *conn, s => s.cwd(dir)).is_ok() {
            continue;
        }
        with_stream!(&mut *conn, s => s.mkdir(dir)).map_err(|e| match e {
            e @ FtpError::ConnectionError(_) => connection(e),
            other => TransportError::Permission {
                path: dir.to_string(),
                reason: other.to_string(),
            },
        })?;
        tracing::debug!(dir, "created remote directory");
    }
    Ok(())
}

#[async_trait]
impl Transport for FtpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let (secure, host, port) = (self.secure, self.host.clone(), self.port);
        let (username, password, passive) =
            (self.username.clone(), self.password.clone(), self.passive);

        let conn = tokio::task::spawn_blocking(move || {
            open(secure, &host, port, &username, &password, passive)
        })
        .await
        .map_err(|e| TransportError::Connection(format!("FTP worker failed: {e}")))??;

        tracing::info!(
            host = %self.host,
            port = self.port,
            tls = self.secure,
            passive = self.passive,
            "connected to FTP server"
        );
        self.conn = Some(conn);
        Ok(())
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let (local, remote): (PathBuf, String) = (local.to_path_buf(), remote.to_string());
        self.blocking(move |conn| put(conn, &local, &remote)).await
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let (remote, local): (String, PathBuf) = (remote.to_string(), local.to_path_buf());
        self.blocking(move |conn| retrieve(conn, &remote, &local)).await
    }

    async fn delete(&mut self, remote: &str) -> Result<(), TransportError> {
        let remote = remote.to_string();
        self.blocking(move |conn| {
            with_stream!(conn, s => s.rm(&remote)).map_err(|e| classify(&remote, e))
        })
        .await
    }

    async fn walk_remote(&mut self, root: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let root = root.to_string();
        self.blocking(move |conn| walk(conn, &root)).await
    }

    async fn ensure_dir(&mut self, remote: &str) -> Result<(), TransportError> {
        let remote = remote.to_string();
        self.blocking(move |conn| make_dirs(conn, &remote)).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let quit = tokio::task::spawn_blocking(move || with_stream!(&mut conn, s => s.quit()))
            .await
            .map_err(|e| TransportError::Connection(format!("FTP worker failed: {e}")))?;
        if let Err(e) = quit {
            tracing::debug!(error = %e, "FTP QUIT failed");
        }
        tracing::info!(host = %self.host, "FTP connection closed");
        Ok(())
    }
}
