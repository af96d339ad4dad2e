use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Sftp,
    Ftp,
    Ftps,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Sftp => 22,
            Self::Ftp | Self::Ftps => 21,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sftp => "sftp",
            Self::Ftp => "ftp",
            Self::Ftps => "ftps",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub protocol: Protocol,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Private key for SFTP public-key auth; takes precedence over the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    /// Accepted SFTP host keys (OpenSSH SHA256 fingerprints or base64 keys).
    /// Empty accepts any host key.
    #[serde(default)]
    pub host_key_fingerprints: Vec<String>,
    pub local_path: PathBuf,
    pub remote_path: String,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_create_dirs: bool,
    #[serde(default = "default_true")]
    pub passive_mode: bool,
    #[serde(default = "default_true")]
    pub auto_upload: bool,
    #[serde(default = "default_true")]
    pub auto_delete: bool,
    #[serde(default)]
    pub sync_on_start: bool,
    /// Download the remote tree once the watcher is running, so the live
    /// aggregator sees and suppresses the resulting local events.
    #[serde(default)]
    pub download_on_start: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_download_grace_secs")]
    pub download_grace_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_tick_ms() -> u64 {
    100
}
fn default_download_grace_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn download_grace(&self) -> Duration {
        Duration::from_secs(self.download_grace_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `~/`-expanded key file path, if one is configured.
    pub fn key_file_path(&self) -> Option<PathBuf> {
        let key = self.key_file.as_ref().filter(|p| !p.as_os_str().is_empty())?;
        Some(expand_home(key))
    }

    /// `sftp://host:22/srv/www`, for log lines.
    pub fn remote_url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port(), self.remote_path)
    }

    /// Create the local root if needed and replace it with its canonical form,
    /// so watcher events, path translation and download memos agree.
    pub fn prepare_local_root(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.local_path).with_context(|| {
            format!("Failed to create local root: {}", self.local_path.display())
        })?;
        self.local_path = self.local_path.canonicalize().with_context(|| {
            format!("Failed to resolve local root: {}", self.local_path.display())
        })?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("host must not be empty");
        }
        if self.username.trim().is_empty() {
            anyhow::bail!("username must not be empty");
        }
        if self.local_path.as_os_str().is_empty() {
            anyhow::bail!("local_path must not be empty");
        }
        if self.remote_path.trim().is_empty() {
            anyhow::bail!("remote_path must not be empty");
        }
        if self.tick_ms == 0 {
            anyhow::bail!("tick_ms must be greater than zero");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be greater than zero");
        }
        match self.protocol {
            Protocol::Sftp if self.password.is_empty() && self.key_file_path().is_none() => {
                anyhow::bail!("sftp needs a password or a key_file");
            }
            Protocol::Ftp | Protocol::Ftps if self.key_file_path().is_some() => {
                tracing::warn!(protocol = %self.protocol, "key_file is only used for sftp, ignoring");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn example() -> Self {
        Self {
            protocol: Protocol::Sftp,
            host: "example.com".into(),
            port: Some(22),
            username: "your_username".into(),
            password: "your_password".into(),
            key_file: None,
            host_key_fingerprints: Vec::new(),
            local_path: "/path/to/local/project".into(),
            remote_path: "/path/to/remote/project".into(),
            ignore_patterns: [
                ".git",
                "node_modules",
                "__pycache__",
                "*.pyc",
                ".DS_Store",
                ".vscode",
                ".idea",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            auto_create_dirs: true,
            passive_mode: true,
            auto_upload: true,
            auto_delete: true,
            sync_on_start: false,
            download_on_start: false,
            debounce_ms: default_debounce_ms(),
            tick_ms: default_tick_ms(),
            download_grace_secs: default_download_grace_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

pub fn parse_config(content: &str, path: &Path) -> Result<Config> {
    let config: Config = if is_toml(path) {
        toml::from_str(content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        serde_json::from_str(content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    };
    config.validate()?;
    Ok(config)
}

/// Load and validate the config. A missing file is replaced by an example
/// config and reported as an error so the user can fill it in.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_example_config(path)?;
            anyhow::bail!(
                "Config file not found: {}\n\
                 An example config was written there; edit it and run again.",
                path.display()
            );
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read config file: {}", path.display()));
        }
    };

    parse_config(&content, path)
}

/// Write the example config to `path`. Refuses to overwrite an existing file.
pub fn write_example_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists, not overwriting", path.display());
    }
    let example = Config::example();
    let content = if is_toml(path) {
        toml::to_string_pretty(&example).context("Failed to serialize example config")?
    } else {
        serde_json::to_string_pretty(&example).context("Failed to serialize example config")?
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write example config: {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote example config");
    Ok(())
}
