use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod config;
mod sync;
mod transport;
mod util;

#[derive(Parser)]
#[command(
    name = "mirrorsync",
    version,
    about = "Mirror a local directory to a remote server over SFTP, FTP or FTPS"
)]
struct Cli {
    /// Path to config file (JSON, or TOML with a .toml extension)
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the local directory and mirror every change until stopped.
    /// SIGUSR1 downloads the remote tree, SIGUSR2 uploads the local tree.
    Start,
    /// Upload the whole local directory once
    SyncNow,
    /// Download the whole remote directory once. While `start` is running,
    /// send it SIGUSR1 instead so the downloads are not uploaded back.
    Download,
    /// Write an example config file
    InitConfig,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "mirrorsync=info",
        1 => "mirrorsync=debug",
        2 => "mirrorsync=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Check inotify watch limits on Linux and warn if they look too low.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(limit) = content.trim().parse::<u64>()
    {
        if limit < 65536 {
            tracing::warn!(
                max_user_watches = limit,
                "inotify watch limit is low, large trees may not be fully watched. \
                 Increase with: echo 524288 | sudo tee {path}"
            );
        } else {
            tracing::debug!(max_user_watches = limit, "inotify watch limit OK");
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM; forward SIGUSR1/SIGUSR2 as bulk
/// download/upload requests to the running engine.
fn spawn_signal_handler(
    token: CancellationToken,
    requests: mpsc::UnboundedSender<sync::EngineRequest>,
) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigusr1.recv() => {
                    tracing::info!("received SIGUSR1, downloading remote tree");
                    let _ = requests.send(sync::EngineRequest::DownloadAll);
                }
                _ = sigusr2.recv() => {
                    tracing::info!("received SIGUSR2, uploading local tree");
                    let _ = requests.send(sync::EngineRequest::SyncAll);
                }
            }
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Command::InitConfig = cli.command {
        config::write_example_config(&cli.config)?;
        println!("wrote {}", cli.config.display());
        return Ok(());
    }

    let mut cfg = config::load_config(&cli.config)?;
    cfg.prepare_local_root()?;
    tracing::info!(
        config = %cli.config.display(),
        local = %cfg.local_path.display(),
        remote = %cfg.remote_url(),
        "configuration loaded"
    );

    let mut engine = sync::SyncEngine::new(cfg.clone(), transport::from_config(&cfg));
    engine.connect().await?;

    let result = match cli.command {
        Command::InitConfig => unreachable!("handled above"),
        Command::Start => {
            check_inotify_limits();

            let cancel = CancellationToken::new();
            let (requests_tx, requests_rx) = mpsc::unbounded_channel();
            spawn_signal_handler(cancel.clone(), requests_tx)?;

            let result = engine.run(cancel, requests_rx).await;
            if result.is_ok() {
                tracing::info!("mirrorsync stopped");
            }
            result
        }
        Command::SyncNow => engine.sync_all().await.map(|report| {
            println!(
                "sync complete: {} uploaded, {} failed",
                report.transferred, report.failed
            );
        }),
        Command::Download => engine.download_all().await.map(|report| {
            println!(
                "download complete: {} downloaded, {} failed",
                report.transferred, report.failed
            );
        }),
    };

    engine.close().await;
    result
}
