pub mod aggregator;
pub mod download_memo;
pub mod local_watcher;
pub mod reconciler;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::transport::{Transport, TransportError};
use crate::util::ignore::IgnoreMatcher;

use aggregator::{AggregatorSettings, ChangeAggregator, FsEvent};
use reconciler::{ReconcileReport, TreeReconciler};

const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Bulk work requested while the sync loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRequest {
    DownloadAll,
    SyncAll,
}

/// Wires the transport, aggregator and reconciler together and runs the
/// watch/dispatch loop.
pub struct SyncEngine<T: ?Sized = dyn Transport> {
    config: Config,
    transport: Box<T>,
    aggregator: ChangeAggregator,
    reconciler: TreeReconciler,
    connected: bool,
    connect_timeout: Duration,
    reconnect_backoff: Duration,
    next_reconnect: Option<Instant>,
}

impl<T: Transport + ?Sized> SyncEngine<T> {
    /// `config.local_path` must already be canonical (see
    /// [`Config::prepare_local_root`]).
    pub fn new(config: Config, transport: Box<T>) -> Self {
        let ignore = IgnoreMatcher::new(&config.ignore_patterns);
        tracing::debug!(rules = ?ignore.rules(), "ignore rules loaded");
        let settings = AggregatorSettings {
            auto_upload: config.auto_upload,
            auto_delete: config.auto_delete,
            auto_create_dirs: config.auto_create_dirs,
            debounce: config.debounce(),
            grace_window: config.download_grace(),
        };
        let aggregator = ChangeAggregator::new(
            config.local_path.clone(),
            config.remote_path.clone(),
            ignore.clone(),
            settings,
        );
        let reconciler = TreeReconciler::new(
            config.local_path.clone(),
            config.remote_path.clone(),
            ignore,
            config.auto_create_dirs,
        );
        let connect_timeout = config.connect_timeout();
        Self {
            config,
            transport,
            aggregator,
            reconciler,
            connected: false,
            connect_timeout,
            reconnect_backoff: RECONNECT_BACKOFF_MIN,
            next_reconnect: None,
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.connect_with_timeout()
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.remote_url()))?;
        self.connected = true;
        Ok(())
    }

    async fn connect_with_timeout(&mut self) -> Result<(), TransportError> {
        let timeout = self.connect_timeout;
        tokio::time::timeout(timeout, self.transport.connect())
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Connection(format!(
                    "timed out after {}s",
                    timeout.as_secs_f32()
                )))
            })
    }

    /// Upload the whole local tree.
    pub async fn sync_all(&mut self) -> Result<ReconcileReport> {
        self.reconciler.sync_all(&mut *self.transport).await
    }

    /// Download the whole remote tree, remembering every written file so the
    /// watcher's echo of those writes is not uploaded back.
    pub async fn download_all(&mut self) -> Result<ReconcileReport> {
        let report = self
            .reconciler
            .download_all(&mut *self.transport, self.aggregator.downloads_mut())
            .await?;
        tracing::debug!(
            remembered = self.aggregator.downloads_mut().len(),
            "download memo updated"
        );
        Ok(report)
    }

    /// Watch the local root and mirror changes until `cancel` fires.
    ///
    /// `requests` carries bulk work to run inside the loop, so downloads are
    /// recorded in the same memo the live aggregator consults.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        mut requests: mpsc::UnboundedReceiver<EngineRequest>,
    ) -> Result<()> {
        if self.config.sync_on_start {
            tracing::info!("sync_on_start enabled, uploading local tree");
            if let Err(e) = self.sync_all().await {
                tracing::error!(error = %e, "initial sync failed");
            }
        }

        let (mut events, _watcher_handle) =
            local_watcher::start_local_watcher(&self.config.local_path)?;

        if self.config.download_on_start {
            tracing::info!("download_on_start enabled, downloading remote tree");
            self.on_request(EngineRequest::DownloadAll).await;
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            local = %self.config.local_path.display(),
            remote = %self.config.remote_url(),
            "entering sync loop"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("sync loop cancelled");
                    break;
                }

                Some(event) = events.recv() => {
                    self.on_event(event, Instant::now()).await;
                }

                Some(request) = requests.recv() => {
                    self.on_request(request).await;
                }

                _ = ticker.tick() => {
                    self.on_tick(Instant::now()).await;
                }
            }
        }

        Ok(())
    }

    async fn on_event(&mut self, event: FsEvent, now: Instant) {
        tracing::debug!(path = %event.path().display(), ?event, "local change detected");
        if !self.connected {
            if self.aggregator.record(event, now) {
                tracing::debug!(
                    queued = self.aggregator.queued_deletes(),
                    "offline, delete queued"
                );
            }
            return;
        }
        if self
            .aggregator
            .handle(event, &mut *self.transport, now)
            .await
            .is_err()
        {
            self.connected = false;
        }
    }

    async fn on_request(&mut self, request: EngineRequest) {
        if !self.connected {
            tracing::warn!(?request, "not connected, skipping request");
            return;
        }
        let result = match request {
            EngineRequest::DownloadAll => self.download_all().await,
            EngineRequest::SyncAll => self.sync_all().await,
        };
        if let Err(e) = result {
            tracing::error!(?request, error = %e, "request failed");
        }
    }

    async fn on_tick(&mut self, now: Instant) {
        if !self.connected && !self.reconnect(now).await {
            return;
        }
        let report = self.aggregator.tick(&mut *self.transport, now).await;
        if report.uploaded > 0 || report.failed > 0 {
            tracing::debug!(
                uploaded = report.uploaded,
                failed = report.failed,
                pending = self.aggregator.pending_len(),
                "dispatch tick"
            );
        }
        if report.connection_lost {
            self.connected = false;
            self.reconnect(now).await;
        }
    }

    /// Close and reopen the transport, at most once per backoff interval.
    /// Returns whether it is usable again.
    async fn reconnect(&mut self, now: Instant) -> bool {
        if self.next_reconnect.is_some_and(|at| now < at) {
            return false;
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "closing stale connection failed");
        }
        match self.connect_with_timeout().await {
            Ok(()) => {
                tracing::info!(remote = %self.config.remote_url(), "reconnected");
                self.connected = true;
                self.reconnect_backoff = RECONNECT_BACKOFF_MIN;
                self.next_reconnect = None;
                true
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in_secs = self.reconnect_backoff.as_secs(),
                    "reconnect failed"
                );
                self.next_reconnect = Some(now + self.reconnect_backoff);
                self.reconnect_backoff = (self.reconnect_backoff * 2).min(RECONNECT_BACKOFF_MAX);
                false
            }
        }
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.transport.close().await {
            tracing::warn!(error = %e, "closing connection failed");
        }
        self.connected = false;
    }
}
