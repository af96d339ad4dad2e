use std::path::Path;

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::aggregator::FsEvent;

/// Start watching `root` recursively for local filesystem changes.
///
/// Raw notify events are classified into `FsEvent`s on the watcher's own
/// thread and forwarded over an unbounded channel. Debouncing happens
/// downstream in the aggregator, which needs to see deletes as they occur.
///
/// The watcher runs until the returned `WatcherHandle` is dropped.
pub fn start_local_watcher(root: &Path) -> Result<(mpsc::UnboundedReceiver<FsEvent>, WatcherHandle)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            for change in classify(event) {
                let _ = tx.send(change);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "local watcher error");
        }
    })
    .context("Failed to create file watcher")?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    tracing::info!(root = %root.display(), "watching for local changes");

    Ok((rx, WatcherHandle { _watcher: watcher }))
}

/// Handle that keeps the watcher alive. Drop to stop watching.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
}

/// Map one raw notify event onto zero or more `FsEvent`s.
pub fn classify(event: Event) -> Vec<FsEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => paths
            .into_iter()
            .filter(|p| !p.is_dir())
            .map(FsEvent::Created)
            .collect(),

        EventKind::Modify(ModifyKind::Name(mode)) => classify_rename(mode, paths),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Metadata(_) | ModifyKind::Any) => paths
            .into_iter()
            .filter(|p| !p.is_dir())
            .map(FsEvent::Modified)
            .collect(),

        EventKind::Remove(RemoveKind::Folder) => Vec::new(),
        EventKind::Remove(_) => paths.into_iter().map(FsEvent::Deleted).collect(),

        _ => Vec::new(),
    }
}

fn classify_rename(mode: RenameMode, paths: Vec<std::path::PathBuf>) -> Vec<FsEvent> {
    match mode {
        RenameMode::Both => {
            let mut paths = paths.into_iter();
            let mut events = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                events.push(FsEvent::Deleted(from));
            }
            if let Some(to) = paths.next()
                && !to.is_dir()
            {
                events.push(FsEvent::Created(to));
            }
            events
        }
        RenameMode::From => paths.into_iter().map(FsEvent::Deleted).collect(),
        RenameMode::To => paths
            .into_iter()
            .filter(|p| !p.is_dir())
            .map(FsEvent::Created)
            .collect(),
        // Backends that can't tell which side of a rename this is.
        RenameMode::Any | RenameMode::Other => paths
            .into_iter()
            .filter_map(|p| {
                if !p.exists() {
                    Some(FsEvent::Deleted(p))
                } else if p.is_dir() {
                    None
                } else {
                    Some(FsEvent::Created(p))
                }
            })
            .collect(),
    }
}
