//! Local filesystem watcher: coalesces raw OS events into a debounced
//! stream of [`FileChange`] records the coordinator turns into [`SyncEvent`]s.

use crate::ignore::IgnoreMatcher;
use anyhow::{Context, Result};
use notify_debouncer_full::notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify_debouncer_full::notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, FileIdMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    /// A rename observed as a single OS event; `dest_path` on the
    /// corresponding [`FileChange`] carries the new path.
    Renamed,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_directory: bool,
    pub mtime: Option<i64>,
    pub dest_path: Option<PathBuf>,
}

/// Owns the underlying OS watch handle; dropping it stops the watch.
pub struct Watcher {
    _debouncer: Debouncer<notify_debouncer_full::notify::RecommendedWatcher, FileIdMap>,
}

/// Starts watching `sync_root` recursively, coalescing bursts of OS events
/// over `coalesce_window` and flushing a batch once `quiet_delay` has
/// elapsed with no further activity for a path. Paths matched by `ignore`
/// never reach the returned channel.
pub fn watch(
    sync_root: PathBuf,
    ignore: Arc<IgnoreMatcher>,
    coalesce_window: Duration,
    quiet_delay: Duration,
) -> Result<(Watcher, UnboundedReceiver<FileChange>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let handler = move |result: DebounceEventResult| match result {
        Ok(events) => {
            for event in events {
                for change in debounced_event_to_changes(&event, &ignore) {
                    if tx.send(change).is_err() {
                        tracing::debug!(target: "watcher", "receiver dropped, discarding change");
                    }
                }
            }
        }
        Err(errors) => {
            for error in errors {
                tracing::warn!(target: "watcher", %error, "filesystem watch error");
            }
        }
    };

    let mut debouncer = new_debouncer(quiet_delay, Some(coalesce_window), handler)
        .context("failed to start filesystem watcher")?;
    debouncer
        .watch(&sync_root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", sync_root.display()))?;

    Ok((Watcher { _debouncer: debouncer }, rx))
}

fn debounced_event_to_changes(event: &DebouncedEvent, ignore: &IgnoreMatcher) -> Vec<FileChange> {
    let is_directory = event.paths.first().map(|p| p.is_dir()).unwrap_or(false);
    let mtime = event
        .paths
        .first()
        .and_then(|p| std::fs::metadata(p).ok())
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);

    match event.kind {
        EventKind::Create(CreateKind::Any) | EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Folder) => {
            event
                .paths
                .iter()
                .filter(|p| !ignore.is_ignored(p))
                .map(|p| FileChange {
                    path: p.clone(),
                    kind: ChangeKind::Created,
                    is_directory,
                    mtime,
                    dest_path: None,
                })
                .collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let from = &event.paths[0];
            let to = &event.paths[1];
            if ignore.is_ignored(from) && ignore.is_ignored(to) {
                return Vec::new();
            }
            vec![FileChange {
                path: from.clone(),
                kind: ChangeKind::Renamed,
                is_directory,
                mtime,
                dest_path: Some(to.clone()),
            }]
        }
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(|p| !ignore.is_ignored(p))
            .map(|p| FileChange {
                path: p.clone(),
                kind: ChangeKind::Modified,
                is_directory,
                mtime,
                dest_path: None,
            })
            .collect(),
        EventKind::Remove(RemoveKind::Any) | EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Folder) => {
            event
                .paths
                .iter()
                .filter(|p| !ignore.is_ignored(p))
                .map(|p| FileChange {
                    path: p.clone(),
                    kind: ChangeKind::Deleted,
                    is_directory,
                    mtime: None,
                    dest_path: None,
                })
                .collect()
        }
        _ => Vec::new(),
    }
}
