//! Top-level event loop (sec 4.15): pulls events off the priority queue,
//! consults the tracker and decision engine, dispatches transfer primitives
//! onto the worker pool, and keeps the local state store current.

use crate::conflict;
use crate::decision::{self, DecisionAction};
use crate::events::{EventQueue, EventType, SyncEvent};
use crate::ignore::IgnoreMatcher;
use crate::remote_listener;
use crate::state::FileRecord;
use crate::tracker::{ConflictKind, TransferTracker, TransferType};
use crate::transfers::{self, download, upload, TransferContext};
use crate::watcher::{self, ChangeKind, FileChange, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api_client::ApiClient;
use crate::config::EngineConfig;
use crate::state::StateDb;
use crate::workers::WorkerPool;

/// Delay before a `CANCEL_AND_REQUEUE` decision's new event is reinserted,
/// giving the cancelled transfer's worker time to release its path.
const REQUEUE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// A lightweight handle callers keep after handing the `Coordinator` itself
/// to [`Coordinator::run`], used to trigger a graceful shutdown.
#[derive(Clone)]
pub struct CoordinatorHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl CoordinatorHandle {
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub struct Coordinator {
    state: CoordinatorState,
    ctx: TransferContext,
    pool: Arc<WorkerPool>,
    tracker: TransferTracker,
    queue: EventQueue,
    sync_root: PathBuf,
    machine_name: String,
    config: EngineConfig,
    events_tx: UnboundedSender<SyncEvent>,
    events_rx: UnboundedReceiver<SyncEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    _watcher: Option<Watcher>,
}

impl Coordinator {
    pub fn new(
        api: Arc<ApiClient>,
        state_db: Arc<StateDb>,
        data_key: [u8; 32],
        config: EngineConfig,
        machine_name: String,
    ) -> (Self, CoordinatorHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sync_root = config.sync_folder.clone();
        let backoff = crate::retry::BackoffConfig::from(&config);

        let coordinator = Self {
            state: CoordinatorState::Stopped,
            ctx: TransferContext { api, state_db, data_key, backoff },
            pool: WorkerPool::new(config.max_workers),
            tracker: TransferTracker::new(),
            queue: EventQueue::new(),
            sync_root,
            machine_name: resolve_machine_name(machine_name),
            config,
            events_tx,
            events_rx,
            shutdown_tx: shutdown_tx.clone(),
            shutdown_rx,
            _watcher: None,
        };
        (coordinator, CoordinatorHandle { shutdown_tx })
    }

    /// Runs until a shutdown is requested: spawns the watcher and remote
    /// listener, then processes events until told to stop, draining the
    /// worker pool before returning.
    pub async fn run(mut self) {
        self.state = CoordinatorState::Starting;

        self.scan_for_missed_local_changes();

        if let Err(err) = self.start_watcher() {
            error!(target: "coordinator", %err, "failed to start file watcher");
        }
        self.start_remote_listener();

        self.state = CoordinatorState::Running;
        info!(target: "coordinator", "coordinator running");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            while let Ok(event) = self.events_rx.try_recv() {
                self.queue.push(event);
            }

            match self.queue.pop() {
                Some(event) => self.handle_event(event).await,
                None => {
                    tokio::select! {
                        Some(event) = self.events_rx.recv() => self.queue.push(event),
                        _ = self.shutdown_rx.changed() => break,
                    }
                }
            }
        }

        self.state = CoordinatorState::Stopping;
        info!(target: "coordinator", "coordinator stopping, draining workers");
        self.pool.shutdown().await;
        self.state = CoordinatorState::Stopped;
    }

    /// Background scan (sec 8 property 5) over every tracked path, run once
    /// at startup before the live watcher takes over: catches edits made
    /// while the engine was not running. Uses
    /// [`crate::state::FileRecord::is_locally_modified`] against the
    /// on-disk mtime rather than re-hashing every file.
    fn scan_for_missed_local_changes(&mut self) {
        let tracked = match self.ctx.state_db.all_tracked() {
            Ok(tracked) => tracked,
            Err(err) => {
                warn!(target: "coordinator", %err, "failed to list tracked paths for startup scan");
                return;
            }
        };

        for record in tracked {
            let local_path = match self.local_path(&record.path) {
                Ok(p) => p,
                Err(err) => {
                    warn!(target: "coordinator", %err, path = %record.path, "skipping unsafe tracked path during startup scan");
                    continue;
                }
            };
            let mtime = match std::fs::metadata(&local_path).and_then(|m| m.modified()) {
                Ok(modified) => modified
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
                Err(_) => continue,
            };

            if record.is_locally_modified(mtime) {
                self.queue.push(SyncEvent {
                    path: record.path,
                    event_type: EventType::LocalModified,
                    mtime: Some(mtime),
                    timestamp: mtime,
                    dest_path: None,
                });
            }
        }
    }

    fn start_watcher(&mut self) -> anyhow::Result<()> {
        let ignore = Arc::new(IgnoreMatcher::load(self.sync_root.clone())?);
        let (watcher, mut changes) = watcher::watch(
            self.sync_root.clone(),
            ignore,
            Duration::from_millis(self.config.coalesce_window_ms),
            Duration::from_millis(self.config.quiet_delay_ms),
        )?;
        self._watcher = Some(watcher);

        let sync_root = self.sync_root.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                for event in file_change_to_events(&sync_root, change) {
                    let _ = events_tx.send(event);
                }
            }
        });
        Ok(())
    }

    fn start_remote_listener(&self) {
        let api = Arc::clone(&self.ctx.api);
        let state_db = Arc::clone(&self.ctx.state_db);
        let config = self.config.clone();
        let events_tx = self.events_tx.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(remote_listener::run(api, state_db, config, events_tx, shutdown_rx));
    }

    async fn handle_event(&mut self, event: SyncEvent) {
        if crate::pathsafety::validate_relative_path(&event.path).is_err()
            || event.dest_path.as_deref().is_some_and(|d| crate::pathsafety::validate_relative_path(d).is_err())
        {
            warn!(target: "coordinator", path = %event.path, dest = ?event.dest_path, "dropping event with unsafe path");
            return;
        }

        let path = event.path.clone();

        if matches!(event.event_type, EventType::TransferComplete | EventType::TransferFailed) {
            self.finish_transfer(&path, event.event_type);
            return;
        }

        if let Some(transfer) = self.tracker.get(&path).filter(|t| !t.is_terminal()) {
            match decision::decide(&event, transfer) {
                DecisionAction::Ignore => {}
                DecisionAction::CancelAndRequeue => {
                    self.pool.cancel(&path);
                    if let Some(t) = self.tracker.get_mut(&path) {
                        t.cancel();
                    }
                    self.requeue_later(event);
                }
                DecisionAction::MarkConflict => {
                    // Upload keeps running to its metadata commit; the
                    // conflict flag just means a 409 there is expected.
                    if let Some(t) = self.tracker.get_mut(&path) {
                        t.has_conflict = true;
                    }
                }
                DecisionAction::CreateConflictCopy => {
                    if let Some(t) = self.tracker.get_mut(&path) {
                        t.mark_conflict(ConflictKind::EagerDecision, None);
                    }
                    self.pool.cancel(&path);
                    self.submit_conflict_resolution(path);
                }
            }
            return;
        }

        match event.event_type {
            EventType::LocalCreated | EventType::LocalModified => self.submit_upload(&path),
            EventType::RemoteCreated | EventType::RemoteModified => self.submit_download(&path),
            EventType::LocalDeleted => self.submit_local_delete(&path),
            EventType::RemoteDeleted => self.apply_remote_delete(&path),
            EventType::TransferComplete | EventType::TransferFailed => {
                unreachable!("handled before the active-transfer gate above")
            }
        }
    }

    fn requeue_later(&self, event: SyncEvent) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REQUEUE_DELAY).await;
            let _ = events_tx.send(event);
        });
    }

    /// Completion of a transfer (success, cancellation, or failure): drop
    /// it from the tracker, and if it had been flagged for a conflict
    /// while in flight, run the resolver now that it has stopped.
    fn finish_transfer(&mut self, path: &str, outcome: EventType) {
        let had_conflict = self.tracker.get(path).map(|t| t.has_conflict).unwrap_or(false);
        self.tracker.remove(path);

        if had_conflict && outcome == EventType::TransferFailed {
            self.submit_conflict_resolution(path.to_string());
        }
    }

    /// Joins `relative` to the sync root only after validating it (sec 3,
    /// sec 8 property 9): rejects `..`, absolute paths, and drive-letter
    /// prefixes so a hostile server response can never resolve outside the
    /// sync root.
    fn local_path(&self, relative: &str) -> Result<PathBuf, crate::error::SyncError> {
        let safe = crate::pathsafety::validate_relative_path(relative)?;
        Ok(self.sync_root.join(safe))
    }

    fn submit_upload(&mut self, path: &str) {
        let local_path = match self.local_path(path) {
            Ok(p) => p,
            Err(err) => {
                warn!(target: "coordinator", %err, %path, "refusing to submit upload for unsafe path");
                return;
            }
        };

        let parent_version = self
            .ctx
            .state_db
            .get_file_record(path)
            .ok()
            .flatten()
            .and_then(|r| r.server_version);

        self.tracker.create(path, TransferType::Upload, parent_version);

        let ctx = self.ctx.clone();
        let remote_path = path.to_string();
        let machine_name = self.machine_name.clone();
        let events_tx = self.events_tx.clone();

        self.pool.submit(path.to_string(), move |token| async move {
            let outcome = upload::upload_file(&ctx, &local_path, &remote_path, parent_version, &token, &upload::NoopProgress).await;
            let final_type = match outcome {
                Ok(result) => {
                    persist_upload_record(&ctx, &remote_path, &local_path, &result);
                    EventType::TransferComplete
                }
                Err(crate::error::SyncError::Conflict { .. }) => {
                    resolve_and_classify(&ctx, &remote_path, &local_path, &machine_name).await
                }
                Err(crate::error::SyncError::Cancelled) => EventType::TransferFailed,
                Err(err) => {
                    warn!(target: "coordinator", %err, path = %remote_path, "upload failed");
                    EventType::TransferFailed
                }
            };
            send_completion(&events_tx, remote_path, final_type);
        });
    }

    fn submit_download(&mut self, path: &str) {
        let local_path = match self.local_path(path) {
            Ok(p) => p,
            Err(err) => {
                warn!(target: "coordinator", %err, %path, "refusing to submit download for unsafe path");
                return;
            }
        };

        self.tracker.create(path, TransferType::Download, None);

        let ctx = self.ctx.clone();
        let remote_path = path.to_string();
        let events_tx = self.events_tx.clone();

        self.pool.submit(path.to_string(), move |token| async move {
            let outcome = download::download_file(&ctx, &remote_path, &local_path, &token, &download::NoopProgress).await;
            let final_type = match outcome {
                Ok(result) => {
                    let mut record = FileRecord::new(&remote_path);
                    record.server_version = Some(result.server_version);
                    record.content_hash = Some(result.content_hash);
                    record.size = result.size as i64;
                    record.mtime = file_mtime(&local_path);
                    record.is_tracked = true;
                    if let Err(err) = ctx.state_db.upsert_file_record(&record) {
                        error!(target: "coordinator", %err, path = %remote_path, "failed to persist downloaded file record");
                    }
                    EventType::TransferComplete
                }
                Err(err) => {
                    if !matches!(err, crate::error::SyncError::Cancelled) {
                        warn!(target: "coordinator", %err, path = %remote_path, "download failed");
                    }
                    EventType::TransferFailed
                }
            };
            send_completion(&events_tx, remote_path, final_type);
        });
    }

    fn submit_local_delete(&mut self, path: &str) {
        let local_path = match self.local_path(path) {
            Ok(p) => p,
            Err(err) => {
                warn!(target: "coordinator", %err, %path, "refusing to submit delete for unsafe path");
                return;
            }
        };

        self.tracker.create(path, TransferType::Delete, None);

        let ctx = self.ctx.clone();
        let remote_path = path.to_string();
        let events_tx = self.events_tx.clone();

        self.pool.submit(path.to_string(), move |token| async move {
            let result = transfers::delete_file(&ctx, &remote_path, &token).await;
            if let Err(err) = &result {
                if !matches!(err, crate::error::SyncError::Cancelled) {
                    warn!(target: "coordinator", %err, path = %remote_path, local = %local_path.display(), "delete failed");
                }
            }
            let final_type = if result.is_ok() { EventType::TransferComplete } else { EventType::TransferFailed };
            send_completion(&events_tx, remote_path, final_type);
        });
    }

    /// Remote-originated deletes never round-trip the server, so unlike
    /// the other kinds they run synchronously rather than through the pool.
    fn apply_remote_delete(&mut self, path: &str) {
        let local_path = match self.local_path(path) {
            Ok(p) => p,
            Err(err) => {
                warn!(target: "coordinator", %err, %path, "refusing to apply remote delete for unsafe path");
                return;
            }
        };
        if let Err(err) = crate::transfers::delete::apply_remote_delete(&self.ctx, path, &local_path) {
            error!(target: "coordinator", %err, %path, "failed to apply remote delete");
        }
    }

    fn submit_conflict_resolution(&mut self, path: String) {
        let local_path = match self.local_path(&path) {
            Ok(p) => p,
            Err(err) => {
                warn!(target: "coordinator", %err, %path, "refusing to resolve conflict for unsafe path");
                return;
            }
        };

        self.tracker.create(&path, TransferType::Download, None);

        let ctx = self.ctx.clone();
        let remote_path = path.clone();
        let machine_name = self.machine_name.clone();
        let events_tx = self.events_tx.clone();

        self.pool.submit(path, move |_token| async move {
            let final_type = resolve_and_classify(&ctx, &remote_path, &local_path, &machine_name).await;
            send_completion(&events_tx, remote_path, final_type);
        });
    }
}

fn send_completion(events_tx: &UnboundedSender<SyncEvent>, path: String, event_type: EventType) {
    let _ = events_tx.send(SyncEvent {
        path,
        event_type,
        mtime: None,
        timestamp: chrono::Utc::now().timestamp(),
        dest_path: None,
    });
}

fn persist_upload_record(ctx: &TransferContext, remote_path: &str, local_path: &Path, result: &upload::UploadOutcome) {
    let mut record = FileRecord::new(remote_path);
    record.server_version = Some(result.server_version);
    record.content_hash = Some(result.content_hash.clone());
    record.chunk_hashes = result.chunk_hashes.clone();
    record.size = std::fs::metadata(local_path).map(|m| m.len() as i64).unwrap_or_default();
    record.mtime = file_mtime(local_path);
    record.is_tracked = true;
    if let Err(err) = ctx.state_db.upsert_file_record(&record) {
        error!(target: "coordinator", %err, path = remote_path, "failed to persist uploaded file record");
    }
}

async fn resolve_and_classify(ctx: &TransferContext, remote_path: &str, local_path: &Path, machine_name: &str) -> EventType {
    match conflict::resolve(ctx, remote_path, local_path, machine_name).await {
        Ok(conflict::Outcome::Resolved)
        | Ok(conflict::Outcome::AlreadySynced)
        | Ok(conflict::Outcome::NoConflict) => EventType::TransferComplete,
        Ok(conflict::Outcome::RetryNeeded) | Ok(conflict::Outcome::Abort) | Err(_) => EventType::TransferFailed,
    }
}

fn file_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A rename carries no event type of its own in this taxonomy; it is
/// expressed as a deletion of the old path followed by a creation at the
/// new one. Directory-level changes are not forwarded: the transfer
/// primitives create parent directories implicitly as needed.
fn file_change_to_events(sync_root: &Path, change: FileChange) -> Vec<SyncEvent> {
    if change.is_directory {
        return Vec::new();
    }

    let now = chrono::Utc::now().timestamp();
    let Some(path) = relative_path(sync_root, &change.path) else {
        return Vec::new();
    };

    match change.kind {
        ChangeKind::Created => vec![SyncEvent { path, event_type: EventType::LocalCreated, mtime: change.mtime, timestamp: now, dest_path: None }],
        ChangeKind::Modified => vec![SyncEvent { path, event_type: EventType::LocalModified, mtime: change.mtime, timestamp: now, dest_path: None }],
        ChangeKind::Deleted => vec![SyncEvent { path, event_type: EventType::LocalDeleted, mtime: None, timestamp: now, dest_path: None }],
        ChangeKind::Renamed => {
            let mut events = vec![SyncEvent { path, event_type: EventType::LocalDeleted, mtime: None, timestamp: now, dest_path: None }];
            if let Some(dest) = change.dest_path.as_deref().and_then(|d| relative_path(sync_root, d)) {
                events.push(SyncEvent { path: dest, event_type: EventType::LocalCreated, mtime: change.mtime, timestamp: now, dest_path: None });
            }
            events
        }
    }
}

fn relative_path(sync_root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(sync_root)
        .ok()
        .map(|p| p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
}

/// Falls back to a sanitized hostname when no machine name is registered
/// yet (sec 10.5), so conflict-copy filenames stay stable across restarts
/// even before the registration flow has run.
fn resolve_machine_name(configured: String) -> String {
    if !configured.is_empty() {
        return configured;
    }

    let raw = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-machine".to_string());

    let sanitized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();

    if sanitized.is_empty() {
        "unknown-machine".to_string()
    } else {
        sanitized
    }
}
