//! Realtime change detection for watched shares
//!
//! Raw notifications pass through three stages before they reach the
//! change processor:
//!
//! 1. **Debounce.** Events for one path are coalesced until the path has been
//!    quiet for `debounce_delay`; the last observed kind wins.
//! 2. **Move detection.** A settled delete of a file whose digest is known is
//!    parked in a [MoveIndex] for one more window. A settled create whose
//!    content hashes to a parked digest on the same share becomes a single
//!    `Moved` event. Parked deletes that are never claimed are emitted as
//!    `Deleted` when they expire.
//! 3. **Log then hand off.** Every confirmed event is appended to the change
//!    log before it is sent on the bounded processor queue, so a crash between
//!    the two leaves a replayable row.
//!
//! [ChangeWatcher::observe] feeds raw changes without going through notify.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchedRoot;
use crate::db::sqlite_helpers::now_utc;
use crate::db::{ChangeLogEntry, CreateChangeLog, Database};
use crate::error::{CatalogError, Result};
use crate::services::digest::digest_file;
use crate::services::fs::{ShareFileSystem, relative_path};

/// Parked deletes kept for move detection
pub const MOVE_INDEX_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Removed,
}

/// One notification for one path, before debouncing
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub smb_root: String,
    /// Share-relative, leading `/`
    pub path: String,
    pub kind: RawKind,
    pub is_directory: bool,
}

impl RawChange {
    pub fn new(smb_root: &str, path: &str, kind: RawKind) -> Self {
        Self {
            smb_root: smb_root.to_string(),
            path: path.to_string(),
            kind,
            is_directory: false,
        }
    }

    pub fn directory(mut self) -> Self {
        self.is_directory = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOperation {
    Created,
    Modified,
    Deleted,
    Moved { from: String },
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Created => "created",
            ChangeOperation::Modified => "modified",
            ChangeOperation::Deleted => "deleted",
            ChangeOperation::Moved { .. } => "moved",
        }
    }
}

/// A confirmed change, already recorded in the change log
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Change log row id
    pub id: i64,
    pub smb_root: String,
    pub path: String,
    pub operation: ChangeOperation,
    pub is_directory: bool,
    pub size: Option<u64>,
    pub detected_at: DateTime<Utc>,
}

/// What a change log row stores in `new_data`
#[derive(Debug, Serialize, Deserialize)]
struct ChangeSnapshot {
    smb_root: String,
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    is_dir: bool,
}

impl ChangeEvent {
    fn to_log(&self) -> Result<CreateChangeLog> {
        let from = match &self.operation {
            ChangeOperation::Moved { from } => Some(from.clone()),
            _ => None,
        };
        let old_data = from
            .as_ref()
            .map(|from| serde_json::to_string(&serde_json::json!({ "path": from })))
            .transpose()?;
        let snapshot = ChangeSnapshot {
            smb_root: self.smb_root.clone(),
            path: self.path.clone(),
            from,
            size: self.size,
            is_dir: self.is_directory,
        };
        Ok(CreateChangeLog {
            entity_type: if self.is_directory { "directory" } else { "file" }.to_string(),
            entity_id: self.path.clone(),
            change_type: self.operation.as_str().to_string(),
            old_data,
            new_data: Some(serde_json::to_string(&snapshot)?),
            detected_at: self.detected_at,
        })
    }

    /// Rebuild an event from its change log row
    pub fn from_log_entry(entry: &ChangeLogEntry) -> Result<Self> {
        let raw = entry
            .new_data
            .as_deref()
            .ok_or_else(|| CatalogError::not_found(format!("snapshot for change {}", entry.id)))?;
        let snapshot: ChangeSnapshot = serde_json::from_str(raw)?;

        let operation = match (entry.change_type.as_str(), snapshot.from) {
            ("created", _) => ChangeOperation::Created,
            ("modified", _) => ChangeOperation::Modified,
            ("deleted", _) => ChangeOperation::Deleted,
            ("moved", Some(from)) => ChangeOperation::Moved { from },
            (other, _) => {
                return Err(CatalogError::not_found(format!(
                    "change type '{}' for change {}",
                    other, entry.id
                )));
            }
        };

        Ok(Self {
            id: entry.id,
            smb_root: snapshot.smb_root,
            path: snapshot.path,
            operation,
            is_directory: snapshot.is_dir,
            size: snapshot.size,
            detected_at: entry.detected_at,
        })
    }
}

// ===== Debounce =====

struct PendingChange {
    change: RawChange,
    deadline: Instant,
}

/// Per-path quiet-period tracking
pub(crate) struct Debouncer {
    delay: Duration,
    pending: HashMap<(String, String), PendingChange>,
}

impl Debouncer {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
        }
    }

    /// Record a change; restarts the path's quiet period
    pub(crate) fn observe(&mut self, change: RawChange, now: Instant) {
        let key = (change.smb_root.clone(), change.path.clone());
        let deadline = now + self.delay;
        match self.pending.get_mut(&key) {
            Some(pending) => {
                // Removals cannot be stat'ed, so keep what earlier events saw
                let is_directory = pending.change.is_directory || change.is_directory;
                pending.change = RawChange { is_directory, ..change };
                pending.deadline = deadline;
            }
            None => {
                self.pending.insert(key, PendingChange { change, deadline });
            }
        }
    }

    /// Changes whose quiet period is over. Removals come first so a create
    /// in the same batch can be matched against them; then oldest deadline.
    pub(crate) fn due(&mut self, now: Instant) -> Vec<RawChange> {
        let keys: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut due: Vec<PendingChange> = keys
            .into_iter()
            .filter_map(|k| self.pending.remove(&k))
            .collect();
        due.sort_by_key(|p| (p.change.kind != RawKind::Removed, p.deadline));
        due.into_iter().map(|p| p.change).collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<RawChange> {
        self.pending.drain().map(|(_, p)| p.change).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

// ===== Move detection =====

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DeletedFile {
    pub smb_root: String,
    pub path: String,
    pub size: u64,
    deleted_at: Instant,
}

type DigestKey = (String, String);

/// Recently deleted files by (share, digest), bounded and oldest-first
pub(crate) struct MoveIndex {
    capacity: usize,
    entries: HashMap<DigestKey, (u64, DeletedFile)>,
    order: VecDeque<(u64, DigestKey)>,
    next_seq: u64,
}

impl MoveIndex {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Park a deleted file. Returns entries pushed out by this insert: one
    /// with the same digest, or the oldest when over capacity.
    pub(crate) fn insert(
        &mut self,
        smb_root: &str,
        digest: &str,
        path: &str,
        size: u64,
        now: Instant,
    ) -> Vec<DeletedFile> {
        let key = (smb_root.to_string(), digest.to_string());
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut displaced = Vec::new();
        let file = DeletedFile {
            smb_root: smb_root.to_string(),
            path: path.to_string(),
            size,
            deleted_at: now,
        };
        if let Some((_, old)) = self.entries.insert(key.clone(), (seq, file)) {
            displaced.push(old);
        }
        self.order.push_back((seq, key));

        while self.entries.len() > self.capacity {
            match self.pop_oldest() {
                Some(old) => displaced.push(old),
                None => break,
            }
        }
        displaced
    }

    /// Claim a parked delete for a created file with this digest
    pub(crate) fn take(&mut self, smb_root: &str, digest: &str) -> Option<DeletedFile> {
        self.entries
            .remove(&(smb_root.to_string(), digest.to_string()))
            .map(|(_, file)| file)
    }

    /// Remove and return entries parked for at least `ttl`
    pub(crate) fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<DeletedFile> {
        let mut expired = Vec::new();
        while let Some((seq, key)) = self.order.front() {
            match self.entries.get(key) {
                Some((live, file)) if live == seq => {
                    if now.duration_since(file.deleted_at) < ttl {
                        break;
                    }
                    if let Some((_, file)) = self.entries.remove(key) {
                        expired.push(file);
                    }
                }
                _ => {}
            }
            self.order.pop_front();
        }
        expired
    }

    pub(crate) fn drain(&mut self) -> Vec<DeletedFile> {
        self.order.clear();
        self.entries.drain().map(|(_, (_, file))| file).collect()
    }

    pub(crate) fn has_root(&self, smb_root: &str) -> bool {
        self.entries.keys().any(|(root, _)| root == smb_root)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn pop_oldest(&mut self) -> Option<DeletedFile> {
        while let Some((seq, key)) = self.order.pop_front() {
            if matches!(self.entries.get(&key), Some((live, _)) if *live == seq) {
                return self.entries.remove(&key).map(|(_, file)| file);
            }
        }
        None
    }
}

// ===== notify =====

/// Translate one notify event for a watched root into raw changes
pub(crate) fn raw_changes(smb_root: &str, base: &Path, event: &Event) -> Vec<RawChange> {
    let to_raw = |path: &Path, kind: RawKind| -> Option<RawChange> {
        let relative = relative_path(base, path)?;
        if relative == "/" {
            return None;
        }
        let is_directory = kind != RawKind::Removed && path.is_dir();
        Some(RawChange {
            smb_root: smb_root.to_string(),
            path: relative,
            kind,
            is_directory,
        })
    };

    let kind = match event.kind {
        EventKind::Create(_) => RawKind::Created,
        EventKind::Remove(_) => RawKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => RawKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => RawKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            return [
                to_raw(&event.paths[0], RawKind::Removed),
                to_raw(&event.paths[1], RawKind::Created),
            ]
            .into_iter()
            .flatten()
            .collect();
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            return event
                .paths
                .iter()
                .filter_map(|p| {
                    let kind = if p.exists() { RawKind::Created } else { RawKind::Removed };
                    to_raw(p, kind)
                })
                .collect();
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => RawKind::Modified,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event.paths.iter().filter_map(|p| to_raw(p, kind)).collect()
}

fn subscribe(root: &WatchedRoot, tx: mpsc::UnboundedSender<RawChange>) -> Result<RecommendedWatcher> {
    let name = root.name.clone();
    let base = root.local_path.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in raw_changes(&name, &base, &event) {
                    // Receiver gone means the watcher is shutting down
                    let _ = tx.send(change);
                }
            }
            Err(e) => warn!(service = "watcher", smb_root = %name, error = %e, "Watch error"),
        },
        notify::Config::default(),
    )
    .map_err(|e| CatalogError::Config(format!("cannot watch share '{}': {}", root.name, e)))?;

    watcher
        .watch(&root.local_path, RecursiveMode::Recursive)
        .map_err(|e| {
            CatalogError::Config(format!(
                "cannot watch share '{}' at {}: {}",
                root.name,
                root.local_path.display(),
                e
            ))
        })?;

    info!(service = "watcher", smb_root = %root.name, path = %root.local_path.display(), "Watching share");
    Ok(watcher)
}

// ===== Watcher =====

struct WatchState {
    debouncer: Debouncer,
    moves: MoveIndex,
}

struct Inner {
    db: Database,
    fs: Arc<dyn ShareFileSystem>,
    delay: Duration,
    output: mpsc::Sender<ChangeEvent>,
    state: Mutex<WatchState>,
    emitted: AtomicU64,
}

struct Running {
    _watchers: Vec<RecommendedWatcher>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ChangeWatcher {
    inner: Arc<Inner>,
    roots: Vec<WatchedRoot>,
    raw_tx: mpsc::UnboundedSender<RawChange>,
    raw_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RawChange>>>,
    running: Mutex<Option<Running>>,
}

impl ChangeWatcher {
    /// `output` is the processor queue; a full queue slows the watcher down.
    pub fn new(
        db: Database,
        fs: Arc<dyn ShareFileSystem>,
        roots: Vec<WatchedRoot>,
        debounce_delay: Duration,
        output: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                db,
                fs,
                delay: debounce_delay,
                output,
                state: Mutex::new(WatchState {
                    debouncer: Debouncer::new(debounce_delay),
                    moves: MoveIndex::new(MOVE_INDEX_CAPACITY),
                }),
                emitted: AtomicU64::new(0),
            }),
            roots,
            raw_tx,
            raw_rx: Arc::new(tokio::sync::Mutex::new(raw_rx)),
            running: Mutex::new(None),
        }
    }

    /// Subscribe to every enabled root and start settling changes.
    /// Fails with `Config` if a root cannot be watched. A second call while
    /// running does nothing.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let watchers = self
            .roots
            .iter()
            .filter(|r| r.enabled)
            .map(|root| subscribe(root, self.raw_tx.clone()))
            .collect::<Result<Vec<_>>>()?;

        let shutdown = CancellationToken::new();
        let inner = self.inner.clone();
        let raw_rx = self.raw_rx.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { inner.run(raw_rx, token).await });

        info!(
            service = "watcher",
            roots = watchers.len(),
            debounce_ms = self.inner.delay.as_millis() as u64,
            "Started"
        );
        *running = Some(Running {
            _watchers: watchers,
            shutdown,
            handle,
        });
        Ok(())
    }

    /// Unsubscribe and stop. Changes still settling are written to the
    /// change log for replay. Safe without `start`.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let Running {
            _watchers,
            shutdown,
            handle,
        } = running;
        drop(_watchers);
        shutdown.cancel();
        if let Err(e) = handle.await {
            warn!(service = "watcher", error = %e, "Watcher task ended abnormally");
        }
        info!(service = "watcher", "Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Feed a raw change as if notify had reported it
    pub fn observe(&self, change: RawChange) {
        let _ = self.raw_tx.send(change);
    }

    /// Events confirmed and logged since construction
    pub fn emitted(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    /// Paths still inside their quiet period
    pub fn settling(&self) -> usize {
        self.inner.state.lock().debouncer.len()
    }

    /// Deletes parked for move detection
    pub fn parked_deletes(&self) -> usize {
        self.inner.state.lock().moves.len()
    }
}

fn tick_period(delay: Duration) -> Duration {
    (delay / 4).clamp(Duration::from_millis(10), Duration::from_millis(500))
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        raw_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RawChange>>>,
        shutdown: CancellationToken,
    ) {
        let mut raw_rx = raw_rx.lock().await;
        let mut tick = tokio::time::interval(tick_period(self.delay));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = raw_rx.recv() => match change {
                    Some(change) => {
                        debug!(service = "watcher", smb_root = %change.smb_root, path = %change.path, kind = ?change.kind, "Raw change");
                        self.state.lock().debouncer.observe(change, Instant::now());
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    if let Err(e) = self.settle(Instant::now(), &shutdown).await {
                        if e.is_cancelled() {
                            break;
                        }
                        error!(service = "watcher", error = %e, "Failed to settle changes");
                    }
                }
            }
        }

        while let Ok(change) = raw_rx.try_recv() {
            self.state.lock().debouncer.observe(change, Instant::now());
        }
        self.flush_for_replay().await;
    }

    async fn settle(&self, now: Instant, shutdown: &CancellationToken) -> Result<()> {
        let (due, expired) = {
            let mut state = self.state.lock();
            (state.debouncer.due(now), state.moves.expire(now, self.delay))
        };

        for deleted in expired {
            self.emit(Self::deleted_event(&deleted), shutdown).await?;
        }
        for change in due {
            if let Err(e) = self.confirm(&change, shutdown).await {
                if e.is_cancelled() || matches!(e, CatalogError::QueueClosed) {
                    return Err(e);
                }
                warn!(
                    service = "watcher",
                    smb_root = %change.smb_root,
                    path = %change.path,
                    error = %e,
                    "Dropped change"
                );
            }
        }
        Ok(())
    }

    async fn confirm(&self, change: &RawChange, shutdown: &CancellationToken) -> Result<()> {
        match change.kind {
            RawKind::Removed => self.confirm_removed(change, shutdown).await,
            RawKind::Created | RawKind::Modified => self.confirm_present(change, shutdown).await,
        }
    }

    async fn confirm_removed(&self, change: &RawChange, shutdown: &CancellationToken) -> Result<()> {
        if !change.is_directory {
            let known = self
                .db
                .media_files()
                .find_by_path(&change.smb_root, &change.path)
                .await?;
            if let Some(file) = known {
                if let Some(digest) = file.checksum.filter(|_| file.file_size > 0) {
                    let displaced = self.state.lock().moves.insert(
                        &change.smb_root,
                        &digest,
                        &change.path,
                        file.file_size as u64,
                        Instant::now(),
                    );
                    debug!(service = "watcher", path = %change.path, "Parked delete for move detection");
                    for deleted in displaced {
                        self.emit(Self::deleted_event(&deleted), shutdown).await?;
                    }
                    return Ok(());
                }
            }
        }

        let is_directory = change.is_directory
            || self
                .db
                .directory_analysis()
                .get(&change.smb_root, &change.path)
                .await?
                .is_some();
        let event = self.event(change, ChangeOperation::Deleted, is_directory, None);
        self.emit(event, shutdown).await
    }

    async fn confirm_present(&self, change: &RawChange, shutdown: &CancellationToken) -> Result<()> {
        let Some(entry) = self.fs.stat(&change.smb_root, &change.path).await? else {
            debug!(service = "watcher", path = %change.path, "Path gone before it settled");
            return Ok(());
        };

        let mut operation = match change.kind {
            RawKind::Created => ChangeOperation::Created,
            _ => ChangeOperation::Modified,
        };

        let may_be_move = operation == ChangeOperation::Created
            && !entry.is_directory
            && entry.size > 0
            && self.state.lock().moves.has_root(&change.smb_root);
        if may_be_move {
            match digest_file(self.fs.as_ref(), &change.smb_root, &change.path, shutdown).await {
                Ok(digest) => {
                    if let Some(from) = self.state.lock().moves.take(&change.smb_root, &digest) {
                        info!(service = "watcher", from = %from.path, to = %change.path, "Detected move");
                        operation = ChangeOperation::Moved { from: from.path };
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(service = "watcher", path = %change.path, error = %e, "Failed to hash created file");
                }
            }
        }

        let event = self.event(change, operation, entry.is_directory, Some(entry.size));
        self.emit(event, shutdown).await
    }

    fn event(
        &self,
        change: &RawChange,
        operation: ChangeOperation,
        is_directory: bool,
        size: Option<u64>,
    ) -> ChangeEvent {
        ChangeEvent {
            id: 0,
            smb_root: change.smb_root.clone(),
            path: change.path.clone(),
            operation,
            is_directory,
            size,
            detected_at: now_utc(),
        }
    }

    fn deleted_event(deleted: &DeletedFile) -> ChangeEvent {
        ChangeEvent {
            id: 0,
            smb_root: deleted.smb_root.clone(),
            path: deleted.path.clone(),
            operation: ChangeOperation::Deleted,
            is_directory: false,
            size: Some(deleted.size),
            detected_at: now_utc(),
        }
    }

    async fn record(&self, mut event: ChangeEvent) -> Result<ChangeEvent> {
        event.id = self.db.change_log().append(&event.to_log()?).await?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            service = "watcher",
            change_id = event.id,
            smb_root = %event.smb_root,
            path = %event.path,
            operation = event.operation.as_str(),
            "Change confirmed"
        );
        Ok(event)
    }

    /// Log, then block until the processor queue has room
    async fn emit(&self, event: ChangeEvent, shutdown: &CancellationToken) -> Result<()> {
        let event = self.record(event).await?;
        tokio::select! {
            sent = self.output.send(event) => sent.map_err(|_| CatalogError::QueueClosed),
            _ = shutdown.cancelled() => Err(CatalogError::Cancelled),
        }
    }

    /// Log everything still settling so the next start can replay it
    async fn flush_for_replay(&self) {
        let (pending, parked) = {
            let mut state = self.state.lock();
            (state.debouncer.drain(), state.moves.drain())
        };

        let mut events: Vec<ChangeEvent> = parked.iter().map(Self::deleted_event).collect();
        for change in &pending {
            let operation = match change.kind {
                RawKind::Created => ChangeOperation::Created,
                RawKind::Modified => ChangeOperation::Modified,
                RawKind::Removed => ChangeOperation::Deleted,
            };
            events.push(self.event(change, operation, change.is_directory, None));
        }

        for event in events {
            match self.record(event).await {
                Ok(event) => {
                    if self.output.try_send(event).is_err() {
                        debug!(service = "watcher", "Change left in the log for replay");
                    }
                }
                Err(e) => error!(service = "watcher", error = %e, "Failed to log change on shutdown"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::media_files::UpsertMediaFile;
    use crate::db::{CreateMediaItem, FieldCipher};
    use crate::services::fs::LocalFileSystem;
    use assert_matches::assert_matches;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const DELAY: Duration = Duration::from_millis(100);

    // ===== Debouncer =====

    #[test]
    fn test_burst_coalesces_to_last_kind() {
        let mut debouncer = Debouncer::new(DELAY);
        let t0 = Instant::now();
        debouncer.observe(RawChange::new("m", "/a.mkv", RawKind::Created), t0);
        debouncer.observe(RawChange::new("m", "/a.mkv", RawKind::Modified), t0 + Duration::from_millis(50));
        debouncer.observe(RawChange::new("m", "/a.mkv", RawKind::Modified), t0 + Duration::from_millis(90));

        // Deadline moved with each event
        assert!(debouncer.due(t0 + Duration::from_millis(150)).is_empty());

        let due = debouncer.due(t0 + Duration::from_millis(190));
        assert_eq!(due, vec![RawChange::new("m", "/a.mkv", RawKind::Modified)]);
        assert_eq!(debouncer.len(), 0);
    }

    #[test]
    fn test_paths_and_roots_are_independent() {
        let mut debouncer = Debouncer::new(DELAY);
        let t0 = Instant::now();
        debouncer.observe(RawChange::new("m", "/a.mkv", RawKind::Created), t0);
        debouncer.observe(RawChange::new("tv", "/a.mkv", RawKind::Removed), t0);
        debouncer.observe(RawChange::new("m", "/b.mkv", RawKind::Created), t0 + Duration::from_millis(60));

        let due = debouncer.due(t0 + DELAY);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].kind, RawKind::Removed);
        assert_eq!(debouncer.len(), 1);
    }

    #[test]
    fn test_directory_flag_survives_removal() {
        let mut debouncer = Debouncer::new(DELAY);
        let t0 = Instant::now();
        debouncer.observe(RawChange::new("m", "/Heat", RawKind::Created).directory(), t0);
        debouncer.observe(RawChange::new("m", "/Heat", RawKind::Removed), t0);

        let due = debouncer.due(t0 + DELAY);
        assert_eq!(due[0].kind, RawKind::Removed);
        assert!(due[0].is_directory);
    }

    // ===== MoveIndex =====

    #[test]
    fn test_move_index_claims_by_root_and_digest() {
        let mut index = MoveIndex::new(10);
        let now = Instant::now();
        assert!(index.insert("m", "abc", "/old.mkv", 10, now).is_empty());

        assert!(index.has_root("m"));
        assert!(!index.has_root("tv"));
        assert_eq!(index.take("tv", "abc"), None);
        assert_eq!(index.take("m", "abc").map(|f| f.path), Some("/old.mkv".to_string()));
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_move_index_expiry() {
        let mut index = MoveIndex::new(10);
        let t0 = Instant::now();
        index.insert("m", "a", "/a", 1, t0);
        index.insert("m", "b", "/b", 1, t0 + Duration::from_millis(80));

        let expired = index.expire(t0 + DELAY, DELAY);
        assert_eq!(expired.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(), vec!["/a"]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_move_index_evicts_oldest() {
        let mut index = MoveIndex::new(2);
        let now = Instant::now();
        index.insert("m", "a", "/a", 1, now);
        index.insert("m", "b", "/b", 1, now);
        index.take("m", "a");
        index.insert("m", "c", "/c", 1, now);
        let evicted = index.insert("m", "d", "/d", 1, now);

        assert_eq!(evicted.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(), vec!["/b"]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_move_index_same_digest_displaces() {
        let mut index = MoveIndex::new(10);
        let now = Instant::now();
        index.insert("m", "a", "/copy1", 1, now);
        let displaced = index.insert("m", "a", "/copy2", 1, now);
        assert_eq!(displaced[0].path, "/copy1");
        assert_eq!(index.take("m", "a").map(|f| f.path), Some("/copy2".to_string()));
    }

    // ===== notify mapping =====

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_raw_changes_mapping() {
        let base = Path::new("/mnt/movies");

        let created = raw_changes("m", base, &event(EventKind::Create(CreateKind::File), &["/mnt/movies/Heat/a.mkv"]));
        assert_eq!(created, vec![RawChange::new("m", "/Heat/a.mkv", RawKind::Created)]);

        let removed = raw_changes("m", base, &event(EventKind::Remove(RemoveKind::Any), &["/mnt/movies/a.mkv"]));
        assert_eq!(removed[0].kind, RawKind::Removed);

        let written = raw_changes(
            "m",
            base,
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/mnt/movies/a.mkv"]),
        );
        assert_eq!(written[0].kind, RawKind::Modified);

        let chmod = raw_changes(
            "m",
            base,
            &event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)), &["/mnt/movies/a.mkv"]),
        );
        assert!(chmod.is_empty());
    }

    #[test]
    fn test_rename_both_splits_into_remove_and_create() {
        let base = Path::new("/mnt/movies");
        let changes = raw_changes(
            "m",
            base,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/mnt/movies/old.mkv", "/mnt/movies/new.mkv"],
            ),
        );
        assert_eq!(
            changes,
            vec![
                RawChange::new("m", "/old.mkv", RawKind::Removed),
                RawChange::new("m", "/new.mkv", RawKind::Created),
            ]
        );
    }

    #[test]
    fn test_paths_outside_root_are_ignored() {
        let changes = raw_changes(
            "m",
            Path::new("/mnt/movies"),
            &event(EventKind::Create(CreateKind::File), &["/elsewhere/a.mkv", "/mnt/movies"]),
        );
        assert!(changes.is_empty());
    }

    // ===== Change log snapshot =====

    #[test]
    fn test_log_entry_rebuilds_move() {
        let event = ChangeEvent {
            id: 0,
            smb_root: "m".to_string(),
            path: "/new/a.mkv".to_string(),
            operation: ChangeOperation::Moved {
                from: "/old/a.mkv".to_string(),
            },
            is_directory: false,
            size: Some(42),
            detected_at: now_utc(),
        };
        let log = event.to_log().unwrap();
        assert_eq!(log.change_type, "moved");
        assert_eq!(log.entity_type, "file");

        let entry = ChangeLogEntry {
            id: 7,
            entity_type: log.entity_type,
            entity_id: log.entity_id,
            change_type: log.change_type,
            old_data: log.old_data,
            new_data: log.new_data,
            detected_at: log.detected_at,
            processed: false,
        };
        let rebuilt = ChangeEvent::from_log_entry(&entry).unwrap();
        assert_eq!(rebuilt, ChangeEvent { id: 7, ..event });
    }

    // ===== Pipeline =====

    struct Fixture {
        dir: TempDir,
        db: Database,
        watcher: ChangeWatcher,
        rx: mpsc::Receiver<ChangeEvent>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let cipher = FieldCipher::from_base64_key(&FieldCipher::generate_key()).unwrap();
        let db = Database::in_memory(cipher).await.unwrap();
        let fs = LocalFileSystem::default().with_root("movies", dir.path());
        let (tx, rx) = mpsc::channel(16);
        let watcher = ChangeWatcher::new(db.clone(), Arc::new(fs), Vec::new(), Duration::from_millis(40), tx);
        Fixture { dir, db, watcher, rx }
    }

    async fn next(rx: &mut mpsc::Receiver<ChangeEvent>) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn known_file(db: &Database, path: &str, checksum: &str) {
        let movie = db.media_types().by_name("movie").await.unwrap().unwrap();
        let item = db
            .media_items()
            .create(&CreateMediaItem {
                media_type_id: movie.id,
                title: "Heat".to_string(),
                year: Some(1995),
            })
            .await
            .unwrap();
        db.media_files()
            .upsert(&UpsertMediaFile {
                media_item_id: item,
                file_path: path.to_string(),
                smb_root: "movies".to_string(),
                filename: "Heat.mkv".to_string(),
                file_size: 8,
                file_extension: Some(".mkv".to_string()),
                quality_info: None,
                checksum: Some(checksum.to_string()),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_created_file_is_logged_then_sent() {
        let mut f = fixture().await;
        std::fs::write(f.dir.path().join("a.mkv"), b"contents").unwrap();
        f.watcher.start().unwrap();

        f.watcher.observe(RawChange::new("movies", "/a.mkv", RawKind::Created));
        f.watcher.observe(RawChange::new("movies", "/a.mkv", RawKind::Modified));

        let event = next(&mut f.rx).await;
        assert_eq!(event.operation, ChangeOperation::Modified);
        assert_eq!(event.size, Some(8));

        let logged = f.db.change_log().get(event.id).await.unwrap().unwrap();
        assert_eq!(logged.change_type, "modified");
        assert!(!logged.processed);
        f.watcher.stop().await;
    }

    #[tokio::test]
    async fn test_delete_then_create_with_same_digest_is_a_move() {
        let mut f = fixture().await;
        std::fs::create_dir_all(f.dir.path().join("new")).unwrap();
        std::fs::write(f.dir.path().join("new/Heat.mkv"), b"heatheat").unwrap();
        let digest = {
            let fs = LocalFileSystem::default().with_root("movies", f.dir.path());
            digest_file(&fs, "movies", "/new/Heat.mkv", &CancellationToken::new())
                .await
                .unwrap()
        };
        known_file(&f.db, "/old/Heat.mkv", &digest).await;
        f.watcher.start().unwrap();

        f.watcher.observe(RawChange::new("movies", "/old/Heat.mkv", RawKind::Removed));
        f.watcher.observe(RawChange::new("movies", "/new/Heat.mkv", RawKind::Created));

        let event = next(&mut f.rx).await;
        assert_eq!(event.path, "/new/Heat.mkv");
        assert_matches!(event.operation, ChangeOperation::Moved { ref from } if from == "/old/Heat.mkv");
        assert_eq!(f.watcher.parked_deletes(), 0);

        // Nothing else comes out: the delete was absorbed
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.rx.try_recv().is_err());
        f.watcher.stop().await;
    }

    #[tokio::test]
    async fn test_unclaimed_parked_delete_expires_as_deleted() {
        let mut f = fixture().await;
        known_file(&f.db, "/Heat.mkv", "abc123").await;
        f.watcher.start().unwrap();

        f.watcher.observe(RawChange::new("movies", "/Heat.mkv", RawKind::Removed));

        let event = next(&mut f.rx).await;
        assert_eq!(event.operation, ChangeOperation::Deleted);
        assert_eq!(event.path, "/Heat.mkv");
        f.watcher.stop().await;
    }

    #[tokio::test]
    async fn test_created_then_gone_is_dropped() {
        let mut f = fixture().await;
        f.watcher.start().unwrap();
        f.watcher.observe(RawChange::new("movies", "/tmp.part", RawKind::Created));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.rx.try_recv().is_err());
        assert_eq!(f.watcher.emitted(), 0);
        f.watcher.stop().await;
    }

    #[tokio::test]
    async fn test_full_queue_blocks_instead_of_dropping() {
        let f = fixture().await;
        std::fs::write(f.dir.path().join("a.mkv"), b"first").unwrap();
        std::fs::write(f.dir.path().join("b.mkv"), b"second").unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let fs = LocalFileSystem::default().with_root("movies", f.dir.path());
        let watcher = ChangeWatcher::new(f.db.clone(), Arc::new(fs), Vec::new(), Duration::from_millis(40), tx);
        watcher.start().unwrap();

        watcher.observe(RawChange::new("movies", "/a.mkv", RawKind::Created));
        watcher.observe(RawChange::new("movies", "/b.mkv", RawKind::Created));
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Both are logged while the second waits for room in the queue
        assert_eq!(f.db.change_log().unprocessed(10).await.unwrap().len(), 2);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.path, "/a.mkv");

        let second = next(&mut rx).await;
        assert_eq!(second.path, "/b.mkv");
        assert_eq!(second.operation, ChangeOperation::Created);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_logs_unsettled_changes() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(1);
        let fs = LocalFileSystem::default().with_root("movies", f.dir.path());
        let watcher = ChangeWatcher::new(f.db.clone(), Arc::new(fs), Vec::new(), Duration::from_secs(60), tx);
        watcher.start().unwrap();
        watcher.observe(RawChange::new("movies", "/Heat", RawKind::Created).directory());
        tokio::time::sleep(Duration::from_millis(50)).await;

        watcher.stop().await;
        assert!(!watcher.is_running());
        let pending = f.db.change_log().unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_type, "directory");
    }

    #[tokio::test]
    async fn test_unwatchable_root_is_config_error() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(1);
        let roots = vec![WatchedRoot {
            name: "gone".to_string(),
            local_path: f.dir.path().join("does-not-exist"),
            enabled: true,
        }];
        let fs = LocalFileSystem::new(&roots);
        let watcher = ChangeWatcher::new(f.db.clone(), Arc::new(fs), roots, DELAY, tx);

        assert_matches!(watcher.start(), Err(CatalogError::Config(_)));
        assert!(!watcher.is_running());
    }
}
