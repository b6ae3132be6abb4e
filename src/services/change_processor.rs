//! Change Processor: applies confirmed change events to the catalog
//!
//! A fixed pool of workers drains the bounded queue the watcher feeds. Each
//! event updates file rows in the store and, where the catalog may have
//! changed, queues a directory analysis. The event's change log row is
//! marked processed only after all of that succeeded; failed events stay
//! unprocessed and are picked up by [ChangeProcessor::replay_pending].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::media_items::STATUS_MISSING;
use crate::db::sqlite_helpers::now_utc;
use crate::db::{ChangeStatistics, Database, MediaFile};
use crate::error::Result;
use crate::services::classifier::is_media_file;
use crate::services::digest::digest_file;
use crate::services::fs::{file_name, parent_dir};
use crate::services::scheduler::AnalysisScheduler;
use crate::services::watcher::{ChangeEvent, ChangeOperation};

/// Priority for a created or modified directory
pub const DIRECTORY_PRIORITY: i32 = 7;
/// Priority for the parent of a new or moved media file
pub const FILE_PRIORITY: i32 = 6;
/// Rows read per replay pass
pub const REPLAY_BATCH: i64 = 100;

/// Bonus for recent changes: +2 under a minute old, +1 under ten minutes
pub fn recency_bonus(detected_at: DateTime<Utc>, now: DateTime<Utc>) -> i32 {
    let age = now.signed_duration_since(detected_at);
    if age < chrono::Duration::minutes(1) {
        2
    } else if age < chrono::Duration::minutes(10) {
        1
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounters {
    pub processed: u64,
    pub failed: u64,
}

struct Inner {
    db: Database,
    scheduler: Arc<AnalysisScheduler>,
    processed: AtomicU64,
    failed: AtomicU64,
}

struct Workers {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct ChangeProcessor {
    inner: Arc<Inner>,
    worker_count: usize,
    tx: mpsc::Sender<ChangeEvent>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ChangeEvent>>>,
    workers: Mutex<Option<Workers>>,
}

impl ChangeProcessor {
    pub fn new(db: Database, scheduler: Arc<AnalysisScheduler>, worker_count: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                db,
                scheduler,
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            worker_count: worker_count.max(1),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Mutex::new(None),
        }
    }

    /// Queue handle for the watcher. `send` waits while the queue is full.
    pub fn sender(&self) -> mpsc::Sender<ChangeEvent> {
        self.tx.clone()
    }

    /// Spawn the worker pool. A second call while running does nothing.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let handles = (0..self.worker_count)
            .map(|worker_id| {
                let inner = self.inner.clone();
                let rx = self.rx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { inner.worker(worker_id, rx, shutdown).await })
            })
            .collect();

        *workers = Some(Workers { shutdown, handles });
        info!(service = "change_processor", workers = self.worker_count, "Started");
    }

    /// Stop the workers after their current event. Queued events stay in
    /// the change log as unprocessed. Safe without `start`.
    pub async fn stop(&self) {
        let Some(workers) = self.workers.lock().take() else {
            return;
        };
        workers.shutdown.cancel();
        for handle in workers.handles {
            if let Err(e) = handle.await {
                warn!(service = "change_processor", error = %e, "Worker ended abnormally");
            }
        }
        info!(service = "change_processor", "Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Apply one event and mark its log row processed
    pub async fn process(&self, event: &ChangeEvent, cancel: &CancellationToken) -> Result<()> {
        self.inner.process(event, cancel).await
    }

    /// Re-run unprocessed change log rows, oldest first. Returns how many
    /// were applied.
    pub async fn replay_pending(&self, limit: i64) -> Result<usize> {
        let entries = self.inner.db.change_log().unprocessed(limit).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let cancel = CancellationToken::new();
        let mut applied = 0;
        for entry in &entries {
            let event = match ChangeEvent::from_log_entry(entry) {
                Ok(event) => event,
                Err(e) => {
                    // Unreadable rows would be replayed forever
                    warn!(service = "change_processor", change_id = entry.id, error = %e, "Skipping unreadable change");
                    self.inner.db.change_log().mark_processed(entry.id).await?;
                    continue;
                }
            };
            match self.inner.process(&event, &cancel).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(service = "change_processor", change_id = entry.id, error = %e, "Replay failed");
                }
            }
        }
        info!(service = "change_processor", applied, total = entries.len(), "Replayed pending changes");
        Ok(applied)
    }

    pub async fn get_change_statistics(&self, since: DateTime<Utc>) -> Result<ChangeStatistics> {
        self.inner.db.change_log().statistics(since).await
    }

    pub fn counters(&self) -> ChangeCounters {
        ChangeCounters {
            processed: self.inner.processed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn worker(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ChangeEvent>>>,
        shutdown: CancellationToken,
    ) {
        debug!(service = "change_processor", worker_id, "Worker started");
        loop {
            let event = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                }
            };
            let Some(event) = event else {
                break;
            };

            if let Err(e) = self.process(&event, &shutdown).await {
                if e.is_cancelled() {
                    break;
                }
                error!(
                    service = "change_processor",
                    worker_id,
                    change_id = event.id,
                    path = %event.path,
                    operation = event.operation.as_str(),
                    error = %e,
                    "Failed to process change"
                );
            }
        }
        debug!(service = "change_processor", worker_id, "Worker stopped");
    }

    async fn process(&self, event: &ChangeEvent, cancel: &CancellationToken) -> Result<()> {
        debug!(
            service = "change_processor",
            change_id = event.id,
            smb_root = %event.smb_root,
            path = %event.path,
            operation = event.operation.as_str(),
            "Processing change"
        );

        let result = match &event.operation {
            ChangeOperation::Created | ChangeOperation::Modified if event.is_directory => {
                self.schedule(event, &event.path, DIRECTORY_PRIORITY, cancel).await
            }
            ChangeOperation::Created | ChangeOperation::Modified => self.handle_file_change(event, cancel).await,
            ChangeOperation::Deleted => self.handle_delete(event).await,
            ChangeOperation::Moved { from } => self.handle_move(event, from, cancel).await,
        };

        match result {
            Ok(()) => {
                self.db.change_log().mark_processed(event.id).await?;
                self.processed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if !e.is_cancelled() {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    async fn schedule(
        &self,
        event: &ChangeEvent,
        directory: &str,
        base_priority: i32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let priority = base_priority + recency_bonus(event.detected_at, now_utc());
        self.scheduler
            .analyze_directory(directory, &event.smb_root, priority, &cancel.child_token())
            .await
    }

    async fn handle_file_change(&self, event: &ChangeEvent, cancel: &CancellationToken) -> Result<()> {
        let files = self.db.media_files();
        match files.find_by_path(&event.smb_root, &event.path).await? {
            Some(file) => {
                files.touch_verified(&event.smb_root, &event.path).await?;
                let size_changed = event.size.is_some_and(|s| s as i64 != file.file_size);
                if size_changed {
                    self.refresh_digest(event, &file, cancel).await?;
                }
                debug!(
                    service = "change_processor",
                    media_item_id = file.media_item_id,
                    path = %event.path,
                    size_changed,
                    "Verified known file"
                );
                Ok(())
            }
            None if is_media_file(file_name(&event.path)) => {
                self.schedule(event, &parent_dir(&event.path), FILE_PRIORITY, cancel).await
            }
            None => {
                debug!(service = "change_processor", path = %event.path, "Ignoring non-media file");
                Ok(())
            }
        }
    }

    async fn refresh_digest(&self, event: &ChangeEvent, file: &MediaFile, cancel: &CancellationToken) -> Result<()> {
        let size = event.size.unwrap_or(0) as i64;
        let checksum = if size > 0 {
            let fs = self.scheduler.analyzer().file_system();
            match digest_file(fs.as_ref(), &event.smb_root, &event.path, cancel).await {
                Ok(digest) => Some(digest),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(service = "change_processor", path = %event.path, error = %e, "Failed to hash changed file");
                    None
                }
            }
        } else {
            None
        };
        self.db
            .media_files()
            .update_checksum(file.id, checksum.as_deref(), size)
            .await
    }

    async fn handle_delete(&self, event: &ChangeEvent) -> Result<()> {
        let files = self.db.media_files();
        let affected: Vec<MediaFile> = if event.is_directory {
            files.list_in_directory(&event.smb_root, &event.path).await?
        } else {
            files.find_by_path(&event.smb_root, &event.path).await?.into_iter().collect()
        };

        if affected.is_empty() {
            debug!(service = "change_processor", path = %event.path, "Deleted path was not catalogued");
            return Ok(());
        }

        let mut items = Vec::new();
        for file in &affected {
            files.clear_virtual_link(&event.smb_root, &file.file_path).await?;
            if !items.contains(&file.media_item_id) {
                items.push(file.media_item_id);
            }
        }
        for media_item_id in items {
            self.check_item_integrity(media_item_id).await?;
        }
        Ok(())
    }

    /// An item with at most one file still present is marked missing
    async fn check_item_integrity(&self, media_item_id: i64) -> Result<()> {
        let remaining = self
            .db
            .media_files()
            .list_by_item(media_item_id)
            .await?
            .iter()
            .filter(|f| f.virtual_smb_link.is_some())
            .count();

        if remaining <= 1 {
            warn!(
                service = "change_processor",
                media_item_id,
                remaining_files = remaining,
                "Media item may be incomplete after deletion"
            );
            self.db.media_items().set_status(media_item_id, STATUS_MISSING).await?;
        }
        Ok(())
    }

    async fn handle_move(&self, event: &ChangeEvent, from: &str, cancel: &CancellationToken) -> Result<()> {
        let files = self.db.media_files();
        if files.find_by_path(&event.smb_root, &event.path).await?.is_some() {
            // Already catalogued at the destination; analysis settles the rest
            files.clear_virtual_link(&event.smb_root, from).await?;
        } else if files.rename(&event.smb_root, from, &event.path).await? {
            info!(service = "change_processor", from = %from, to = %event.path, "Moved file");
        }

        let old_parent = parent_dir(from);
        let new_parent = parent_dir(&event.path);
        self.schedule(event, &new_parent, FILE_PRIORITY, cancel).await?;
        if old_parent != new_parent {
            self.schedule(event, &old_parent, FILE_PRIORITY, cancel).await?;
        }
        Ok(())
    }
}
