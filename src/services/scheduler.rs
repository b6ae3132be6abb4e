//! Analysis scheduler
//!
//! A bounded priority queue of directories feeding a fixed worker pool.
//! Requests are keyed by directory path: a second request for a queued path
//! only raises its priority, and a path is never analyzed by two workers at
//! once. Higher priority runs first; equal priorities run in enqueue order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::sqlite_helpers::now_utc;
use crate::error::{CatalogError, Result};
use crate::services::analyzer::DirectoryAnalyzer;

/// A queued "analyze this directory" request
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub directory_path: String,
    pub smb_root: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

/// How one analysis pass ended
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Completed { media_item_id: i64, media_type: String },
    /// Nothing in the directory classified
    Skipped,
    /// The request's token fired before or during the pass
    Cancelled,
    Failed(String),
}

pub type CompletionCallback = Arc<dyn Fn(&AnalysisRequest, &AnalysisOutcome) + Send + Sync>;

/// Batch counters for operator visibility
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisCounters {
    pub processed: u64,
    pub identified: u64,
    pub failed: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    path: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Heap entries are never updated in place. A raised priority pushes a new
/// entry and the old one is skipped on pop because it no longer matches the
/// pending request.
#[derive(Default)]
struct QueueState {
    pending: HashMap<String, AnalysisRequest>,
    heap: BinaryHeap<QueueEntry>,
    running: HashSet<String>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, path: &str, priority: i32) {
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            priority,
            seq: self.next_seq,
            path: path.to_string(),
        });
    }

    /// Highest-priority request whose path is not already running
    fn pop_next(&mut self) -> Option<AnalysisRequest> {
        let mut deferred = Vec::new();
        let mut found = None;

        while let Some(entry) = self.heap.pop() {
            let current = match self.pending.get(&entry.path) {
                Some(req) if req.priority == entry.priority => req,
                _ => continue,
            };
            if current.cancel.is_cancelled() {
                self.pending.remove(&entry.path);
                continue;
            }
            if self.running.contains(&entry.path) {
                deferred.push(entry);
                continue;
            }
            if let Some(req) = self.pending.remove(&entry.path) {
                self.running.insert(entry.path);
                found = Some(req);
                break;
            }
        }

        self.heap.extend(deferred);
        found
    }

    fn purge_cancelled(&mut self) {
        self.pending.retain(|_, req| !req.cancel.is_cancelled());
    }
}

struct Inner {
    analyzer: Arc<DirectoryAnalyzer>,
    state: Mutex<QueueState>,
    /// Signalled when work is queued or a path stops running
    work: Notify,
    /// Signalled when a queued request leaves the queue
    space: Notify,
    capacity: usize,
    processed: AtomicU64,
    identified: AtomicU64,
    failed: AtomicU64,
    callback: RwLock<Option<CompletionCallback>>,
}

struct Workers {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct AnalysisScheduler {
    inner: Arc<Inner>,
    worker_count: usize,
    workers: Mutex<Option<Workers>>,
}

impl AnalysisScheduler {
    pub fn new(analyzer: Arc<DirectoryAnalyzer>, worker_count: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                analyzer,
                state: Mutex::new(QueueState::default()),
                work: Notify::new(),
                space: Notify::new(),
                capacity: capacity.max(1),
                processed: AtomicU64::new(0),
                identified: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                callback: RwLock::new(None),
            }),
            worker_count: worker_count.max(1),
            workers: Mutex::new(None),
        }
    }

    pub fn analyzer(&self) -> &Arc<DirectoryAnalyzer> {
        &self.inner.analyzer
    }

    /// Called after every pass, from the worker that ran it
    pub fn set_completion_callback(&self, callback: CompletionCallback) {
        *self.inner.callback.write() = Some(callback);
    }

    /// Spawn the worker pool. A second call while running does nothing.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return;
        }
        self.inner.state.lock().closed = false;

        let shutdown = CancellationToken::new();
        let handles = (0..self.worker_count)
            .map(|worker_id| {
                let inner = self.inner.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { inner.worker(worker_id, shutdown).await })
            })
            .collect();

        *workers = Some(Workers { shutdown, handles });
        info!(service = "scheduler", workers = self.worker_count, "Started");
    }

    /// Stop accepting work, let running passes finish and wait for the
    /// workers. Requests still queued are dropped. Safe without `start`.
    pub async fn stop(&self) {
        let workers = self.workers.lock().take();
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.pending.clear();
            state.heap.clear();
        }
        self.inner.space.notify_waiters();

        let Some(workers) = workers else {
            return;
        };
        workers.shutdown.cancel();
        for handle in workers.handles {
            if let Err(e) = handle.await {
                warn!(service = "scheduler", error = %e, "Worker ended abnormally");
            }
        }
        info!(service = "scheduler", "Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Queue `directory_path` for analysis.
    ///
    /// An already queued path keeps one request whose priority becomes the
    /// larger of the two. When the queue is full this waits for space; the
    /// wait ends with `Cancelled` if `cancel` fires first. An already
    /// cancelled token fails at once and leaves nothing queued.
    pub async fn analyze_directory(
        &self,
        directory_path: &str,
        smb_root: &str,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(CatalogError::Cancelled);
            }

            let space = self.inner.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(CatalogError::QueueClosed);
                }

                if let Some(existing) = state.pending.get_mut(directory_path) {
                    if existing.cancel.is_cancelled() {
                        existing.cancel = cancel.clone();
                    }
                    if priority > existing.priority {
                        existing.priority = priority;
                        state.push(directory_path, priority);
                        drop(state);
                        self.inner.work.notify_one();
                    }
                    debug!(path = %directory_path, priority = priority, "Coalesced analysis request");
                    return Ok(());
                }

                state.purge_cancelled();
                if state.pending.len() < self.inner.capacity {
                    state.pending.insert(
                        directory_path.to_string(),
                        AnalysisRequest {
                            directory_path: directory_path.to_string(),
                            smb_root: smb_root.to_string(),
                            priority,
                            created_at: now_utc(),
                            cancel: cancel.clone(),
                        },
                    );
                    state.push(directory_path, priority);
                    drop(state);
                    self.inner.work.notify_one();
                    debug!(path = %directory_path, root = %smb_root, priority = priority, "Queued analysis");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CatalogError::Cancelled),
                _ = &mut space => {}
            }
        }
    }

    /// Requests waiting in the queue, not counting running passes
    pub fn pending_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.purge_cancelled();
        state.pending.len()
    }

    /// Priority of the queued request for `directory_path`, if any
    pub fn pending_priority(&self, directory_path: &str) -> Option<i32> {
        let mut state = self.inner.state.lock();
        state.purge_cancelled();
        state.pending.get(directory_path).map(|r| r.priority)
    }

    pub fn counters(&self) -> AnalysisCounters {
        AnalysisCounters {
            processed: self.inner.processed.load(AtomicOrdering::Relaxed),
            identified: self.inner.identified.load(AtomicOrdering::Relaxed),
            failed: self.inner.failed.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Inner {
    async fn worker(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        debug!(worker_id = worker_id, "Analysis worker started");

        loop {
            let work = self.work.notified();
            tokio::pin!(work);
            work.as_mut().enable();

            let next = self.state.lock().pop_next();
            let Some(request) = next else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = &mut work => continue,
                }
            };
            self.space.notify_waiters();

            let outcome = self.run(worker_id, &request).await;

            self.state.lock().running.remove(&request.directory_path);
            self.work.notify_one();

            let callback = self.callback.read().clone();
            if let Some(callback) = callback {
                callback(&request, &outcome);
            }

            if shutdown.is_cancelled() {
                break;
            }
        }

        debug!(worker_id = worker_id, "Analysis worker stopped");
    }

    async fn run(&self, worker_id: usize, request: &AnalysisRequest) -> AnalysisOutcome {
        let path = &request.directory_path;
        match self
            .analyzer
            .analyze(&request.smb_root, path, &request.cancel)
            .await
        {
            Ok(Some(result)) => {
                self.processed.fetch_add(1, AtomicOrdering::Relaxed);
                self.identified.fetch_add(1, AtomicOrdering::Relaxed);
                info!(
                    worker_id = worker_id,
                    path = %path,
                    root = %request.smb_root,
                    media_type = %result.detection.media_type,
                    media_item_id = result.media_item.id,
                    "Directory analysis completed"
                );
                AnalysisOutcome::Completed {
                    media_item_id: result.media_item.id,
                    media_type: result.detection.media_type,
                }
            }
            Ok(None) => {
                self.processed.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(worker_id = worker_id, path = %path, "Directory skipped, nothing classified");
                AnalysisOutcome::Skipped
            }
            Err(e) if e.is_cancelled() => {
                debug!(worker_id = worker_id, path = %path, "Directory analysis cancelled");
                AnalysisOutcome::Cancelled
            }
            Err(e) => {
                self.processed.fetch_add(1, AtomicOrdering::Relaxed);
                self.failed.fetch_add(1, AtomicOrdering::Relaxed);
                error!(
                    worker_id = worker_id,
                    path = %path,
                    root = %request.smb_root,
                    error = %e,
                    "Directory analysis failed"
                );
                AnalysisOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, FieldCipher};
    use crate::services::fs::LocalFileSystem;
    use crate::services::providers::ProviderAggregator;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn scheduler(dir: &TempDir, workers: usize, capacity: usize) -> AnalysisScheduler {
        let cipher = FieldCipher::from_base64_key(&FieldCipher::generate_key()).unwrap();
        let db = Database::in_memory(cipher).await.unwrap();
        let fs = LocalFileSystem::default().with_root("media", dir.path());
        let providers = ProviderAggregator::new(Duration::from_secs(1));
        let analyzer = DirectoryAnalyzer::new(db, Arc::new(fs), Arc::new(providers));
        AnalysisScheduler::new(Arc::new(analyzer), workers, capacity)
    }

    // ===== Coalescing =====

    #[tokio::test]
    async fn test_priority_never_lowers() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir, 1, 10).await;
        let token = CancellationToken::new();

        s.analyze_directory("/a", "media", 10, &token).await.unwrap();
        s.analyze_directory("/a", "media", 3, &token).await.unwrap();
        assert_eq!(s.pending_priority("/a"), Some(10));

        s.analyze_directory("/b", "media", 3, &token).await.unwrap();
        s.analyze_directory("/b", "media", 10, &token).await.unwrap();
        assert_eq!(s.pending_priority("/b"), Some(10));
        assert_eq!(s.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_pop_order_priority_then_fifo() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir, 1, 10).await;
        let token = CancellationToken::new();
        s.analyze_directory("/low", "media", 1, &token).await.unwrap();
        s.analyze_directory("/first", "media", 5, &token).await.unwrap();
        s.analyze_directory("/second", "media", 5, &token).await.unwrap();
        s.analyze_directory("/low", "media", 9, &token).await.unwrap();

        let mut state = s.inner.state.lock();
        let order: Vec<String> = std::iter::from_fn(|| state.pop_next())
            .map(|r| r.directory_path)
            .collect();
        assert_eq!(order, vec!["/low", "/first", "/second"]);
    }

    #[tokio::test]
    async fn test_running_path_is_not_popped_twice() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir, 1, 10).await;
        let token = CancellationToken::new();
        s.analyze_directory("/a", "media", 1, &token).await.unwrap();

        let first = s.inner.state.lock().pop_next().unwrap();
        s.analyze_directory("/a", "media", 1, &token).await.unwrap();
        assert!(s.inner.state.lock().pop_next().is_none());

        s.inner.state.lock().running.remove(&first.directory_path);
        assert!(s.inner.state.lock().pop_next().is_some());
    }

    // ===== Cancellation =====

    #[tokio::test]
    async fn test_cancelled_enqueue_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir, 1, 10).await;
        let token = CancellationToken::new();
        token.cancel();

        assert_matches!(
            s.analyze_directory("/a", "media", 5, &token).await,
            Err(CatalogError::Cancelled)
        );
        assert_eq!(s.pending_priority("/a"), None);
        assert_eq!(s.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_enqueue_drops_request() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir, 1, 10).await;
        let token = CancellationToken::new();
        s.analyze_directory("/a", "media", 5, &token).await.unwrap();
        token.cancel();
        assert_eq!(s.pending_priority("/a"), None);
        assert!(s.inner.state.lock().pop_next().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_waits_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir, 1, 1).await;
        let token = CancellationToken::new();
        s.analyze_directory("/a", "media", 1, &token).await.unwrap();

        let waiter = CancellationToken::new();
        let cancel = waiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        assert_matches!(
            s.analyze_directory("/b", "media", 1, &waiter).await,
            Err(CatalogError::Cancelled)
        );
        assert_eq!(s.pending_priority("/b"), None);
    }

    // ===== Lifecycle =====

    #[tokio::test]
    async fn test_stop_without_start() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir, 2, 10).await;
        s.stop().await;
        s.stop().await;
        assert!(!s.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir, 2, 10).await;
        s.start();
        s.start();
        assert!(s.is_running());
        s.stop().await;
        assert_matches!(
            s.analyze_directory("/a", "media", 1, &CancellationToken::new()).await,
            Err(CatalogError::QueueClosed)
        );
    }

    #[tokio::test]
    async fn test_workers_run_analysis() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Alien (1979)")).unwrap();
        std::fs::write(dir.path().join("Alien (1979)/Alien.1979.1080p.mkv"), b"alien").unwrap();
        std::fs::create_dir_all(dir.path().join("misc")).unwrap();
        std::fs::write(dir.path().join("misc/readme.txt"), b"x").unwrap();

        let s = scheduler(&dir, 2, 10).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.set_completion_callback(Arc::new(move |req, outcome| {
            let _ = tx.send((req.directory_path.clone(), outcome.clone()));
        }));
        s.start();

        let token = CancellationToken::new();
        s.analyze_directory("/Alien (1979)", "media", 5, &token).await.unwrap();
        s.analyze_directory("/misc", "media", 1, &token).await.unwrap();

        let mut outcomes = HashMap::new();
        for _ in 0..2 {
            let (path, outcome) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            outcomes.insert(path, outcome);
        }
        s.stop().await;

        assert_matches!(
            outcomes.get("/Alien (1979)"),
            Some(AnalysisOutcome::Completed { media_type, .. }) if media_type == "movie"
        );
        assert_eq!(outcomes.get("/misc"), Some(&AnalysisOutcome::Skipped));
        assert_eq!(
            s.counters(),
            AnalysisCounters {
                processed: 2,
                identified: 1,
                failed: 0
            }
        );
    }
}
