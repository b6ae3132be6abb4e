//! Lifecycle manager for the catalog's long-running components.
//!
//! [CatalogManager] owns the store, the provider aggregator and the three
//! background services (scheduler, change processor, watcher) and starts
//! them in dependency order:
//!
//! 1. validate the config
//! 2. sync the schema
//! 3. start the analysis scheduler
//! 4. start the change processor
//! 5. replay unprocessed change log rows
//! 6. start the watcher, when realtime is enabled
//!
//! [stop](CatalogManager::stop) walks the started services in reverse and is
//! idempotent. The manager is also the surface an API or CLI layer calls for
//! analysis, statistics and duplicate reports.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{ChangeStatistics, Database, DatabaseStats, FieldCipher};
use crate::error::{CatalogError, Result};
use crate::services::analyzer::DirectoryAnalyzer;
use crate::services::change_processor::{ChangeCounters, ChangeProcessor, REPLAY_BATCH};
use crate::services::digest::{DuplicateGroup, group_duplicates};
use crate::services::fs::{LocalFileSystem, ShareFileSystem};
use crate::services::providers::ProviderAggregator;
use crate::services::scheduler::{AnalysisCounters, AnalysisScheduler};
use crate::services::watcher::ChangeWatcher;

/// Priority for bulk re-analysis of every known directory
pub const BULK_PRIORITY: i32 = 1;
/// Items read per metadata refresh batch
pub const REFRESH_BATCH: i64 = 100;
/// Pause between refreshed items, to stay friendly with provider limits
pub const REFRESH_PAUSE: Duration = Duration::from_millis(100);

/// Health status of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a service health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// A component the manager starts, stops and health-checks.
///
/// Use [tracing] for lifecycle logging with a `service` field naming the
/// component (e.g. `tracing::info!(service = "watcher", "Started")`).
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Unique name for logging and lookup (e.g. "scheduler", "watcher").
    fn name(&self) -> &str;

    /// Start background tasks. A second call while running does nothing.
    async fn start(&self) -> Result<()>;

    /// Stop background tasks. Safe to call when not started.
    async fn stop(&self) -> Result<()>;

    /// Report current health. Default returns [ServiceHealth::healthy].
    async fn health(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth::healthy())
    }
}

fn running_health(running: bool) -> ServiceHealth {
    if running {
        ServiceHealth::healthy()
    } else {
        ServiceHealth::degraded("not running")
    }
}

#[async_trait]
impl Service for AnalysisScheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn start(&self) -> Result<()> {
        AnalysisScheduler::start(self);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        AnalysisScheduler::stop(self).await;
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        Ok(running_health(self.is_running()))
    }
}

#[async_trait]
impl Service for ChangeProcessor {
    fn name(&self) -> &str {
        "change_processor"
    }

    async fn start(&self) -> Result<()> {
        ChangeProcessor::start(self);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        ChangeProcessor::stop(self).await;
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        Ok(running_health(self.is_running()))
    }
}

#[async_trait]
impl Service for ChangeWatcher {
    fn name(&self) -> &str {
        "watcher"
    }

    async fn start(&self) -> Result<()> {
        ChangeWatcher::start(self)
    }

    async fn stop(&self) -> Result<()> {
        ChangeWatcher::stop(self).await;
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        Ok(running_health(self.is_running()))
    }
}

/// Everything an operator dashboard shows about the catalog
#[derive(Debug, Clone, Serialize)]
pub struct CatalogStats {
    pub database: DatabaseStats,
    pub changes_24h: ChangeStatistics,
    /// Media type name -> item count
    pub media_types: BTreeMap<String, i64>,
    /// Provider name -> external metadata rows
    pub metadata_coverage: BTreeMap<String, i64>,
    pub analysis: AnalysisCounters,
    pub changes: ChangeCounters,
    pub pending_analyses: usize,
}

pub struct CatalogManager {
    config: Config,
    db: Database,
    providers: Arc<ProviderAggregator>,
    scheduler: Arc<AnalysisScheduler>,
    processor: Arc<ChangeProcessor>,
    watcher: Arc<ChangeWatcher>,
    /// Services started so far, in start order
    started: Mutex<Vec<Arc<dyn Service>>>,
}

impl CatalogManager {
    /// Build every component from config: open the store, register the
    /// providers and mount the watched roots as local shares.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let key = config
            .encryption_key
            .as_deref()
            .ok_or_else(|| CatalogError::Config("CATALOG_ENCRYPTION_KEY is required".into()))?;
        let cipher = FieldCipher::from_base64_key(key)?;
        let db = Database::connect(&config.database_url, cipher).await?;
        let fs = LocalFileSystem::new(config.enabled_roots());
        let providers = ProviderAggregator::from_config(&config)?;
        Ok(Self::new(config, db, Arc::new(fs), Arc::new(providers)))
    }

    /// Wire components around an existing store and share access
    pub fn new(
        config: Config,
        db: Database,
        fs: Arc<dyn ShareFileSystem>,
        providers: Arc<ProviderAggregator>,
    ) -> Self {
        let analyzer = Arc::new(DirectoryAnalyzer::new(db.clone(), fs.clone(), providers.clone()));
        let scheduler = Arc::new(AnalysisScheduler::new(
            analyzer,
            config.analysis_workers,
            config.analysis_queue_capacity,
        ));
        let processor = Arc::new(ChangeProcessor::new(
            db.clone(),
            scheduler.clone(),
            config.change_workers,
            config.change_queue_capacity,
        ));
        let watcher = Arc::new(ChangeWatcher::new(
            db.clone(),
            fs,
            config.watched_roots.clone(),
            config.debounce_delay,
            processor.sender(),
        ));

        Self {
            config,
            db,
            providers,
            scheduler,
            processor,
            watcher,
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn providers(&self) -> &Arc<ProviderAggregator> {
        &self.providers
    }

    pub fn scheduler(&self) -> &Arc<AnalysisScheduler> {
        &self.scheduler
    }

    pub fn processor(&self) -> &Arc<ChangeProcessor> {
        &self.processor
    }

    pub fn watcher(&self) -> &Arc<ChangeWatcher> {
        &self.watcher
    }

    /// Start everything. On failure the services already started are
    /// stopped again. A second call while running does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        if !started.is_empty() {
            return Ok(());
        }

        self.config.validate()?;
        self.db.migrate().await?;

        let result = self.start_services(&mut started).await;
        if let Err(e) = result {
            warn!(service = "catalog", error = %e, "Start failed, stopping started services");
            Self::stop_services(&mut started).await;
            return Err(e);
        }

        info!(
            service = "catalog",
            services = started.len(),
            realtime = self.config.enable_realtime,
            providers = ?self.providers.enabled_providers().collect::<Vec<_>>(),
            "Catalog started"
        );
        Ok(())
    }

    async fn start_services(&self, started: &mut Vec<Arc<dyn Service>>) -> Result<()> {
        let scheduler: Arc<dyn Service> = self.scheduler.clone();
        scheduler.start().await?;
        started.push(scheduler);

        let processor: Arc<dyn Service> = self.processor.clone();
        processor.start().await?;
        started.push(processor);

        let replayed = self.processor.replay_pending(REPLAY_BATCH).await?;
        if replayed > 0 {
            info!(service = "catalog", replayed, "Replayed changes from before the last stop");
        }

        if self.config.enable_realtime {
            let watcher: Arc<dyn Service> = self.watcher.clone();
            watcher.start().await?;
            started.push(watcher);
        }
        Ok(())
    }

    async fn stop_services(started: &mut Vec<Arc<dyn Service>>) {
        while let Some(service) = started.pop() {
            match service.stop().await {
                Ok(()) => info!(service = %service.name(), "Service '{}' stopped", service.name()),
                Err(e) => warn!(service = %service.name(), error = %e, "Service '{}' stop failed", service.name()),
            }
        }
    }

    /// Stop in reverse start order. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut started = self.started.lock().await;
        if started.is_empty() {
            return;
        }
        Self::stop_services(&mut started).await;
        info!(service = "catalog", "Catalog stopped");
    }

    pub async fn is_running(&self) -> bool {
        !self.started.lock().await.is_empty()
    }

    /// Health of every component, database included
    pub async fn health(&self) -> BTreeMap<String, ServiceHealth> {
        let services: [Arc<dyn Service>; 3] = [
            self.scheduler.clone(),
            self.processor.clone(),
            self.watcher.clone(),
        ];
        let mut out = BTreeMap::new();
        for service in services {
            let health = service
                .health()
                .await
                .unwrap_or_else(|e| ServiceHealth::unhealthy(e.to_string()));
            out.insert(service.name().to_string(), health);
        }
        let db = match self.db.health_check().await {
            Ok(()) => ServiceHealth::healthy(),
            Err(e) => ServiceHealth::unhealthy(e.to_string()),
        };
        out.insert("database".to_string(), db);
        out
    }

    pub async fn analyze_directory(
        &self,
        directory_path: &str,
        smb_root: &str,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.scheduler
            .analyze_directory(directory_path, smb_root, priority, cancel)
            .await
    }

    /// Queue every directory the catalog has analyzed before, at the
    /// lowest priority. Returns how many were queued.
    pub async fn analyze_all_directories(&self, cancel: &CancellationToken) -> Result<usize> {
        let directories = self.db.directory_analysis().all_directories().await?;
        let mut queued = 0;
        for (path, smb_root) in &directories {
            match self.scheduler.analyze_directory(path, smb_root, BULK_PRIORITY, cancel).await {
                Ok(()) => queued += 1,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(service = "catalog", smb_root = %smb_root, path = %path, error = %e, "Failed to queue directory");
                }
            }
        }
        info!(service = "catalog", queued, total = directories.len(), "Queued full re-analysis");
        Ok(queued)
    }

    /// Re-fetch provider metadata for active items not updated within
    /// `older_than`. Works in batches with a short pause per item. Returns
    /// how many items were refreshed.
    pub async fn refresh_external_metadata(
        &self,
        older_than: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| CatalogError::Config(format!("refresh age out of range: {}", e)))?;
        let before = Utc::now() - age;
        let analyzer = self.scheduler.analyzer();

        let mut seen = HashSet::new();
        let mut refreshed = 0;
        loop {
            let batch = self.db.media_items().needing_refresh(before, REFRESH_BATCH).await?;
            let fresh: Vec<i64> = batch.iter().copied().filter(|id| seen.insert(*id)).collect();
            if fresh.is_empty() {
                break;
            }

            for id in fresh {
                if cancel.is_cancelled() {
                    return Err(CatalogError::Cancelled);
                }
                let Some(item) = self.db.media_items().get(id).await? else {
                    continue;
                };
                match analyzer.refresh_item(&item, cancel).await {
                    Ok(true) => refreshed += 1,
                    Ok(false) => debug!(service = "catalog", media_item_id = id, "No metadata found on refresh"),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => warn!(service = "catalog", media_item_id = id, error = %e, "Metadata refresh failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(REFRESH_PAUSE) => {}
                    _ = cancel.cancelled() => return Err(CatalogError::Cancelled),
                }
            }

            if (batch.len() as i64) < REFRESH_BATCH {
                break;
            }
        }

        info!(service = "catalog", refreshed, "Metadata refresh finished");
        Ok(refreshed)
    }

    pub async fn get_change_statistics(&self, since: chrono::DateTime<Utc>) -> Result<ChangeStatistics> {
        self.processor.get_change_statistics(since).await
    }

    pub async fn get_stats(&self) -> Result<CatalogStats> {
        let since = Utc::now() - chrono::Duration::hours(24);
        Ok(CatalogStats {
            database: self.db.stats().await?,
            changes_24h: self.processor.get_change_statistics(since).await?,
            media_types: self.db.media_items().by_type_counts().await?.into_iter().collect(),
            metadata_coverage: self
                .db
                .external_metadata()
                .coverage_by_provider()
                .await?
                .into_iter()
                .collect(),
            analysis: self.scheduler.counters(),
            changes: self.processor.counters(),
            pending_analyses: self.scheduler.pending_count(),
        })
    }

    /// Files on `smb_root` with identical content, grouped
    pub async fn duplicate_groups(&self, smb_root: &str) -> Result<Vec<DuplicateGroup>> {
        let candidates = self.db.media_files().duplicate_candidates(smb_root).await?;
        Ok(group_duplicates(candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchedRoot;
    use crate::db::{CreateMediaItem, UpsertMediaFile};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn manager(config: Config) -> CatalogManager {
        let cipher = FieldCipher::from_base64_key(&FieldCipher::generate_key()).unwrap();
        let db = Database::in_memory(cipher).await.unwrap();
        let fs = LocalFileSystem::new(config.enabled_roots());
        CatalogManager::new(config, db, Arc::new(fs), Arc::new(ProviderAggregator::new(Duration::from_secs(5))))
    }

    #[tokio::test]
    async fn test_start_stop_order_and_idempotence() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            watched_roots: vec![WatchedRoot {
                name: "movies".to_string(),
                local_path: dir.path().to_path_buf(),
                enabled: true,
            }],
            ..Config::default()
        };
        let manager = manager(config).await;

        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert!(manager.scheduler().is_running());
        assert!(manager.processor().is_running());
        assert!(manager.watcher().is_running());

        let health = manager.health().await;
        assert_eq!(health["watcher"], ServiceHealth::healthy());
        assert_eq!(health["database"], ServiceHealth::healthy());

        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running().await);
        assert!(!manager.watcher().is_running());
        assert!(!manager.scheduler().is_running());
    }

    #[tokio::test]
    async fn test_realtime_disabled_skips_watcher() {
        let manager = manager(Config {
            enable_realtime: false,
            ..Config::default()
        })
        .await;

        manager.start().await.unwrap();
        assert!(!manager.watcher().is_running());
        assert_eq!(
            manager.health().await["watcher"].status,
            HealthStatus::Degraded
        );
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unwatchable_root_fails_start_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let manager = manager(Config {
            watched_roots: vec![WatchedRoot {
                name: "gone".to_string(),
                local_path: dir.path().join("missing"),
                enabled: true,
            }],
            ..Config::default()
        })
        .await;

        assert_matches!(manager.start().await, Err(CatalogError::Config(_)));
        assert!(!manager.is_running().await);
        assert!(!manager.scheduler().is_running());
        assert!(!manager.processor().is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let manager = manager(Config {
            analysis_workers: 0,
            ..Config::default()
        })
        .await;
        assert_matches!(manager.start().await, Err(CatalogError::Config(_)));
    }

    #[tokio::test]
    async fn test_stats_and_duplicates() {
        let manager = manager(Config {
            enable_realtime: false,
            ..Config::default()
        })
        .await;
        let db = manager.database();
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
        for path in ["/a/Heat.mkv", "/b/Heat.mkv"] {
            db.media_files()
                .upsert(&UpsertMediaFile {
                    media_item_id: item,
                    file_path: path.to_string(),
                    smb_root: "movies".to_string(),
                    filename: "Heat.mkv".to_string(),
                    file_size: 100,
                    file_extension: Some(".mkv".to_string()),
                    quality_info: None,
                    checksum: Some("same".to_string()),
                })
                .await
                .unwrap();
        }

        let groups = manager.duplicate_groups("movies").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].files.len(), 2);

        let stats = manager.get_stats().await.unwrap();
        assert_eq!(stats.media_types.get("movie"), Some(&1));
        assert_eq!(stats.pending_analyses, 0);
        assert_eq!(stats.changes_24h.total_changes, 0);
    }

    #[tokio::test]
    async fn test_analyze_all_directories_uses_bulk_priority() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Heat (1995)")).unwrap();
        std::fs::write(dir.path().join("Heat (1995)/Heat.1995.1080p.mkv"), b"video").unwrap();
        let config = Config {
            enable_realtime: false,
            watched_roots: vec![WatchedRoot {
                name: "movies".to_string(),
                local_path: dir.path().to_path_buf(),
                enabled: true,
            }],
            ..Config::default()
        };
        let manager = manager(config).await;
        let cancel = CancellationToken::new();

        // Populate directory_analysis with one pass, scheduler not started
        manager
            .scheduler()
            .analyzer()
            .analyze("movies", "/Heat (1995)", &cancel)
            .await
            .unwrap();

        let queued = manager.analyze_all_directories(&cancel).await.unwrap();
        assert_eq!(queued, 1);
        assert_eq!(manager.scheduler().pending_priority("/Heat (1995)"), Some(BULK_PRIORITY));
    }

    #[tokio::test]
    async fn test_refresh_without_providers_refreshes_nothing() {
        let manager = manager(Config {
            enable_realtime: false,
            ..Config::default()
        })
        .await;
        let cancel = CancellationToken::new();
        let refreshed = manager
            .refresh_external_metadata(Duration::from_secs(0), &cancel)
            .await
            .unwrap();
        assert_eq!(refreshed, 0);
    }
}
