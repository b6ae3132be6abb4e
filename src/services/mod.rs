//! Catalog services: analysis pipeline, realtime change handling and
//! metadata providers

pub mod analyzer;
pub mod change_processor;
pub mod classifier;
pub mod digest;
pub mod fs;
pub mod manager;
pub mod providers;
pub mod quality;
pub mod rate_limiter;
pub mod scheduler;
pub mod watcher;

pub use analyzer::{AnalysisResult, DirectoryAnalyzer};
pub use change_processor::{ChangeCounters, ChangeProcessor};
pub use classifier::{Classifier, DetectionResult};
pub use digest::{DuplicateFile, DuplicateGroup};
pub use fs::{FileEntry, LocalFileSystem, ShareFileSystem};
pub use manager::{CatalogManager, CatalogStats, HealthStatus, Service, ServiceHealth};
pub use providers::{MetadataProvider, ProviderAggregator, ProviderMetadata, SearchResult};
pub use quality::{QualityAnalysis, QualityInfo, extract_quality};
pub use scheduler::{AnalysisCounters, AnalysisOutcome, AnalysisRequest, AnalysisScheduler};
pub use watcher::{ChangeEvent, ChangeOperation, ChangeWatcher, RawChange, RawKind};
