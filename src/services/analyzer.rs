//! Directory analysis pipeline
//!
//! One pass over one directory: list it, classify it, score and digest its
//! media files, ask the providers for a best match, then write the
//! directory record, the media item, its files and the provider metadata in
//! a single store transaction. Provider calls happen before the transaction
//! opens so no connection is held across network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::collections::CreateCollection;
use crate::db::directory_analysis::{fetch_analysis, link_analysis_item, upsert_analysis};
use crate::db::external_metadata::upsert_metadata;
use crate::db::media_files::upsert_file;
use crate::db::media_items::{apply_enrichment, fetch_item, insert_item, update_detection};
use crate::db::{
    CreateMediaItem, Database, DirectoryAnalysis, ExternalMetadata, ItemEnrichment, MediaFile,
    MediaItem, UpsertDirectoryAnalysis, UpsertExternalMetadata, UpsertMediaFile,
};
use crate::error::{CatalogError, Result};
use crate::services::classifier::{Classifier, DetectionResult, filter_media_files};
use crate::services::digest::digest_file;
use crate::services::fs::{FileEntry, ShareFileSystem};
use crate::services::providers::{ProviderAggregator, ProviderMetadata, SearchResult};
use crate::services::quality::{QualityAnalysis, QualityInfo, analyze_quality, extract_quality};

/// Everything one analysis pass produced
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub directory: DirectoryAnalysis,
    pub detection: DetectionResult,
    pub media_item: MediaItem,
    pub files: Vec<MediaFile>,
    pub external_metadata: Vec<ExternalMetadata>,
    pub quality: QualityAnalysis,
}

/// A media file with its computed quality and digest, ready to store
struct ScannedFile {
    entry: FileEntry,
    quality: QualityInfo,
    checksum: Option<String>,
}

pub struct DirectoryAnalyzer {
    db: Database,
    fs: Arc<dyn ShareFileSystem>,
    providers: Arc<ProviderAggregator>,
    classifier: RwLock<Option<Arc<Classifier>>>,
}

impl DirectoryAnalyzer {
    pub fn new(db: Database, fs: Arc<dyn ShareFileSystem>, providers: Arc<ProviderAggregator>) -> Self {
        Self {
            db,
            fs,
            providers,
            classifier: RwLock::new(None),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn file_system(&self) -> &Arc<dyn ShareFileSystem> {
        &self.fs
    }

    pub fn providers(&self) -> &Arc<ProviderAggregator> {
        &self.providers
    }

    /// Detection rules built from the stored media types, loaded once
    pub async fn classifier(&self) -> Result<Arc<Classifier>> {
        if let Some(classifier) = self.classifier.read().clone() {
            return Ok(classifier);
        }
        let media_types = self.db.media_types().all().await?;
        let classifier = Arc::new(Classifier::new(&media_types));
        *self.classifier.write() = Some(classifier.clone());
        Ok(classifier)
    }

    /// Drop the cached rules so the next pass re-reads media types
    pub fn reload_classifier(&self) {
        *self.classifier.write() = None;
    }

    /// Analyze one directory. `Ok(None)` when nothing in it classifies.
    pub async fn analyze(
        &self,
        smb_root: &str,
        directory_path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<AnalysisResult>> {
        if cancel.is_cancelled() {
            return Err(CatalogError::Cancelled);
        }

        let entries = self.fs.list_directory(smb_root, directory_path).await?;
        let classifier = self.classifier().await?;
        let detection = match classifier.classify_directory(directory_path, &entries) {
            Some(d) if d.is_valid() => d,
            _ => {
                debug!(path = %directory_path, root = %smb_root, "No media type detected");
                return Ok(None);
            }
        };

        let scanned = self
            .scan_files(smb_root, directory_path, &entries, &detection.media_type, cancel)
            .await?;

        let existing = self
            .db
            .directory_analysis()
            .get(smb_root, directory_path)
            .await?;
        let existing_item = match existing.as_ref().and_then(|d| d.media_item_id) {
            Some(id) => self.db.media_items().get(id).await?,
            None => None,
        };

        // Re-analysis keeps a title the providers already settled on
        let (title, year) = match &existing_item {
            Some(item) if item.media_type.as_deref() == Some(detection.media_type.as_str()) => {
                (item.title.clone(), item.year.or(detection.suggested_year))
            }
            _ => (detection.suggested_title.clone(), detection.suggested_year),
        };

        let metadata = match self
            .lookup_metadata(&title, Some(&detection.media_type), year, cancel)
            .await
        {
            Ok(m) => m,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(path = %directory_path, error = %e, "Metadata lookup failed");
                None
            }
        };

        let media_item_id = self
            .persist(
                smb_root,
                directory_path,
                &entries,
                &detection,
                &title,
                year,
                &scanned,
                metadata.as_ref(),
            )
            .await?;

        if let Some(collection) = metadata.as_ref().and_then(|m| m.collection.as_ref()) {
            let provider = metadata.as_ref().map(|m| m.provider.clone()).unwrap_or_default();
            let input = CreateCollection {
                name: collection.name.clone(),
                collection_type: detection.media_type.clone(),
                total_items: 1,
                external_ids: [(provider, collection.external_id.clone())].into_iter().collect(),
                cover_url: collection.cover_url.clone(),
                ..Default::default()
            };
            if let Err(e) = self.db.collections().upsert(&input).await {
                warn!(collection = %collection.name, error = %e, "Failed to record collection");
            }
        }

        let directory = self
            .db
            .directory_analysis()
            .get(smb_root, directory_path)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("analysis for {}", directory_path)))?;
        let media_item = self
            .db
            .media_items()
            .get(media_item_id)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("media item {}", media_item_id)))?;
        let files = self.db.media_files().list_by_item(media_item_id).await?;
        let external_metadata = self.db.external_metadata().list_for_item(media_item_id).await?;
        let quality = analyze_quality(&entries, &detection.media_type);

        Ok(Some(AnalysisResult {
            directory,
            detection,
            media_item,
            files,
            external_metadata,
            quality,
        }))
    }

    /// Quality and digest for every media file of the detected type. A file
    /// whose stored row already has a digest for the same size is not
    /// re-read; digest failures leave the digest unset.
    async fn scan_files(
        &self,
        smb_root: &str,
        directory_path: &str,
        entries: &[FileEntry],
        media_type: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScannedFile>> {
        let known: HashMap<String, MediaFile> = self
            .db
            .media_files()
            .list_in_directory(smb_root, directory_path)
            .await?
            .into_iter()
            .map(|f| (f.file_path.clone(), f))
            .collect();

        let mut scanned = Vec::new();
        for entry in filter_media_files(entries, media_type) {
            let quality = extract_quality(&entry.name, entry.extension.as_deref());

            let stored = known
                .get(&entry.path)
                .filter(|f| f.file_size == entry.size as i64)
                .and_then(|f| f.checksum.clone());
            let checksum = match stored {
                Some(c) => Some(c),
                None if entry.size == 0 => None,
                None => match digest_file(self.fs.as_ref(), smb_root, &entry.path, cancel).await {
                    Ok(c) => Some(c),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(path = %entry.path, error = %e, "Failed to digest file");
                        None
                    }
                },
            };

            scanned.push(ScannedFile {
                entry: entry.clone(),
                quality,
                checksum,
            });
        }
        Ok(scanned)
    }

    /// Best provider match with its details. Routing needs a known type, so
    /// a missing type fails before any provider is asked.
    ///
    /// When the winner's details cannot be fetched the search result itself
    /// is recorded. Cancellation mid-lookup counts as no result.
    pub async fn lookup_metadata(
        &self,
        title: &str,
        media_type: Option<&str>,
        year: Option<i32>,
        cancel: &CancellationToken,
    ) -> Result<Option<ProviderMetadata>> {
        let media_type = media_type.ok_or(CatalogError::MediaTypeUnavailable)?;

        let Some(best) = self
            .providers
            .get_best_match(title, media_type, year, cancel)
            .await
        else {
            return Ok(None);
        };

        match self
            .providers
            .get_details(&best.provider, &best.result.external_id, media_type, cancel)
            .await
        {
            Ok(details) => Ok(Some(details)),
            Err(e) if e.is_cancelled() => Ok(None),
            Err(e) => {
                warn!(
                    provider = %best.provider,
                    external_id = %best.result.external_id,
                    error = %e,
                    "Failed to fetch details, keeping search result"
                );
                Ok(Some(from_search_result(&best.provider, best.result)?))
            }
        }
    }

    /// Re-fetch provider metadata for an existing item and store it
    pub async fn refresh_item(&self, item: &MediaItem, cancel: &CancellationToken) -> Result<bool> {
        let Some(metadata) = self
            .lookup_metadata(&item.title, item.media_type.as_deref(), item.year, cancel)
            .await?
        else {
            return Ok(false);
        };

        let mut tx = self.db.begin().await?;
        apply_enrichment(&mut *tx, item.id, &enrichment_from(&metadata)).await?;
        upsert_metadata(&mut *tx, self.db.cipher(), &metadata_row(item.id, &metadata)).await?;
        tx.commit().await?;
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        smb_root: &str,
        directory_path: &str,
        entries: &[FileEntry],
        detection: &DetectionResult,
        title: &str,
        year: Option<i32>,
        scanned: &[ScannedFile],
        metadata: Option<&ProviderMetadata>,
    ) -> Result<i64> {
        let regular: Vec<&FileEntry> = entries.iter().filter(|f| !f.is_directory).collect();
        let mut tx = self.db.begin().await?;

        upsert_analysis(
            &mut tx,
            &UpsertDirectoryAnalysis {
                directory_path: directory_path.to_string(),
                smb_root: smb_root.to_string(),
                media_item_id: None,
                confidence_score: detection.confidence,
                detection_method: detection.method.clone(),
                analysis_data: Some(detection.analysis_data.clone()),
                files_count: regular.len() as i64,
                total_size: regular.iter().map(|f| f.size as i64).sum(),
            },
        )
        .await?;

        let item_input = CreateMediaItem {
            media_type_id: detection.media_type_id,
            title: title.to_string(),
            year,
        };
        let linked = fetch_analysis(&mut *tx, smb_root, directory_path)
            .await?
            .and_then(|d| d.media_item_id);
        let existing = match linked {
            Some(id) => fetch_item(&mut *tx, id).await?.map(|i| i.id),
            None => None,
        };
        let media_item_id = match existing {
            Some(id) => {
                update_detection(&mut *tx, id, &item_input).await?;
                id
            }
            None => {
                let id = insert_item(&mut *tx, &item_input).await?;
                link_analysis_item(&mut *tx, smb_root, directory_path, id).await?;
                id
            }
        };

        if let Some(metadata) = metadata {
            apply_enrichment(&mut *tx, media_item_id, &enrichment_from(metadata)).await?;
            upsert_metadata(&mut *tx, self.db.cipher(), &metadata_row(media_item_id, metadata)).await?;
        }

        for file in scanned {
            upsert_file(
                &mut tx,
                &UpsertMediaFile {
                    media_item_id,
                    file_path: file.entry.path.clone(),
                    smb_root: smb_root.to_string(),
                    filename: file.entry.name.clone(),
                    file_size: file.entry.size as i64,
                    file_extension: file.entry.extension.clone(),
                    quality_info: Some(file.quality.clone()),
                    checksum: file.checksum.clone(),
                },
            )
            .await?;
        }

        tx.commit().await?;
        debug!(
            path = %directory_path,
            root = %smb_root,
            media_item_id = media_item_id,
            files = scanned.len(),
            "Stored directory analysis"
        );
        Ok(media_item_id)
    }
}

fn enrichment_from(metadata: &ProviderMetadata) -> ItemEnrichment {
    ItemEnrichment {
        original_title: metadata.original_title.clone(),
        description: metadata.description.clone(),
        genres: metadata.genres.clone(),
        cast_crew: metadata.cast_crew.clone(),
        rating: metadata.rating,
    }
}

fn metadata_row(media_item_id: i64, metadata: &ProviderMetadata) -> UpsertExternalMetadata {
    UpsertExternalMetadata {
        media_item_id,
        provider: metadata.provider.clone(),
        external_id: metadata.external_id.clone(),
        data: metadata.data.clone(),
        rating: metadata.rating,
        review_url: metadata.review_url.clone(),
        cover_url: metadata.cover_url.clone(),
        trailer_url: metadata.trailer_url.clone(),
    }
}

fn from_search_result(provider: &str, result: SearchResult) -> Result<ProviderMetadata> {
    Ok(ProviderMetadata {
        provider: provider.to_string(),
        external_id: result.external_id.clone(),
        data: serde_json::to_string(&result)?,
        rating: result.rating,
        cover_url: result.cover_url.clone(),
        title: Some(result.title),
        year: result.year,
        description: result.description,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FieldCipher;
    use crate::services::fs::LocalFileSystem;
    use crate::services::providers::testing::{StaticProvider, result};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup(providers: Vec<StaticProvider>) -> (TempDir, DirectoryAnalyzer) {
        let dir = TempDir::new().unwrap();
        let cipher = FieldCipher::from_base64_key(&FieldCipher::generate_key()).unwrap();
        let db = Database::in_memory(cipher).await.unwrap();
        let fs = LocalFileSystem::default().with_root("movies", dir.path());
        let mut aggregator = ProviderAggregator::new(Duration::from_secs(5));
        for p in providers {
            aggregator.register(Arc::new(p));
        }
        let analyzer = DirectoryAnalyzer::new(db, Arc::new(fs), Arc::new(aggregator));
        (dir, analyzer)
    }

    fn write(dir: &TempDir, rel: &str, bytes: &[u8]) {
        let path = dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    // ===== Pipeline =====

    #[tokio::test]
    async fn test_analyze_without_providers() {
        let (dir, analyzer) = setup(vec![]).await;
        write(&dir, "Heat (1995)/Heat.1995.1080p.WEB-DL.AAC.x264.mkv", b"movie bytes");
        write(&dir, "Heat (1995)/notes.txt", b"x");

        let result = analyzer
            .analyze("movies", "/Heat (1995)", &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.detection.media_type, "movie");
        assert_eq!(result.media_item.title, "Heat");
        assert_eq!(result.media_item.year, Some(1995));
        assert_eq!(result.media_item.media_type.as_deref(), Some("movie"));
        assert_eq!(result.files.len(), 1);
        let score = result.files[0].quality_info.as_ref().unwrap().quality_score;
        assert!((80..=100).contains(&score));
        assert!(result.files[0].checksum.is_some());
        assert!(result.external_metadata.is_empty());
        assert_eq!(result.directory.files_count, 2);
        assert_eq!(result.directory.media_item_id, Some(result.media_item.id));
    }

    #[tokio::test]
    async fn test_analyze_with_provider_match() {
        let provider = StaticProvider::new("tmdb", vec![result("949", "Heat", Some(1995), 0.8)]);
        let (dir, analyzer) = setup(vec![provider]).await;
        write(&dir, "Heat (1995)/Heat.1995.2160p.BluRay.x265.mkv", b"uhd");

        let result = analyzer
            .analyze("movies", "/Heat (1995)", &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.external_metadata.len(), 1);
        assert_eq!(result.external_metadata[0].provider, "tmdb");
        assert_eq!(result.external_metadata[0].data, r#"{"id":"949"}"#);
        assert_eq!(result.media_item.rating, Some(7.5));
    }

    #[tokio::test]
    async fn test_reanalysis_reuses_item() {
        let (dir, analyzer) = setup(vec![]).await;
        write(&dir, "Heat (1995)/Heat.1995.720p.mkv", b"a");
        let token = CancellationToken::new();

        let first = analyzer.analyze("movies", "/Heat (1995)", &token).await.unwrap().unwrap();
        write(&dir, "Heat (1995)/Heat.1995.1080p.mkv", b"b");
        let second = analyzer.analyze("movies", "/Heat (1995)", &token).await.unwrap().unwrap();

        assert_eq!(first.media_item.id, second.media_item.id);
        assert_eq!(second.files.len(), 2);
        assert_eq!(second.quality.available_qualities.len(), 2);
    }

    #[tokio::test]
    async fn test_unclassifiable_directory_is_skipped() {
        let (dir, analyzer) = setup(vec![]).await;
        write(&dir, "misc/readme.txt", b"hello");
        let result = analyzer
            .analyze("movies", "/misc", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_dir, analyzer) = setup(vec![]).await;
        let token = CancellationToken::new();
        token.cancel();
        assert_matches!(
            analyzer.analyze("movies", "/Heat", &token).await,
            Err(CatalogError::Cancelled)
        );
    }

    // ===== Metadata lookup =====

    #[tokio::test]
    async fn test_missing_media_type_skips_providers() {
        let (_dir, analyzer) = setup(vec![StaticProvider::new("tmdb", vec![])]).await;
        assert_matches!(
            analyzer
                .lookup_metadata("Heat", None, None, &CancellationToken::new())
                .await,
            Err(CatalogError::MediaTypeUnavailable)
        );
    }

    #[test]
    fn test_search_result_fallback() {
        let meta = from_search_result("imdb", result("tt1", "Heat", Some(1995), 0.75)).unwrap();
        assert_eq!(meta.provider, "imdb");
        assert_eq!(meta.title.as_deref(), Some("Heat"));
        assert!(meta.data.contains("\"tt1\""));
    }
}
