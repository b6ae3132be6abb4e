//! External metadata providers and the aggregator that ranks their results
//!
//! Providers are trait objects registered by name. Which providers are asked
//! for a given media type is data ([providers_for_type]), so the aggregator
//! never branches on a provider.

pub mod lastfm;
pub mod musicbrainz;
pub mod omdb;
pub mod openlibrary;
pub mod tmdb;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::CastCrew;
use crate::error::{CatalogError, Result};

pub use lastfm::LastFmProvider;
pub use musicbrainz::MusicBrainzProvider;
pub use omdb::OmdbProvider;
pub use openlibrary::OpenLibraryProvider;
pub use tmdb::TmdbProvider;

/// Provider names consulted for each media type, in priority order
pub fn providers_for_type(media_type: &str) -> &'static [&'static str] {
    match media_type {
        "movie" | "documentary" => &["tmdb", "imdb"],
        "tv_show" => &["tmdb", "imdb", "tvdb"],
        "anime" => &["anidb", "myanimelist", "tmdb"],
        "music" => &["musicbrainz", "spotify", "lastfm"],
        "pc_game" | "game" => &["igdb", "steam"],
        "console_game" | "mobile_game" => &["igdb"],
        "ebook" => &["goodreads", "openlibrary"],
        "audiobook" => &["goodreads"],
        "youtube_video" => &["youtube"],
        "software" => &["github"],
        "podcast" => &["spotify"],
        _ => &["tmdb", "imdb"],
    }
}

/// One candidate returned by a provider search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub external_id: String,
    pub title: String,
    pub year: Option<i32>,
    pub rating: Option<f64>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    /// Provider's own confidence, the base of [relevance_score]
    pub relevance: f64,
}

/// A franchise or box set the title belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRef {
    pub external_id: String,
    pub name: String,
    pub cover_url: Option<String>,
}

/// Full record fetched from one provider for one title
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderMetadata {
    pub provider: String,
    pub external_id: String,
    /// Raw provider payload (JSON)
    pub data: String,
    pub rating: Option<f64>,
    pub review_url: Option<String>,
    pub cover_url: Option<String>,
    pub trailer_url: Option<String>,
    pub title: Option<String>,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub description: Option<String>,
    pub genres: Vec<String>,
    pub cast_crew: Option<CastCrew>,
    pub collection: Option<CollectionRef>,
}

/// The capability every metadata source offers
#[async_trait]
pub trait MetadataProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// False when the provider has no credentials configured
    fn is_enabled(&self) -> bool;

    async fn search(
        &self,
        query: &str,
        media_type: &str,
        year: Option<i32>,
    ) -> Result<Vec<SearchResult>>;

    async fn get_details(&self, external_id: &str, media_type: &str) -> Result<ProviderMetadata>;
}

/// The winning search result across providers
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    pub provider: String,
    pub result: SearchResult,
    pub score: f64,
}

/// Base relevance plus title, year and rating bonuses
pub fn relevance_score(result: &SearchResult, query: &str, year: Option<i32>) -> f64 {
    let mut score = result.relevance;

    let title = result.title.to_lowercase();
    let query = query.to_lowercase();
    if title == query {
        score += 0.3;
    } else if title.contains(&query) {
        score += 0.2;
    }

    if year.is_some() && result.year == year {
        score += 0.2;
    }

    if result.rating.is_some_and(|r| r > 0.0) {
        score += 0.1;
    }

    score
}

/// Fans searches out to the providers routed for a media type
pub struct ProviderAggregator {
    providers: HashMap<String, Arc<dyn MetadataProvider>>,
    timeout: Duration,
}

impl ProviderAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            timeout,
        }
    }

    /// Register every built-in provider, enabled or not
    pub fn from_config(config: &Config) -> Result<Self> {
        let timeout = config.provider_timeout;
        let mut aggregator = Self::new(timeout);

        let build = |e: anyhow::Error| CatalogError::Config(format!("{:#}", e));
        aggregator.register(Arc::new(
            TmdbProvider::new(config.api_key("tmdb"), timeout).map_err(build)?,
        ));
        aggregator.register(Arc::new(
            OmdbProvider::new(config.api_key("imdb"), timeout).map_err(build)?,
        ));
        aggregator.register(Arc::new(
            MusicBrainzProvider::new(config.musicbrainz_contact.as_deref(), timeout).map_err(build)?,
        ));
        aggregator.register(Arc::new(
            LastFmProvider::new(config.api_key("lastfm"), timeout).map_err(build)?,
        ));
        aggregator.register(Arc::new(
            OpenLibraryProvider::new(config.api_key("openlibrary"), timeout).map_err(build)?,
        ));

        let enabled: Vec<&str> = aggregator.enabled_providers().collect();
        info!(service = "providers", enabled = ?enabled, "Metadata providers registered");
        Ok(aggregator)
    }

    /// Add or replace a provider under its own name
    pub fn register(&mut self, provider: Arc<dyn MetadataProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &str> {
        self.providers
            .values()
            .filter(|p| p.is_enabled())
            .map(|p| p.name())
    }

    /// Registered and enabled providers routed for `media_type`, in order
    fn routed(&self, media_type: &str, subset: Option<&[&str]>) -> Vec<Arc<dyn MetadataProvider>> {
        let names = match subset {
            Some(names) if !names.is_empty() => names,
            _ => providers_for_type(media_type),
        };
        names
            .iter()
            .filter_map(|name| self.providers.get(*name))
            .filter(|p| p.is_enabled())
            .cloned()
            .collect()
    }

    /// Search every routed provider concurrently.
    ///
    /// Returns (provider, results) pairs in routing order, leaving out
    /// providers that failed, timed out, were cancelled or found nothing.
    pub async fn search_all(
        &self,
        query: &str,
        media_type: &str,
        year: Option<i32>,
        subset: Option<&[&str]>,
        cancel: &CancellationToken,
    ) -> Vec<(String, Vec<SearchResult>)> {
        let calls = self.routed(media_type, subset).into_iter().map(|provider| async move {
            let name = provider.name().to_string();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(CatalogError::Cancelled),
                r = tokio::time::timeout(self.timeout, provider.search(query, media_type, year)) => {
                    r.unwrap_or_else(|_| Err(CatalogError::provider(&name, "request timed out")))
                }
            };
            match outcome {
                Ok(results) if !results.is_empty() => Some((name, results)),
                Ok(_) => None,
                Err(e) if e.is_cancelled() => {
                    debug!(provider = %name, query = %query, "Provider search cancelled");
                    None
                }
                Err(e) => {
                    warn!(provider = %name, query = %query, error = %e, "Provider search failed");
                    None
                }
            }
        });

        join_all(calls).await.into_iter().flatten().collect()
    }

    /// Highest-scoring result across all routed providers. Ties keep the
    /// first seen in routing order.
    pub async fn get_best_match(
        &self,
        query: &str,
        media_type: &str,
        year: Option<i32>,
        cancel: &CancellationToken,
    ) -> Option<BestMatch> {
        let all = self.search_all(query, media_type, year, None, cancel).await;

        let mut best: Option<BestMatch> = None;
        let mut best_score = 0.0;
        for (provider, results) in all {
            for result in results {
                let score = relevance_score(&result, query, year);
                if score > best_score {
                    best_score = score;
                    best = Some(BestMatch {
                        provider: provider.clone(),
                        result,
                        score,
                    });
                }
            }
        }
        best
    }

    /// Full record from one provider
    pub async fn get_details(
        &self,
        provider: &str,
        external_id: &str,
        media_type: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderMetadata> {
        let p = self
            .providers
            .get(provider)
            .ok_or_else(|| CatalogError::not_found(format!("provider {}", provider)))?;
        if !p.is_enabled() {
            return Err(CatalogError::Disabled {
                provider: provider.to_string(),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(CatalogError::Cancelled),
            r = tokio::time::timeout(self.timeout, p.get_details(external_id, media_type)) => {
                r.unwrap_or_else(|_| Err(CatalogError::provider(provider, "request timed out")))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory provider with canned results
    pub struct StaticProvider {
        pub name: String,
        pub enabled: bool,
        pub results: Vec<SearchResult>,
        pub fail: bool,
        pub delay: Option<Duration>,
        pub calls: Mutex<u32>,
    }

    impl StaticProvider {
        pub fn new(name: &str, results: Vec<SearchResult>) -> Self {
            Self {
                name: name.to_string(),
                enabled: true,
                results,
                fail: false,
                delay: None,
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl MetadataProvider for StaticProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        async fn search(&self, _: &str, _: &str, _: Option<i32>) -> Result<Vec<SearchResult>> {
            *self.calls.lock() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(CatalogError::provider(&self.name, "connection reset"));
            }
            Ok(self.results.clone())
        }

        async fn get_details(&self, external_id: &str, _: &str) -> Result<ProviderMetadata> {
            Ok(ProviderMetadata {
                provider: self.name.clone(),
                external_id: external_id.to_string(),
                data: format!(r#"{{"id":"{}"}}"#, external_id),
                rating: Some(7.5),
                ..Default::default()
            })
        }
    }

    pub fn result(id: &str, title: &str, year: Option<i32>, relevance: f64) -> SearchResult {
        SearchResult {
            external_id: id.to_string(),
            title: title.to_string(),
            year,
            rating: None,
            description: None,
            cover_url: None,
            relevance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{StaticProvider, result};
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn aggregator(providers: Vec<StaticProvider>) -> ProviderAggregator {
        let mut agg = ProviderAggregator::new(Duration::from_secs(5));
        for p in providers {
            agg.register(Arc::new(p));
        }
        agg
    }

    // ===== Routing =====

    #[test]
    fn test_routing_table() {
        assert_eq!(providers_for_type("movie"), &["tmdb", "imdb"]);
        assert_eq!(providers_for_type("music"), &["musicbrainz", "spotify", "lastfm"]);
        assert_eq!(providers_for_type("anime"), &["anidb", "myanimelist", "tmdb"]);
        assert_eq!(providers_for_type("hologram"), &["tmdb", "imdb"]);
    }

    // ===== Relevance =====

    #[test]
    fn test_relevance_bonuses() {
        let mut r = result("1", "Heat", Some(1995), 0.8);
        assert!((relevance_score(&r, "heat", Some(1995)) - 1.3).abs() < 1e-9);
        assert!((relevance_score(&r, "hea", None) - 1.0).abs() < 1e-9);
        r.rating = Some(8.0);
        assert!((relevance_score(&r, "other", Some(2000)) - 0.9).abs() < 1e-9);
    }

    // ===== Aggregation =====

    #[tokio::test]
    async fn test_best_match_across_providers() {
        let agg = aggregator(vec![
            StaticProvider::new("tmdb", vec![result("1", "Heat Wave", Some(1995), 0.8)]),
            StaticProvider::new("imdb", vec![result("tt1", "Heat", Some(1995), 0.75)]),
        ]);
        let best = agg
            .get_best_match("Heat", "movie", Some(1995), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(best.provider, "imdb");
        assert_eq!(best.result.external_id, "tt1");
    }

    #[tokio::test]
    async fn test_ties_keep_routing_order() {
        let agg = aggregator(vec![
            StaticProvider::new("imdb", vec![result("tt1", "Heat", None, 0.8)]),
            StaticProvider::new("tmdb", vec![result("1", "Heat", None, 0.8)]),
        ]);
        let best = agg
            .get_best_match("Heat", "movie", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(best.provider, "tmdb");
    }

    #[tokio::test]
    async fn test_failures_and_disabled_are_skipped() {
        let mut failing = StaticProvider::new("tmdb", vec![result("1", "Heat", None, 0.8)]);
        failing.fail = true;
        let mut disabled = StaticProvider::new("imdb", vec![result("tt1", "Heat", None, 0.75)]);
        disabled.enabled = false;
        let agg = aggregator(vec![failing, disabled]);

        let all = agg
            .search_all("Heat", "movie", None, None, &CancellationToken::new())
            .await;
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_subset_overrides_routing() {
        let agg = aggregator(vec![
            StaticProvider::new("tmdb", vec![result("1", "Heat", None, 0.8)]),
            StaticProvider::new("lastfm", vec![result("x", "Heat", None, 0.6)]),
        ]);
        let all = agg
            .search_all("Heat", "movie", None, Some(&["lastfm"]), &CancellationToken::new())
            .await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "lastfm");
    }

    #[tokio::test]
    async fn test_cancellation_yields_no_result() {
        let mut slow = StaticProvider::new("tmdb", vec![result("1", "Heat", None, 0.8)]);
        slow.delay = Some(Duration::from_secs(30));
        let agg = aggregator(vec![slow]);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        assert!(agg.get_best_match("Heat", "movie", None, &token).await.is_none());
    }

    #[tokio::test]
    async fn test_get_details_errors() {
        let mut disabled = StaticProvider::new("imdb", vec![]);
        disabled.enabled = false;
        let agg = aggregator(vec![StaticProvider::new("tmdb", vec![]), disabled]);
        let token = CancellationToken::new();

        assert_matches!(
            agg.get_details("tvdb", "1", "movie", &token).await,
            Err(CatalogError::NotFound { .. })
        );
        assert_matches!(
            agg.get_details("imdb", "1", "movie", &token).await,
            Err(CatalogError::Disabled { .. })
        );
        let details = agg.get_details("tmdb", "949", "movie", &token).await.unwrap();
        assert_eq!(details.external_id, "949");
    }

    #[test]
    fn test_from_config_without_keys_disables_all() {
        let agg = ProviderAggregator::from_config(&Config::default()).unwrap();
        assert_eq!(agg.enabled_providers().count(), 0);
    }
}
