//! Open Library provider for books
//!
//! Base URL: https://openlibrary.org
//!
//! The API needs no key. The provider is opt-in: it is enabled when an
//! `OPENLIBRARY_API_KEY` entry is configured, whatever its value.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{MetadataProvider, ProviderMetadata, SearchResult};
use crate::error::{CatalogError, Result};
use crate::services::rate_limiter::{RateLimitedClient, RetryConfig};

const NAME: &str = "openlibrary";
const BASE_URL: &str = "https://openlibrary.org";
const BASE_RELEVANCE: f64 = 0.7;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResponse {
    docs: Vec<SearchDoc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchDoc {
    key: String,
    title: String,
    author_name: Vec<String>,
    first_publish_year: Option<i32>,
    cover_i: Option<i64>,
    ratings_average: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Work {
    title: Option<String>,
    description: Option<TextValue>,
    subjects: Vec<String>,
    covers: Vec<i64>,
    first_publish_date: Option<String>,
}

/// Descriptions come either as a plain string or as `{"type", "value"}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TextValue {
    Plain(String),
    Typed { value: String },
}

impl TextValue {
    fn into_string(self) -> String {
        match self {
            TextValue::Plain(s) => s,
            TextValue::Typed { value } => value,
        }
    }
}

fn cover_url(cover_id: i64) -> String {
    format!("https://covers.openlibrary.org/b/id/{}-L.jpg", cover_id)
}

/// "/works/OL45883W" -> "OL45883W"
fn work_id(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Last 4-digit run in a free-form date like "March 1, 1951"
fn year_in(date: &str) -> Option<i32> {
    date.split(|c: char| !c.is_ascii_digit())
        .filter(|p| p.len() == 4)
        .filter_map(|p| p.parse().ok())
        .next_back()
}

fn map_search(response: SearchResponse) -> Vec<SearchResult> {
    response
        .docs
        .into_iter()
        .filter(|d| !d.key.is_empty() && !d.title.is_empty())
        .map(|d| SearchResult {
            external_id: work_id(&d.key).to_string(),
            year: d.first_publish_year,
            rating: d.ratings_average.filter(|r| *r > 0.0).map(|r| r * 2.0),
            description: (!d.author_name.is_empty()).then(|| d.author_name.join(", ")),
            cover_url: d.cover_i.filter(|c| *c > 0).map(cover_url),
            title: d.title,
            relevance: BASE_RELEVANCE,
        })
        .collect()
}

fn map_details(external_id: &str, raw: serde_json::Value) -> Result<ProviderMetadata> {
    let data = raw.to_string();
    let work: Work = serde_json::from_value(raw)?;

    Ok(ProviderMetadata {
        provider: NAME.to_string(),
        external_id: external_id.to_string(),
        data,
        rating: None,
        review_url: Some(format!("{}/works/{}", BASE_URL, external_id)),
        cover_url: work.covers.iter().copied().find(|c| *c > 0).map(cover_url),
        trailer_url: None,
        title: work.title.filter(|t| !t.is_empty()),
        original_title: None,
        year: work.first_publish_date.as_deref().and_then(year_in),
        description: work
            .description
            .map(TextValue::into_string)
            .filter(|d| !d.trim().is_empty()),
        genres: work.subjects.into_iter().take(5).collect(),
        cast_crew: None,
        collection: None,
    })
}

pub struct OpenLibraryProvider {
    client: RateLimitedClient,
    enabled: bool,
    retry_config: RetryConfig,
}

impl OpenLibraryProvider {
    pub fn new(api_key: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: RateLimitedClient::for_openlibrary(timeout)?,
            enabled: api_key.is_some(),
            retry_config: RetryConfig::default(),
        })
    }
}

#[async_trait]
impl MetadataProvider for OpenLibraryProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn search(&self, query: &str, _media_type: &str, _year: Option<i32>) -> Result<Vec<SearchResult>> {
        let url = format!("{}/search.json", BASE_URL);
        let params = [
            ("title", query.to_string()),
            ("limit", "20".to_string()),
            (
                "fields",
                "key,title,author_name,first_publish_year,cover_i,ratings_average".to_string(),
            ),
        ];

        let response: Option<SearchResponse> = self
            .client
            .get_json(&url, &[], &params, &self.retry_config, "openlibrary_search")
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        let results = response.map(map_search).unwrap_or_default();
        debug!(provider = NAME, query = %query, count = results.len(), "Search returned results");
        Ok(results)
    }

    async fn get_details(&self, external_id: &str, _media_type: &str) -> Result<ProviderMetadata> {
        let url = format!("{}/works/{}.json", BASE_URL, external_id);

        let raw: Option<serde_json::Value> = self
            .client
            .get_json(&url, &[], &[], &self.retry_config, "openlibrary_get_details")
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        match raw {
            Some(raw) => map_details(external_id, raw),
            None => Err(CatalogError::not_found(format!("openlibrary {}", external_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_map_search() {
        let response: SearchResponse = serde_json::from_value(json!({
            "numFound": 2,
            "docs": [
                {"key": "/works/OL45883W", "title": "Dune", "author_name": ["Frank Herbert"],
                 "first_publish_year": 1965, "cover_i": 11481354, "ratings_average": 4.2},
                {"key": "/works/OL1W", "title": "Dune Messiah"}
            ]
        }))
        .unwrap();

        let results = map_search(response);
        assert_eq!(results[0].external_id, "OL45883W");
        assert_eq!(results[0].year, Some(1965));
        assert_eq!(results[0].description.as_deref(), Some("Frank Herbert"));
        assert_eq!(
            results[0].cover_url.as_deref(),
            Some("https://covers.openlibrary.org/b/id/11481354-L.jpg")
        );
        assert_eq!(results[1].cover_url, None);
    }

    #[test]
    fn test_map_details_typed_description() {
        let raw = json!({
            "title": "Dune",
            "description": {"type": "/type/text", "value": "Desert planet"},
            "subjects": ["Science fiction", "Arrakis"],
            "covers": [-1, 42],
            "first_publish_date": "August 1, 1965"
        });
        let meta = map_details("OL45883W", raw).unwrap();
        assert_eq!(meta.description.as_deref(), Some("Desert planet"));
        assert_eq!(meta.year, Some(1965));
        assert_eq!(meta.cover_url.as_deref(), Some("https://covers.openlibrary.org/b/id/42-L.jpg"));
        assert_eq!(meta.genres.len(), 2);
    }

    #[test]
    fn test_plain_description() {
        let meta = map_details("OL1W", json!({"description": "Plain text"})).unwrap();
        assert_eq!(meta.description.as_deref(), Some("Plain text"));
    }

    #[test]
    fn test_opt_in() {
        let timeout = Duration::from_secs(5);
        assert!(!OpenLibraryProvider::new(None, timeout).unwrap().is_enabled());
        assert!(OpenLibraryProvider::new(Some("on"), timeout).unwrap().is_enabled());
    }
}
