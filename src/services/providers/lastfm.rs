//! Last.fm provider for album lookups
//!
//! Base URL: https://ws.audioscrobbler.com/2.0/
//!
//! Last.fm returns errors as `{"error": N, "message": ...}` with a 200
//! status, and reports numbers as strings.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{MetadataProvider, ProviderMetadata, SearchResult};
use crate::db::CastCrew;
use crate::error::{CatalogError, Result};
use crate::services::rate_limiter::{RateLimitedClient, RetryConfig};

const NAME: &str = "lastfm";
const BASE_URL: &str = "https://ws.audioscrobbler.com/2.0/";
const BASE_RELEVANCE: f64 = 0.6;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlbumSearchResponse {
    results: Option<AlbumSearchResults>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlbumSearchResults {
    albummatches: AlbumMatches,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlbumMatches {
    album: Vec<LastFmAlbum>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LastFmAlbum {
    name: String,
    artist: String,
    url: Option<String>,
    mbid: Option<String>,
    image: Vec<LastFmImage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LastFmImage {
    #[serde(rename = "#text")]
    url: String,
    size: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlbumInfoResponse {
    error: Option<i32>,
    album: Option<AlbumInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlbumInfo {
    name: String,
    artist: String,
    url: Option<String>,
    image: Vec<LastFmImage>,
    tags: Option<TagList>,
    wiki: Option<Wiki>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TagList {
    tag: Vec<NamedTag>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NamedTag {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Wiki {
    summary: Option<String>,
}

/// Largest non-empty image
fn best_image(images: &[LastFmImage]) -> Option<String> {
    const ORDER: [&str; 5] = ["mega", "extralarge", "large", "medium", "small"];
    ORDER.iter().find_map(|size| {
        images
            .iter()
            .find(|i| i.size == *size && !i.url.is_empty())
            .map(|i| i.url.clone())
    })
}

/// Albums are addressed as "artist|album" when Last.fm has no MBID
fn external_id(album: &LastFmAlbum) -> String {
    album
        .mbid
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("{}|{}", album.artist, album.name))
}

fn map_search(response: AlbumSearchResponse) -> Vec<SearchResult> {
    let Some(results) = response.results else {
        return Vec::new();
    };
    results
        .albummatches
        .album
        .into_iter()
        .filter(|a| !a.name.is_empty())
        .map(|a| SearchResult {
            external_id: external_id(&a),
            cover_url: best_image(&a.image),
            description: Some(a.artist.clone()).filter(|s| !s.is_empty()),
            title: a.name,
            year: None,
            rating: None,
            relevance: BASE_RELEVANCE,
        })
        .collect()
}

fn map_details(external_id: &str, raw: serde_json::Value) -> Result<Option<ProviderMetadata>> {
    let data = raw.to_string();
    let response: AlbumInfoResponse = serde_json::from_value(raw)?;
    if response.error.is_some() {
        return Ok(None);
    }
    let Some(album) = response.album else {
        return Ok(None);
    };

    let cast_crew = (!album.artist.is_empty()).then(|| CastCrew {
        musicians: vec![album.artist.clone()],
        ..Default::default()
    });

    Ok(Some(ProviderMetadata {
        provider: NAME.to_string(),
        external_id: external_id.to_string(),
        data,
        rating: None,
        review_url: album.url.filter(|u| !u.is_empty()),
        cover_url: best_image(&album.image),
        trailer_url: None,
        title: Some(album.name).filter(|n| !n.is_empty()),
        original_title: None,
        year: None,
        description: album
            .wiki
            .and_then(|w| w.summary)
            .filter(|s| !s.trim().is_empty()),
        genres: album
            .tags
            .map(|t| t.tag.into_iter().map(|t| t.name).collect())
            .unwrap_or_default(),
        cast_crew,
        collection: None,
    }))
}

/// Query params selecting an album by MBID or by "artist|album"
fn lookup_params(external_id: &str) -> Vec<(&'static str, String)> {
    match external_id.split_once('|') {
        Some((artist, album)) => vec![("artist", artist.to_string()), ("album", album.to_string())],
        None => vec![("mbid", external_id.to_string())],
    }
}

pub struct LastFmProvider {
    client: RateLimitedClient,
    api_key: Option<String>,
    retry_config: RetryConfig,
}

impl LastFmProvider {
    pub fn new(api_key: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: RateLimitedClient::for_lastfm(timeout)?,
            api_key: api_key.filter(|k| !k.is_empty()).map(str::to_string),
            retry_config: RetryConfig::default(),
        })
    }

    fn key(&self) -> Result<String> {
        self.api_key.clone().ok_or_else(|| CatalogError::Disabled {
            provider: NAME.to_string(),
        })
    }
}

#[async_trait]
impl MetadataProvider for LastFmProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search(&self, query: &str, _media_type: &str, _year: Option<i32>) -> Result<Vec<SearchResult>> {
        let params = [
            ("method", "album.search".to_string()),
            ("album", query.to_string()),
            ("api_key", self.key()?),
            ("format", "json".to_string()),
            ("limit", "20".to_string()),
        ];

        let response: Option<AlbumSearchResponse> = self
            .client
            .get_json(BASE_URL, &[], &params, &self.retry_config, "lastfm_search")
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        let results = response.map(map_search).unwrap_or_default();
        debug!(provider = NAME, query = %query, count = results.len(), "Search returned results");
        Ok(results)
    }

    async fn get_details(&self, external_id: &str, _media_type: &str) -> Result<ProviderMetadata> {
        let mut params = vec![
            ("method", "album.getinfo".to_string()),
            ("api_key", self.key()?),
            ("format", "json".to_string()),
        ];
        params.extend(lookup_params(external_id));

        let raw: Option<serde_json::Value> = self
            .client
            .get_json(BASE_URL, &[], &params, &self.retry_config, "lastfm_get_details")
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        raw.map(|raw| map_details(external_id, raw))
            .transpose()?
            .flatten()
            .ok_or_else(|| CatalogError::not_found(format!("lastfm {}", external_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_map_search() {
        let response: AlbumSearchResponse = serde_json::from_value(json!({
            "results": {"albummatches": {"album": [
                {"name": "Kid A", "artist": "Radiohead", "mbid": "",
                 "image": [{"#text": "https://img/s.png", "size": "small"},
                           {"#text": "https://img/xl.png", "size": "extralarge"}]},
                {"name": "Amnesiac", "artist": "Radiohead", "mbid": "mb-1", "image": []}
            ]}}
        }))
        .unwrap();

        let results = map_search(response);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].external_id, "Radiohead|Kid A");
        assert_eq!(results[0].cover_url.as_deref(), Some("https://img/xl.png"));
        assert_eq!(results[1].external_id, "mb-1");
        assert_eq!(results[1].relevance, BASE_RELEVANCE);
    }

    #[test]
    fn test_map_details() {
        let raw = json!({"album": {
            "name": "Kid A", "artist": "Radiohead", "url": "https://www.last.fm/music/Radiohead/Kid+A",
            "tags": {"tag": [{"name": "electronic"}, {"name": "experimental"}]},
            "wiki": {"summary": "Fourth studio album"}
        }});
        let meta = map_details("Radiohead|Kid A", raw).unwrap().unwrap();
        assert_eq!(meta.genres, vec!["electronic", "experimental"]);
        assert_eq!(meta.description.as_deref(), Some("Fourth studio album"));
        assert_eq!(meta.cast_crew.unwrap().musicians, vec!["Radiohead"]);
    }

    #[test]
    fn test_error_payload_is_a_miss() {
        let raw = json!({"error": 6, "message": "Album not found"});
        assert!(map_details("x", raw).unwrap().is_none());
    }

    #[test]
    fn test_lookup_params() {
        assert_eq!(
            lookup_params("Radiohead|Kid A"),
            vec![("artist", "Radiohead".to_string()), ("album", "Kid A".to_string())]
        );
        assert_eq!(lookup_params("mb-1"), vec![("mbid", "mb-1".to_string())]);
    }
}
