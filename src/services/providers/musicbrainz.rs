//! MusicBrainz provider for album metadata
//!
//! Base URL: https://musicbrainz.org/ws/2
//!
//! No API key, but MusicBrainz requires a User-Agent naming a contact and
//! at most one request per second. The provider is enabled only when a
//! contact is configured.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{MetadataProvider, ProviderMetadata, SearchResult};
use crate::db::CastCrew;
use crate::error::{CatalogError, Result};
use crate::services::rate_limiter::{RateLimitedClient, RetryConfig};

const NAME: &str = "musicbrainz";
const BASE_URL: &str = "https://musicbrainz.org/ws/2";
const BASE_RELEVANCE: f64 = 0.7;
const SEARCH_LIMIT: &str = "25";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReleaseGroupSearch {
    #[serde(rename = "release-groups")]
    release_groups: Vec<ReleaseGroup>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReleaseGroup {
    id: String,
    title: String,
    #[serde(rename = "first-release-date")]
    first_release_date: Option<String>,
    #[serde(rename = "artist-credit")]
    artist_credit: Vec<ArtistCredit>,
    disambiguation: Option<String>,
    score: Option<i32>,
    genres: Vec<Tag>,
    tags: Vec<Tag>,
    rating: Option<Rating>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ArtistCredit {
    name: Option<String>,
    artist: Option<Artist>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Artist {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Tag {
    name: String,
    count: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Rating {
    value: Option<f64>,
}

impl ReleaseGroup {
    fn year(&self) -> Option<i32> {
        self.first_release_date
            .as_deref()
            .and_then(|d| d.split('-').next())
            .and_then(|y| y.parse().ok())
            .filter(|y| *y > 1900)
    }

    fn artist_names(&self) -> Vec<String> {
        self.artist_credit
            .iter()
            .filter_map(|c| {
                c.name
                    .clone()
                    .or_else(|| c.artist.as_ref().map(|a| a.name.clone()))
            })
            .filter(|n| !n.is_empty())
            .collect()
    }
}

/// Escape Lucene special characters in search terms
fn escape_lucene(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(
            c,
            '+' | '-' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '"' | '~' | '*' | '?' | ':' | '\\' | '/'
        ) {
            result.push('\\');
        }
        result.push(c);
    }
    result
}

/// "Artist - Album" narrows the search to that artist
fn build_query(query: &str, year: Option<i32>) -> String {
    let mut lucene = match query.split_once(" - ") {
        Some((artist, album)) if !artist.trim().is_empty() && !album.trim().is_empty() => format!(
            "artist:\"{}\" AND releasegroup:\"{}\"",
            escape_lucene(artist.trim()),
            escape_lucene(album.trim())
        ),
        _ => format!(
            "(releasegroup:\"{}\" OR releasegroup:({}))",
            escape_lucene(query),
            escape_lucene(query)
        ),
    };
    if let Some(y) = year {
        lucene.push_str(&format!(" AND firstreleasedate:{}", y));
    }
    lucene
}

fn cover_url(release_group_id: &str) -> String {
    format!("https://coverartarchive.org/release-group/{}/front-250", release_group_id)
}

fn map_search(search: ReleaseGroupSearch) -> Vec<SearchResult> {
    let mut groups = search.release_groups;
    groups.sort_by(|a, b| b.score.unwrap_or(0).cmp(&a.score.unwrap_or(0)));
    groups
        .into_iter()
        .filter(|g| !g.id.is_empty() && !g.title.is_empty())
        .map(|g| {
            let artists = g.artist_names();
            SearchResult {
                year: g.year(),
                description: (!artists.is_empty()).then(|| artists.join(", ")),
                cover_url: Some(cover_url(&g.id)),
                external_id: g.id,
                title: g.title,
                rating: None,
                relevance: BASE_RELEVANCE,
            }
        })
        .collect()
}

fn map_details(external_id: &str, raw: serde_json::Value) -> Result<ProviderMetadata> {
    let data = raw.to_string();
    let group: ReleaseGroup = serde_json::from_value(raw)?;

    let source = if group.genres.is_empty() {
        &group.tags
    } else {
        &group.genres
    };
    let mut tags: Vec<&Tag> = source.iter().collect();
    tags.sort_by(|a, b| b.count.cmp(&a.count));
    let genres = tags.into_iter().take(5).map(|t| t.name.clone()).collect();

    let musicians = group.artist_names();
    let cast_crew = (!musicians.is_empty()).then(|| CastCrew {
        musicians,
        ..Default::default()
    });

    Ok(ProviderMetadata {
        provider: NAME.to_string(),
        external_id: external_id.to_string(),
        data,
        // 0-5 stars, scaled to match the other providers' 0-10
        rating: group
            .rating
            .as_ref()
            .and_then(|r| r.value)
            .filter(|v| *v > 0.0)
            .map(|v| v * 2.0),
        review_url: Some(format!("https://musicbrainz.org/release-group/{}", external_id)),
        cover_url: Some(cover_url(external_id)),
        trailer_url: None,
        year: group.year(),
        title: Some(group.title).filter(|t| !t.is_empty()),
        original_title: None,
        description: group.disambiguation.filter(|d| !d.is_empty()),
        genres,
        cast_crew,
        collection: None,
    })
}

pub struct MusicBrainzProvider {
    client: RateLimitedClient,
    user_agent: Option<String>,
    retry_config: RetryConfig,
}

impl MusicBrainzProvider {
    pub fn new(contact: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: RateLimitedClient::for_musicbrainz(timeout)?,
            user_agent: contact.filter(|c| !c.is_empty()).map(|c| {
                format!("catalog-core/{} ( {} )", env!("CARGO_PKG_VERSION"), c)
            }),
            retry_config: RetryConfig {
                initial_interval: Duration::from_secs(1),
                ..Default::default()
            },
        })
    }

    fn user_agent(&self) -> Result<&str> {
        self.user_agent.as_deref().ok_or_else(|| CatalogError::Disabled {
            provider: NAME.to_string(),
        })
    }
}

#[async_trait]
impl MetadataProvider for MusicBrainzProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn is_enabled(&self) -> bool {
        self.user_agent.is_some()
    }

    async fn search(&self, query: &str, _media_type: &str, year: Option<i32>) -> Result<Vec<SearchResult>> {
        let url = format!("{}/release-group", BASE_URL);
        let params = [
            ("query", build_query(query, year)),
            ("fmt", "json".to_string()),
            ("limit", SEARCH_LIMIT.to_string()),
        ];

        let response: Option<ReleaseGroupSearch> = self
            .client
            .get_json(
                &url,
                &[("User-Agent", self.user_agent()?)],
                &params,
                &self.retry_config,
                "musicbrainz_search",
            )
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        let results = response.map(map_search).unwrap_or_default();
        debug!(provider = NAME, query = %query, count = results.len(), "Search returned results");
        Ok(results)
    }

    async fn get_details(&self, external_id: &str, _media_type: &str) -> Result<ProviderMetadata> {
        let url = format!("{}/release-group/{}", BASE_URL, external_id);
        let params = [
            ("inc", "artist-credits+genres+tags+ratings".to_string()),
            ("fmt", "json".to_string()),
        ];

        let raw: Option<serde_json::Value> = self
            .client
            .get_json(
                &url,
                &[("User-Agent", self.user_agent()?)],
                &params,
                &self.retry_config,
                "musicbrainz_get_details",
            )
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        match raw {
            Some(raw) => map_details(external_id, raw),
            None => Err(CatalogError::not_found(format!("musicbrainz {}", external_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_escape_lucene() {
        assert_eq!(escape_lucene("AC/DC"), "AC\\/DC");
        assert_eq!(escape_lucene("What?"), "What\\?");
        assert_eq!(escape_lucene("Plain"), "Plain");
    }

    #[test]
    fn test_build_query() {
        assert_eq!(
            build_query("Radiohead - OK Computer", Some(1997)),
            "artist:\"Radiohead\" AND releasegroup:\"OK Computer\" AND firstreleasedate:1997"
        );
        assert_eq!(
            build_query("Kid A", None),
            "(releasegroup:\"Kid A\" OR releasegroup:(Kid A))"
        );
    }

    #[test]
    fn test_map_search_sorts_by_score() {
        let search: ReleaseGroupSearch = serde_json::from_value(json!({
            "release-groups": [
                {"id": "b", "title": "OK Computer OKNOTOK", "score": 80, "first-release-date": "2017-06-23"},
                {"id": "a", "title": "OK Computer", "score": 100, "first-release-date": "1997-05-21",
                 "artist-credit": [{"name": "Radiohead", "artist": {"name": "Radiohead"}}]}
            ]
        }))
        .unwrap();

        let results = map_search(search);
        assert_eq!(results[0].external_id, "a");
        assert_eq!(results[0].year, Some(1997));
        assert_eq!(results[0].description.as_deref(), Some("Radiohead"));
        assert_eq!(
            results[0].cover_url.as_deref(),
            Some("https://coverartarchive.org/release-group/a/front-250")
        );
        assert_eq!(results[1].description, None);
    }

    #[test]
    fn test_map_details() {
        let raw = json!({
            "id": "a", "title": "OK Computer", "first-release-date": "1997-05-21",
            "artist-credit": [{"name": "Radiohead"}],
            "genres": [{"name": "rock", "count": 3}, {"name": "art rock", "count": 9}],
            "rating": {"value": 4.5, "votes-count": 20}
        });
        let meta = map_details("a", raw).unwrap();
        assert_eq!(meta.genres, vec!["art rock", "rock"]);
        assert_eq!(meta.rating, Some(9.0));
        assert_eq!(meta.year, Some(1997));
        assert_eq!(meta.cast_crew.unwrap().musicians, vec!["Radiohead"]);
    }

    #[test]
    fn test_requires_contact() {
        let provider = MusicBrainzProvider::new(None, Duration::from_secs(5)).unwrap();
        assert!(!provider.is_enabled());
        let provider = MusicBrainzProvider::new(Some("ops@example.com"), Duration::from_secs(5)).unwrap();
        assert!(provider.is_enabled());
    }
}
