//! TMDB (The Movie Database) provider
//!
//! Base URL: https://api.themoviedb.org/3
//!
//! TMDB allows ~40 requests per 10 seconds; the shared rate-limited client
//! keeps bursts under that.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{CollectionRef, MetadataProvider, ProviderMetadata, SearchResult};
use crate::db::{Actor, CastCrew};
use crate::error::{CatalogError, Result};
use crate::services::rate_limiter::{RateLimitedClient, RetryConfig};

const NAME: &str = "tmdb";
const BASE_URL: &str = "https://api.themoviedb.org/3";
const BASE_RELEVANCE: f64 = 0.8;
const MAX_ACTORS: usize = 10;

#[derive(Debug, Deserialize)]
struct TmdbSearchResponse {
    #[serde(default)]
    results: Vec<TmdbSearchItem>,
}

/// Movie and TV results share one shape; TV uses `name`/`first_air_date`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TmdbSearchItem {
    id: i64,
    title: Option<String>,
    name: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
    overview: Option<String>,
    poster_path: Option<String>,
    vote_average: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TmdbDetails {
    title: Option<String>,
    name: Option<String>,
    original_title: Option<String>,
    original_name: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
    overview: Option<String>,
    poster_path: Option<String>,
    homepage: Option<String>,
    vote_average: Option<f64>,
    genres: Vec<TmdbGenre>,
    credits: Option<TmdbCredits>,
    videos: Option<TmdbVideos>,
    belongs_to_collection: Option<TmdbCollectionInfo>,
}

#[derive(Debug, Deserialize)]
struct TmdbGenre {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TmdbCredits {
    cast: Vec<TmdbCastMember>,
    crew: Vec<TmdbCrewMember>,
}

#[derive(Debug, Deserialize)]
struct TmdbCastMember {
    name: String,
    character: Option<String>,
    #[serde(default)]
    order: i32,
}

#[derive(Debug, Deserialize)]
struct TmdbCrewMember {
    name: String,
    #[serde(default)]
    job: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TmdbVideos {
    results: Vec<TmdbVideo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TmdbVideo {
    site: String,
    key: String,
    #[serde(rename = "type")]
    video_type: String,
}

#[derive(Debug, Deserialize)]
struct TmdbCollectionInfo {
    id: i64,
    name: String,
    poster_path: Option<String>,
}

fn poster_url(path: Option<&str>) -> Option<String> {
    path.filter(|p| !p.is_empty())
        .map(|p| format!("https://image.tmdb.org/t/p/w500{}", p))
}

/// Year from a `YYYY-MM-DD` date, ignoring anything before 1900
fn year_of(date: Option<&str>) -> Option<i32> {
    date.and_then(|d| d.get(..4))
        .and_then(|y| y.parse().ok())
        .filter(|y| *y > 1900)
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

fn search_endpoint(media_type: &str) -> &'static str {
    match media_type {
        "movie" | "documentary" => "search/movie",
        "tv_show" | "anime" => "search/tv",
        _ => "search/multi",
    }
}

fn details_endpoint(media_type: &str) -> &'static str {
    match media_type {
        "tv_show" | "anime" => "tv",
        _ => "movie",
    }
}

fn map_search(response: TmdbSearchResponse) -> Vec<SearchResult> {
    response
        .results
        .into_iter()
        .filter_map(|item| {
            let title = non_empty(item.title).or(non_empty(item.name))?;
            let date = item.release_date.or(item.first_air_date);
            Some(SearchResult {
                external_id: item.id.to_string(),
                title,
                year: year_of(date.as_deref()),
                rating: item.vote_average.filter(|r| *r > 0.0),
                description: non_empty(item.overview),
                cover_url: poster_url(item.poster_path.as_deref()),
                relevance: BASE_RELEVANCE,
            })
        })
        .collect()
}

fn map_cast_crew(credits: TmdbCredits) -> Option<CastCrew> {
    let mut cast_crew = CastCrew::default();
    for member in credits.crew {
        match member.job.as_str() {
            "Director" if cast_crew.director.is_none() => cast_crew.director = Some(member.name),
            "Writer" | "Screenplay" => cast_crew.writers.push(member.name),
            "Producer" => cast_crew.producers.push(member.name),
            "Original Music Composer" => cast_crew.musicians.push(member.name),
            _ => {}
        }
    }

    let mut cast = credits.cast;
    cast.sort_by_key(|c| c.order);
    cast_crew.actors = cast
        .into_iter()
        .take(MAX_ACTORS)
        .map(|c| Actor {
            name: c.name,
            character: c.character,
            order: c.order,
        })
        .collect();

    (!cast_crew.is_empty()).then_some(cast_crew)
}

fn map_details(external_id: &str, raw: serde_json::Value) -> Result<ProviderMetadata> {
    let data = raw.to_string();
    let details: TmdbDetails = serde_json::from_value(raw)?;

    let trailer_url = details.videos.as_ref().and_then(|v| {
        v.results
            .iter()
            .find(|video| video.site == "YouTube" && video.video_type == "Trailer")
            .map(|video| format!("https://www.youtube.com/watch?v={}", video.key))
    });

    Ok(ProviderMetadata {
        provider: NAME.to_string(),
        external_id: external_id.to_string(),
        data,
        rating: details.vote_average.filter(|r| *r > 0.0),
        review_url: non_empty(details.homepage),
        cover_url: poster_url(details.poster_path.as_deref()),
        trailer_url,
        title: non_empty(details.title).or(non_empty(details.name)),
        original_title: non_empty(details.original_title).or(non_empty(details.original_name)),
        year: year_of(details.release_date.or(details.first_air_date).as_deref()),
        description: non_empty(details.overview),
        genres: details.genres.into_iter().map(|g| g.name).collect(),
        cast_crew: details.credits.and_then(map_cast_crew),
        collection: details.belongs_to_collection.map(|c| CollectionRef {
            external_id: c.id.to_string(),
            name: c.name,
            cover_url: poster_url(c.poster_path.as_deref()),
        }),
    })
}

pub struct TmdbProvider {
    client: RateLimitedClient,
    api_key: Option<String>,
    retry_config: RetryConfig,
}

impl TmdbProvider {
    pub fn new(api_key: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: RateLimitedClient::for_tmdb(timeout)?,
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
impl MetadataProvider for TmdbProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search(&self, query: &str, media_type: &str, year: Option<i32>) -> Result<Vec<SearchResult>> {
        let url = format!("{}/{}", BASE_URL, search_endpoint(media_type));
        let mut params = vec![
            ("api_key", self.key()?),
            ("query", query.to_string()),
            ("include_adult", "false".to_string()),
        ];
        if let Some(y) = year {
            params.push(("year", y.to_string()));
        }

        let response: Option<TmdbSearchResponse> = self
            .client
            .get_json(&url, &[], &params, &self.retry_config, "tmdb_search")
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        let results = response.map(map_search).unwrap_or_default();
        debug!(provider = NAME, query = %query, count = results.len(), "Search returned results");
        Ok(results)
    }

    async fn get_details(&self, external_id: &str, media_type: &str) -> Result<ProviderMetadata> {
        let url = format!("{}/{}/{}", BASE_URL, details_endpoint(media_type), external_id);
        let params = [
            ("api_key", self.key()?),
            ("append_to_response", "credits,videos,external_ids".to_string()),
        ];

        let raw: Option<serde_json::Value> = self
            .client
            .get_json(&url, &[], &params, &self.retry_config, "tmdb_get_details")
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        match raw {
            Some(raw) => map_details(external_id, raw),
            None => Err(CatalogError::not_found(format!("tmdb {}", external_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_endpoints_by_type() {
        assert_eq!(search_endpoint("movie"), "search/movie");
        assert_eq!(search_endpoint("tv_show"), "search/tv");
        assert_eq!(search_endpoint("music"), "search/multi");
        assert_eq!(details_endpoint("tv_show"), "tv");
        assert_eq!(details_endpoint("movie"), "movie");
    }

    #[test]
    fn test_map_search_handles_movies_and_tv() {
        let response: TmdbSearchResponse = serde_json::from_value(json!({
            "results": [
                {"id": 949, "title": "Heat", "release_date": "1995-12-15",
                 "overview": "A crew of thieves", "poster_path": "/heat.jpg", "vote_average": 7.9},
                {"id": 1396, "name": "Breaking Bad", "first_air_date": "2008-01-20", "vote_average": 0.0},
                {"id": 1, "title": ""}
            ]
        }))
        .unwrap();

        let results = map_search(response);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].external_id, "949");
        assert_eq!(results[0].year, Some(1995));
        assert_eq!(results[0].rating, Some(7.9));
        assert_eq!(
            results[0].cover_url.as_deref(),
            Some("https://image.tmdb.org/t/p/w500/heat.jpg")
        );
        assert_eq!(results[1].title, "Breaking Bad");
        assert_eq!(results[1].rating, None);
        assert_eq!(results[1].relevance, BASE_RELEVANCE);
    }

    #[test]
    fn test_map_details() {
        let raw = json!({
            "title": "Heat",
            "original_title": "Heat",
            "release_date": "1995-12-15",
            "vote_average": 7.9,
            "homepage": "https://example.com/heat",
            "poster_path": "/heat.jpg",
            "genres": [{"id": 28, "name": "Action"}, {"id": 80, "name": "Crime"}],
            "credits": {
                "cast": [
                    {"name": "Robert De Niro", "character": "Neil McCauley", "order": 1},
                    {"name": "Al Pacino", "character": "Vincent Hanna", "order": 0}
                ],
                "crew": [{"name": "Michael Mann", "job": "Director"}]
            },
            "videos": {"results": [
                {"site": "Vimeo", "key": "v1", "type": "Trailer"},
                {"site": "YouTube", "key": "abc", "type": "Trailer"}
            ]},
            "belongs_to_collection": null
        });

        let meta = map_details("949", raw).unwrap();
        assert_eq!(meta.provider, "tmdb");
        assert_eq!(meta.rating, Some(7.9));
        assert_eq!(meta.year, Some(1995));
        assert_eq!(meta.genres, vec!["Action", "Crime"]);
        assert_eq!(meta.review_url.as_deref(), Some("https://example.com/heat"));
        assert_eq!(
            meta.trailer_url.as_deref(),
            Some("https://www.youtube.com/watch?v=abc")
        );
        let cast = meta.cast_crew.unwrap();
        assert_eq!(cast.director.as_deref(), Some("Michael Mann"));
        assert_eq!(cast.actors[0].name, "Al Pacino");
        assert!(meta.collection.is_none());
        assert!(meta.data.contains("\"Heat\""));
    }

    #[test]
    fn test_map_details_collection() {
        let raw = json!({
            "title": "Alien",
            "belongs_to_collection": {"id": 8091, "name": "Alien Collection", "poster_path": "/a.jpg"}
        });
        let meta = map_details("348", raw).unwrap();
        let collection = meta.collection.unwrap();
        assert_eq!(collection.external_id, "8091");
        assert_eq!(collection.name, "Alien Collection");
        assert!(meta.cast_crew.is_none());
    }

    #[test]
    fn test_disabled_without_key() {
        let provider = TmdbProvider::new(Some(""), Duration::from_secs(5)).unwrap();
        assert!(!provider.is_enabled());
        let provider = TmdbProvider::new(Some("key"), Duration::from_secs(5)).unwrap();
        assert!(provider.is_enabled());
    }
}
