//! IMDb data through the OMDb API
//!
//! Registered as `imdb` so it answers the routing table's imdb slot.
//! OMDb reports misses as `{"Response":"False"}` with a 200 status.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{MetadataProvider, ProviderMetadata, SearchResult};
use crate::db::{Actor, CastCrew};
use crate::error::{CatalogError, Result};
use crate::services::rate_limiter::{RateLimitedClient, RetryConfig};

const NAME: &str = "imdb";
const BASE_URL: &str = "https://www.omdbapi.com/";
const BASE_RELEVANCE: f64 = 0.75;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OmdbSearchResponse {
    #[serde(rename = "Search")]
    search: Vec<OmdbSearchItem>,
    #[serde(rename = "Response")]
    response: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OmdbSearchItem {
    #[serde(rename = "Title")]
    title: String,
    #[serde(rename = "Year")]
    year: String,
    #[serde(rename = "imdbID")]
    imdb_id: String,
    #[serde(rename = "Poster")]
    poster: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OmdbDetails {
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "Title")]
    title: Option<String>,
    #[serde(rename = "Year")]
    year: Option<String>,
    #[serde(rename = "Genre")]
    genre: Option<String>,
    #[serde(rename = "Director")]
    director: Option<String>,
    #[serde(rename = "Writer")]
    writer: Option<String>,
    #[serde(rename = "Actors")]
    actors: Option<String>,
    #[serde(rename = "Plot")]
    plot: Option<String>,
    #[serde(rename = "Poster")]
    poster: Option<String>,
    #[serde(rename = "imdbRating")]
    imdb_rating: Option<String>,
}

/// OMDb uses "N/A" for every missing field
fn present(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s != "N/A")
}

/// Comma-separated OMDb list
fn split_list(s: Option<String>) -> Vec<String> {
    present(s)
        .map(|s| {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// "1995" or "2008–2013" (series) both start with the year
fn parse_year(s: &str) -> Option<i32> {
    s.get(..4).and_then(|y| y.parse().ok()).filter(|y| *y > 1900)
}

fn omdb_type(media_type: &str) -> Option<&'static str> {
    match media_type {
        "movie" | "documentary" => Some("movie"),
        "tv_show" | "anime" => Some("series"),
        _ => None,
    }
}

fn map_search(response: OmdbSearchResponse) -> Vec<SearchResult> {
    if response.response != "True" {
        return Vec::new();
    }
    response
        .search
        .into_iter()
        .filter(|item| !item.imdb_id.is_empty() && !item.title.is_empty())
        .map(|item| SearchResult {
            year: parse_year(&item.year),
            external_id: item.imdb_id,
            title: item.title,
            rating: None,
            description: None,
            cover_url: present(item.poster),
            relevance: BASE_RELEVANCE,
        })
        .collect()
}

fn map_details(external_id: &str, raw: serde_json::Value) -> Result<Option<ProviderMetadata>> {
    let data = raw.to_string();
    let details: OmdbDetails = serde_json::from_value(raw)?;
    if details.response != "True" {
        return Ok(None);
    }

    let mut cast_crew = CastCrew {
        director: present(details.director),
        writers: split_list(details.writer),
        ..Default::default()
    };
    cast_crew.actors = split_list(details.actors)
        .into_iter()
        .enumerate()
        .map(|(i, name)| Actor {
            name,
            character: None,
            order: i as i32,
        })
        .collect();

    Ok(Some(ProviderMetadata {
        provider: NAME.to_string(),
        external_id: external_id.to_string(),
        data,
        rating: present(details.imdb_rating)
            .and_then(|r| r.parse::<f64>().ok())
            .filter(|r| *r > 0.0),
        review_url: Some(format!("https://www.imdb.com/title/{}/", external_id)),
        cover_url: present(details.poster),
        trailer_url: None,
        title: present(details.title),
        original_title: None,
        year: present(details.year).as_deref().and_then(parse_year),
        description: present(details.plot),
        genres: split_list(details.genre),
        cast_crew: (!cast_crew.is_empty()).then_some(cast_crew),
        collection: None,
    }))
}

pub struct OmdbProvider {
    client: RateLimitedClient,
    api_key: Option<String>,
    retry_config: RetryConfig,
}

impl OmdbProvider {
    pub fn new(api_key: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: RateLimitedClient::for_omdb(timeout)?,
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
impl MetadataProvider for OmdbProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search(&self, query: &str, media_type: &str, year: Option<i32>) -> Result<Vec<SearchResult>> {
        let mut params = vec![("apikey", self.key()?), ("s", query.to_string())];
        if let Some(t) = omdb_type(media_type) {
            params.push(("type", t.to_string()));
        }
        if let Some(y) = year {
            params.push(("y", y.to_string()));
        }

        let response: Option<OmdbSearchResponse> = self
            .client
            .get_json(BASE_URL, &[], &params, &self.retry_config, "omdb_search")
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        let results = response.map(map_search).unwrap_or_default();
        debug!(provider = NAME, query = %query, count = results.len(), "Search returned results");
        Ok(results)
    }

    async fn get_details(&self, external_id: &str, _media_type: &str) -> Result<ProviderMetadata> {
        let params = [
            ("apikey", self.key()?),
            ("i", external_id.to_string()),
            ("plot", "full".to_string()),
        ];

        let raw: Option<serde_json::Value> = self
            .client
            .get_json(BASE_URL, &[], &params, &self.retry_config, "omdb_get_details")
            .await
            .map_err(|e| CatalogError::provider(NAME, format!("{:#}", e)))?;

        raw.map(|raw| map_details(external_id, raw))
            .transpose()?
            .flatten()
            .ok_or_else(|| CatalogError::not_found(format!("imdb {}", external_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_map_search() {
        let response: OmdbSearchResponse = serde_json::from_value(json!({
            "Search": [
                {"Title": "Heat", "Year": "1995", "imdbID": "tt0113277", "Type": "movie", "Poster": "N/A"},
                {"Title": "Breaking Bad", "Year": "2008–2013", "imdbID": "tt0903747", "Type": "series",
                 "Poster": "https://img/bb.jpg"}
            ],
            "totalResults": "2",
            "Response": "True"
        }))
        .unwrap();

        let results = map_search(response);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].external_id, "tt0113277");
        assert_eq!(results[0].year, Some(1995));
        assert_eq!(results[0].cover_url, None);
        assert_eq!(results[1].year, Some(2008));
        assert_eq!(results[1].relevance, BASE_RELEVANCE);
    }

    #[test]
    fn test_map_search_miss() {
        let response: OmdbSearchResponse =
            serde_json::from_value(json!({"Response": "False", "Error": "Movie not found!"})).unwrap();
        assert!(map_search(response).is_empty());
    }

    #[test]
    fn test_map_details() {
        let raw = json!({
            "Title": "Heat", "Year": "1995", "Genre": "Action, Crime, Drama",
            "Director": "Michael Mann", "Writer": "Michael Mann",
            "Actors": "Al Pacino, Robert De Niro", "Plot": "A group of thieves",
            "Poster": "N/A", "imdbRating": "8.3", "Response": "True"
        });
        let meta = map_details("tt0113277", raw).unwrap().unwrap();
        assert_eq!(meta.provider, "imdb");
        assert_eq!(meta.rating, Some(8.3));
        assert_eq!(meta.genres, vec!["Action", "Crime", "Drama"]);
        assert_eq!(meta.cover_url, None);
        assert_eq!(
            meta.review_url.as_deref(),
            Some("https://www.imdb.com/title/tt0113277/")
        );
        let cast = meta.cast_crew.unwrap();
        assert_eq!(cast.actors.len(), 2);
        assert_eq!(cast.actors[1].name, "Robert De Niro");
    }

    #[test]
    fn test_map_details_miss() {
        let raw = json!({"Response": "False", "Error": "Incorrect IMDb ID."});
        assert!(map_details("tt0", raw).unwrap().is_none());
    }

    #[test]
    fn test_type_filter() {
        assert_eq!(omdb_type("movie"), Some("movie"));
        assert_eq!(omdb_type("tv_show"), Some("series"));
        assert_eq!(omdb_type("music"), None);
    }
}
