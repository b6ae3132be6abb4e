//! Rate limiting and retry logic for metadata provider calls
//!
//! Every provider talks to its API through a [RateLimitedClient] so bursts
//! of directory analyses cannot exceed the provider's published limits, and
//! transient failures are retried with exponential backoff.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: u32,
    /// Burst capacity (allows short bursts above the rate)
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            burst_size: 5,
        }
    }
}

/// A rate-limited HTTP client wrapper
pub struct RateLimitedClient {
    client: Client,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    name: String,
}

impl RateLimitedClient {
    /// Create a new rate-limited client. `timeout` bounds each request.
    pub fn new(name: &str, config: RateLimitConfig, timeout: Duration) -> Result<Self> {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("catalog-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            limiter: Arc::new(RateLimiter::direct(quota)),
            name: name.to_string(),
        })
    }

    /// Create a client for TMDB API
    pub fn for_tmdb(timeout: Duration) -> Result<Self> {
        // TMDB allows ~40 requests per 10 seconds, so ~4/sec with burst of 10
        Self::new(
            "tmdb",
            RateLimitConfig {
                requests_per_second: 4,
                burst_size: 10,
            },
            timeout,
        )
    }

    /// Create a client for MusicBrainz API
    pub fn for_musicbrainz(timeout: Duration) -> Result<Self> {
        // MusicBrainz requires max 1 request per second
        Self::new(
            "musicbrainz",
            RateLimitConfig {
                requests_per_second: 1,
                burst_size: 1,
            },
            timeout,
        )
    }

    /// Create a client for OMDb (IMDb data)
    pub fn for_omdb(timeout: Duration) -> Result<Self> {
        // Free OMDb keys are capped daily; keep the rate low
        Self::new(
            "imdb",
            RateLimitConfig {
                requests_per_second: 2,
                burst_size: 4,
            },
            timeout,
        )
    }

    /// Create a client for Last.fm API
    pub fn for_lastfm(timeout: Duration) -> Result<Self> {
        // Last.fm asks for no more than 5 requests per second
        Self::new(
            "lastfm",
            RateLimitConfig {
                requests_per_second: 5,
                burst_size: 5,
            },
            timeout,
        )
    }

    /// Create a client for Open Library
    pub fn for_openlibrary(timeout: Duration) -> Result<Self> {
        Self::new("openlibrary", RateLimitConfig::default(), timeout)
    }

    /// Wait for rate limit and make a GET request with headers and query parameters
    pub async fn get_with_headers_and_query<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        query: &T,
    ) -> Result<Response> {
        self.wait_for_permit().await;
        debug!(client = %self.name, url = %url, "Making rate-limited GET request");

        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(*key, *value);
        }
        request
            .query(query)
            .send()
            .await
            .context("HTTP request failed")
    }

    /// GET and decode a JSON body, retrying rate limits and server errors.
    /// A 404 decodes to `None`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        query: &[(&str, String)],
        retry_config: &RetryConfig,
        operation_name: &str,
    ) -> Result<Option<T>> {
        retry_async(
            || async move {
                let response = self.get_with_headers_and_query(url, headers, query).await?;

                if response.is_rate_limited() {
                    warn!(client = %self.name, "Rate limit hit, will retry");
                    anyhow::bail!("Rate limited (429)");
                }
                if response.status().as_u16() == 404 {
                    return Ok(None);
                }
                if response.status().as_u16() == 401 {
                    anyhow::bail!("{} API key is invalid", self.name);
                }
                if !response.status().is_success() {
                    anyhow::bail!("{} request failed with status: {}", self.name, response.status());
                }

                let body: T = response
                    .json()
                    .await
                    .with_context(|| format!("Failed to parse {} response", self.name))?;
                Ok(Some(body))
            },
            retry_config,
            operation_name,
        )
        .await
    }

    /// Wait for a rate limit permit
    pub async fn wait_for_permit(&self) {
        self.limiter.until_ready().await;
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_interval: Duration,
    /// Maximum backoff duration
    pub max_interval: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create an ExponentialBackoff from this config
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        }
    }
}

/// Execute an async operation with retry logic
pub async fn retry_async<T, E, Fut, F>(
    operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut backoff = config.to_backoff();

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= config.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempts = attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                match backoff.next_backoff() {
                    Some(duration) => {
                        warn!(
                            operation = %operation_name,
                            attempt = attempts,
                            error = %e,
                            retry_in_ms = duration.as_millis() as u64,
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(duration).await;
                    }
                    None => return Err(e),
                }
            }
        }
    }
}

/// Helper trait for retrying HTTP responses that might indicate rate limiting
pub trait ResponseExt {
    /// Check if the response indicates rate limiting (429)
    fn is_rate_limited(&self) -> bool;

    /// Check if the response indicates a transient error that should be retried
    fn is_transient_error(&self) -> bool;
}

impl ResponseExt for Response {
    fn is_rate_limited(&self) -> bool {
        self.status().as_u16() == 429
    }

    fn is_transient_error(&self) -> bool {
        let status = self.status().as_u16();
        // 429 (rate limit), 500-599 (server errors), 408 (timeout)
        status == 429 || status == 408 || (500..600).contains(&status)
    }
}
