//! Client for the broadcaster's schedule feed and stream configuration.
//!
//! The series catalogue and the area-to-HLS table are cached process-wide
//! with a 6-hour TTL; refreshes are lazy and coalesced. Transient network
//! failures are retried with bounded exponential backoff; HTTP 404 and
//! payload-level 404-shaped errors are empty results, not failures.

pub mod cache;
pub mod normalise;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::domain::{BroadcastEvent, Series, ServiceId};
use crate::error::{Error, Result};
use cache::SingleFlightCache;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// How a caller names the series whose events it wants.
#[derive(Debug, Clone)]
pub enum SeriesSelector {
    Code(String),
    Id(i64),
    Url(String),
}

type HlsSourceMap = HashMap<(String, ServiceId), String>;

/// The upstream contract as the rest of the application sees it; tests
/// plug in a fake feed.
#[async_trait::async_trait]
pub trait ScheduleFeed: Send + Sync {
    async fn list_series(&self) -> Result<Arc<Vec<Series>>>;

    async fn resolve_series_code(&self, series_url: &str) -> Result<Option<String>>;

    async fn fetch_events(
        &self,
        selector: &SeriesSelector,
        horizon_end: DateTime<Utc>,
    ) -> Result<Vec<BroadcastEvent>>;

    async fn fetch_hls_source(&self, service_id: ServiceId, area_id: &str) -> Result<String>;
}

#[async_trait::async_trait]
impl ScheduleFeed for UpstreamClient {
    async fn list_series(&self) -> Result<Arc<Vec<Series>>> {
        UpstreamClient::list_series(self).await
    }

    async fn resolve_series_code(&self, series_url: &str) -> Result<Option<String>> {
        UpstreamClient::resolve_series_code(self, series_url).await
    }

    async fn fetch_events(
        &self,
        selector: &SeriesSelector,
        horizon_end: DateTime<Utc>,
    ) -> Result<Vec<BroadcastEvent>> {
        UpstreamClient::fetch_events(self, selector, horizon_end).await
    }

    async fn fetch_hls_source(&self, service_id: ServiceId, area_id: &str) -> Result<String> {
        UpstreamClient::fetch_hls_source(self, service_id, area_id).await
    }
}

pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamConfig,
    series: SingleFlightCache<Arc<Vec<Series>>>,
    hls_sources: SingleFlightCache<Arc<HlsSourceMap>>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig, cache_ttl: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            series: SingleFlightCache::new(cache_ttl),
            hls_sources: SingleFlightCache::new(cache_ttl),
        })
    }

    /// GET a JSON document. `Ok(None)` means "upstream says there is
    /// nothing here" (HTTP 404 or a 404-shaped payload).
    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            // Each arm either returns a final outcome or yields the
            // transient failure to retry.
            let transient: String = match self.http.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        let payload = response.json::<Value>().await.map_err(|e| {
                            Error::UpstreamMalformed(format!("{url}: invalid JSON: {e}"))
                        })?;
                        if normalise::is_payload_not_found(&payload) {
                            return Ok(None);
                        }
                        return Ok(Some(payload));
                    }
                    if !status.is_server_error() {
                        return Err(Error::UpstreamUnavailable(format!(
                            "{url} returned {status}"
                        )));
                    }
                    format!("{url} returned {status}")
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    format!("{url}: {e}")
                }
                Err(e) => return Err(Error::UpstreamUnavailable(format!("{url}: {e}"))),
            };

            if attempt >= MAX_ATTEMPTS {
                return Err(Error::UpstreamUnavailable(transient));
            }
            debug!(attempt, error = %transient, "retrying upstream request");
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    /// The series catalogue, cached process-wide.
    pub async fn list_series(&self) -> Result<Arc<Vec<Series>>> {
        self.series
            .get_or_refresh(|| async {
                let payload = self.get_json(&self.config.series_url).await?;
                let series = payload
                    .as_ref()
                    .map(normalise::extract_series)
                    .unwrap_or_default();
                if series.is_empty() && payload.is_some() {
                    warn!("series catalogue yielded no descriptors");
                }
                Ok(Arc::new(series))
            })
            .await
    }

    /// Resolve a public series page URL to the series code, if possible.
    pub async fn resolve_series_code(&self, series_url: &str) -> Result<Option<String>> {
        let series = self.list_series().await?;
        if let Some(found) = series.iter().find(|s| {
            s.url.as_deref() == Some(series_url)
                || s.series_code
                    .as_deref()
                    .is_some_and(|code| series_url.contains(code))
        }) {
            return Ok(found.series_code.clone());
        }
        Ok(last_code_like_segment(series_url))
    }

    /// Fetch the series' upcoming broadcast events with starts inside the
    /// horizon.
    pub async fn fetch_events(
        &self,
        selector: &SeriesSelector,
        horizon_end: DateTime<Utc>,
    ) -> Result<Vec<BroadcastEvent>> {
        let (query_key, query_value, fallback_series_id) = match selector {
            SeriesSelector::Code(code) => ("series_code", code.clone(), None),
            SeriesSelector::Id(id) => ("series_id", id.to_string(), Some(*id)),
            SeriesSelector::Url(url) => {
                let code = self.resolve_series_code(url).await?.ok_or_else(|| {
                    Error::bad_request(format!("cannot resolve a series code from '{url}'"))
                })?;
                ("series_code", code, None)
            }
        };

        let url = url::Url::parse_with_params(&self.config.events_url, [(query_key, query_value.as_str())])
            .map_err(|e| Error::internal(format!("invalid events URL: {e}")))?;

        let Some(payload) = self.get_json(url.as_str()).await? else {
            return Ok(Vec::new());
        };
        let mut events = normalise::extract_events(&payload, fallback_series_id);
        events.retain(|event| event.start < horizon_end);
        events.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(events)
    }

    /// The live HLS playlist URL for one service in one area.
    pub async fn fetch_hls_source(&self, service_id: ServiceId, area_id: &str) -> Result<String> {
        let sources = self
            .hls_sources
            .get_or_refresh(|| async {
                let payload = self.get_json(&self.config.config_url).await?.ok_or_else(|| {
                    Error::UpstreamUnavailable("stream configuration document is missing".to_string())
                })?;
                let sources = normalise::extract_hls_sources(&payload);
                if sources.is_empty() {
                    return Err(Error::UpstreamMalformed(
                        "stream configuration document carries no HLS sources".to_string(),
                    ));
                }
                Ok(Arc::new(sources))
            })
            .await?;

        let area = area_id.to_ascii_lowercase();
        sources
            .get(&(area.clone(), service_id))
            .cloned()
            .ok_or_else(|| {
                Error::not_found("hls source", format!("{service_id}/{area}"))
            })
    }
}

/// A code-like trailing path segment: at least 8 characters, alphanumeric,
/// containing both a digit and an uppercase letter.
fn last_code_like_segment(series_url: &str) -> Option<String> {
    let parsed = url::Url::parse(series_url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?
        .to_string();
    let code_like = segment.len() >= 8
        && segment.chars().all(|c| c.is_ascii_alphanumeric())
        && segment.chars().any(|c| c.is_ascii_digit())
        && segment.chars().any(|c| c.is_ascii_uppercase());
    code_like.then_some(segment)
}
