//! HTTP implementation of [`SoundApi`] over the Freesound v2 endpoints.
//!
//! All calls go through the shared [`RateLimiter`]; a 429 reports its
//! retry-after back to the limiter before retrying. Transient trouble
//! (network, 5xx) retries with exponential backoff; permanent statuses
//! (401, 403, 404) return immediately.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::EchomapError;
use crate::rate_limit::RateLimiter;
use crate::SampleId;

use super::{
    BatchOutcome, FetchOutcome, SampleRecord, SimilarHit, SimilarOutcome, SoundApi, FULL_FIELDS,
    MAX_BATCH_IDS,
};

const DEFAULT_BASE_URL: &str = "https://freesound.org/apiv2";

/// Exponential backoff schedule for transient failures; one sleep before
/// each retry, so a request is attempted at most `BACKOFF.len() + 1` times.
const BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Assumed penalty when a 429 arrives without a Retry-After header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

const MAX_ERROR_BODY_CHARS: usize = 300;

pub struct FreesoundClient {
    client: Client,
    base_url: String,
    api_key: String,
    limiter: RateLimiter,
}

enum JsonOutcome<T> {
    Ok(T),
    NotFound,
    Transient(String),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<ApiSound>,
}

/// One sound as the upstream returns it. Converted to [`SampleRecord`]
/// immediately after deserialization; the description never survives that
/// conversion.
#[derive(Deserialize)]
struct ApiSound {
    id: SampleId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    filesize: Option<u64>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    pack: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    previews: Option<Previews>,
    #[serde(default)]
    num_downloads: Option<u64>,
    #[serde(default)]
    avg_rating: Option<f64>,
    #[serde(default)]
    num_ratings: Option<u64>,
    /// Stripped on conversion; the license URL suffices for attribution.
    #[serde(default)]
    description: Option<String>,
    /// Similarity score, present only in similar-sounds results.
    #[serde(default)]
    score: Option<f64>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct Previews {
    #[serde(rename = "preview-hq-mp3", default)]
    hq_mp3: Option<String>,
    #[serde(rename = "preview-lq-mp3", default)]
    lq_mp3: Option<String>,
}

impl ApiSound {
    fn into_record(self) -> SampleRecord {
        // Explicitly dropped, not stored.
        drop(self.description);

        SampleRecord {
            id: self.id,
            name: self.name.unwrap_or_default(),
            duration: self.duration.unwrap_or_default(),
            filesize: self.filesize.unwrap_or_default(),
            username: self.username.unwrap_or_default(),
            pack: self.pack.as_deref().map(pack_identifier),
            tags: self.tags.unwrap_or_default(),
            license: self.license.unwrap_or_default(),
            preview_url: self
                .previews
                .and_then(|p| p.hq_mp3.or(p.lq_mp3)),
            num_downloads: self.num_downloads.unwrap_or_default(),
            avg_rating: self.avg_rating.unwrap_or_default(),
            num_ratings: self.num_ratings.unwrap_or_default(),
            collected_at: None,
            last_existence_check_at: None,
            last_metadata_update_at: None,
            priority_score: 0.0,
            extra: self.extra,
        }
    }

    fn similarity_weight(&self) -> f64 {
        self.score.unwrap_or(1.0).clamp(0.0, 1.0)
    }
}

/// Normalize a pack reference to a stable identifier. Upstream returns pack
/// URLs (`.../packs/1234/`); the trailing numeric segment is the identifier.
/// Anything that doesn't look like that is kept verbatim.
fn pack_identifier(raw: &str) -> String {
    raw.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(raw)
        .to_string()
}

/// Build the `id:(a OR b OR ...)` filter expression for a batch query.
fn id_filter(ids: &[SampleId]) -> String {
    let joined = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("id:({joined})")
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

impl FreesoundClient {
    pub fn new(api_key: impl Into<String>, limiter: RateLimiter) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            limiter,
        }
    }

    /// Point the client at a different endpoint root (staging, test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonOutcome<T>, EchomapError> {
        let mut last_failure = String::from("no attempt made");

        for attempt in 0..=BACKOFF.len() {
            if attempt > 0 {
                tokio::time::sleep(BACKOFF[attempt - 1]).await;
            }
            self.limiter.acquire().await;

            let response = match self
                .client
                .get(url)
                .query(query)
                .header("Authorization", format!("Token {}", self.api_key))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_failure = format!("network error: {e}");
                    tracing::warn!(url, attempt, "request failed: {e}");
                    continue;
                }
            };

            let status = response.status();
            match status {
                StatusCode::NOT_FOUND => return Ok(JsonOutcome::NotFound),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(EchomapError::AuthFailed(status.to_string()));
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = parse_retry_after(&response);
                    self.limiter.report_retry_after(retry_after).await;
                    last_failure = "rate limited".to_string();
                    continue;
                }
                s if s.is_success() => match response.json::<T>().await {
                    Ok(value) => return Ok(JsonOutcome::Ok(value)),
                    Err(e) => {
                        last_failure = format!("malformed response body: {e}");
                        tracing::warn!(url, attempt, "{last_failure}");
                        continue;
                    }
                },
                s => {
                    let body = response.text().await.unwrap_or_default();
                    let snippet: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
                    last_failure = format!("{s}: {snippet}");
                    tracing::warn!(url, attempt, "upstream error: {last_failure}");
                    continue;
                }
            }
        }

        Ok(JsonOutcome::Transient(last_failure))
    }

    fn fields_param(fields: &[&str]) -> String {
        fields.join(",")
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Duration {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

#[async_trait]
impl SoundApi for FreesoundClient {
    async fn search_most_downloaded(&self) -> Result<SampleId, EchomapError> {
        let url = format!("{}/search/text/", self.base_url);
        let query = [
            ("query", String::new()),
            ("sort", "downloads_desc".to_string()),
            ("page_size", "1".to_string()),
            ("fields", "id".to_string()),
        ];
        match self.get_json::<SearchPage>(&url, &query).await? {
            JsonOutcome::Ok(page) => page
                .results
                .first()
                .map(|s| s.id)
                .ok_or_else(|| EchomapError::Other("empty most-downloaded result".into())),
            JsonOutcome::NotFound => {
                Err(EchomapError::Other("search endpoint returned 404".into()))
            }
            JsonOutcome::Transient(reason) => Err(EchomapError::Other(reason)),
        }
    }

    async fn fetch_sample(&self, id: SampleId) -> Result<FetchOutcome, EchomapError> {
        let url = format!("{}/sounds/{id}/", self.base_url);
        let query = [("fields", Self::fields_param(FULL_FIELDS))];
        Ok(match self.get_json::<ApiSound>(&url, &query).await? {
            JsonOutcome::Ok(sound) => FetchOutcome::Found(Box::new(sound.into_record())),
            JsonOutcome::NotFound => FetchOutcome::NotFound,
            JsonOutcome::Transient(reason) => FetchOutcome::Transient(reason),
        })
    }

    async fn fetch_similar(
        &self,
        id: SampleId,
        page_size: u32,
    ) -> Result<SimilarOutcome, EchomapError> {
        let url = format!("{}/sounds/{id}/similar/", self.base_url);
        let query = [
            ("page_size", page_size.to_string()),
            ("fields", Self::fields_param(FULL_FIELDS)),
        ];
        Ok(match self.get_json::<SearchPage>(&url, &query).await? {
            JsonOutcome::Ok(page) => SimilarOutcome::Found(
                page.results
                    .into_iter()
                    .map(|sound| {
                        let weight = sound.similarity_weight();
                        SimilarHit {
                            record: sound.into_record(),
                            weight,
                        }
                    })
                    .collect(),
            ),
            JsonOutcome::NotFound => SimilarOutcome::NotFound,
            JsonOutcome::Transient(reason) => SimilarOutcome::Transient(reason),
        })
    }

    async fn batch_validate(
        &self,
        ids: &[SampleId],
        fields: &[&str],
    ) -> Result<BatchOutcome, EchomapError> {
        if ids.len() > MAX_BATCH_IDS {
            return Err(EchomapError::Other(format!(
                "batch_validate called with {} ids (max {MAX_BATCH_IDS})",
                ids.len()
            )));
        }
        if ids.is_empty() {
            return Ok(BatchOutcome::Found(Default::default()));
        }

        let url = format!("{}/search/text/", self.base_url);
        let query = [
            ("filter", id_filter(ids)),
            ("fields", Self::fields_param(fields)),
            ("page_size", ids.len().to_string()),
        ];
        Ok(match self.get_json::<SearchPage>(&url, &query).await? {
            JsonOutcome::Ok(page) => BatchOutcome::Found(
                page.results
                    .into_iter()
                    .map(|sound| (sound.id, sound.into_record()))
                    .collect(),
            ),
            // The batch search endpoint itself vanishing is not a deletion
            // signal for any individual sample.
            JsonOutcome::NotFound => BatchOutcome::Transient("search endpoint 404".into()),
            JsonOutcome::Transient(reason) => BatchOutcome::Transient(reason),
        })
    }
}
