pub mod http;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EchomapError;
use crate::SampleId;

pub use http::FreesoundClient;

/// Known-popular sample used when the seed lookup fails on a cold start.
pub const FALLBACK_SEED: SampleId = 2523;

/// Maximum IDs per batched filter query.
pub const MAX_BATCH_IDS: usize = 150;

/// Field set for full-mode metadata refresh. `original_filename` and `md5`
/// are filter-only upstream and are deliberately absent. `description` is
/// never requested: the license URL suffices for attribution.
pub const FULL_FIELDS: &[&str] = &[
    "id",
    "url",
    "name",
    "tags",
    "geotag",
    "created",
    "license",
    "type",
    "channels",
    "filesize",
    "bitrate",
    "bitdepth",
    "duration",
    "samplerate",
    "username",
    "pack",
    "download",
    "bookmark",
    "previews",
    "images",
    "num_downloads",
    "avg_rating",
    "num_ratings",
    "rate",
    "comments",
    "num_comments",
    "comment",
    "similar_sounds",
    "analysis",
];

/// Per-sample attributes as stored in the metadata cache.
///
/// Wire-format quirks (pack URLs, nested preview objects) are normalized by
/// the HTTP client before a record reaches any caller. Fields the upstream
/// may add later land in `extra` instead of being dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: SampleId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub filesize: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub pack: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub num_downloads: u64,
    #[serde(default)]
    pub avg_rating: f64,
    #[serde(default)]
    pub num_ratings: u64,
    #[serde(default)]
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_existence_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_metadata_update_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority_score: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SampleRecord {
    /// Minimal record for tests and id-only batch responses.
    pub fn bare(id: SampleId) -> Self {
        Self {
            id,
            name: String::new(),
            duration: 0.0,
            filesize: 0,
            username: String::new(),
            pack: None,
            tags: Vec::new(),
            license: String::new(),
            preview_url: None,
            num_downloads: 0,
            avg_rating: 0.0,
            num_ratings: 0,
            collected_at: None,
            last_existence_check_at: None,
            last_metadata_update_at: None,
            priority_score: 0.0,
            extra: BTreeMap::new(),
        }
    }

    /// A sample with no stored bytes does not exist as audio; such records
    /// are rejected at ingest and flagged as corruption at load.
    pub fn is_valid(&self) -> bool {
        self.filesize > 0
    }
}

/// Outcome of a single-sample fetch. Not-found and transient trouble are
/// ordinary values here; only authentication failures and programmer errors
/// surface as `Err`.
#[derive(Debug)]
pub enum FetchOutcome {
    Found(Box<SampleRecord>),
    NotFound,
    Transient(String),
}

/// A similar-sound hit with its similarity weight in [0, 1].
#[derive(Debug, Clone)]
pub struct SimilarHit {
    pub record: SampleRecord,
    pub weight: f64,
}

#[derive(Debug)]
pub enum SimilarOutcome {
    Found(Vec<SimilarHit>),
    NotFound,
    Transient(String),
}

/// Outcome of a batched existence/refresh query. A successful response maps
/// every surviving ID to its (possibly id-only) record; requested IDs absent
/// from the map no longer exist upstream.
#[derive(Debug)]
pub enum BatchOutcome {
    Found(HashMap<SampleId, SampleRecord>),
    Transient(String),
}

/// Typed surface over the upstream sound API. The crawler and validator
/// depend on this trait so tests can script responses without a network.
#[async_trait]
pub trait SoundApi: Send + Sync {
    /// One search call returning the single most-downloaded sample ID.
    async fn search_most_downloaded(&self) -> Result<SampleId, EchomapError>;

    async fn fetch_sample(&self, id: SampleId) -> Result<FetchOutcome, EchomapError>;

    async fn fetch_similar(
        &self,
        id: SampleId,
        page_size: u32,
    ) -> Result<SimilarOutcome, EchomapError>;

    /// Batched existence/refresh query over at most [`MAX_BATCH_IDS`] IDs.
    async fn batch_validate(
        &self,
        ids: &[SampleId],
        fields: &[&str],
    ) -> Result<BatchOutcome, EchomapError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_fields_shape() {
        assert_eq!(FULL_FIELDS.len(), 29);
        assert!(!FULL_FIELDS.contains(&"original_filename"));
        assert!(!FULL_FIELDS.contains(&"md5"));
        assert!(!FULL_FIELDS.contains(&"description"));
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut record = SampleRecord::bare(17);
        record.name = "rain on tent".into();
        record.filesize = 20_480;
        record.tags = vec!["rain".into(), "field-recording".into()];
        record
            .extra
            .insert("samplerate".into(), serde_json::json!(48000));

        let blob = serde_json::to_string(&record).unwrap();
        let back: SampleRecord = serde_json::from_str(&blob).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.extra["samplerate"], serde_json::json!(48000));
    }

    #[test]
    fn zero_filesize_is_invalid() {
        let mut record = SampleRecord::bare(5);
        assert!(!record.is_valid());
        record.filesize = 1;
        assert!(record.is_valid());
    }

    #[test]
    fn id_only_record_deserializes() {
        let record: SampleRecord = serde_json::from_str(r#"{"id": 42}"#).unwrap();
        assert_eq!(record.id, 42);
        assert!(record.name.is_empty());
    }
}
