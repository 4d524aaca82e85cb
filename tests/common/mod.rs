//! Scripted in-process stand-in for the upstream API.
#![allow(dead_code)] // each test binary uses a different slice of this

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use echomap::api::{
    BatchOutcome, FetchOutcome, SampleRecord, SimilarHit, SimilarOutcome, SoundApi,
};
use echomap::error::EchomapError;
use echomap::SampleId;

#[derive(Default)]
pub struct FakeApi {
    /// Seed returned by the most-downloaded search; None scripts a failure.
    pub most_downloaded: Mutex<Option<SampleId>>,
    /// The upstream catalog. IDs absent from here 404.
    pub samples: Mutex<HashMap<SampleId, SampleRecord>>,
    pub similar: Mutex<HashMap<SampleId, Vec<SimilarHit>>>,
    /// IDs that fail transiently this many more times before succeeding.
    pub flaky: Mutex<HashMap<SampleId, u32>>,
    /// Batch indexes (0-based, in call order) that fail transiently.
    pub failing_batches: Mutex<HashSet<usize>>,
    /// Field sets requested by batch_validate, in call order.
    pub batch_fields_seen: Mutex<Vec<Vec<String>>>,

    pub seed_calls: AtomicU32,
    pub fetch_calls: AtomicU32,
    pub similar_calls: AtomicU32,
    pub batch_calls: AtomicU32,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(id: SampleId) -> SampleRecord {
        let mut record = SampleRecord::bare(id);
        record.name = format!("sample-{id}");
        record.filesize = 10_000 + id as u64;
        record.username = format!("user-{}", id % 5);
        record.num_downloads = 100 * id as u64;
        record.avg_rating = 4.0;
        record
    }

    pub fn add_sample(&self, record: SampleRecord) {
        self.samples.lock().unwrap().insert(record.id, record);
    }

    pub fn add_similar(&self, id: SampleId, hits: Vec<(SampleRecord, f64)>) {
        self.similar.lock().unwrap().insert(
            id,
            hits.into_iter()
                .map(|(record, weight)| SimilarHit { record, weight })
                .collect(),
        );
    }

    pub fn total_calls(&self) -> u32 {
        self.seed_calls.load(Ordering::SeqCst)
            + self.fetch_calls.load(Ordering::SeqCst)
            + self.similar_calls.load(Ordering::SeqCst)
            + self.batch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SoundApi for FakeApi {
    async fn search_most_downloaded(&self) -> Result<SampleId, EchomapError> {
        self.seed_calls.fetch_add(1, Ordering::SeqCst);
        self.most_downloaded
            .lock()
            .unwrap()
            .ok_or_else(|| EchomapError::Other("search unavailable".into()))
    }

    async fn fetch_sample(&self, id: SampleId) -> Result<FetchOutcome, EchomapError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let mut flaky = self.flaky.lock().unwrap();
        if let Some(remaining) = flaky.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(FetchOutcome::Transient("scripted failure".into()));
            }
        }
        drop(flaky);

        Ok(match self.samples.lock().unwrap().get(&id) {
            Some(record) => FetchOutcome::Found(Box::new(record.clone())),
            None => FetchOutcome::NotFound,
        })
    }

    async fn fetch_similar(
        &self,
        id: SampleId,
        page_size: u32,
    ) -> Result<SimilarOutcome, EchomapError> {
        self.similar_calls.fetch_add(1, Ordering::SeqCst);
        let hits = self
            .similar
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        Ok(SimilarOutcome::Found(
            hits.into_iter().take(page_size as usize).collect(),
        ))
    }

    async fn batch_validate(
        &self,
        ids: &[SampleId],
        fields: &[&str],
    ) -> Result<BatchOutcome, EchomapError> {
        let call_index = self.batch_calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.batch_fields_seen
            .lock()
            .unwrap()
            .push(fields.iter().map(|f| f.to_string()).collect());

        if self.failing_batches.lock().unwrap().contains(&call_index) {
            return Ok(BatchOutcome::Transient("scripted batch failure".into()));
        }

        let samples = self.samples.lock().unwrap();
        Ok(BatchOutcome::Found(
            ids.iter()
                .filter_map(|id| samples.get(id).map(|r| (*id, r.clone())))
                .collect(),
        ))
    }
}
