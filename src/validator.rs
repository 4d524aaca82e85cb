//! Scheduled re-validation of the library against the upstream API.
//!
//! Partial mode re-checks existence for the 300 stalest samples; full mode
//! refreshes metadata for everything. Targets are queried in filter-ID
//! batches. An ID absent from a *successful* batch response is treated as
//! deleted and pruned everywhere; an errored batch deletes nothing: its
//! samples are tallied as `api_errors` and, in full mode, put to sleep
//! until a later pass confirms them.

use std::collections::HashSet;
use std::fs;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::api::{BatchOutcome, SampleRecord, SoundApi, FULL_FIELDS, MAX_BATCH_IDS};
use crate::checkpoint::{CheckpointStore, LoadOutcome, ValidationEvent};
use crate::config::ValidationMode;
use crate::error::EchomapError;
use crate::SampleId;

/// Partial mode target size: the N samples with the oldest existence check.
pub const PARTIAL_TARGET: usize = 300;

/// Checkpoint cadence during validation, in batches.
const SAVE_EVERY_BATCHES: usize = 10;

pub const REPORT_FILE: &str = "validation_report.json";

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DeletedSample {
    pub id: SampleId,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub timestamp: DateTime<Utc>,
    pub validation_mode: String,
    pub total_samples: usize,
    pub validated_samples: usize,
    pub metadata_refreshed: usize,
    pub deleted_samples: Vec<DeletedSample>,
    pub api_errors: usize,
    pub edges_removed: usize,
}

pub enum ValidatorOutcome {
    /// A full pass already ran today; partial did nothing, zero API calls.
    Skipped,
    Completed(ValidationReport),
}

pub struct Validator<'a, A: SoundApi> {
    api: &'a A,
    store: CheckpointStore,
}

impl<'a, A: SoundApi> Validator<'a, A> {
    pub fn new(api: &'a A, store: CheckpointStore) -> Self {
        Self { api, store }
    }

    pub async fn run(
        &self,
        mode: ValidationMode,
        cancel: &CancellationToken,
    ) -> Result<ValidatorOutcome, EchomapError> {
        let state = match self.store.load()? {
            LoadOutcome::Fresh => {
                tracing::info!("no checkpoint — nothing to validate");
                let report = self.empty_report(mode, 0);
                self.write_report(&report)?;
                return Ok(ValidatorOutcome::Completed(report));
            }
            LoadOutcome::Loaded(state) => state,
        };
        let mut graph = state.graph;
        let mut cache = state.cache;
        let mut control = state.control;

        if mode == ValidationMode::Partial && full_ran_today(&control.validation_history) {
            tracing::info!("SKIP: full validation already ran today — partial pass not needed");
            return Ok(ValidatorOutcome::Skipped);
        }

        let targets = match mode {
            ValidationMode::Partial => cache.select_oldest_by_existence_check(PARTIAL_TARGET)?,
            ValidationMode::Full => cache.ids()?,
        };
        let total_samples = cache.row_count()?;
        let fields: &[&str] = match mode {
            ValidationMode::Partial => &["id"],
            ValidationMode::Full => FULL_FIELDS,
        };

        tracing::info!(
            mode = mode.as_str(),
            targets = targets.len(),
            batches = targets.len().div_ceil(MAX_BATCH_IDS),
            "validation starting"
        );

        let mut processed: HashSet<SampleId> = control.processed_set();
        let mut validated_samples = 0usize;
        let mut metadata_refreshed = 0usize;
        let mut deleted_samples = Vec::new();
        let mut api_errors = 0usize;
        let mut edges_removed = 0usize;

        for (batch_no, batch) in targets.chunks(MAX_BATCH_IDS).enumerate() {
            if cancel.is_cancelled() {
                tracing::info!("cancelled — saving progress and stopping early");
                break;
            }

            match self.api.batch_validate(batch, fields).await? {
                BatchOutcome::Transient(reason) => {
                    tracing::warn!(
                        batch = batch_no,
                        size = batch.len(),
                        "batch query failed after retries ({reason})"
                    );
                    api_errors += batch.len();
                    if mode == ValidationMode::Full {
                        // Unreachable is not deleted: park these until a
                        // successful pass confirms them either way.
                        let now = Utc::now();
                        for &id in batch {
                            cache.mark_dormant(id, now)?;
                        }
                    }
                }
                BatchOutcome::Found(found) => {
                    let now = Utc::now();
                    for &id in batch {
                        match found.get(&id) {
                            Some(record) => {
                                validated_samples += 1;
                                match mode {
                                    ValidationMode::Partial => {
                                        cache.record_existence_check(id, now)?;
                                    }
                                    ValidationMode::Full => {
                                        let refreshed = refresh_fields(record, now);
                                        if cache.update_fields(id, &refreshed)? {
                                            metadata_refreshed += 1;
                                        }
                                        cache.wake(id)?;
                                    }
                                }
                            }
                            None => {
                                let name = cache
                                    .get(id)?
                                    .map(|r| r.name)
                                    .unwrap_or_default();
                                edges_removed += graph.remove_node(id).unwrap_or(0);
                                cache.delete(id)?;
                                processed.remove(&id);
                                tracing::info!(id, name = %name, "sample deleted upstream — pruned");
                                deleted_samples.push(DeletedSample { id, name });
                            }
                        }
                    }
                }
            }

            // Batch results land inside one save boundary; saves only
            // happen between batches.
            if (batch_no + 1) % SAVE_EVERY_BATCHES == 0 {
                control.processed_ids = processed.iter().copied().collect();
                self.store.save(&graph, &mut cache, &mut control)?;
            }
        }

        control.processed_ids = processed.iter().copied().collect();
        control.validation_history.push(ValidationEvent {
            mode: mode.as_str().to_string(),
            timestamp: Utc::now(),
            deleted_count: deleted_samples.len(),
        });
        self.store.save(&graph, &mut cache, &mut control)?;

        let report = ValidationReport {
            timestamp: Utc::now(),
            validation_mode: mode.as_str().to_string(),
            total_samples,
            validated_samples,
            metadata_refreshed,
            deleted_samples,
            api_errors,
            edges_removed,
        };
        self.write_report(&report)?;

        tracing::info!(
            mode = mode.as_str(),
            validated = report.validated_samples,
            refreshed = report.metadata_refreshed,
            deleted = report.deleted_samples.len(),
            api_errors = report.api_errors,
            edges_removed = report.edges_removed,
            "validation finished"
        );
        for deleted in &report.deleted_samples {
            tracing::info!(id = deleted.id, name = %deleted.name, "deleted");
        }
        Ok(ValidatorOutcome::Completed(report))
    }

    fn empty_report(&self, mode: ValidationMode, total: usize) -> ValidationReport {
        ValidationReport {
            timestamp: Utc::now(),
            validation_mode: mode.as_str().to_string(),
            total_samples: total,
            validated_samples: 0,
            metadata_refreshed: 0,
            deleted_samples: Vec::new(),
            api_errors: 0,
            edges_removed: 0,
        }
    }

    fn write_report(&self, report: &ValidationReport) -> Result<(), EchomapError> {
        let path = self.store.dir().join(REPORT_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EchomapError::io(parent, e))?;
        }
        fs::write(&path, serde_json::to_vec_pretty(report)?)
            .map_err(|e| EchomapError::io(&path, e))?;
        Ok(())
    }
}

/// True if a full validation event was recorded on today's UTC date.
fn full_ran_today(history: &[ValidationEvent]) -> bool {
    let today = Utc::now().date_naive();
    history
        .iter()
        .any(|event| event.mode == "full" && event.timestamp.date_naive() == today)
}

/// Mutable fields to fold into the stored record on a full refresh.
fn refresh_fields(
    record: &SampleRecord,
    now: DateTime<Utc>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut fields = serde_json::Map::new();
    fields.insert("name".into(), json!(record.name));
    fields.insert("duration".into(), json!(record.duration));
    if record.filesize > 0 {
        fields.insert("filesize".into(), json!(record.filesize));
    }
    fields.insert("username".into(), json!(record.username));
    fields.insert("pack".into(), json!(record.pack));
    fields.insert("tags".into(), json!(record.tags));
    fields.insert("license".into(), json!(record.license));
    fields.insert("preview_url".into(), json!(record.preview_url));
    fields.insert("num_downloads".into(), json!(record.num_downloads));
    fields.insert("avg_rating".into(), json!(record.avg_rating));
    fields.insert("num_ratings".into(), json!(record.num_ratings));
    for (key, value) in &record.extra {
        fields.insert(key.clone(), value.clone());
    }
    fields.insert(
        "last_existence_check_at".into(),
        json!(now.to_rfc3339()),
    );
    fields.insert(
        "last_metadata_update_at".into(),
        json!(now.to_rfc3339()),
    );
    fields
}
