//! Priority-driven recursive discovery.
//!
//! Resumes from the persisted queue (or seeds from the most-downloaded
//! sample on a cold start), pops best-first, ingests each sample with its
//! co-membership edges, and expands similar sounds one depth level at a
//! time. The per-session request budget and wall-clock budget guarantee the
//! run ends with a final checkpoint save; budget exhaustion is a normal
//! outcome, not an error.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{FetchOutcome, SampleRecord, SimilarOutcome, SoundApi, FALLBACK_SEED};
use crate::cache::MetadataCache;
use crate::checkpoint::{CheckpointStore, ControlMeta, LoadOutcome};
use crate::config::{CollectionMode, Config, HARD_DAILY_CAP};
use crate::error::EchomapError;
use crate::graph::{EdgeKind, SampleGraph};
use crate::queue::CrawlQueue;
use crate::SampleId;

/// Effectively infinite priority for the seed. `f64::MAX` rather than
/// infinity so queue snapshots stay representable in JSON.
pub const SEED_PRIORITY: f64 = f64::MAX;

/// Checkpoint save cadence, in popped samples.
pub const DEFAULT_SAVE_INTERVAL: usize = 50;

/// Safety cap on samples handled in one `queue_empty` session.
pub const QUEUE_EMPTY_SAMPLE_CAP: usize = 10_000;

/// Only a sample's leading tags participate in shared-tag edges, bounding
/// fanout on heavily tagged uploads.
const TOP_TAGS: usize = 5;

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub max_requests: u32,
    pub max_depth: u32,
    pub max_runtime: Duration,
    pub collection_mode: CollectionMode,
    pub save_interval: usize,
    pub similar_page_size: u32,
    pub fallback_seed: SampleId,
    /// Priority formula:
    /// `log10(1 + downloads) * w_downloads + avg_rating * w_rating - depth * depth_penalty`.
    pub w_downloads: f64,
    pub w_rating: f64,
    pub depth_penalty: f64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_requests: crate::config::DEFAULT_MAX_REQUESTS,
            max_depth: 3,
            max_runtime: Duration::from_secs(5 * 3600),
            collection_mode: CollectionMode::Limit,
            save_interval: DEFAULT_SAVE_INTERVAL,
            similar_page_size: 15,
            fallback_seed: FALLBACK_SEED,
            w_downloads: 1.0,
            w_rating: 0.5,
            depth_penalty: 0.1,
        }
    }
}

impl CrawlConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_requests: config.max_requests,
            max_depth: config.max_depth,
            max_runtime: config.max_runtime,
            collection_mode: config.collection_mode,
            ..Self::default()
        }
    }

    /// Deterministic from fields present at enqueue time.
    pub fn priority(&self, downloads: u64, avg_rating: f64, depth: u32) -> f64 {
        (1.0 + downloads as f64).log10() * self.w_downloads + avg_rating * self.w_rating
            - depth as f64 * self.depth_penalty
    }

    /// The spend ceiling for this session. `queue_empty` mode ignores the
    /// configured budget but never the absolute daily cap.
    fn request_ceiling(&self) -> u32 {
        match self.collection_mode {
            CollectionMode::Limit => self.max_requests,
            CollectionMode::QueueEmpty => HARD_DAILY_CAP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    BudgetExhausted,
    TimeExhausted,
    QueueEmpty,
    Cancelled,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BudgetExhausted => "budget_exhausted",
            Self::TimeExhausted => "time_exhausted",
            Self::QueueEmpty => "queue_empty",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct CrawlSummary {
    pub reason: ExitReason,
    pub nodes_added: usize,
    pub edges_added: usize,
    pub api_requests: u32,
    pub duration: Duration,
}

/// One line of `metrics_history.jsonl`.
#[derive(Serialize)]
struct MetricsRecord<'a> {
    timestamp: &'a str,
    nodes_added: usize,
    edges_added: usize,
    api_requests: u32,
    duration: f64,
}

/// Reverse lookups for co-membership edges, rebuilt from the cache at load
/// time and maintained per ingest.
#[derive(Default)]
struct MembershipIndex {
    by_pack: HashMap<String, Vec<SampleId>>,
    by_user: HashMap<String, Vec<SampleId>>,
    by_tag: HashMap<String, Vec<SampleId>>,
}

impl MembershipIndex {
    fn from_cache(cache: &mut MetadataCache) -> Result<Self, EchomapError> {
        let mut index = Self::default();
        cache.for_each_record(|_, record| index.insert(&record))?;
        Ok(index)
    }

    fn insert(&mut self, record: &SampleRecord) {
        if let Some(pack) = &record.pack {
            self.by_pack.entry(pack.clone()).or_default().push(record.id);
        }
        if !record.username.is_empty() {
            self.by_user
                .entry(record.username.clone())
                .or_default()
                .push(record.id);
        }
        for tag in record.tags.iter().take(TOP_TAGS) {
            self.by_tag.entry(tag.clone()).or_default().push(record.id);
        }
    }
}

struct Session {
    graph: SampleGraph,
    cache: MetadataCache,
    control: ControlMeta,
    queue: CrawlQueue,
    processed: HashSet<SampleId>,
    index: MembershipIndex,
    requests: u32,
    nodes_added: usize,
    edges_added: usize,
    samples_handled: usize,
}

pub struct Crawler<'a, A: SoundApi> {
    api: &'a A,
    store: CheckpointStore,
    config: CrawlConfig,
}

impl<'a, A: SoundApi> Crawler<'a, A> {
    pub fn new(api: &'a A, store: CheckpointStore, config: CrawlConfig) -> Self {
        Self { api, store, config }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<CrawlSummary, EchomapError> {
        let started = Instant::now();
        let mut session = self.load_session()?;

        if session.graph.node_count() == 0 {
            self.seed(&mut session).await?;
        } else {
            tracing::info!(
                nodes = session.graph.node_count(),
                pending = session.queue.len(),
                "resuming from checkpoint"
            );
        }

        let outcome = self.drive(&mut session, cancel, started).await;

        // The checkpoint is saved no matter how the loop ended.
        let save_result = self.persist(&mut session);
        let reason = match (outcome, save_result) {
            (Err(run_err), Err(save_err)) => {
                tracing::error!("final save also failed: {save_err}");
                return Err(run_err);
            }
            (Err(run_err), Ok(())) => return Err(run_err),
            (Ok(_), Err(save_err)) => return Err(save_err),
            (Ok(reason), Ok(())) => reason,
        };

        let summary = CrawlSummary {
            reason,
            nodes_added: session.nodes_added,
            edges_added: session.edges_added,
            api_requests: session.requests,
            duration: started.elapsed(),
        };
        self.append_metrics(&summary)?;
        tracing::info!(
            reason = summary.reason.as_str(),
            nodes_added = summary.nodes_added,
            edges_added = summary.edges_added,
            api_requests = summary.api_requests,
            duration_secs = summary.duration.as_secs_f64(),
            "crawl finished"
        );
        Ok(summary)
    }

    fn load_session(&self) -> Result<Session, EchomapError> {
        let (graph, mut cache, control) = match self.store.load()? {
            LoadOutcome::Fresh => {
                tracing::info!(dir = %self.store.dir().display(), "no checkpoint — cold start");
                std::fs::create_dir_all(self.store.dir())
                    .map_err(|e| EchomapError::io(self.store.dir(), e))?;
                (
                    SampleGraph::new(),
                    MetadataCache::open(&self.store.db_path())?,
                    ControlMeta::empty(),
                )
            }
            LoadOutcome::Loaded(state) => (state.graph, state.cache, state.control),
        };

        let index = MembershipIndex::from_cache(&mut cache)?;
        let queue = CrawlQueue::restore(&control.priority_queue);
        let processed = control.processed_set();

        Ok(Session {
            graph,
            cache,
            control,
            queue,
            processed,
            index,
            requests: 0,
            nodes_added: 0,
            edges_added: 0,
            samples_handled: 0,
        })
    }

    async fn seed(&self, session: &mut Session) -> Result<(), EchomapError> {
        if !self.try_spend(session) {
            return Ok(());
        }
        let seed = match self.api.search_most_downloaded().await {
            Ok(id) => id,
            Err(e @ EchomapError::AuthFailed(_)) => return Err(e),
            Err(e) => {
                tracing::warn!("seed lookup failed ({e}) — using fallback seed");
                self.config.fallback_seed
            }
        };
        tracing::info!(seed, "seeding crawl");
        session.queue.push(SEED_PRIORITY, seed, 0);
        Ok(())
    }

    async fn drive(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ExitReason, EchomapError> {
        let mut pops_since_save = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(ExitReason::Cancelled);
            }
            if started.elapsed() >= self.config.max_runtime {
                return Ok(ExitReason::TimeExhausted);
            }
            if session.requests >= self.config.request_ceiling() {
                return Ok(ExitReason::BudgetExhausted);
            }
            if self.config.collection_mode == CollectionMode::QueueEmpty
                && session.samples_handled >= QUEUE_EMPTY_SAMPLE_CAP
            {
                tracing::warn!(cap = QUEUE_EMPTY_SAMPLE_CAP, "session safety cap reached");
                return Ok(ExitReason::BudgetExhausted);
            }

            let Some(entry) = session.queue.pop() else {
                return Ok(ExitReason::QueueEmpty);
            };
            if session.processed.contains(&entry.id) {
                continue;
            }

            if !self.try_spend(session) {
                // Not one more call: the entry goes back for next session.
                session.queue.push(entry.score, entry.id, entry.depth);
                return Ok(ExitReason::BudgetExhausted);
            }

            match self.api.fetch_sample(entry.id).await? {
                FetchOutcome::NotFound => {
                    tracing::debug!(id = entry.id, "sample gone upstream");
                    session.processed.insert(entry.id);
                }
                FetchOutcome::Transient(reason) => {
                    tracing::warn!(id = entry.id, "fetch failed transiently ({reason}) — re-enqueued");
                    session.queue.push(entry.score, entry.id, entry.depth);
                }
                FetchOutcome::Found(record) if !record.is_valid() => {
                    tracing::info!(id = entry.id, "rejecting sample with zero filesize");
                    session.processed.insert(entry.id);
                }
                FetchOutcome::Found(record) => {
                    self.ingest(session, *record, entry.score)?;
                    if entry.depth < self.config.max_depth {
                        self.expand_similar(session, entry.id, entry.depth).await?;
                    }
                    session.processed.insert(entry.id);
                    session.samples_handled += 1;
                }
            }

            pops_since_save += 1;
            if pops_since_save >= self.config.save_interval {
                self.persist(session)?;
                pops_since_save = 0;
            }
        }
    }

    /// Add the sample to topology and cache, plus co-membership edges to
    /// nodes already present. New nodes are never created for membership.
    fn ingest(
        &self,
        session: &mut Session,
        mut record: SampleRecord,
        score: f64,
    ) -> Result<(), EchomapError> {
        let id = record.id;
        record.collected_at = Some(Utc::now());
        record.priority_score = if score.is_finite() { score } else { SEED_PRIORITY };

        if session.graph.add_node(id) {
            session.nodes_added += 1;
        }

        if let Some(pack) = record.pack.clone() {
            let peers = session.index.by_pack.get(&pack).cloned().unwrap_or_default();
            self.link_peers(session, id, &peers, EdgeKind::SamePack);
        }
        if !record.username.is_empty() {
            let peers = session
                .index
                .by_user
                .get(&record.username)
                .cloned()
                .unwrap_or_default();
            self.link_peers(session, id, &peers, EdgeKind::SameUser);
        }
        for tag in record.tags.iter().take(TOP_TAGS) {
            let peers = session.index.by_tag.get(tag).cloned().unwrap_or_default();
            self.link_peers(session, id, &peers, EdgeKind::SharedTag);
        }

        session.index.insert(&record);
        session.cache.set(record)?;
        Ok(())
    }

    fn link_peers(&self, session: &mut Session, id: SampleId, peers: &[SampleId], kind: EdgeKind) {
        for &peer in peers {
            if peer == id || !session.graph.has_node(peer) {
                continue;
            }
            if session.graph.add_edge(id, peer, kind, None) {
                session.edges_added += 1;
            }
        }
    }

    async fn expand_similar(
        &self,
        session: &mut Session,
        id: SampleId,
        depth: u32,
    ) -> Result<(), EchomapError> {
        if !self.try_spend(session) {
            return Ok(());
        }

        let hits = match self
            .api
            .fetch_similar(id, self.config.similar_page_size)
            .await?
        {
            SimilarOutcome::Found(hits) => hits,
            SimilarOutcome::NotFound => {
                tracing::debug!(id, "no similarity listing");
                return Ok(());
            }
            SimilarOutcome::Transient(reason) => {
                tracing::warn!(id, "similar fetch failed transiently ({reason})");
                return Ok(());
            }
        };

        for hit in hits {
            let sid = hit.record.id;
            if sid == id {
                continue;
            }
            if !hit.record.is_valid() {
                tracing::debug!(id = sid, "skipping similar hit with zero filesize");
                continue;
            }

            let score = self
                .config
                .priority(hit.record.num_downloads, hit.record.avg_rating, depth + 1);

            let mut record = hit.record;
            record.collected_at = Some(Utc::now());
            record.priority_score = score;

            if session.graph.add_node(sid) {
                session.nodes_added += 1;
            }
            session.index.insert(&record);
            session.cache.set(record)?;

            if session.graph.add_edge(id, sid, EdgeKind::Similar, Some(hit.weight)) {
                session.edges_added += 1;
            }
            if !session.processed.contains(&sid) {
                session.queue.push(score, sid, depth + 1);
            }
        }
        Ok(())
    }

    fn try_spend(&self, session: &mut Session) -> bool {
        if session.requests >= self.config.request_ceiling() {
            return false;
        }
        session.requests += 1;
        true
    }

    fn persist(&self, session: &mut Session) -> Result<(), EchomapError> {
        session.control.processed_ids = session.processed.iter().copied().collect();
        session.control.priority_queue = session.queue.snapshot();
        session.control.session_request_count = session.requests;
        self.store
            .save(&session.graph, &mut session.cache, &mut session.control)
    }

    fn append_metrics(&self, summary: &CrawlSummary) -> Result<(), EchomapError> {
        let timestamp = Utc::now().to_rfc3339();
        let record = MetricsRecord {
            timestamp: &timestamp,
            nodes_added: summary.nodes_added,
            edges_added: summary.edges_added,
            api_requests: summary.api_requests,
            duration: summary.duration.as_secs_f64(),
        };
        let path = self.store.metrics_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EchomapError::io(&path, e))?;
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        file.write_all(&line).map_err(|e| EchomapError::io(&path, e))?;
        Ok(())
    }
}
