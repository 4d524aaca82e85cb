//! Split checkpoint persistence.
//!
//! A checkpoint directory holds three files: binary topology, the SQLite
//! metadata cache, and a small control JSON. Saves are atomic per file
//! (temp + fsync + rename, control written last), so a crash leaves either
//! the old complete set or a new topology with stale control, and the
//! stale case is caught at load by the count cross-check.
//!
//! A legacy monolithic library file is migrated on first load: split into
//! the three files, then retained until the next successful save completes.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::api::SampleRecord;
use crate::cache::MetadataCache;
use crate::error::EchomapError;
use crate::graph::{EdgeKind, SampleGraph};
use crate::SampleId;

pub const TOPOLOGY_FILE: &str = "graph_topology";
pub const DB_FILE: &str = "metadata_cache.db";
pub const CONTROL_FILE: &str = "checkpoint_metadata.json";
pub const LEGACY_FILE: &str = "library_graph.json";
pub const METRICS_FILE: &str = "metrics_history.jsonl";

/// Anything smaller than these cannot be a real checkpoint component.
pub const MIN_TOPOLOGY_BYTES: u64 = 100;
pub const MIN_DB_BYTES: u64 = 8 * 1024;
pub const MIN_CONTROL_BYTES: u64 = 10;

pub const CONTROL_SCHEMA_VERSION: u32 = 2;

/// Control metadata persisted alongside topology and cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMeta {
    pub timestamp: DateTime<Utc>,
    pub nodes: usize,
    pub edges: usize,
    pub processed_ids: Vec<SampleId>,
    /// (score, id, depth) triples, best-first.
    pub priority_queue: Vec<(f64, SampleId, u32)>,
    pub session_request_count: u32,
    pub schema_version: u32,
    #[serde(default)]
    pub validation_history: Vec<ValidationEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationEvent {
    pub mode: String,
    pub timestamp: DateTime<Utc>,
    pub deleted_count: usize,
}

impl ControlMeta {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            nodes: 0,
            edges: 0,
            processed_ids: Vec::new(),
            priority_queue: Vec::new(),
            session_request_count: 0,
            schema_version: CONTROL_SCHEMA_VERSION,
            validation_history: Vec::new(),
        }
    }

    pub fn processed_set(&self) -> HashSet<SampleId> {
        self.processed_ids.iter().copied().collect()
    }
}

/// Everything a resumed session needs.
#[derive(Debug)]
pub struct CheckpointState {
    pub graph: SampleGraph,
    pub cache: MetadataCache,
    pub control: ControlMeta,
}

#[derive(Debug)]
pub enum LoadOutcome {
    /// No checkpoint on disk: cold start, not an error.
    Fresh,
    Loaded(Box<CheckpointState>),
}

/// Legacy monolithic library: attributes inline with structure, one file.
#[derive(Deserialize)]
struct LegacyLibrary {
    #[serde(default)]
    samples: Vec<SampleRecord>,
    #[serde(default)]
    edges: Vec<(SampleId, SampleId, EdgeKind, Option<f64>)>,
    #[serde(default)]
    processed_ids: Vec<SampleId>,
    #[serde(default)]
    priority_queue: Vec<(f64, SampleId, u32)>,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn topology_path(&self) -> PathBuf {
        self.dir.join(TOPOLOGY_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join(DB_FILE)
    }

    pub fn control_path(&self) -> PathBuf {
        self.dir.join(CONTROL_FILE)
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.dir.join(LEGACY_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join(METRICS_FILE)
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Atomic save of the triple. Counts and timestamp are recorded into
    /// `control` before anything is written, so a verified load can
    /// cross-check them against the topology it actually got.
    pub fn save(
        &self,
        graph: &SampleGraph,
        cache: &mut MetadataCache,
        control: &mut ControlMeta,
    ) -> Result<(), EchomapError> {
        self.save_inner(graph, cache, control)?;

        // A legacy file that survived migration is only dropped once a
        // post-migration save has succeeded.
        let legacy = self.legacy_path();
        if legacy.exists() {
            fs::remove_file(&legacy).map_err(|e| EchomapError::io(&legacy, e))?;
            tracing::info!("removed migrated legacy library file");
        }
        Ok(())
    }

    fn save_inner(
        &self,
        graph: &SampleGraph,
        cache: &mut MetadataCache,
        control: &mut ControlMeta,
    ) -> Result<(), EchomapError> {
        fs::create_dir_all(&self.dir).map_err(|e| EchomapError::io(&self.dir, e))?;

        cache.checkpoint_wal()?;

        control.nodes = graph.node_count();
        control.edges = graph.edge_count();
        control.timestamp = Utc::now();
        control.processed_ids.sort_unstable();
        control.processed_ids.dedup();

        // Topology first, control last: a crash in between leaves a new
        // topology with stale control, which load() rejects by count check.
        let topo_tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| EchomapError::io(&self.dir, e))?;
        graph.save_topology(topo_tmp.path())?;
        topo_tmp
            .persist(self.topology_path())
            .map_err(|e| EchomapError::io(self.topology_path(), e.error))?;

        let mut control_tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| EchomapError::io(&self.dir, e))?;
        control_tmp
            .write_all(&serde_json::to_vec_pretty(control)?)
            .and_then(|_| control_tmp.as_file().sync_all())
            .map_err(|e| EchomapError::io(control_tmp.path(), e))?;
        control_tmp
            .persist(self.control_path())
            .map_err(|e| EchomapError::io(self.control_path(), e.error))?;

        tracing::debug!(
            nodes = control.nodes,
            edges = control.edges,
            "checkpoint saved"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    /// Load and verify the checkpoint. A missing checkpoint is `Fresh`; a
    /// present-but-inconsistent one is an error, and the files are left
    /// exactly as found for restore-from-archive.
    pub fn load(&self) -> Result<LoadOutcome, EchomapError> {
        let topology = self.topology_path();
        let db = self.db_path();
        let control = self.control_path();

        let present = [&topology, &db, &control]
            .iter()
            .filter(|p| p.exists())
            .count();

        if present == 0 {
            if self.legacy_path().exists() {
                return Ok(LoadOutcome::Loaded(Box::new(self.migrate_legacy()?)));
            }
            return Ok(LoadOutcome::Fresh);
        }

        let mut problems = Vec::new();
        for (path, label) in [
            (&topology, "topology"),
            (&db, "metadata cache"),
            (&control, "control metadata"),
        ] {
            if !path.exists() {
                problems.push(format!("{label} file missing: {}", path.display()));
            }
        }
        if !problems.is_empty() {
            return Err(EchomapError::corrupt(problems));
        }

        for (path, min, label) in [
            (&topology, MIN_TOPOLOGY_BYTES, "topology"),
            (&db, MIN_DB_BYTES, "metadata cache"),
            (&control, MIN_CONTROL_BYTES, "control metadata"),
        ] {
            match fs::metadata(path) {
                Ok(meta) if meta.len() < min => problems.push(format!(
                    "{label} file is {} bytes (minimum {min})",
                    meta.len()
                )),
                Ok(_) => {}
                Err(e) => problems.push(format!("{label} unreadable: {e}")),
            }
        }
        if !problems.is_empty() {
            return Err(EchomapError::corrupt(problems));
        }

        let graph = match SampleGraph::load_topology(&topology) {
            Ok(g) => Some(g),
            Err(e) => {
                problems.push(format!("topology failed to load: {e}"));
                None
            }
        };
        let cache = match MetadataCache::open(&db) {
            Ok(c) => Some(c),
            Err(e) => {
                problems.push(format!("metadata cache failed to open: {e}"));
                None
            }
        };
        let meta: Option<ControlMeta> = match fs::read_to_string(&control) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(m) => Some(m),
                Err(e) => {
                    problems.push(format!("control metadata failed to parse: {e}"));
                    None
                }
            },
            Err(e) => {
                problems.push(format!("control metadata unreadable: {e}"));
                None
            }
        };

        if let (Some(graph), Some(mut cache), Some(meta)) = (graph, cache, meta) {
            if graph.node_count() == 0 {
                problems.push("topology has no nodes".into());
            }
            match cache.row_count() {
                Ok(0) => problems.push("metadata cache has no rows".into()),
                Ok(_) => {}
                Err(e) => problems.push(format!("metadata cache row count failed: {e}")),
            }
            if meta.nodes != graph.node_count() {
                problems.push(format!(
                    "control records {} nodes but topology has {}",
                    meta.nodes,
                    graph.node_count()
                ));
            }
            if meta.edges != graph.edge_count() {
                problems.push(format!(
                    "control records {} edges but topology has {}",
                    meta.edges,
                    graph.edge_count()
                ));
            }
            match cache.corrupt_filesize_count() {
                Ok(0) => {}
                Ok(n) => problems.push(format!("{n} cached record(s) with filesize == 0")),
                Err(e) => problems.push(format!("filesize probe failed: {e}")),
            }

            if problems.is_empty() {
                return Ok(LoadOutcome::Loaded(Box::new(CheckpointState {
                    graph,
                    cache,
                    control: meta,
                })));
            }
        }

        Err(EchomapError::corrupt(problems))
    }

    // -----------------------------------------------------------------------
    // Legacy migration
    // -----------------------------------------------------------------------

    fn migrate_legacy(&self) -> Result<CheckpointState, EchomapError> {
        let path = self.legacy_path();
        tracing::info!(path = %path.display(), "migrating legacy monolithic library");

        let raw = fs::read_to_string(&path).map_err(|e| EchomapError::io(&path, e))?;
        let legacy: LegacyLibrary = serde_json::from_str(&raw)
            .map_err(|e| EchomapError::Migration(format!("legacy file failed to parse: {e}")))?;

        let mut graph = SampleGraph::new();
        let mut kept = Vec::with_capacity(legacy.samples.len());
        let mut dropped = 0usize;
        for record in legacy.samples {
            if !record.is_valid() {
                dropped += 1;
                continue;
            }
            graph.add_node(record.id);
            kept.push(record);
        }
        if dropped > 0 {
            tracing::warn!(dropped, "legacy records with filesize == 0 discarded");
        }

        for (src, dst, kind, weight) in legacy.edges {
            graph.add_edge(src, dst, kind, weight);
        }

        fs::create_dir_all(&self.dir).map_err(|e| EchomapError::io(&self.dir, e))?;
        let mut cache = MetadataCache::open(&self.db_path())?;
        cache.bulk_insert(&kept)?;

        let mut control = ControlMeta::empty();
        control.processed_ids = legacy.processed_ids;
        control.priority_queue = legacy.priority_queue;

        // Split form written; the legacy file stays until the next save.
        self.save_inner(&graph, &mut cache, &mut control)?;

        Ok(CheckpointState {
            graph,
            cache,
            control,
        })
    }
}
