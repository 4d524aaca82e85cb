//! Pure-topology sample graph.
//!
//! Nodes are sample IDs; edges carry only a kind and an optional weight.
//! Attributes live in the metadata cache; keeping topology attribute-free
//! is what lets graph passes and metadata queries scale independently.
//!
//! On disk the graph is a postcard-encoded snapshot behind a magic/version
//! prefix, so truncated or foreign files fail to decode instead of loading
//! as an empty graph.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use serde::{Deserialize, Serialize};

use crate::error::EchomapError;
use crate::SampleId;

const MAGIC: &[u8; 4] = b"EMAP";
const FORMAT_VERSION: u8 = 1;

/// Fixed header: magic, version, node count, edge count, zero padding.
/// The counts let a verifier inspect a file without decoding the body, and
/// the fixed size gives every valid topology file a floor well above the
/// checkpoint verifier's minimum-size check.
const HEADER_LEN: usize = 128;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Directed similarity edge, weight in [0, 1].
    Similar,
    SamePack,
    SameUser,
    SharedTag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeAttr {
    pub kind: EdgeKind,
    pub weight: Option<f64>,
}

/// Serialized topology: structure only, deterministic ordering.
#[derive(Serialize, Deserialize)]
struct TopologySnapshot {
    nodes: Vec<SampleId>,
    edges: Vec<(SampleId, SampleId, EdgeKind, Option<f64>)>,
}

#[derive(Default, Debug)]
pub struct SampleGraph {
    graph: StableDiGraph<SampleId, EdgeAttr>,
    index: HashMap<SampleId, NodeIndex>,
}

impl SampleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent node insert. Returns true if the node was new.
    pub fn add_node(&mut self, id: SampleId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let idx = self.graph.add_node(id);
        self.index.insert(id, idx);
        true
    }

    /// Idempotent within (src, dst, kind). Both endpoints must already be
    /// nodes; an edge to a nonexistent node is refused, not auto-created.
    /// Returns true if the edge was added.
    pub fn add_edge(
        &mut self,
        src: SampleId,
        dst: SampleId,
        kind: EdgeKind,
        weight: Option<f64>,
    ) -> bool {
        let (Some(&s), Some(&d)) = (self.index.get(&src), self.index.get(&dst)) else {
            tracing::debug!(src, dst, ?kind, "edge refused: endpoint not in graph");
            return false;
        };
        let exists = self
            .graph
            .edges(s)
            .any(|e| e.target() == d && e.weight().kind == kind);
        if exists {
            return false;
        }
        self.graph.add_edge(s, d, EdgeAttr { kind, weight });
        true
    }

    /// Remove a node and every incident edge. Returns the number of edges
    /// removed alongside it, or None if the node was absent.
    pub fn remove_node(&mut self, id: SampleId) -> Option<usize> {
        let idx = self.index.remove(&id)?;
        let before = self.graph.edge_count();
        self.graph.remove_node(idx);
        Some(before - self.graph.edge_count())
    }

    pub fn has_node(&self, id: SampleId) -> bool {
        self.index.contains_key(&id)
    }

    /// Unique neighbors in either direction.
    pub fn neighbors(&self, id: SampleId) -> impl Iterator<Item = SampleId> + '_ {
        let idx = self.index.get(&id).copied();
        let mut seen = HashSet::new();
        idx.into_iter()
            .flat_map(|i| self.graph.neighbors_undirected(i))
            .filter_map(move |n| {
                let nid = self.graph[n];
                seen.insert(nid).then_some(nid)
            })
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = SampleId> + '_ {
        self.graph.node_indices().map(|i| self.graph[i])
    }

    fn to_snapshot(&self) -> TopologySnapshot {
        let mut nodes: Vec<SampleId> = self.node_ids().collect();
        nodes.sort_unstable();

        let mut edges: Vec<(SampleId, SampleId, EdgeKind, Option<f64>)> = self
            .graph
            .edge_references()
            .map(|e| {
                (
                    self.graph[e.source()],
                    self.graph[e.target()],
                    e.weight().kind,
                    e.weight().weight,
                )
            })
            .collect();
        edges.sort_unstable_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

        TopologySnapshot { nodes, edges }
    }

    fn from_snapshot(snapshot: TopologySnapshot) -> Result<Self, EchomapError> {
        let mut graph = Self::new();
        for id in snapshot.nodes {
            graph.add_node(id);
        }
        for (src, dst, kind, weight) in snapshot.edges {
            if !graph.has_node(src) || !graph.has_node(dst) {
                return Err(EchomapError::Topology(format!(
                    "edge ({src}, {dst}) references a node outside the node set"
                )));
            }
            graph.add_edge(src, dst, kind, weight);
        }
        Ok(graph)
    }

    /// Serialize topology to `path`. The caller owns atomicity (temp file +
    /// rename); this writes and fsyncs in place.
    pub fn save_topology(&self, path: &Path) -> Result<(), EchomapError> {
        let snapshot = self.to_snapshot();
        let body = postcard::to_stdvec(&snapshot)
            .map_err(|e| EchomapError::Topology(format!("encode failed: {e}")))?;

        let mut header = [0u8; HEADER_LEN];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        header[MAGIC.len()] = FORMAT_VERSION;
        header[5..13].copy_from_slice(&(snapshot.nodes.len() as u64).to_le_bytes());
        header[13..21].copy_from_slice(&(snapshot.edges.len() as u64).to_le_bytes());

        let mut file =
            fs::File::create(path).map_err(|e| EchomapError::io(path, e))?;
        file.write_all(&header)
            .and_then(|_| file.write_all(&body))
            .and_then(|_| file.sync_all())
            .map_err(|e| EchomapError::io(path, e))?;
        Ok(())
    }

    pub fn load_topology(path: &Path) -> Result<Self, EchomapError> {
        let bytes = fs::read(path).map_err(|e| EchomapError::io(path, e))?;

        let Some((header, body)) = bytes.split_at_checked(HEADER_LEN) else {
            return Err(EchomapError::Topology("file shorter than header".into()));
        };
        if &header[..MAGIC.len()] != MAGIC {
            return Err(EchomapError::Topology("bad magic".into()));
        }
        if header[MAGIC.len()] != FORMAT_VERSION {
            return Err(EchomapError::Topology(format!(
                "unsupported format version {}",
                header[MAGIC.len()]
            )));
        }
        let header_nodes = u64::from_le_bytes(header[5..13].try_into().expect("8 bytes"));
        let header_edges = u64::from_le_bytes(header[13..21].try_into().expect("8 bytes"));

        let snapshot: TopologySnapshot = postcard::from_bytes(body)
            .map_err(|e| EchomapError::Topology(format!("decode failed: {e}")))?;
        if snapshot.nodes.len() as u64 != header_nodes
            || snapshot.edges.len() as u64 != header_edges
        {
            return Err(EchomapError::Topology(
                "header counts disagree with the decoded body".into(),
            ));
        }
        Self::from_snapshot(snapshot)
    }
}
