//! echomap: resumable, rate-limited graph crawler and library manager for
//! the Freesound audio API.
//!
//! Discovery walks similarity from a seed sample, materializing a directed
//! graph (similarity plus pack/uploader/tag co-membership) whose attributes
//! live in an embedded metadata cache. State persists as a split checkpoint
//! {topology, cache, control JSON} with atomic saves and verified loads,
//! and a batch validator periodically reconciles the library against the
//! upstream API. Everything runs inside a hard daily request quota and is
//! built to make incremental nightly progress over months.

pub mod api;
pub mod archive;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod crawler;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod queue;
pub mod rate_limit;
pub mod validator;

/// Upstream sample identifier. A single integer type throughout; string
/// conversion happens only at serialization boundaries.
pub type SampleId = i64;
