//! Split checkpoint integration: atomic save, verified load, migration.

use echomap::api::SampleRecord;
use echomap::cache::MetadataCache;
use echomap::checkpoint::{
    CheckpointStore, ControlMeta, LoadOutcome, CONTROL_FILE, LEGACY_FILE,
};
use echomap::error::EchomapError;
use echomap::graph::{EdgeKind, SampleGraph};
use tempfile::TempDir;

fn record(id: i64) -> SampleRecord {
    let mut r = SampleRecord::bare(id);
    r.name = format!("sample-{id}");
    r.filesize = 4096 + id as u64;
    r
}

/// A saved three-node checkpoint in a fresh directory.
fn saved_checkpoint(dir: &TempDir) -> CheckpointStore {
    let store = CheckpointStore::new(dir.path());
    let mut graph = SampleGraph::new();
    let mut cache = MetadataCache::open(&store.db_path()).unwrap();
    let mut control = ControlMeta::empty();

    for id in [1, 2, 3] {
        graph.add_node(id);
        cache.set(record(id)).unwrap();
    }
    graph.add_edge(1, 2, EdgeKind::Similar, Some(0.9));
    graph.add_edge(2, 3, EdgeKind::SamePack, None);

    control.processed_ids = vec![1, 2];
    control.priority_queue = vec![(5.5, 3, 1), (2.0, 4, 2)];
    control.session_request_count = 7;

    store.save(&graph, &mut cache, &mut control).unwrap();
    store
}

fn load_state(store: &CheckpointStore) -> echomap::checkpoint::CheckpointState {
    match store.load().unwrap() {
        LoadOutcome::Loaded(state) => *state,
        LoadOutcome::Fresh => panic!("expected a loaded checkpoint"),
    }
}

#[test]
fn empty_directory_is_fresh_not_corrupt() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("never-created"));
    assert!(matches!(store.load().unwrap(), LoadOutcome::Fresh));
}

#[test]
fn save_load_round_trip_preserves_everything() {
    let dir = TempDir::new().unwrap();
    let store = saved_checkpoint(&dir);

    let mut state = load_state(&store);
    assert_eq!(state.graph.node_count(), 3);
    assert_eq!(state.graph.edge_count(), 2);
    assert_eq!(state.control.nodes, 3);
    assert_eq!(state.control.edges, 2);
    assert_eq!(state.control.processed_ids, vec![1, 2]);
    assert_eq!(state.control.priority_queue, vec![(5.5, 3, 1), (2.0, 4, 2)]);
    assert_eq!(state.control.session_request_count, 7);

    // Every topology node has a cache record and vice versa.
    let cached = state.cache.ids().unwrap();
    let mut nodes: Vec<_> = state.graph.node_ids().collect();
    nodes.sort_unstable();
    assert_eq!(cached, nodes);
    assert_eq!(state.cache.get(2).unwrap().unwrap().name, "sample-2");
}

#[test]
fn control_json_is_stable_across_save_load_save() {
    let dir = TempDir::new().unwrap();
    let store = saved_checkpoint(&dir);
    let first = std::fs::read_to_string(store.control_path()).unwrap();

    let mut state = load_state(&store);
    store
        .save(&state.graph, &mut state.cache, &mut state.control)
        .unwrap();
    let second = std::fs::read_to_string(store.control_path()).unwrap();

    let mut a: serde_json::Value = serde_json::from_str(&first).unwrap();
    let mut b: serde_json::Value = serde_json::from_str(&second).unwrap();
    a.as_object_mut().unwrap().remove("timestamp");
    b.as_object_mut().unwrap().remove("timestamp");
    assert_eq!(a, b);
}

#[test]
fn node_count_mismatch_is_rejected_and_untouched() {
    let dir = TempDir::new().unwrap();
    let store = saved_checkpoint(&dir);

    let raw = std::fs::read_to_string(store.control_path()).unwrap();
    let mut control: serde_json::Value = serde_json::from_str(&raw).unwrap();
    control["nodes"] = serde_json::json!(515);
    std::fs::write(store.control_path(), control.to_string()).unwrap();

    let before = std::fs::read(store.control_path()).unwrap();
    let err = store.load().unwrap_err();
    assert!(matches!(err, EchomapError::CheckpointCorrupt { .. }));
    assert!(err.to_string().contains("515"));

    // The corrupt checkpoint was not overwritten by the failed load.
    assert_eq!(std::fs::read(store.control_path()).unwrap(), before);
}

#[test]
fn edge_count_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = saved_checkpoint(&dir);

    let raw = std::fs::read_to_string(store.control_path()).unwrap();
    let mut control: serde_json::Value = serde_json::from_str(&raw).unwrap();
    control["edges"] = serde_json::json!(99);
    std::fs::write(store.control_path(), control.to_string()).unwrap();

    assert!(store.load().is_err());
}

#[test]
fn missing_component_is_corrupt_not_fresh() {
    let dir = TempDir::new().unwrap();
    let store = saved_checkpoint(&dir);
    std::fs::remove_file(dir.path().join(CONTROL_FILE)).unwrap();

    let err = store.load().unwrap_err();
    assert!(err.to_string().contains("control"));
}

#[test]
fn undersized_topology_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = saved_checkpoint(&dir);
    std::fs::write(store.topology_path(), b"EMAP tiny").unwrap();

    let err = store.load().unwrap_err();
    assert!(err.to_string().contains("topology"));
}

#[test]
fn garbage_database_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = saved_checkpoint(&dir);
    std::fs::write(store.db_path(), vec![0xABu8; 16 * 1024]).unwrap();

    assert!(store.load().is_err());
}

#[test]
fn zero_filesize_record_is_rejected_at_load() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut graph = SampleGraph::new();
    let mut cache = MetadataCache::open(&store.db_path()).unwrap();
    let mut control = ControlMeta::empty();

    graph.add_node(1);
    graph.add_node(2);
    cache.set(record(1)).unwrap();
    cache.set(SampleRecord::bare(2)).unwrap(); // filesize 0
    store.save(&graph, &mut cache, &mut control).unwrap();

    let err = store.load().unwrap_err();
    assert!(err.to_string().contains("filesize"));
}

#[test]
fn legacy_monolith_migrates_to_split_form() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());

    let legacy = serde_json::json!({
        "samples": [
            {"id": 10, "name": "kick", "filesize": 2048, "username": "a"},
            {"id": 20, "name": "snare", "filesize": 4096, "username": "a"},
            {"id": 30, "name": "ghost", "filesize": 0}
        ],
        "edges": [
            [10, 20, "similar", 0.8],
            [20, 30, "same_user", null]
        ],
        "processed_ids": [10, 20],
        "priority_queue": [[3.5, 40, 1]]
    });
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(dir.path().join(LEGACY_FILE), legacy.to_string()).unwrap();

    let mut state = load_state(&store);
    // The zero-filesize record and its edges were dropped in migration.
    assert_eq!(state.graph.node_count(), 2);
    assert_eq!(state.graph.edge_count(), 1);
    assert_eq!(state.cache.ids().unwrap(), vec![10, 20]);
    assert_eq!(state.control.processed_ids, vec![10, 20]);
    assert_eq!(state.control.priority_queue, vec![(3.5, 40, 1)]);

    // Split files exist; the legacy file survives the migration save...
    assert!(store.topology_path().exists());
    assert!(store.db_path().exists());
    assert!(store.control_path().exists());
    assert!(store.legacy_path().exists());

    // ...and is only removed by the next successful save cycle.
    store
        .save(&state.graph, &mut state.cache, &mut state.control)
        .unwrap();
    assert!(!store.legacy_path().exists());

    // The migrated checkpoint loads like any other.
    let state = load_state(&store);
    assert_eq!(state.graph.node_count(), 2);
}

#[test]
fn unparseable_legacy_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(dir.path().join(LEGACY_FILE), "not json at all").unwrap();

    assert!(matches!(
        store.load(),
        Err(EchomapError::Migration(_))
    ));
}
