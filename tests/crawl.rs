//! End-to-end crawl scenarios against a scripted API.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::FakeApi;
use echomap::cache::MetadataCache;
use echomap::checkpoint::{CheckpointStore, ControlMeta, LoadOutcome};
use echomap::config::CollectionMode;
use echomap::crawler::{CrawlConfig, Crawler, ExitReason};
use echomap::graph::SampleGraph;

fn crawl_config(max_requests: u32, max_depth: u32) -> CrawlConfig {
    CrawlConfig {
        max_requests,
        max_depth,
        max_runtime: Duration::from_secs(3600),
        save_interval: 10,
        ..CrawlConfig::default()
    }
}

fn load(dir: &TempDir) -> echomap::checkpoint::CheckpointState {
    match CheckpointStore::new(dir.path()).load().unwrap() {
        LoadOutcome::Loaded(state) => *state,
        LoadOutcome::Fresh => panic!("expected a checkpoint after the run"),
    }
}

/// Seed a checkpoint whose queue holds `pending` at `depth`, with
/// `processed` already-collected samples in graph and cache.
fn seed_checkpoint(
    dir: &TempDir,
    processed: &[i64],
    pending: &[(f64, i64, u32)],
) {
    let store = CheckpointStore::new(dir.path());
    let mut graph = SampleGraph::new();
    let mut cache = MetadataCache::open(&store.db_path()).unwrap();
    let mut control = ControlMeta::empty();

    for &id in processed {
        graph.add_node(id);
        cache.set(FakeApi::record(id)).unwrap();
    }
    control.processed_ids = processed.to_vec();
    control.priority_queue = pending.to_vec();
    store.save(&graph, &mut cache, &mut control).unwrap();
}

#[tokio::test]
async fn cold_start_seeds_and_expands() {
    let api = FakeApi::new();
    *api.most_downloaded.lock().unwrap() = Some(2523);

    let mut seed = FakeApi::record(2523);
    seed.num_downloads = 100_000;
    seed.pack = Some("91".into());
    api.add_sample(seed.clone());
    api.add_sample(FakeApi::record(300));
    api.add_sample(FakeApi::record(400));
    api.add_similar(2523, vec![(FakeApi::record(300), 0.9), (FakeApi::record(400), 0.7)]);

    let dir = TempDir::new().unwrap();
    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(10, 1));
    let summary = crawler.run(&CancellationToken::new()).await.unwrap();

    assert!(summary.nodes_added >= 2, "seed plus at least one similar");
    assert!(summary.edges_added >= 1);
    assert!((2..=10).contains(&summary.api_requests));
    assert_eq!(api.seed_calls.load(Ordering::SeqCst), 1);

    let state = load(&dir);
    assert!(state.graph.node_count() >= 2);
    assert!(state.graph.has_node(2523));
    assert!(state.control.processed_ids.contains(&2523));
    assert!(state.control.edges >= 1);
    assert!(state.cache.get(2523).unwrap().unwrap().collected_at.is_some());
}

#[tokio::test]
async fn seed_lookup_failure_falls_back() {
    let api = FakeApi::new();
    *api.most_downloaded.lock().unwrap() = None; // search fails
    api.add_sample(FakeApi::record(2523));

    let dir = TempDir::new().unwrap();
    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(10, 0));
    crawler.run(&CancellationToken::new()).await.unwrap();

    let state = load(&dir);
    assert!(state.graph.has_node(2523), "fallback seed collected");
}

#[tokio::test]
async fn resume_processes_exactly_budget_in_priority_order() {
    let dir = TempDir::new().unwrap();
    let processed: Vec<i64> = (1000..1010).collect();
    // Pending entries at max_depth, so each pop costs exactly one request.
    let pending: Vec<(f64, i64, u32)> = (1..=50)
        .map(|i| (i as f64, 2000 + i as i64, 2))
        .collect();
    seed_checkpoint(&dir, &processed, &pending);

    let api = FakeApi::new();
    for &(_, id, _) in &pending {
        api.add_sample(FakeApi::record(id));
    }

    let config = crawl_config(5, 2);
    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), config);
    let summary = crawler.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.reason, ExitReason::BudgetExhausted);
    assert_eq!(summary.api_requests, 5);
    assert_eq!(api.seed_calls.load(Ordering::SeqCst), 0, "resume never seeds");

    let state = load(&dir);
    assert_eq!(state.control.processed_ids.len(), processed.len() + 5);
    // The five highest-priority pending entries were taken, best first.
    for id in [2050, 2049, 2048, 2047, 2046] {
        assert!(state.control.processed_ids.contains(&id));
    }
    assert_eq!(state.control.priority_queue.len(), 45);
    assert_eq!(state.control.session_request_count, 5);
}

#[tokio::test]
async fn budget_exhaustion_is_clean_and_never_overspends() {
    let dir = TempDir::new().unwrap();
    let pending: Vec<(f64, i64, u32)> = (1..=30).map(|i| (i as f64, i as i64, 3)).collect();
    seed_checkpoint(&dir, &[500], &pending);

    let api = FakeApi::new();
    for &(_, id, _) in &pending {
        api.add_sample(FakeApi::record(id));
    }

    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(7, 3));
    let summary = crawler.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.reason, ExitReason::BudgetExhausted);
    assert_eq!(summary.api_requests, 7);
    // Not one call more than the budget.
    assert_eq!(api.total_calls(), 7);

    // A metrics record was appended.
    let metrics = std::fs::read_to_string(dir.path().join("metrics_history.jsonl")).unwrap();
    let line: serde_json::Value =
        serde_json::from_str(metrics.lines().last().unwrap()).unwrap();
    assert_eq!(line["api_requests"], serde_json::json!(7));
    assert!(line["timestamp"].is_string());
}

#[tokio::test]
async fn empty_queue_on_nonempty_checkpoint_ends_clean() {
    let dir = TempDir::new().unwrap();
    seed_checkpoint(&dir, &[1, 2, 3], &[]);

    let api = FakeApi::new();
    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(100, 3));
    let summary = crawler.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.reason, ExitReason::QueueEmpty);
    assert_eq!(summary.nodes_added, 0);
    assert_eq!(api.total_calls(), 0);
    assert_eq!(load(&dir).graph.node_count(), 3);
}

#[tokio::test]
async fn transient_failure_re_enqueues_without_processing() {
    let dir = TempDir::new().unwrap();
    seed_checkpoint(&dir, &[900], &[(4.0, 77, 3)]);

    let api = FakeApi::new();
    api.add_sample(FakeApi::record(77));
    api.flaky.lock().unwrap().insert(77, u32::MAX); // never recovers

    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(3, 3));
    let summary = crawler.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.reason, ExitReason::BudgetExhausted);
    let state = load(&dir);
    assert!(!state.control.processed_ids.contains(&77));
    // Still pending at its original priority for the next session.
    assert_eq!(state.control.priority_queue, vec![(4.0, 77, 3)]);
    assert!(!state.graph.has_node(77));
}

#[tokio::test]
async fn transient_then_success_collects_the_sample() {
    let dir = TempDir::new().unwrap();
    seed_checkpoint(&dir, &[900], &[(4.0, 78, 3)]);

    let api = FakeApi::new();
    api.add_sample(FakeApi::record(78));
    api.flaky.lock().unwrap().insert(78, 1); // one failure, then fine

    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(5, 3));
    crawler.run(&CancellationToken::new()).await.unwrap();

    let state = load(&dir);
    assert!(state.control.processed_ids.contains(&78));
    assert!(state.graph.has_node(78));
}

#[tokio::test]
async fn zero_filesize_sample_is_rejected_but_marked_processed() {
    let dir = TempDir::new().unwrap();
    seed_checkpoint(&dir, &[900], &[(4.0, 66, 3)]);

    let api = FakeApi::new();
    let mut broken = FakeApi::record(66);
    broken.filesize = 0;
    api.add_sample(broken);

    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(5, 3));
    crawler.run(&CancellationToken::new()).await.unwrap();

    let state = load(&dir);
    assert!(state.control.processed_ids.contains(&66));
    assert!(!state.graph.has_node(66));
    assert!(state.cache.get(66).unwrap().is_none());
}

#[tokio::test]
async fn co_membership_edges_link_existing_nodes_only() {
    let dir = TempDir::new().unwrap();
    // 111 shares a pack with the already-collected 110.
    let store = CheckpointStore::new(dir.path());
    let mut graph = SampleGraph::new();
    let mut cache = MetadataCache::open(&store.db_path()).unwrap();
    let mut control = ControlMeta::empty();
    let mut existing = FakeApi::record(110);
    existing.pack = Some("alpha".into());
    graph.add_node(110);
    cache.set(existing).unwrap();
    control.processed_ids = vec![110];
    control.priority_queue = vec![(1.0, 111, 3)];
    store.save(&graph, &mut cache, &mut control).unwrap();

    let api = FakeApi::new();
    let mut incoming = FakeApi::record(111);
    incoming.pack = Some("alpha".into());
    // Same pack as a sample that is NOT in the graph: no edge, no node.
    incoming.username = "stranger".into();
    api.add_sample(incoming);

    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(5, 3));
    let summary = crawler.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.edges_added, 1, "one same_pack edge to node 110");
    let state = load(&dir);
    assert_eq!(state.graph.edge_count(), 1);
    let neighbors: Vec<_> = state.graph.neighbors(111).collect();
    assert_eq!(neighbors, vec![110]);
}

#[tokio::test]
async fn similar_expansion_respects_depth_budget() {
    let api = FakeApi::new();
    *api.most_downloaded.lock().unwrap() = Some(1);
    api.add_sample(FakeApi::record(1));
    api.add_sample(FakeApi::record(2));
    api.add_sample(FakeApi::record(3));
    api.add_similar(1, vec![(FakeApi::record(2), 0.9)]);
    api.add_similar(2, vec![(FakeApi::record(3), 0.8)]);

    let dir = TempDir::new().unwrap();
    // max_depth 1: the seed expands, its similars do not.
    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(50, 1));
    let summary = crawler.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.reason, ExitReason::QueueEmpty);
    assert_eq!(api.similar_calls.load(Ordering::SeqCst), 1);
    let state = load(&dir);
    assert!(state.graph.has_node(2));
    assert!(!state.graph.has_node(3), "depth 2 never expanded");
}

#[tokio::test]
async fn runs_against_dead_api_leave_identical_state() {
    let dir = TempDir::new().unwrap();
    seed_checkpoint(&dir, &[1, 2], &[(9.0, 10, 3), (8.0, 11, 3)]);

    let api = FakeApi::new();
    api.flaky.lock().unwrap().insert(10, u32::MAX);
    api.flaky.lock().unwrap().insert(11, u32::MAX);

    let snapshot = |dir: &TempDir| {
        let state = load(dir);
        (
            state.graph.node_count(),
            state.graph.edge_count(),
            state.control.processed_ids.clone(),
            state.control.priority_queue.clone(),
        )
    };

    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(4, 3));
    crawler.run(&CancellationToken::new()).await.unwrap();
    let first = snapshot(&dir);

    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(4, 3));
    crawler.run(&CancellationToken::new()).await.unwrap();
    let second = snapshot(&dir);

    assert_eq!(first, second);
}

#[tokio::test]
async fn queue_empty_mode_drains_the_queue() {
    let dir = TempDir::new().unwrap();
    let pending: Vec<(f64, i64, u32)> = (1..=8).map(|i| (i as f64, i as i64, 3)).collect();
    seed_checkpoint(&dir, &[100], &pending);

    let api = FakeApi::new();
    for &(_, id, _) in &pending {
        api.add_sample(FakeApi::record(id));
    }

    let config = CrawlConfig {
        collection_mode: CollectionMode::QueueEmpty,
        // Would stop after 2 in limit mode; queue_empty ignores it.
        max_requests: 2,
        ..crawl_config(2, 3)
    };
    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), config);
    let summary = crawler.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.reason, ExitReason::QueueEmpty);
    assert_eq!(load(&dir).control.priority_queue.len(), 0);
    assert_eq!(summary.nodes_added, 8);
}

#[tokio::test]
async fn cancellation_saves_and_exits() {
    let dir = TempDir::new().unwrap();
    let pending: Vec<(f64, i64, u32)> = (1..=5).map(|i| (i as f64, i as i64, 3)).collect();
    seed_checkpoint(&dir, &[100], &pending);

    let api = FakeApi::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let crawler = Crawler::new(&api, CheckpointStore::new(dir.path()), crawl_config(50, 3));
    let summary = crawler.run(&cancel).await.unwrap();

    assert_eq!(summary.reason, ExitReason::Cancelled);
    assert_eq!(api.total_calls(), 0);
    // Checkpoint still saved on the way out.
    assert_eq!(load(&dir).control.priority_queue.len(), 5);
}
