use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use chrono::Utc;

use crate::semantic::{
    vectors::{record_id, TypeOrigin, VectorRecord},
    IndexManager, IndexOptions, IndexState, VectorStore,
};

use super::support::{list_def, MemoryStore, StaticSource, VocabularyEmbedder};

const WAIT: Duration = Duration::from_secs(10);

fn placeholder(name: &str) -> VectorRecord {
    let now = Utc::now();
    VectorRecord {
        id: record_id(name),
        semantic_type: name.to_string(),
        origin: TypeOrigin::Custom,
        description: String::new(),
        embedding: vec![0.0; 512],
        source_text: String::new(),
        plugin_kind: "list".to_string(),
        examples: vec![],
        created_at: now,
        updated_at: now,
    }
}

fn three_defs() -> Vec<crate::definitions::SemanticTypeDefinition> {
    vec![
        list_def("COLOR", "colors", &["RED"]),
        list_def("FRUIT", "fruits", &["APPLE"]),
        list_def("CITY", "cities", &["PARIS"]),
    ]
}

struct Fixture {
    embedder: Arc<VocabularyEmbedder>,
    vectors: Arc<VectorStore>,
    manager: IndexManager,
}

fn fixture(opts: IndexOptions) -> Fixture {
    let embedder = Arc::new(VocabularyEmbedder::new());
    let vectors = Arc::new(VectorStore::durable(Arc::new(MemoryStore::new("vectors"))));
    let manager = IndexManager::new(
        embedder.clone(),
        vectors.clone(),
        Arc::new(StaticSource::new(three_defs())),
        opts,
    );
    Fixture {
        embedder,
        vectors,
        manager,
    }
}

fn opts(min_indexed_count: usize) -> IndexOptions {
    IndexOptions {
        min_indexed_count,
        ..Default::default()
    }
}

#[test]
fn populated_index_is_not_rebuilt_on_connect() {
    let fx = fixture(opts(3));
    for name in ["A", "B", "C"] {
        fx.vectors.put(&placeholder(name)).unwrap();
    }

    assert!(fx.manager.on_connectivity_established());
    assert!(fx.manager.wait_idle(WAIT));

    assert_eq!(fx.embedder.calls(), 0);
    assert_eq!(fx.vectors.count().unwrap(), 3);
    assert!(!fx.vectors.contains("COLOR").unwrap());
}

#[test]
fn sparse_index_is_topped_up() {
    let fx = fixture(opts(10));
    fx.vectors.put(&placeholder("COLOR")).unwrap();

    let report = fx.manager.index_all_now(false).unwrap();

    assert!(!report.skipped);
    assert_eq!(report.indexed, 2);
    assert_eq!(fx.embedder.calls(), 2);
    assert_eq!(fx.vectors.count().unwrap(), 3);
    // the existing record was left alone
    assert!(fx.vectors.get("COLOR").unwrap().unwrap().source_text.is_empty());
}

#[test]
fn rebuild_clears_and_reembeds_everything() {
    let fx = fixture(opts(1));
    fx.vectors.put(&placeholder("COLOR")).unwrap();
    fx.vectors.put(&placeholder("STALE")).unwrap();

    assert!(fx.manager.rebuild_all());
    assert!(fx.manager.wait_idle(WAIT));

    assert_eq!(fx.embedder.calls(), 3);
    assert_eq!(fx.vectors.count().unwrap(), 3);
    assert!(!fx.vectors.contains("STALE").unwrap());

    let color = fx.vectors.get("COLOR").unwrap().unwrap();
    assert_eq!(color.id, "color");
    assert!(color.source_text.starts_with("Semantic Type: COLOR\n"));
    assert_eq!(color.examples, vec!["RED"]);
}

#[test]
fn force_rebuild_reembeds_without_clearing() {
    let fx = fixture(IndexOptions {
        min_indexed_count: 1,
        force_rebuild: true,
        worker_threads: 3,
    });
    fx.vectors.put(&placeholder("STALE")).unwrap();

    assert!(fx.manager.on_connectivity_established());
    assert!(fx.manager.wait_idle(WAIT));

    assert_eq!(fx.embedder.calls(), 3);
    assert!(fx.vectors.contains("STALE").unwrap());
    assert_eq!(fx.vectors.count().unwrap(), 4);
}

#[test]
fn second_bulk_request_is_ignored_while_running() {
    let fx = fixture(opts(10));
    fx.embedder.delay_ms.store(100, Ordering::SeqCst);

    assert!(fx.manager.on_connectivity_established());
    assert!(fx.manager.is_indexing());
    assert!(!fx.manager.on_connectivity_established());
    assert!(!fx.manager.rebuild_all());
    assert!(fx.manager.index_all_now(true).is_none());

    assert!(fx.manager.wait_idle(WAIT));
    assert_eq!(fx.embedder.calls(), 3);

    let progress = fx.manager.progress();
    assert_eq!(progress.state, IndexState::Idle);
    assert_eq!(progress.target, 3);
    assert_eq!(progress.completed, 3);
}

#[test]
fn failures_are_counted_and_do_not_stop_the_pass() {
    let fx = fixture(opts(10));
    fx.embedder.fail.store(true, Ordering::SeqCst);

    let report = fx.manager.index_all_now(true).unwrap();
    assert_eq!(report.indexed, 0);
    assert_eq!(report.failed, 3);
    assert_eq!(fx.manager.progress().failed, 3);
    assert!(!fx.manager.is_indexing());

    // the flag is clear, so a later pass runs
    fx.embedder.fail.store(false, Ordering::SeqCst);
    assert_eq!(fx.manager.index_all_now(true).unwrap().indexed, 3);
}

#[test]
fn incremental_hooks_run_in_submission_order() {
    let fx = fixture(opts(10));
    let def = list_def("BRAND", "brands", &["ACME"]);

    fx.manager.reindex_one(&def);
    fx.manager.remove_one("BRAND");
    assert!(fx.manager.wait_idle(WAIT));
    assert!(!fx.vectors.contains("BRAND").unwrap());

    fx.manager.remove_one("BRAND");
    fx.manager.reindex_one(&def);
    assert!(fx.manager.wait_idle(WAIT));
    assert!(fx.vectors.contains("BRAND").unwrap());
}

#[test]
fn shutdown_drains_queued_work() {
    let fx = fixture(opts(10));
    for name in ["A", "B", "C", "D"] {
        fx.manager.reindex_one(&list_def(name, "queued", &["X"]));
    }

    fx.manager.shutdown();
    assert_eq!(fx.vectors.count().unwrap(), 4);

    // tasks after shutdown are dropped
    fx.manager.reindex_one(&list_def("LATE", "late", &["X"]));
    assert!(fx.manager.wait_idle(WAIT));
    assert!(!fx.vectors.contains("LATE").unwrap());
}

#[test]
fn reindexed_built_in_keeps_its_origin() {
    let fx = fixture(opts(10));
    let mut def = list_def("EMAIL", "email address", &["A@B.COM"]);
    def.is_built_in = true;

    fx.manager.reindex_one(&def);
    assert!(fx.manager.wait_idle(WAIT));

    let record = fx.vectors.get("EMAIL").unwrap().unwrap();
    assert_eq!(record.origin, TypeOrigin::BuiltIn);
    assert_eq!(record.plugin_kind, "list");
    assert_eq!(record.embedding.len(), 512);
    assert_eq!(record.examples, vec!["A@B.COM"]);
}

#[test]
fn changes_during_bulk_pass_are_not_overwritten() {
    let embedder = Arc::new(VocabularyEmbedder::new());
    embedder.delay_ms.store(150, Ordering::SeqCst);
    let vectors = Arc::new(VectorStore::durable(Arc::new(MemoryStore::new("vectors"))));
    let source = Arc::new(StaticSource::new(three_defs()));
    let manager = IndexManager::new(
        embedder,
        vectors.clone(),
        source.clone(),
        IndexOptions {
            min_indexed_count: 10,
            worker_threads: 1,
            ..Default::default()
        },
    );

    assert!(manager.on_connectivity_established());
    std::thread::sleep(Duration::from_millis(50));

    // CITY is deleted and FRUIT edited while the pass still holds the old snapshot
    let updated_fruit = list_def("FRUIT", "orchard fruit", &["PEAR"]);
    {
        let mut defs = source.defs.lock().unwrap();
        defs.retain(|def| def.name != "CITY");
        for def in defs.iter_mut().filter(|def| def.name == "FRUIT") {
            *def = updated_fruit.clone();
        }
    }
    manager.remove_one("CITY");
    manager.reindex_one(&updated_fruit);
    assert!(manager.wait_idle(WAIT));

    assert!(!vectors.contains("CITY").unwrap());
    assert_eq!(vectors.get("FRUIT").unwrap().unwrap().description, "orchard fruit");
    assert_eq!(vectors.count().unwrap(), 2);
    manager.shutdown();
}
