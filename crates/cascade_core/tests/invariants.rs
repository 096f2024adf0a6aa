//! Store-wide invariants under scripted and randomized operation
//! sequences, including the crash-replay proxy over truncated batch
//! streams.

use cascade_core::{
    ClassDescriptor, Context, EntityId, IndexClass, IndexEmission, ObjectStore, StoreConfig,
    ValueOutcome,
};
use cascade_kv::{KvEngine, KvTable, MemoryEngine};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn quick_config() -> StoreConfig {
    StoreConfig::new()
        .batch_linger(Duration::from_millis(2))
        .niceness(Duration::from_millis(2))
}

fn open_store(engine: &Arc<MemoryEngine>) -> ObjectStore {
    ObjectStore::open(Arc::clone(engine) as Arc<dyn KvEngine>, quick_config())
}

fn by_tag(value: &serde_json::Value) -> Vec<IndexEmission> {
    value["tag"]
        .as_str()
        .map(|tag| vec![IndexEmission::key_only(tag)])
        .unwrap_or_default()
}

/// Snapshot of an index as `(key, source_id)` pairs.
fn index_pairs(index: &IndexClass) -> BTreeSet<(String, u64)> {
    let mut pairs = BTreeSet::new();
    for key in index.index_keys(None, None).unwrap() {
        let text = match &key {
            cascade_codec::Key::Text(text) => text.clone(),
            other => other.to_string(),
        };
        for entry in index.entries_for(&key).unwrap() {
            let EntityId::Num(id) = entry.source_id else {
                panic!("numeric ids expected");
            };
            pairs.insert((text.clone(), id));
        }
    }
    pairs
}

/// What the index must contain: the union of `index_by` over every
/// current source value.
fn expected_pairs(store: &ObjectStore, class: &str) -> BTreeSet<(String, u64)> {
    let class = store.class(class).unwrap();
    let mut pairs = BTreeSet::new();
    for (id, value) in class.entries().unwrap() {
        let EntityId::Num(id) = id else {
            panic!("numeric ids expected");
        };
        for emission in by_tag(&value) {
            let cascade_codec::Key::Text(text) = emission.key else {
                panic!("text keys expected");
            };
            pairs.insert((text, id));
        }
    }
    pairs
}

#[test]
fn versions_are_non_decreasing_per_entity() {
    let store = ObjectStore::open(Arc::new(MemoryEngine::new()), quick_config());
    let foo = store.define(ClassDescriptor::persisted("foo")).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut last_seen = vec![0u64; 8];
    for _ in 0..200 {
        let slot = rng.gen_range(0..8usize);
        let id = EntityId::Num(slot as u64 + 1);
        foo.set(&id, json!({ "r": rng.gen_range(0..100) })).unwrap();
        let version = foo.for_id(&id).version();
        assert!(version >= last_seen[slot], "version regressed for {id}");
        last_seen[slot] = version;
    }
}

#[test]
fn watermark_covers_every_committed_row() {
    let engine = Arc::new(MemoryEngine::new());
    let store = open_store(&engine);
    let foo = store.define(ClassDescriptor::persisted("foo")).unwrap();
    for i in 1..=40u64 {
        foo.set(&EntityId::Num(i), json!({ "i": i })).unwrap();
    }
    store.drain();

    let table = engine.open("foo").unwrap();
    let watermark: u64 = String::from_utf8(
        table
            .get(&cascade_core::entity::LAST_VERSION_KEY)
            .unwrap()
            .unwrap(),
    )
    .unwrap()
    .parse()
    .unwrap();

    let max_row = foo
        .get_instance_ids_and_versions_since(0)
        .unwrap()
        .into_iter()
        .map(|(_, version)| version)
        .max()
        .unwrap();
    assert_eq!(watermark, max_row);
}

#[test]
fn canonical_instance_is_stable() {
    let store = ObjectStore::open_in_memory();
    let foo = store.define(ClassDescriptor::persisted("foo")).unwrap();
    let id = EntityId::Num(1);
    let a = foo.for_id(&id);
    let b = foo.for_id(&id);
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn index_matches_source_after_random_mutations() {
    let engine = Arc::new(MemoryEngine::new());
    let store = open_store(&engine);
    let foo = store.define(ClassDescriptor::persisted("foo")).unwrap();
    let index = store.define_index("foo", "foo-by-tag", Arc::new(by_tag)).unwrap();

    let tags = ["red", "green", "blue", "cyan"];
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..300 {
        let id = EntityId::Num(rng.gen_range(1..=20u64));
        if rng.gen_bool(0.15) {
            foo.remove(&id).unwrap();
        } else {
            let tag = tags[rng.gen_range(0..tags.len())];
            foo.set(&id, json!({ "tag": tag, "r": rng.gen_range(0..1000) }))
                .unwrap();
        }
    }
    store.drain();

    assert_eq!(index_pairs(&index), expected_pairs(&store, "foo"));
}

#[test]
fn truncated_batch_stream_restores_consistency_on_resume() {
    let engine = Arc::new(MemoryEngine::new());
    let source_last_version;
    {
        let store = open_store(&engine);
        let foo = store.define(ClassDescriptor::persisted("foo")).unwrap();
        let _ = store.define_index("foo", "foo-by-tag", Arc::new(by_tag)).unwrap();

        let tags = ["red", "green", "blue"];
        let mut rng = StdRng::seed_from_u64(9);
        for round in 0..6 {
            for _ in 0..25 {
                let id = EntityId::Num(rng.gen_range(1..=12u64));
                let tag = tags[rng.gen_range(0..tags.len())];
                foo.set(&id, json!({ "tag": tag, "round": round })).unwrap();
            }
            store.drain();
        }
        source_last_version = foo.last_version();
        store.close();
    }

    let boundaries = engine.batch_count();
    assert!(boundaries >= 4, "workload should span several batches");

    for cut in 0..=boundaries {
        let replayed = Arc::new(engine.replay_truncated(cut));

        // Progress must never run ahead of what the truncated stream
        // actually committed.
        let watermark = replayed
            .open("foo-by-tag")
            .unwrap()
            .get(&cascade_core::entity::LAST_VERSION_KEY)
            .unwrap()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|text| text.parse::<u64>().ok())
            .unwrap_or(0);
        assert!(
            watermark <= source_last_version,
            "cut {cut}: watermark ran ahead"
        );

        // Restarting over the truncated state restores index freshness.
        let store = open_store(&replayed);
        store.define(ClassDescriptor::persisted("foo")).unwrap();
        let index = store
            .define_index("foo", "foo-by-tag", Arc::new(by_tag))
            .unwrap();
        store.drain();
        assert_eq!(
            index_pairs(&index),
            expected_pairs(&store, "foo"),
            "cut {cut}: index diverged from source"
        );
    }
}

#[test]
fn eviction_never_changes_persisted_results() {
    let engine = Arc::new(MemoryEngine::new());
    let store = ObjectStore::open(
        Arc::clone(&engine) as Arc<dyn KvEngine>,
        // A cache small enough that every load evicts earlier entries.
        quick_config().cache_capacity(256),
    );
    let foo = store.define(ClassDescriptor::persisted("foo")).unwrap();

    for i in 1..=30u64 {
        foo.set(&EntityId::Num(i), json!({ "i": i, "pad": "x".repeat(64) }))
            .unwrap();
    }
    store.drain();

    for i in 1..=30u64 {
        let id = EntityId::Num(i);
        assert_eq!(
            foo.value_of(&id, &Context::new()).unwrap(),
            ValueOutcome::Value(json!({ "i": i, "pad": "x".repeat(64) })),
            "value changed after eviction pressure"
        );
    }
}
