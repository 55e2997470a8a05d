//! Concurrency behavior of the document store under parallel writers.

use std::sync::Arc;

use filegate_core::config::EngineConfig;
use filegate_core::deadline::Deadline;
use filegate_core::paths::PathResolver;
use filegate_core::store::DocumentStore;

fn store_in(tmp: &std::path::Path) -> DocumentStore {
    let config = EngineConfig {
        network_root: tmp.join("share"),
        local_fallback_root: tmp.join("local"),
        ..EngineConfig::default()
    };
    DocumentStore::new(Arc::new(PathResolver::new(&config)))
}

#[test]
fn parallel_modifies_on_one_document_serialize() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(store_in(tmp.path()));

    const THREADS: usize = 8;
    const INCREMENTS: usize = 25;

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    store
                        .modify("counter.json", Deadline::none(), |value: &mut u64| {
                            *value += 1;
                        })
                        .expect("modify");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    // Every increment survived: no lost updates under contention.
    let total: u64 = store
        .read("counter.json")
        .expect("read")
        .expect("present");
    assert_eq!(total, (THREADS * INCREMENTS) as u64);
}

#[test]
fn modifies_on_different_documents_do_not_contend() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(store_in(tmp.path()));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let doc = format!("doc-{i}.json");
                for _ in 0..20 {
                    store
                        .modify(&doc, Deadline::none(), |value: &mut u64| {
                            *value += 1;
                        })
                        .expect("modify");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    for i in 0..4 {
        let value: u64 = store
            .read(&format!("doc-{i}.json"))
            .expect("read")
            .expect("present");
        assert_eq!(value, 20);
    }
}

#[test]
fn readers_see_complete_documents_during_writes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(store_in(tmp.path()));

    // A large-ish document makes a torn write observable if one could
    // happen.
    let payload: Vec<String> = (0..500).map(|i| format!("entry-{i:04}")).collect();
    store
        .modify("big.json", Deadline::none(), |value: &mut Vec<String>| {
            *value = payload.clone();
        })
        .expect("seed");

    let writer = {
        let store = Arc::clone(&store);
        let payload = payload.clone();
        std::thread::spawn(move || {
            for _ in 0..20 {
                store
                    .modify("big.json", Deadline::none(), |value: &mut Vec<String>| {
                        *value = payload.clone();
                    })
                    .expect("rewrite");
            }
        })
    };

    for _ in 0..50 {
        let snapshot: Option<Vec<String>> = store.read("big.json").expect("read never corrupt");
        let snapshot = snapshot.expect("document always present once created");
        assert_eq!(snapshot.len(), 500, "atomic rename means no partial reads");
    }

    writer.join().expect("join");
}
