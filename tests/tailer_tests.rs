//! Change stream tailing and idempotent application.

use std::sync::Arc;

use bson::{doc, Bson};
use mongo_pg_sync::checkpoint::{Checkpoint, CheckpointStore};
use mongo_pg_sync::incremental_sync::Tailer;
use mongo_pg_sync::schema::Mappings;
use mongo_pg_sync::sink::SqlSink;
use mongo_pg_sync::testing::{
    delete_event, skip_event, superhero_mappings, upsert_event, FixtureSource,
    MemoryCheckpointStore, MemorySink,
};
use tokio_util::sync::CancellationToken;

/// Create the destination tables with keys and cascading foreign keys, as an
/// initial import would have left them.
async fn prepare_schema(sink: &MemorySink, mappings: &Mappings) {
    for (_, mapping) in mappings.collections() {
        for (table, parent) in mapping.tables() {
            let columns: Vec<(String, String)> = table
                .column_specs()
                .into_iter()
                .map(|spec| (spec.name, spec.sql_type))
                .collect();
            sink.create_table(&table.name, &columns).await.unwrap();
            sink.add_primary_key(&table.name, &table.pk).await.unwrap();
            if let (Some(link), Some(parent)) = (&table.parent_link, parent) {
                sink.add_foreign_key(&table.name, link, &parent.name, &parent.pk)
                    .await
                    .unwrap();
            }
        }
    }
}

fn tailer(
    mappings: &Mappings,
    sink: &Arc<MemorySink>,
    store: &Arc<MemoryCheckpointStore>,
) -> Tailer {
    Tailer::new(
        mappings.clone(),
        sink.clone() as Arc<dyn SqlSink>,
        store.clone(),
        "test".to_string(),
    )
}

fn hero_doc(characters: &[&str]) -> bson::Document {
    doc! {
        "_id": "hero-1",
        "superhero": "Batman",
        "publisher": "DC",
        "characters": characters.iter().map(|name| doc! { "name": *name }).collect::<Vec<_>>(),
    }
}

#[tokio::test]
async fn upserts_materialize_all_derived_rows() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    prepare_schema(&sink, &mappings).await;

    let source = FixtureSource::new().with_events(vec![upsert_event(
        "superheros",
        hero_doc(&["Bruce Wayne", "Dick Grayson"]),
        100,
        1,
    )]);
    tailer(&mappings, &sink, &store)
        .watch(&source, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sink.row_count("superheros"), 1);
    assert_eq!(sink.row_count("superhero_characters"), 2);
    assert_eq!(
        store.last_known("test").await.unwrap(),
        Some(Checkpoint::new(100, 1))
    );
}

#[tokio::test]
async fn replaying_events_is_idempotent() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    prepare_schema(&sink, &mappings).await;

    let event = upsert_event("superheros", hero_doc(&["Bruce Wayne"]), 100, 1);
    let source = FixtureSource::new().with_events(vec![event.clone(), event]);
    tailer(&mappings, &sink, &store)
        .watch(&source, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sink.row_count("superheros"), 1);
    assert_eq!(sink.row_count("superhero_characters"), 1);
    assert_eq!(store.history("test").len(), 2);
}

#[tokio::test]
async fn updates_shrink_child_rows() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    prepare_schema(&sink, &mappings).await;

    let source = FixtureSource::new().with_events(vec![
        upsert_event("superheros", hero_doc(&["Bruce Wayne", "Dick Grayson"]), 100, 1),
        upsert_event("superheros", hero_doc(&["Bruce Wayne"]), 100, 2),
    ]);
    tailer(&mappings, &sink, &store)
        .watch(&source, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sink.row_count("superhero_characters"), 1);
    let row = &sink.rows("superhero_characters")[0];
    assert_eq!(row.get("name").unwrap().to_string(), "Bruce Wayne");
}

#[tokio::test]
async fn deletes_cascade_to_child_rows() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    prepare_schema(&sink, &mappings).await;

    let source = FixtureSource::new().with_events(vec![
        upsert_event("superheros", hero_doc(&["Bruce Wayne"]), 100, 1),
        delete_event("superheros", Bson::String("hero-1".to_string()), 100, 2),
    ]);
    tailer(&mappings, &sink, &store)
        .watch(&source, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sink.row_count("superheros"), 0);
    assert_eq!(sink.row_count("superhero_characters"), 0);
    assert_eq!(
        store.last_known("test").await.unwrap(),
        Some(Checkpoint::new(100, 2))
    );
}

#[tokio::test]
async fn binary_ids_are_applied_and_never_stall_the_stream() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    prepare_schema(&sink, &mappings).await;

    let uuid = Bson::Binary(bson::Binary {
        subtype: bson::spec::BinarySubtype::Uuid,
        bytes: vec![0xde, 0xad, 0xbe, 0xef],
    });
    let mut with_binary_id = hero_doc(&[]);
    with_binary_id.insert("_id", uuid.clone());
    let source = FixtureSource::new().with_events(vec![
        upsert_event("superheros", with_binary_id, 100, 1),
        upsert_event("superheros", hero_doc(&[]), 100, 2),
        delete_event("superheros", uuid, 100, 3),
    ]);
    tailer(&mappings, &sink, &store)
        .watch(&source, None, CancellationToken::new())
        .await
        .unwrap();

    // The binary-keyed row was written, the later events were not blocked,
    // and the matching delete found the same canonical key again.
    assert_eq!(sink.row_count("superheros"), 1);
    assert_eq!(sink.pk_values("superheros"), vec!["hero-1"]);
    assert_eq!(
        store.last_known("test").await.unwrap(),
        Some(Checkpoint::new(100, 3))
    );
}

#[tokio::test]
async fn skipped_events_still_advance_the_checkpoint() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());

    let source = FixtureSource::new().with_events(vec![skip_event(200, 1)]);
    tailer(&mappings, &sink, &store)
        .watch(&source, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        store.last_known("test").await.unwrap(),
        Some(Checkpoint::new(200, 1))
    );
}

#[tokio::test]
async fn unmapped_collections_are_ignored_but_tracked() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());

    let source = FixtureSource::new().with_events(vec![upsert_event(
        "audit_log",
        doc! { "_id": "a", "entry": "noise" },
        300,
        1,
    )]);
    tailer(&mappings, &sink, &store)
        .watch(&source, None, CancellationToken::new())
        .await
        .unwrap();

    assert!(!sink.table_exists("audit_log"));
    assert_eq!(
        store.last_known("test").await.unwrap(),
        Some(Checkpoint::new(300, 1))
    );
}

#[tokio::test]
async fn resume_replays_only_events_after_the_checkpoint() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    prepare_schema(&sink, &mappings).await;

    let source = FixtureSource::new().with_events(vec![
        upsert_event("superheros", hero_doc(&[]), 100, 1),
        delete_event("superheros", Bson::String("hero-1".to_string()), 100, 2),
    ]);
    // Resuming past the upsert only replays the delete, which is a no-op on
    // an empty destination.
    tailer(&mappings, &sink, &store)
        .watch(&source, Some(Checkpoint::new(100, 1)), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sink.row_count("superheros"), 0);
    assert_eq!(store.history("test"), vec![Checkpoint::new(100, 2)]);
}

#[tokio::test]
async fn failed_application_leaves_the_checkpoint_untouched() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    prepare_schema(&sink, &mappings).await;
    sink.fail_table("superheros");

    let source = FixtureSource::new().with_events(vec![upsert_event(
        "superheros",
        hero_doc(&[]),
        100,
        1,
    )]);
    let result = tailer(&mappings, &sink, &store)
        .watch(&source, None, CancellationToken::new())
        .await;

    assert!(result.is_err());
    assert_eq!(store.last_known("test").await.unwrap(), None);
}

#[tokio::test]
async fn regressive_positions_are_rejected() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());

    let source = FixtureSource::new().with_events(vec![skip_event(200, 5), skip_event(200, 3)]);
    let result = tailer(&mappings, &sink, &store)
        .watch(&source, None, CancellationToken::new())
        .await;

    assert!(result.is_err());
    assert_eq!(
        store.last_known("test").await.unwrap(),
        Some(Checkpoint::new(200, 5))
    );
}

#[tokio::test]
async fn cancellation_stops_the_tailer_between_events() {
    let mappings = superhero_mappings();
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    prepare_schema(&sink, &mappings).await;

    let source = FixtureSource::new()
        .with_events(vec![upsert_event("superheros", hero_doc(&[]), 100, 1)])
        .hang_at_end();
    let cancel = CancellationToken::new();
    let tailer = tailer(&mappings, &sink, &store);

    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { tailer.watch(&source, None, cancel).await })
    };
    // Wait for the first event to land before cancelling.
    for _ in 0..100 {
        if store.last_known("test").await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.row_count("superheros"), 1);
    assert_eq!(
        store.last_known("test").await.unwrap(),
        Some(Checkpoint::new(100, 1))
    );
}
