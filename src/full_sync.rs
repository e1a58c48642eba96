//! Initial import of whole collections into freshly rebuilt tables.
//!
//! The import is destructive on the destination: tables are dropped and
//! recreated without durability, rows stream in through the bulk load path,
//! and constraints and indexes arrive only after the data, so the load never
//! pays per-row constraint checks.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bson::Document;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tracing::info;

use crate::buffer::CopyBuffers;
use crate::schema::{Mappings, TableMapping};
use crate::sink::SqlSink;
use crate::transform::map_document;

/// Read access to whole source collections.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Stream every document of a collection.
    async fn collection_documents(
        &self,
        collection: &str,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Document>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    Pending,
    Importing,
    Done,
    Failed,
}

/// Progress of one collection's import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSnapshot {
    pub collection: String,
    pub state: ImportState,
    pub documents: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Progress {
    state: ImportState,
    documents: u64,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Progress {
    fn pending() -> Self {
        Progress {
            state: ImportState::Pending,
            documents: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Shared, observable progress of the initial import.
#[derive(Default)]
pub struct ImportStatus {
    collections: std::sync::Mutex<HashMap<String, Progress>>,
}

impl ImportStatus {
    pub fn new(mappings: &Mappings) -> Self {
        let collections = mappings
            .collections()
            .map(|(name, _)| (name.clone(), Progress::pending()))
            .collect();
        ImportStatus {
            collections: std::sync::Mutex::new(collections),
        }
    }

    fn set_state(&self, collection: &str, state: ImportState) {
        let mut collections = self.collections.lock().unwrap();
        let entry = collections
            .entry(collection.to_string())
            .or_insert_with(Progress::pending);
        match state {
            ImportState::Importing => entry.started_at = Some(Utc::now()),
            ImportState::Done | ImportState::Failed => entry.finished_at = Some(Utc::now()),
            ImportState::Pending => {}
        }
        entry.state = state;
    }

    fn document_done(&self, collection: &str) {
        let mut collections = self.collections.lock().unwrap();
        if let Some(entry) = collections.get_mut(collection) {
            entry.documents += 1;
        }
    }

    pub fn snapshot(&self) -> Vec<ImportSnapshot> {
        let collections = self.collections.lock().unwrap();
        let mut snapshots: Vec<ImportSnapshot> = collections
            .iter()
            .map(|(collection, progress)| ImportSnapshot {
                collection: collection.clone(),
                state: progress.state,
                documents: progress.documents,
                started_at: progress.started_at,
                finished_at: progress.finished_at,
            })
            .collect();
        snapshots.sort_by(|a, b| a.collection.cmp(&b.collection));
        snapshots
    }

    /// True once every collection finished, successfully or not.
    pub fn is_settled(&self) -> bool {
        self.collections
            .lock()
            .unwrap()
            .values()
            .all(|progress| matches!(progress.state, ImportState::Done | ImportState::Failed))
    }
}

/// Import one collection: rebuild its tables, stream the documents through
/// the buffers, then add constraints and indexes.
pub async fn import_collection(
    source: &dyn DocumentSource,
    sink: &dyn SqlSink,
    buffers: &CopyBuffers,
    collection: &str,
    mapping: &TableMapping,
    status: &ImportStatus,
) -> anyhow::Result<u64> {
    status.set_state(collection, ImportState::Importing);
    match import_collection_inner(source, sink, buffers, collection, mapping, status).await {
        Ok(documents) => {
            status.set_state(collection, ImportState::Done);
            info!(collection, documents, "collection imported");
            Ok(documents)
        }
        Err(e) => {
            status.set_state(collection, ImportState::Failed);
            Err(e).with_context(|| format!("import of collection '{collection}' failed"))
        }
    }
}

async fn import_collection_inner(
    source: &dyn DocumentSource,
    sink: &dyn SqlSink,
    buffers: &CopyBuffers,
    collection: &str,
    mapping: &TableMapping,
    status: &ImportStatus,
) -> anyhow::Result<u64> {
    let tables = mapping.tables();

    // Children first on the way down, parents first on the way up.
    for (table, _) in tables.iter().rev() {
        sink.drop_table(&table.name).await?;
    }
    for (table, _) in &tables {
        let columns: Vec<(String, String)> = table
            .column_specs()
            .into_iter()
            .map(|spec| (spec.name, spec.sql_type))
            .collect();
        sink.create_table(&table.name, &columns).await?;
    }
    info!(collection, tables = tables.len(), "destination tables rebuilt");

    let mut documents = source.collection_documents(collection).await?;
    let mut count: u64 = 0;
    while let Some(document) = documents.next().await {
        let document = document?;
        let rows = map_document(mapping, &document)?;
        buffers.push(mapping, rows).await?;
        status.document_done(collection);
        count += 1;
    }
    buffers.finalize(mapping).await?;

    for (table, _) in &tables {
        sink.add_primary_key(&table.name, &table.pk).await?;
    }
    for (table, parent) in &tables {
        if let (Some(link), Some(parent)) = (&table.parent_link, parent) {
            sink.add_foreign_key(&table.name, link, &parent.name, &parent.pk)
                .await?;
        }
    }
    for (table, _) in &tables {
        for index in &table.indexes {
            sink.create_index(index).await?;
        }
    }
    for (table, _) in &tables {
        sink.mark_durable(&table.name).await?;
    }

    Ok(count)
}

/// Import every mapped collection. Collections run concurrently; their
/// buffers are independent so bulk loads never interleave across groups.
pub async fn run_full_sync(
    mappings: &Mappings,
    source: &dyn DocumentSource,
    sink: Arc<dyn SqlSink>,
    status: &ImportStatus,
) -> anyhow::Result<()> {
    let buffers = CopyBuffers::new(sink.clone());
    let imports = mappings.collections().map(|(collection, mapping)| {
        import_collection(source, sink.as_ref(), &buffers, collection, mapping, status)
    });
    let counts = futures::future::try_join_all(imports).await?;
    info!(
        collections = counts.len(),
        documents = counts.iter().sum::<u64>(),
        "initial import complete"
    );
    Ok(())
}
