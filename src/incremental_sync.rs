//! Incremental synchronization from a change log.
//!
//! The tailer consumes an ordered stream of change events, applies each one
//! through the sink, and only then advances the checkpoint. Delivery is
//! at-least-once; every application is idempotent so replays after a crash
//! converge to the same destination state.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::schema::Mappings;
use crate::sink::SqlSink;
use crate::transform::map_document;
use crate::values::{canonical_id, SqlValue};

/// What one source change means for the destination.
#[derive(Debug, Clone)]
pub enum ChangeOp {
    /// Write the document's current state, replacing whatever rows it
    /// produced before.
    Upsert {
        collection: String,
        document: Document,
    },
    /// The document is gone; remove its root row.
    Delete { collection: String, id: Bson },
    /// Nothing to apply, but the position still moves forward.
    Skip,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub position: Checkpoint,
}

/// An open, ordered stream of change events.
#[async_trait]
pub trait ChangeStream: Send {
    /// The next event, or `None` once the stream ends.
    async fn next_event(&mut self) -> anyhow::Result<Option<ChangeEvent>>;
}

/// A source database's change log.
#[async_trait]
pub trait ChangeLogSource: Send + Sync {
    /// Open the change log, resuming just after `from` when given.
    async fn open(&self, from: Option<Checkpoint>) -> anyhow::Result<Box<dyn ChangeStream>>;

    /// The current head position of the change log.
    async fn latest_position(&self) -> anyhow::Result<Checkpoint>;
}

/// Applies change events and tracks progress.
pub struct Tailer {
    mappings: Mappings,
    sink: Arc<dyn SqlSink>,
    store: Arc<dyn CheckpointStore>,
    stream_id: String,
}

impl Tailer {
    pub fn new(
        mappings: Mappings,
        sink: Arc<dyn SqlSink>,
        store: Arc<dyn CheckpointStore>,
        stream_id: String,
    ) -> Self {
        Tailer {
            mappings,
            sink,
            store,
            stream_id,
        }
    }

    /// Consume the change log until cancellation or the stream ends.
    ///
    /// The checkpoint advances only after the event is fully applied, and
    /// cancellation is honored between events, never in the middle of one.
    pub async fn watch(
        &self,
        source: &dyn ChangeLogSource,
        from: Option<Checkpoint>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        match from {
            Some(checkpoint) => info!(
                stream_id = self.stream_id.as_str(),
                checkpoint = %checkpoint,
                "resuming incremental sync"
            ),
            None => info!(
                stream_id = self.stream_id.as_str(),
                "starting incremental sync from the change log head"
            ),
        }
        let mut stream = source.open(from).await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(stream_id = self.stream_id.as_str(), "incremental sync stopped");
                    return Ok(());
                }
                event = stream.next_event() => {
                    let Some(event) = event? else {
                        info!(stream_id = self.stream_id.as_str(), "change stream ended");
                        return Ok(());
                    };
                    self.apply(&event.op).await?;
                    self.store.advance(&self.stream_id, event.position).await?;
                }
            }
        }
    }

    async fn apply(&self, op: &ChangeOp) -> anyhow::Result<()> {
        match op {
            ChangeOp::Skip => {
                trace!("skipping change event");
                Ok(())
            }
            ChangeOp::Delete { collection, id } => {
                let Some(mapping) = self.mappings.resolve(collection) else {
                    trace!(collection, "ignoring delete for unmapped collection");
                    return Ok(());
                };
                let key = SqlValue::String(canonical_id(id));
                debug!(collection, key = %key, "applying delete");
                self.sink.remove(&mapping.name, &mapping.pk, &key).await
            }
            ChangeOp::Upsert {
                collection,
                document,
            } => {
                let Some(mapping) = self.mappings.resolve(collection) else {
                    trace!(collection, "ignoring change for unmapped collection");
                    return Ok(());
                };
                let rows = map_document(mapping, document)?;
                // Removing the root row first lets the cascade clear child
                // rows that the new document state no longer produces.
                let key = rows[0].pk_value().clone();
                debug!(collection, key = %key, rows = rows.len(), "applying upsert");
                self.sink.remove(&mapping.name, &mapping.pk, &key).await?;
                for row in &rows {
                    self.sink
                        .upsert(&row.table, &row.pk_column, &row.fields)
                        .await?;
                }
                Ok(())
            }
        }
    }
}
