//! Row accumulation for bulk loading.
//!
//! During the initial import, mapped rows are not written one by one; they
//! accumulate per destination table and are flushed through the sink's bulk
//! load path in chunks. Buffers are grouped by root table so concurrent
//! imports of different collections never serialize on each other, while a
//! parent table and its child tables share one lock and flush together with
//! the parent first.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::schema::TableMapping;
use crate::sink::SqlSink;
use crate::transform::Row;

/// Rows buffered per table before an automatic flush.
pub const CHUNK_SIZE: usize = 500;

struct TableBuffer {
    columns: Vec<String>,
    rows: Vec<Vec<crate::values::SqlValue>>,
}

/// Buffers for one root table and its children, in flush order.
struct GroupBuffer {
    /// Table name to buffer, ordered parents before children.
    tables: Vec<(String, TableBuffer)>,
    /// Rows pending across all tables of the group.
    pending: usize,
}

impl GroupBuffer {
    fn new(mapping: &TableMapping) -> Self {
        let tables = mapping
            .tables()
            .into_iter()
            .map(|(table, _)| {
                (
                    table.name.clone(),
                    TableBuffer {
                        columns: table.column_names(),
                        rows: Vec::new(),
                    },
                )
            })
            .collect();
        GroupBuffer { tables, pending: 0 }
    }

    fn buffer_mut(&mut self, table: &str) -> Option<&mut TableBuffer> {
        self.tables
            .iter_mut()
            .find(|(name, _)| name == table)
            .map(|(_, buffer)| buffer)
    }

    async fn flush(&mut self, sink: &dyn SqlSink) -> anyhow::Result<()> {
        for (table, buffer) in &mut self.tables {
            if buffer.rows.is_empty() {
                continue;
            }
            debug!(table = table.as_str(), rows = buffer.rows.len(), "flushing buffered rows");
            sink.copy_rows(table, &buffer.columns, &buffer.rows).await?;
            buffer.rows.clear();
        }
        self.pending = 0;
        Ok(())
    }
}

/// Accumulates rows per destination table and flushes them through the bulk
/// load path, keyed by root table.
pub struct CopyBuffers {
    sink: Arc<dyn SqlSink>,
    chunk_size: usize,
    groups: Mutex<HashMap<String, Arc<Mutex<GroupBuffer>>>>,
}

impl CopyBuffers {
    pub fn new(sink: Arc<dyn SqlSink>) -> Self {
        Self::with_chunk_size(sink, CHUNK_SIZE)
    }

    pub fn with_chunk_size(sink: Arc<dyn SqlSink>, chunk_size: usize) -> Self {
        CopyBuffers {
            sink,
            chunk_size,
            groups: Mutex::new(HashMap::new()),
        }
    }

    async fn group(&self, mapping: &TableMapping) -> Arc<Mutex<GroupBuffer>> {
        let mut groups = self.groups.lock().await;
        groups
            .entry(mapping.name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(GroupBuffer::new(mapping))))
            .clone()
    }

    /// Buffer the rows of one mapped document. The threshold is checked per
    /// row, so the moment the group's total pending count reaches the chunk
    /// size the whole group flushes, parents first. A document's rows may
    /// therefore split across chunks; within one push they arrive in mapper
    /// order, so a parent row is always flushed no later than its children.
    pub async fn push(&self, mapping: &TableMapping, rows: Vec<Row>) -> anyhow::Result<()> {
        let group = self.group(mapping).await;
        let mut group = group.lock().await;
        for row in rows {
            let buffer = group.buffer_mut(&row.table).ok_or_else(|| {
                anyhow::anyhow!("row for unknown table '{}' in group '{}'", row.table, mapping.name)
            })?;
            buffer.rows.push(row.values());
            group.pending += 1;
            if group.pending >= self.chunk_size {
                group.flush(self.sink.as_ref()).await?;
            }
        }
        Ok(())
    }

    /// Flush whatever remains for one root table.
    pub async fn finalize(&self, mapping: &TableMapping) -> anyhow::Result<()> {
        let group = self.group(mapping).await;
        let mut group = group.lock().await;
        group.flush(self.sink.as_ref()).await
    }

    /// Flush every group; used when an import completes.
    pub async fn finalize_all(&self) -> anyhow::Result<()> {
        let groups: Vec<_> = self.groups.lock().await.values().cloned().collect();
        for group in groups {
            group.lock().await.flush(self.sink.as_ref()).await?;
        }
        Ok(())
    }
}
