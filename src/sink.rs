//! Destination-side operations behind a trait so the pipeline can run
//! against PostgreSQL in production and an in-memory fake in tests.

use async_trait::async_trait;

use crate::transform::Field;
use crate::values::SqlValue;

/// Everything the importer and tailer need from the destination database.
///
/// All operations are idempotent: replaying them with the same inputs leaves
/// the destination in the same state.
#[async_trait]
pub trait SqlSink: Send + Sync {
    /// Insert or update one row keyed on its primary key.
    async fn upsert(&self, table: &str, pk_column: &str, fields: &[Field]) -> anyhow::Result<()>;

    /// Delete one row by primary key. Foreign keys cascade the delete to
    /// dependent child rows.
    async fn remove(&self, table: &str, pk_column: &str, key: &SqlValue) -> anyhow::Result<()>;

    /// Bulk-append rows through the database's bulk load path. Rows carry
    /// values in `columns` order.
    async fn copy_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> anyhow::Result<()>;

    /// Drop the table if it exists, discarding dependent constraints.
    async fn drop_table(&self, table: &str) -> anyhow::Result<()>;

    /// Create the table without durability guarantees, for bulk loading.
    /// Columns are `(name, sql_type)` pairs.
    async fn create_table(&self, table: &str, columns: &[(String, String)]) -> anyhow::Result<()>;

    async fn add_primary_key(&self, table: &str, column: &str) -> anyhow::Result<()>;

    /// Add a cascading foreign key from `table.column` to
    /// `parent_table.parent_column`.
    async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        parent_table: &str,
        parent_column: &str,
    ) -> anyhow::Result<()>;

    /// Execute a raw `CREATE {definition}` index statement.
    async fn create_index(&self, definition: &str) -> anyhow::Result<()>;

    /// Restore crash safety on a table created with `create_table`.
    async fn mark_durable(&self, table: &str) -> anyhow::Result<()>;
}
