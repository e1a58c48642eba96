//! PostgreSQL implementations of the sink and checkpoint store.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{pin_mut, SinkExt};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::sink::SqlSink;
use crate::transform::Field;
use crate::values::{encode_copy_row, SqlValue};

/// Connect and drive the connection on a background task.
pub async fn connect(uri: &str) -> anyhow::Result<Client> {
    let (client, connection) = tokio_postgres::connect(uri, NoTls)
        .await
        .context("failed to connect to PostgreSQL")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });
    Ok(client)
}

pub struct PostgresSink {
    client: Arc<Client>,
}

impl PostgresSink {
    pub fn new(client: Arc<Client>) -> Self {
        PostgresSink { client }
    }
}

#[async_trait]
impl SqlSink for PostgresSink {
    async fn upsert(&self, table: &str, pk_column: &str, fields: &[Field]) -> anyhow::Result<()> {
        let columns: Vec<&str> = fields.iter().map(|f| f.column.as_str()).collect();
        let placeholders: Vec<String> = (1..=fields.len()).map(|i| format!("${i}")).collect();
        let updates: Vec<String> = fields
            .iter()
            .filter(|f| f.column != pk_column)
            .map(|f| format!("{0} = EXCLUDED.{0}", f.column))
            .collect();
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let statement = format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({pk_column}) {conflict}",
            columns.join(", "),
            placeholders.join(", "),
        );
        let params: Vec<&(dyn ToSql + Sync)> = fields
            .iter()
            .map(|f| &f.value as &(dyn ToSql + Sync))
            .collect();
        self.client
            .execute(statement.as_str(), &params)
            .await
            .with_context(|| format!("upsert into '{table}' failed for {fields:?}"))?;
        Ok(())
    }

    async fn remove(&self, table: &str, pk_column: &str, key: &SqlValue) -> anyhow::Result<()> {
        let statement = format!("DELETE FROM {table} WHERE {pk_column} = $1");
        self.client
            .execute(statement.as_str(), &[key])
            .await
            .with_context(|| format!("delete from '{table}' failed for key {key}"))?;
        Ok(())
    }

    async fn copy_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> anyhow::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let statement = format!("COPY {table} ({}) FROM STDIN", columns.join(", "));
        let sink = self
            .client
            .copy_in::<_, Bytes>(statement.as_str())
            .await
            .with_context(|| format!("COPY into '{table}' failed to start"))?;
        pin_mut!(sink);
        let mut buffer = String::new();
        for row in rows {
            encode_copy_row(row, &mut buffer);
            if buffer.len() >= 64 * 1024 {
                sink.send(Bytes::from(std::mem::take(&mut buffer))).await?;
            }
        }
        if !buffer.is_empty() {
            sink.send(Bytes::from(buffer)).await?;
        }
        let written = sink
            .finish()
            .await
            .with_context(|| format!("COPY into '{table}' failed"))?;
        debug!(table, rows = written, "bulk load chunk complete");
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> anyhow::Result<()> {
        self.client
            .batch_execute(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
            .await
            .with_context(|| format!("failed to drop table '{table}'"))?;
        Ok(())
    }

    async fn create_table(&self, table: &str, columns: &[(String, String)]) -> anyhow::Result<()> {
        let definitions: Vec<String> = columns
            .iter()
            .map(|(name, sql_type)| format!("{name} {sql_type}"))
            .collect();
        // Unlogged while bulk loading; mark_durable restores WAL logging.
        self.client
            .batch_execute(&format!(
                "CREATE UNLOGGED TABLE {table} ({})",
                definitions.join(", ")
            ))
            .await
            .with_context(|| format!("failed to create table '{table}'"))?;
        Ok(())
    }

    async fn add_primary_key(&self, table: &str, column: &str) -> anyhow::Result<()> {
        self.client
            .batch_execute(&format!("ALTER TABLE {table} ADD PRIMARY KEY ({column})"))
            .await
            .with_context(|| format!("failed to add primary key on '{table}'"))?;
        Ok(())
    }

    async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        parent_table: &str,
        parent_column: &str,
    ) -> anyhow::Result<()> {
        self.client
            .batch_execute(&format!(
                "ALTER TABLE {table} ADD CONSTRAINT fk_{table}_{column} \
                 FOREIGN KEY ({column}) REFERENCES {parent_table} ({parent_column}) \
                 ON DELETE CASCADE"
            ))
            .await
            .with_context(|| format!("failed to add foreign key on '{table}'"))?;
        Ok(())
    }

    async fn create_index(&self, definition: &str) -> anyhow::Result<()> {
        self.client
            .batch_execute(&format!("CREATE {definition}"))
            .await
            .with_context(|| format!("failed to create index '{definition}'"))?;
        Ok(())
    }

    async fn mark_durable(&self, table: &str) -> anyhow::Result<()> {
        self.client
            .batch_execute(&format!("ALTER TABLE {table} SET LOGGED"))
            .await
            .with_context(|| format!("failed to mark table '{table}' logged"))?;
        Ok(())
    }
}

const CHECKPOINT_TABLE: &str = "sync_checkpoints";

/// Checkpoints stored next to the replicated data, so a destination restored
/// from backup carries a position consistent with its contents.
pub struct PostgresCheckpointStore {
    client: Arc<Client>,
}

impl PostgresCheckpointStore {
    pub async fn new(client: Arc<Client>) -> anyhow::Result<Self> {
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {CHECKPOINT_TABLE} (
                     stream_id TEXT PRIMARY KEY,
                     ts BIGINT NOT NULL,
                     seq BIGINT NOT NULL,
                     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                 )"
            ))
            .await
            .context("failed to create the checkpoint table")?;
        Ok(PostgresCheckpointStore { client })
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn last_known(&self, stream_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        let row = self
            .client
            .query_opt(
                format!("SELECT ts, seq FROM {CHECKPOINT_TABLE} WHERE stream_id = $1").as_str(),
                &[&stream_id],
            )
            .await
            .context("failed to read the checkpoint")?;
        Ok(row.map(|row| {
            let ts: i64 = row.get(0);
            let seq: i64 = row.get(1);
            Checkpoint::new(ts as u32, seq as u32)
        }))
    }

    async fn advance(&self, stream_id: &str, checkpoint: Checkpoint) -> anyhow::Result<()> {
        // The WHERE clause makes regressions a no-op at the SQL level even
        // with concurrent writers; zero affected rows means the stored
        // position was already ahead.
        let affected = self
            .client
            .execute(
                format!(
                    "INSERT INTO {CHECKPOINT_TABLE} (stream_id, ts, seq) \
                     VALUES ($1, $2, $3) \
                     ON CONFLICT (stream_id) DO UPDATE \
                     SET ts = EXCLUDED.ts, seq = EXCLUDED.seq, updated_at = now() \
                     WHERE ({CHECKPOINT_TABLE}.ts, {CHECKPOINT_TABLE}.seq) \
                        <= (EXCLUDED.ts, EXCLUDED.seq)"
                )
                .as_str(),
                &[
                    &stream_id,
                    &i64::from(checkpoint.time),
                    &i64::from(checkpoint.increment),
                ],
            )
            .await
            .context("failed to write the checkpoint")?;
        if affected == 0 {
            anyhow::bail!(
                "refusing to move checkpoint for stream '{stream_id}' backwards to {checkpoint}"
            );
        }
        info!(stream_id, checkpoint = %checkpoint, "checkpoint advanced");
        Ok(())
    }
}
