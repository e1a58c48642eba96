//! In-memory fakes and fixtures for exercising the pipeline without live
//! databases.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::{self, BoxStream, StreamExt};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::full_sync::DocumentSource;
use crate::incremental_sync::{ChangeEvent, ChangeLogSource, ChangeOp, ChangeStream};
use crate::schema::Mappings;
use crate::sink::SqlSink;
use crate::transform::Field;
use crate::values::SqlValue;

#[derive(Debug, Clone)]
struct ForeignKey {
    column: String,
    parent_table: String,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<(String, String)>,
    pk_column: Option<String>,
    rows: Vec<HashMap<String, SqlValue>>,
    foreign_keys: Vec<ForeignKey>,
    logged: bool,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    copy_log: Vec<(String, usize)>,
    indexes: Vec<String>,
}

/// A sink that keeps rows in process memory and simulates cascading
/// foreign-key deletes, so tests can assert on final destination state.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
    fail_tables: Mutex<HashSet<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Make every write targeting `table` fail until cleared.
    pub fn fail_table(&self, table: &str) {
        self.fail_tables.lock().unwrap().insert(table.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_tables.lock().unwrap().clear();
    }

    fn check_fail(&self, table: &str) -> anyhow::Result<()> {
        if self.fail_tables.lock().unwrap().contains(table) {
            anyhow::bail!("injected failure writing to '{table}'");
        }
        Ok(())
    }

    pub fn rows(&self, table: &str) -> Vec<HashMap<String, SqlValue>> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    /// Primary key values of a table, sorted, as display strings.
    pub fn pk_values(&self, table: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let Some(table) = state.tables.get(table) else {
            return Vec::new();
        };
        let pk = table.pk_column.clone().unwrap_or_else(|| "id".to_string());
        let mut keys: Vec<String> = table
            .rows
            .iter()
            .filter_map(|row| row.get(&pk).map(|v| v.to_string()))
            .collect();
        keys.sort();
        keys
    }

    /// Table names in the order bulk load chunks arrived.
    pub fn copy_log(&self) -> Vec<String> {
        self.copy_chunks().into_iter().map(|(table, _)| table).collect()
    }

    /// Bulk load chunks in arrival order, with their row counts.
    pub fn copy_chunks(&self) -> Vec<(String, usize)> {
        self.state.lock().unwrap().copy_log.clone()
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.state.lock().unwrap().tables.contains_key(table)
    }

    pub fn is_logged(&self, table: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.logged)
            .unwrap_or(false)
    }

    pub fn has_primary_key(&self, table: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.pk_column.is_some())
            .unwrap_or(false)
    }

    pub fn index_definitions(&self) -> Vec<String> {
        self.state.lock().unwrap().indexes.clone()
    }

    fn delete_where(state: &mut MemoryState, table: &str, column: &str, keys: &[SqlValue]) {
        let Some(entry) = state.tables.get_mut(table) else {
            return;
        };
        let pk = entry.pk_column.clone().unwrap_or_else(|| "id".to_string());
        let mut removed_keys = Vec::new();
        entry.rows.retain(|row| {
            let matches = row.get(column).map(|v| keys.contains(v)).unwrap_or(false);
            if matches {
                if let Some(key) = row.get(&pk) {
                    removed_keys.push(key.clone());
                }
            }
            !matches
        });
        if removed_keys.is_empty() {
            return;
        }
        let dependents: Vec<(String, String)> = state
            .tables
            .iter()
            .flat_map(|(name, t)| {
                t.foreign_keys
                    .iter()
                    .filter(|fk| fk.parent_table == table)
                    .map(|fk| (name.clone(), fk.column.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (child, fk_column) in dependents {
            Self::delete_where(state, &child, &fk_column, &removed_keys);
        }
    }
}

#[async_trait]
impl SqlSink for MemorySink {
    async fn upsert(&self, table: &str, pk_column: &str, fields: &[Field]) -> anyhow::Result<()> {
        self.check_fail(table)?;
        let key = fields
            .iter()
            .find(|f| f.column == pk_column)
            .map(|f| f.value.clone())
            .ok_or_else(|| anyhow::anyhow!("upsert without a '{pk_column}' value"))?;
        let row: HashMap<String, SqlValue> = fields
            .iter()
            .map(|f| (f.column.clone(), f.value.clone()))
            .collect();
        let mut state = self.state.lock().unwrap();
        let entry = state.tables.entry(table.to_string()).or_default();
        let pk = entry
            .pk_column
            .clone()
            .unwrap_or_else(|| pk_column.to_string());
        match entry
            .rows
            .iter_mut()
            .find(|r| r.get(&pk) == Some(&key))
        {
            Some(existing) => *existing = row,
            None => entry.rows.push(row),
        }
        Ok(())
    }

    async fn remove(&self, table: &str, pk_column: &str, key: &SqlValue) -> anyhow::Result<()> {
        self.check_fail(table)?;
        let mut state = self.state.lock().unwrap();
        Self::delete_where(&mut state, table, pk_column, std::slice::from_ref(key));
        Ok(())
    }

    async fn copy_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> anyhow::Result<()> {
        self.check_fail(table)?;
        let mut state = self.state.lock().unwrap();
        state.copy_log.push((table.to_string(), rows.len()));
        let entry = state.tables.entry(table.to_string()).or_default();
        if !entry.columns.is_empty() {
            for column in columns {
                if !entry.columns.iter().any(|(name, _)| name == column) {
                    anyhow::bail!("bulk load into '{table}' names unknown column '{column}'");
                }
            }
        }
        for values in rows {
            if values.len() != columns.len() {
                anyhow::bail!(
                    "bulk load into '{table}' with {} values for {} columns",
                    values.len(),
                    columns.len()
                );
            }
            entry
                .rows
                .push(columns.iter().cloned().zip(values.iter().cloned()).collect());
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().tables.remove(table);
        Ok(())
    }

    async fn create_table(&self, table: &str, columns: &[(String, String)]) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.tables.contains_key(table) {
            anyhow::bail!("table '{table}' already exists");
        }
        state.tables.insert(
            table.to_string(),
            MemoryTable {
                columns: columns.to_vec(),
                ..MemoryTable::default()
            },
        );
        Ok(())
    }

    async fn add_primary_key(&self, table: &str, column: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| anyhow::anyhow!("no such table '{table}'"))?;
        let mut seen = HashSet::new();
        for row in &entry.rows {
            let key = row
                .get(column)
                .map(|v| v.to_string())
                .unwrap_or_default();
            if !seen.insert(key.clone()) {
                anyhow::bail!("duplicate key '{key}' adding primary key on '{table}'");
            }
        }
        entry.pk_column = Some(column.to_string());
        Ok(())
    }

    async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        parent_table: &str,
        _parent_column: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| anyhow::anyhow!("no such table '{table}'"))?;
        entry.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            parent_table: parent_table.to_string(),
        });
        Ok(())
    }

    async fn create_index(&self, definition: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().indexes.push(definition.to_string());
        Ok(())
    }

    async fn mark_durable(&self, table: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| anyhow::anyhow!("no such table '{table}'"))?;
        entry.logged = true;
        Ok(())
    }
}

/// Checkpoint store backed by a map, recording every successful advance.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    history: Mutex<Vec<(String, Checkpoint)>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        MemoryCheckpointStore::default()
    }

    /// Every position recorded for a stream, in order.
    pub fn history(&self, stream_id: &str) -> Vec<Checkpoint> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == stream_id)
            .map(|(_, checkpoint)| *checkpoint)
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn last_known(&self, stream_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().unwrap().get(stream_id).copied())
    }

    async fn advance(&self, stream_id: &str, checkpoint: Checkpoint) -> anyhow::Result<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap();
        if let Some(existing) = checkpoints.get(stream_id) {
            if *existing > checkpoint {
                anyhow::bail!(
                    "refusing to move checkpoint for stream '{stream_id}' backwards to {checkpoint}"
                );
            }
        }
        checkpoints.insert(stream_id.to_string(), checkpoint);
        self.history
            .lock()
            .unwrap()
            .push((stream_id.to_string(), checkpoint));
        Ok(())
    }
}

/// A scripted source: fixed collection contents plus a fixed event sequence.
#[derive(Default)]
pub struct FixtureSource {
    collections: HashMap<String, Vec<Document>>,
    events: Vec<ChangeEvent>,
    hang_at_end: bool,
}

impl FixtureSource {
    pub fn new() -> Self {
        FixtureSource::default()
    }

    pub fn with_collection(mut self, name: &str, documents: Vec<Document>) -> Self {
        self.collections.insert(name.to_string(), documents);
        self
    }

    pub fn with_events(mut self, events: Vec<ChangeEvent>) -> Self {
        self.events = events;
        self
    }

    /// Keep the stream open after the last event instead of ending it, so
    /// cancellation can be exercised.
    pub fn hang_at_end(mut self) -> Self {
        self.hang_at_end = true;
        self
    }
}

#[async_trait]
impl DocumentSource for FixtureSource {
    async fn collection_documents(
        &self,
        collection: &str,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Document>>> {
        let documents = self
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default();
        Ok(stream::iter(documents.into_iter().map(Ok)).boxed())
    }
}

#[async_trait]
impl ChangeLogSource for FixtureSource {
    async fn open(&self, from: Option<Checkpoint>) -> anyhow::Result<Box<dyn ChangeStream>> {
        let events: VecDeque<ChangeEvent> = self
            .events
            .iter()
            .filter(|event| from.map(|from| event.position > from).unwrap_or(true))
            .cloned()
            .collect();
        Ok(Box::new(ScriptedStream {
            events,
            hang_at_end: self.hang_at_end,
        }))
    }

    async fn latest_position(&self) -> anyhow::Result<Checkpoint> {
        Ok(self
            .events
            .iter()
            .map(|event| event.position)
            .max()
            .unwrap_or(Checkpoint::new(0, 0)))
    }
}

struct ScriptedStream {
    events: VecDeque<ChangeEvent>,
    hang_at_end: bool,
}

#[async_trait]
impl ChangeStream for ScriptedStream {
    async fn next_event(&mut self) -> anyhow::Result<Option<ChangeEvent>> {
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None if self.hang_at_end => futures::future::pending().await,
            None => Ok(None),
        }
    }
}

pub fn upsert_event(collection: &str, document: Document, time: u32, increment: u32) -> ChangeEvent {
    ChangeEvent {
        op: ChangeOp::Upsert {
            collection: collection.to_string(),
            document,
        },
        position: Checkpoint::new(time, increment),
    }
}

pub fn delete_event(collection: &str, id: Bson, time: u32, increment: u32) -> ChangeEvent {
    ChangeEvent {
        op: ChangeOp::Delete {
            collection: collection.to_string(),
            id,
        },
        position: Checkpoint::new(time, increment),
    }
}

pub fn skip_event(time: u32, increment: u32) -> ChangeEvent {
    ChangeEvent {
        op: ChangeOp::Skip,
        position: Checkpoint::new(time, increment),
    }
}

/// The mapping used across integration tests: superheros with nested
/// characters, each character with scalar alias strings.
pub fn superhero_mappings() -> Mappings {
    Mappings::from_json(
        r#"{
            "superheros": {
                "name": "superheros",
                "pk": "id",
                "columns": [
                    { "name": "superhero", "source": "superhero", "type": "TEXT" },
                    { "name": "publisher", "source": "publisher", "type": "TEXT" }
                ],
                "indexes": [
                    "INDEX idx_superheros_superhero ON superheros (superhero)"
                ],
                "children": [{
                    "source": "characters",
                    "table": {
                        "name": "superhero_characters",
                        "parent_link": "superhero_id",
                        "columns": [
                            { "name": "name", "source": "name", "type": "TEXT" }
                        ],
                        "children": [{
                            "source": "aliases",
                            "table": {
                                "name": "superhero_character_aliases",
                                "parent_link": "character_id",
                                "columns": [
                                    { "name": "alias", "source": "value", "type": "TEXT" }
                                ]
                            }
                        }]
                    }
                }]
            }
        }"#,
    )
    .expect("fixture mapping is valid")
}

/// Generate superhero documents; the first `with_characters` carry three
/// nested characters each.
pub fn superhero_documents(count: usize, with_characters: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            let mut document = doc! {
                "_id": format!("hero-{i:03}"),
                "superhero": format!("Superhero {i}"),
                "publisher": if i % 2 == 0 { "DC" } else { "Marvel" },
            };
            if i < with_characters {
                document.insert(
                    "characters",
                    vec![
                        doc! { "name": format!("Character {i}-a") },
                        doc! { "name": format!("Character {i}-b") },
                        doc! { "name": format!("Character {i}-c") },
                    ],
                );
            }
            document
        })
        .collect()
}
