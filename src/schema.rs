//! Declarative mapping from source collections to destination tables.
//!
//! A mapping file describes, per source collection, the destination root
//! table, its scalar columns, and the nested array fields that become child
//! tables. Mappings are loaded once at startup and are read-only afterwards;
//! everything structural (duplicate table names, missing parent links) is
//! rejected at load time rather than during streaming.
//!
//! ```json
//! {
//!   "superheros": {
//!     "name": "superheros",
//!     "pk": "id",
//!     "columns": [{ "name": "superhero", "source": "superhero", "type": "TEXT" }],
//!     "children": [{
//!       "source": "characters",
//!       "table": {
//!         "name": "superhero_characters",
//!         "parent_link": "superhero_id",
//!         "columns": [{ "name": "name", "source": "name", "type": "TEXT" }]
//!       }
//!     }]
//!   }
//! }
//! ```

use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};

fn default_pk() -> String {
    "id".to_string()
}

/// One destination column fed from a dot-separated document field path.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMapping {
    pub name: String,
    pub source: String,
    #[serde(rename = "type")]
    pub sql_type: String,
}

/// A nested array field mapped to a child table.
#[derive(Debug, Clone, Deserialize)]
pub struct ChildMapping {
    /// Field path of the array inside the parent document.
    pub source: String,
    pub table: TableMapping,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableMapping {
    pub name: String,
    #[serde(default = "default_pk")]
    pub pk: String,
    /// Foreign-key column pointing at the parent row; child tables only.
    #[serde(default)]
    pub parent_link: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnMapping>,
    /// Raw index definitions, executed as `CREATE {definition}`.
    #[serde(default)]
    pub indexes: Vec<String>,
    #[serde(default)]
    pub children: Vec<ChildMapping>,
}

/// Name and declared PostgreSQL type of one destination column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_type: String,
}

impl TableMapping {
    /// The fixed column order shared by `CREATE TABLE`, `COPY` and the
    /// mapper: primary key, parent link (child tables), then the mapped
    /// columns in declaration order.
    pub fn column_specs(&self) -> Vec<ColumnSpec> {
        let mut specs = vec![ColumnSpec {
            name: self.pk.clone(),
            sql_type: "TEXT".to_string(),
        }];
        if let Some(link) = &self.parent_link {
            specs.push(ColumnSpec {
                name: link.clone(),
                sql_type: "TEXT".to_string(),
            });
        }
        for column in &self.columns {
            specs.push(ColumnSpec {
                name: column.name.clone(),
                sql_type: column.sql_type.clone(),
            });
        }
        specs
    }

    pub fn column_names(&self) -> Vec<String> {
        self.column_specs().into_iter().map(|s| s.name).collect()
    }

    /// Every table of this mapping tree breadth-first (parents before
    /// children), each paired with its parent table if any.
    pub fn tables(&self) -> Vec<(&TableMapping, Option<&TableMapping>)> {
        let mut ordered = Vec::new();
        let mut queue: VecDeque<(&TableMapping, Option<&TableMapping>)> =
            VecDeque::from([(self, None)]);
        while let Some((table, parent)) = queue.pop_front() {
            ordered.push((table, parent));
            for child in &table.children {
                queue.push_back((&child.table, Some(table)));
            }
        }
        ordered
    }

    fn validate(&self, is_root: bool, seen_tables: &mut HashSet<String>) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!("table with empty name");
        }
        if self.pk.is_empty() {
            bail!("table '{}' has an empty primary key column", self.name);
        }
        if !seen_tables.insert(self.name.clone()) {
            bail!("duplicate destination table name '{}'", self.name);
        }
        match (&self.parent_link, is_root) {
            (Some(_), true) => bail!("root table '{}' must not declare a parent link", self.name),
            (None, false) => bail!("child table '{}' is missing its parent link", self.name),
            (Some(link), false) if link.is_empty() => {
                bail!("child table '{}' has an empty parent link", self.name)
            }
            _ => {}
        }
        let mut columns = HashSet::new();
        columns.insert(self.pk.as_str());
        if let Some(link) = &self.parent_link {
            if !columns.insert(link.as_str()) {
                bail!(
                    "table '{}': parent link '{link}' collides with the primary key",
                    self.name
                );
            }
        }
        for column in &self.columns {
            if !columns.insert(column.name.as_str()) {
                bail!("table '{}': duplicate column '{}'", self.name, column.name);
            }
        }
        for child in &self.children {
            if child.source.is_empty() {
                bail!("table '{}': child mapping with empty source path", self.name);
            }
            child.table.validate(false, seen_tables)?;
        }
        Ok(())
    }
}

/// All collection mappings known to the process.
#[derive(Debug, Clone, Default)]
pub struct Mappings {
    collections: HashMap<String, TableMapping>,
}

impl Mappings {
    /// Build validated mappings; rejects structurally broken configurations.
    pub fn new(collections: HashMap<String, TableMapping>) -> anyhow::Result<Self> {
        let mut seen_tables = HashSet::new();
        for (collection, mapping) in &collections {
            mapping
                .validate(true, &mut seen_tables)
                .with_context(|| format!("invalid mapping for collection '{collection}'"))?;
        }
        Ok(Mappings { collections })
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let collections: HashMap<String, TableMapping> =
            serde_json::from_str(json).context("failed to parse mapping configuration")?;
        Mappings::new(collections)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read mapping file '{path}'"))?;
        Mappings::from_json(&contents)
    }

    /// Resolve a source collection to its table tree, if mapped.
    pub fn resolve(&self, collection: &str) -> Option<&TableMapping> {
        self.collections.get(collection)
    }

    pub fn collections(&self) -> impl Iterator<Item = (&String, &TableMapping)> {
        self.collections.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}
