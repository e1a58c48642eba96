//! Flattening of BSON documents into relational rows.
//!
//! One source document expands into a row for the root table plus one row per
//! element of every mapped nested array, recursively. Child rows carry a
//! synthetic primary key derived from their parent key and array position, so
//! re-mapping the same document always produces identical keys.

use anyhow::Context;
use bson::{doc, Bson, Document};

use crate::schema::{ChildMapping, TableMapping};
use crate::values::{bson_to_sql_value, canonical_id, SqlValue};

/// One destination column with its value, in table column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub column: String,
    pub value: SqlValue,
}

/// One row destined for a single table.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub table: String,
    pub pk_column: String,
    pub fields: Vec<Field>,
}

impl Row {
    /// The primary key value; the first field by construction.
    pub fn pk_value(&self) -> &SqlValue {
        &self.fields[0].value
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.column.clone()).collect()
    }

    pub fn values(&self) -> Vec<SqlValue> {
        self.fields.iter().map(|f| f.value.clone()).collect()
    }
}

/// Flatten one document into rows, breadth-first: the root row first, then
/// all first-level child rows, then their children. Rows for the same table
/// are contiguous within each level.
///
/// The only fatal input is a document without an `_id`. Missing or non-array
/// child paths yield zero child rows, missing column paths yield `Null`.
pub fn map_document(mapping: &TableMapping, document: &Document) -> anyhow::Result<Vec<Row>> {
    let id = document
        .get("_id")
        .context("document is missing its _id field")?;
    let root_key = canonical_id(id);

    let mut rows = vec![build_row(mapping, &root_key, None, document)];

    // Each layer entry pairs a child mapping with the (parent key, child key,
    // element document) triples feeding it.
    let mut layer = child_elements(&mapping.children, &[(root_key, document.clone())]);

    while !layer.is_empty() {
        let mut next = Vec::new();
        for (child, elements) in layer {
            for (parent_key, child_key, element) in &elements {
                rows.push(build_row(
                    &child.table,
                    child_key,
                    Some(parent_key.as_str()),
                    element,
                ));
            }
            let parents: Vec<(String, Document)> = elements
                .into_iter()
                .map(|(_, child_key, element)| (child_key, element))
                .collect();
            next.extend(child_elements(&child.table.children, &parents));
        }
        layer = next;
    }

    Ok(rows)
}

/// Collect, for every child mapping, the array elements found under its
/// source path across all the given parent documents. Child keys are the
/// parent key suffixed with the element position.
fn child_elements<'a>(
    children: &'a [ChildMapping],
    parents: &[(String, Document)],
) -> Vec<(&'a ChildMapping, Vec<(String, String, Document)>)> {
    children
        .iter()
        .map(|child| {
            let mut elements = Vec::new();
            for (parent_key, parent) in parents {
                let Some(Bson::Array(items)) = lookup_path(parent, &child.source) else {
                    continue;
                };
                for (position, item) in items.iter().enumerate() {
                    elements.push((
                        parent_key.clone(),
                        format!("{parent_key}_{position}"),
                        element_context(item),
                    ));
                }
            }
            (child, elements)
        })
        .collect()
}

/// Wrap an array element so the mapper can treat it uniformly: documents keep
/// their fields, scalars become `{ "value": element }`.
fn element_context(element: &Bson) -> Document {
    match element {
        Bson::Document(d) => d.clone(),
        other => doc! { "value": other.clone() },
    }
}

fn build_row(
    mapping: &TableMapping,
    key: &str,
    parent_key: Option<&str>,
    document: &Document,
) -> Row {
    let mut fields = vec![Field {
        column: mapping.pk.clone(),
        value: SqlValue::String(key.to_string()),
    }];
    if let Some(link) = &mapping.parent_link {
        let parent = parent_key.map(str::to_string).unwrap_or_default();
        fields.push(Field {
            column: link.clone(),
            value: SqlValue::String(parent),
        });
    }
    for column in &mapping.columns {
        let value = match lookup_path(document, &column.source) {
            Some(bson) => bson_to_sql_value(bson),
            None => SqlValue::Null,
        };
        fields.push(Field {
            column: column.name.clone(),
            value,
        });
    }
    Row {
        table: mapping.name.clone(),
        pk_column: mapping.pk.clone(),
        fields,
    }
}

/// Follow a dot-separated path through nested documents.
fn lookup_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = document;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = current.get(segment)?;
        if segments.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Mappings;

    fn superhero_mapping() -> Mappings {
        Mappings::from_json(
            r#"{
                "superheros": {
                    "name": "superheros",
                    "pk": "id",
                    "columns": [
                        { "name": "superhero", "source": "superhero", "type": "TEXT" },
                        { "name": "publisher", "source": "meta.publisher", "type": "TEXT" }
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
        .unwrap()
    }

    fn text(s: &str) -> SqlValue {
        SqlValue::String(s.to_string())
    }

    #[test]
    fn root_row_uses_canonical_id_and_paths() {
        let mappings = superhero_mapping();
        let mapping = mappings.resolve("superheros").unwrap();
        let document = doc! {
            "_id": "hero-1",
            "superhero": "Batman",
            "meta": { "publisher": "DC" },
        };
        let rows = map_document(mapping, &document).unwrap();
        assert_eq!(rows.len(), 1);
        let root = &rows[0];
        assert_eq!(root.table, "superheros");
        assert_eq!(root.pk_column, "id");
        assert_eq!(root.column_names(), vec!["id", "superhero", "publisher"]);
        assert_eq!(root.values(), vec![text("hero-1"), text("Batman"), text("DC")]);
    }

    #[test]
    fn child_rows_get_positional_keys_and_parent_links() {
        let mappings = superhero_mapping();
        let mapping = mappings.resolve("superheros").unwrap();
        let document = doc! {
            "_id": "hero-1",
            "superhero": "Batman",
            "characters": [
                { "name": "Bruce Wayne", "aliases": ["The Dark Knight"] },
                { "name": "Dick Grayson" },
            ],
        };
        let rows = map_document(mapping, &document).unwrap();
        let tables: Vec<&str> = rows.iter().map(|r| r.table.as_str()).collect();
        assert_eq!(
            tables,
            vec![
                "superheros",
                "superhero_characters",
                "superhero_characters",
                "superhero_character_aliases",
            ]
        );
        assert_eq!(rows[1].values()[0], text("hero-1_0"));
        assert_eq!(rows[1].values()[1], text("hero-1"));
        assert_eq!(rows[2].values()[0], text("hero-1_1"));
        // Scalar array elements are addressed through the "value" path.
        assert_eq!(rows[3].values()[0], text("hero-1_0_0"));
        assert_eq!(rows[3].values()[1], text("hero-1_0"));
        assert_eq!(rows[3].values()[2], text("The Dark Knight"));
    }

    #[test]
    fn missing_child_path_yields_no_child_rows() {
        let mappings = superhero_mapping();
        let mapping = mappings.resolve("superheros").unwrap();
        let rows = map_document(mapping, &doc! { "_id": "x", "superhero": "Thor" }).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn non_array_child_path_yields_no_child_rows() {
        let mappings = superhero_mapping();
        let mapping = mappings.resolve("superheros").unwrap();
        let rows =
            map_document(mapping, &doc! { "_id": "x", "characters": "not-an-array" }).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn missing_column_path_maps_to_null() {
        let mappings = superhero_mapping();
        let mapping = mappings.resolve("superheros").unwrap();
        let rows = map_document(mapping, &doc! { "_id": "x" }).unwrap();
        assert_eq!(rows[0].values()[1], SqlValue::Null);
        assert_eq!(rows[0].values()[2], SqlValue::Null);
    }

    #[test]
    fn document_without_id_is_rejected() {
        let mappings = superhero_mapping();
        let mapping = mappings.resolve("superheros").unwrap();
        assert!(map_document(mapping, &doc! { "superhero": "Thor" }).is_err());
    }

    #[test]
    fn remapping_is_deterministic() {
        let mappings = superhero_mapping();
        let mapping = mappings.resolve("superheros").unwrap();
        let document = doc! {
            "_id": "hero-1",
            "characters": [{ "name": "Bruce Wayne" }],
        };
        let first = map_document(mapping, &document).unwrap();
        let second = map_document(mapping, &document).unwrap();
        assert_eq!(first, second);
    }
}
