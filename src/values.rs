//! Scalar values carried from BSON documents into PostgreSQL statements.
//!
//! Every value that reaches the sink flows through [`SqlValue`], which is
//! bindable to prepared statements and renderable in `COPY` text format.

use bson::Bson;
use bytes::BytesMut;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

/// A scalar bound to a destination column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Render the value as one `COPY ... FROM STDIN` text-format cell.
    fn copy_cell(&self, out: &mut String) {
        match self {
            SqlValue::Null => out.push_str("\\N"),
            SqlValue::Bool(true) => out.push('t'),
            SqlValue::Bool(false) => out.push('f'),
            SqlValue::Int(i) => out.push_str(&i.to_string()),
            SqlValue::Float(f) => out.push_str(&f.to_string()),
            SqlValue::String(s) => escape_copy_text(s, out),
            SqlValue::Timestamp(ts) => {
                out.push_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
        }
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(b) => write!(f, "{b}"),
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::String(s) => f.write_str(s),
            SqlValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

// Mapped column types come from the mapping file, so the declared PostgreSQL
// type is only known at runtime; the value adapts to the narrower integer,
// float and timestamp types on the fly.
impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Int(i) => {
                if *ty == Type::INT2 {
                    (*i as i16).to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    (*i as i32).to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            SqlValue::Float(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::String(s) => s.to_sql(ty, out),
            SqlValue::Timestamp(ts) => {
                if *ty == Type::TIMESTAMP {
                    ts.naive_utc().to_sql(ty, out)
                } else {
                    ts.to_sql(ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Remove embedded NUL characters; PostgreSQL rejects them in text values.
pub fn sanitize_text(s: &str) -> String {
    if s.contains('\u{0}') {
        s.replace('\u{0}', "")
    } else {
        s.to_string()
    }
}

/// Convert one BSON scalar into its relational representation.
///
/// Non-scalar values bound to a scalar column (documents, arrays that are not
/// mapped to a child table) are stored as their relaxed extended-JSON text.
pub fn bson_to_sql_value(value: &Bson) -> SqlValue {
    use base64::Engine;

    match value {
        Bson::Double(f) => SqlValue::Float(*f),
        Bson::Int32(i) => SqlValue::Int(i64::from(*i)),
        Bson::Int64(i) => SqlValue::Int(*i),
        Bson::Boolean(b) => SqlValue::Bool(*b),
        Bson::String(s) => SqlValue::String(sanitize_text(s)),
        Bson::Null | Bson::Undefined => SqlValue::Null,
        Bson::ObjectId(oid) => SqlValue::String(oid.to_hex()),
        Bson::DateTime(dt) => SqlValue::Timestamp(dt.to_chrono()),
        Bson::Timestamp(ts) => match chrono::DateTime::from_timestamp(i64::from(ts.time), 0) {
            Some(dt) => SqlValue::Timestamp(dt),
            None => SqlValue::Null,
        },
        Bson::Decimal128(d) => SqlValue::String(d.to_string()),
        Bson::Symbol(s) => SqlValue::String(sanitize_text(s)),
        Bson::Binary(binary) => {
            SqlValue::String(base64::engine::general_purpose::STANDARD.encode(&binary.bytes))
        }
        other => SqlValue::String(sanitize_text(
            &other.clone().into_relaxed_extjson().to_string(),
        )),
    }
}

/// Canonical string form of a document identifier.
///
/// ObjectIds become their hex form, numeric identifiers their decimal form.
/// Anything else (binary UUIDs, composite documents) renders as its relaxed
/// extended-JSON text, which is deterministic for a given value, so no
/// identifier shape is ever fatal.
pub fn canonical_id(value: &Bson) -> String {
    match value {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => sanitize_text(s),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        other => sanitize_text(&other.clone().into_relaxed_extjson().to_string()),
    }
}

/// Append one `COPY` text-format row (tab separated, newline terminated).
pub fn encode_copy_row(values: &[SqlValue], out: &mut String) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        value.copy_cell(out);
    }
    out.push('\n');
}

fn escape_copy_text(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}
