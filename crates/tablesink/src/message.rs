//! Inbound message model
//!
//! Wire format (UTF-8 JSON, unknown fields ignored):
//!
//! ```json
//! { "table_name": "Sales Q1", "columns": ["Region", "Amount"], "data": [["east", "100"]] }
//! ```

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{Result, SinkError};
use crate::identifier::{sanitize, sanitize_all, SafeIdentifier};

/// One decoded stream record
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TableMessage {
    #[serde(default)]
    pub table_name: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub columns: Vec<String>,

    /// Rows aligned positionally with `columns`
    #[serde(default, rename = "data", deserialize_with = "null_as_default")]
    pub rows: Vec<Vec<Value>>,
}

/// A message that passed the structural check, with names sanitized and cells
/// rendered as text
#[derive(Debug, Clone, PartialEq)]
pub struct WriteUnit {
    pub relation: SafeIdentifier,
    pub columns: Vec<SafeIdentifier>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl TableMessage {
    /// Decode the JSON payload of a stream record
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn new(
        table_name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
        rows: Vec<Vec<Value>>,
    ) -> Self {
        Self {
            table_name: Some(table_name.into()),
            columns: columns.into_iter().map(Into::into).collect(),
            rows,
        }
    }

    /// Why this message carries nothing to write, if it doesn't
    pub fn emptiness(&self) -> Option<&'static str> {
        if self.table_name.as_deref().map_or(true, str::is_empty) {
            Some("missing table_name")
        } else if self.columns.is_empty() {
            Some("no columns")
        } else if self.rows.is_empty() {
            Some("no data rows")
        } else {
            None
        }
    }

    /// Sanitize names and render cells; structurally empty messages are `Malformed`
    ///
    /// Row arity is not checked here: a mismatch is a write-step failure.
    pub fn to_write_unit(&self) -> Result<WriteUnit> {
        if let Some(reason) = self.emptiness() {
            return Err(SinkError::Malformed(reason.to_string()));
        }

        let relation = sanitize(self.table_name.as_deref().unwrap_or_default());
        let columns = sanitize_all(&self.columns);
        let rows = self
            .rows
            .iter()
            .map(|row| row.iter().cloned().map(cell_text).collect())
            .collect();

        Ok(WriteUnit {
            relation,
            columns,
            rows,
        })
    }
}

impl WriteUnit {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// `null` is treated like an absent field
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Text form of a cell: strings verbatim, `null` as SQL NULL, everything else as JSON text
pub fn cell_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
