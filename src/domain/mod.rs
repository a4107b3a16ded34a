use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single result row: column name to value, in column order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable: true,
            description: None,
        }
    }

    pub fn int64(name: impl Into<String>) -> Self {
        Self::new(name, "INT64")
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, "STRING")
    }

    pub fn float64(name: impl Into<String>) -> Self {
        Self::new(name, "FLOAT64")
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, "BOOLEAN")
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, "DATE")
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, "TIMESTAMP")
    }

    pub fn numeric(name: impl Into<String>) -> Self {
        Self::new(name, "NUMERIC")
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl From<(&str, &str)> for ColumnDef {
    fn from((name, column_type): (&str, &str)) -> Self {
        Self::new(name, column_type)
    }
}

/// Column metadata for one warehouse table. Replaced wholesale on refresh,
/// never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_rows: Option<u64>,
}

impl SchemaTable {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            num_rows: None,
        }
    }

    pub fn with_num_rows(mut self, num_rows: u64) -> Self {
        self.num_rows = Some(num_rows);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// One-line rendering used in language-model grounding context.
    pub fn to_prompt_line(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                if c.nullable {
                    format!("{} {}", c.name, c.column_type)
                } else {
                    format!("{} {} NOT NULL", c.name, c.column_type)
                }
            })
            .collect();
        format!("{}({})", self.name, cols.join(", "))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleRows {
    pub table: String,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// Positional rows as returned by a warehouse backend.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Value>>,
    /// Set when the backend knows the full result is larger than `rows`.
    pub total_rows: Option<u64>,
}

impl QueryResult {
    pub fn into_rows(self) -> Vec<Row> {
        let names: Vec<String> = self.columns.into_iter().map(|c| c.name).collect();
        self.rows
            .into_iter()
            .map(|values| {
                names
                    .iter()
                    .cloned()
                    .zip(values.into_iter().chain(std::iter::repeat(Value::Null)))
                    .collect()
            })
            .collect()
    }
}
