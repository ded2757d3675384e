//! Small columnar table the quality checks run against.
//!
//! Rows come either from the derived store tables or from a CSV export of
//! them. Cells are loosely typed on purpose: the checks have to cope with
//! whatever a warehouse export contains, and report a bad column as a check
//! error instead of refusing to load the file.

use anyhow::{Context, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// One cell. CSV loading tries integer, then float, then falls back to text;
/// empty cells are null.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) | Value::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn parse(cell: &str) -> Value {
        if cell.is_empty() {
            return Value::Null;
        }
        if let Ok(v) = cell.parse::<i64>() {
            return Value::Int(v);
        }
        if let Ok(v) = cell.parse::<f64>() {
            return Value::Float(v);
        }
        Value::Text(cell.to_string())
    }
}

// Floats compare by bit pattern so rows can live in hash sets for the
// uniqueness and duplicate checks.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Null, Value::Null) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Int(v) => {
                state.write_u8(0);
                v.hash(state);
            }
            Value::Float(v) => {
                state.write_u8(1);
                v.to_bits().hash(state);
            }
            Value::Text(v) => {
                state.write_u8(2);
                v.hash(state);
            }
            Value::Null => state.write_u8(3),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Null => f.write_str("null"),
        }
    }
}

/// Named table of rows with a fixed column set.
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Dataset {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Loads a headered CSV file, inferring cell types per [`Value`].
    pub fn from_csv(name: &str, path: &Path) -> Result<Dataset> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("opening dataset csv {}", path.display()))?;
        let columns: Vec<String> = reader
            .headers()
            .context("reading csv header")?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context("reading csv row")?;
            rows.push(record.iter().map(Value::parse).collect());
        }

        Ok(Dataset {
            name: name.to_string(),
            columns,
            rows,
        })
    }

    /// Adds a row, sized to the column count: short rows read as nulls in
    /// the missing columns, long rows lose the extra cells.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// # Errors
    ///
    /// Fails when the column does not exist; checks turn that into an
    /// errored outcome.
    pub fn column(&self, name: &str) -> Result<Vec<&Value>> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .with_context(|| format!("dataset {} has no column {name}", self.name))?;
        Ok(self.rows.iter().map(|row| &row[idx]).collect())
    }
}
