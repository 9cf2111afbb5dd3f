//! In-memory tabular data read from delimited files
//!
//! A [`Dataset`] holds the header row and the raw cell values of a CSV
//! file. Empty cells are kept as `None` and load as SQL NULL. Column types
//! are inferred lazily when the dataset is written.

mod csv;

pub use self::csv::{read_csv, read_csv_from_reader};

use std::path::PathBuf;

/// Error type for reading datasets
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Source file does not exist
    #[error("CSV file not found: {0}")]
    FileNotFound(PathBuf),

    /// Malformed delimited data
    #[error("Failed to parse CSV {path}: {message}")]
    Csv { path: PathBuf, message: String },

    /// Delimiter is not a single-byte character
    #[error("Invalid delimiter {0:?}: must be a single ASCII character")]
    InvalidDelimiter(char),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for dataset reads
pub type LoadResult<T> = Result<T, LoadError>;

/// SQL type chosen for a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Text,
}

impl ColumnType {
    /// PostgreSQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
        }
    }
}

/// A table loaded from a delimited file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Dataset {
    /// Build a dataset from column names and rows
    ///
    /// Rows shorter than the header are padded with NULLs, longer rows are
    /// truncated.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, None);
                row
            })
            .collect();
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// True when there is nothing to write: no rows or no columns
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }

    /// Infer one SQL type per column
    ///
    /// A column is `BIGINT` when every non-null value parses as `i64`,
    /// `DOUBLE PRECISION` when every one parses as `f64`, and `TEXT`
    /// otherwise. An all-null column is `TEXT`.
    pub fn column_types(&self) -> Vec<ColumnType> {
        (0..self.columns.len())
            .map(|idx| {
                let mut values = self.rows.iter().filter_map(|row| row[idx].as_deref());
                let mut seen = false;
                let mut ty = ColumnType::BigInt;
                for value in values.by_ref() {
                    seen = true;
                    if ty == ColumnType::BigInt && value.parse::<i64>().is_err() {
                        ty = ColumnType::Double;
                    }
                    if ty == ColumnType::Double && !is_float(value) {
                        ty = ColumnType::Text;
                        break;
                    }
                }
                if seen { ty } else { ColumnType::Text }
            })
            .collect()
    }
}

// Rejects "inf"/"nan" spellings so free text such as "Infinity" stays TEXT.
fn is_float(value: &str) -> bool {
    value.parse::<f64>().is_ok_and(|v| v.is_finite())
}

/// Make header names unique and non-empty
///
/// Blank headers become `Unnamed: <index>`; repeated names get `.1`, `.2`
/// suffixes in order of appearance.
pub fn normalize_headers<'a>(headers: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = std::collections::HashMap::<String, usize>::new();
    let mut result: Vec<String> = Vec::new();

    for (idx, raw) in headers.into_iter().enumerate() {
        let base = if raw.trim().is_empty() {
            format!("Unnamed: {}", idx)
        } else {
            raw.trim().to_string()
        };

        let mut name = base.clone();
        while let Some(count) = seen.get_mut(&name) {
            *count += 1;
            name = format!("{}.{}", base, count);
            if !seen.contains_key(&name) {
                break;
            }
        }
        seen.entry(name.clone()).or_insert(0);
        result.push(name);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(values: &[&str]) -> Vec<Option<String>> {
        values
            .iter()
            .map(|v| {
                if v.is_empty() {
                    None
                } else {
                    Some(v.to_string())
                }
            })
            .collect()
    }

    #[test]
    fn test_empty_dataset() {
        assert!(Dataset::default().is_empty());
        assert!(Dataset::new(vec!["a".to_string()], vec![]).is_empty());
        assert!(!Dataset::new(vec!["a".to_string()], vec![cells(&["1"])]).is_empty());
    }

    #[test]
    fn test_rows_are_padded_to_header_width() {
        let ds = Dataset::new(
            vec!["a".to_string(), "b".to_string()],
            vec![cells(&["1"]), cells(&["1", "2", "3"])],
        );
        assert_eq!(ds.rows()[0], vec![Some("1".to_string()), None]);
        assert_eq!(ds.rows()[1].len(), 2);
    }

    #[test]
    fn test_column_type_inference() {
        let ds = Dataset::new(
            vec![
                "int".to_string(),
                "float".to_string(),
                "text".to_string(),
                "nulls".to_string(),
                "inf".to_string(),
            ],
            vec![
                cells(&["1", "1.5", "a", "", "1"]),
                cells(&["", "2", "3", "", "Infinity"]),
                cells(&["-7", "-0.25", "x", "", "2"]),
            ],
        );
        assert_eq!(
            ds.column_types(),
            vec![
                ColumnType::BigInt,
                ColumnType::Double,
                ColumnType::Text,
                ColumnType::Text,
                ColumnType::Text,
            ]
        );
    }

    #[test]
    fn test_normalize_headers() {
        let headers = normalize_headers(["id", "", "id", "name", "id", " name "]);
        assert_eq!(
            headers,
            vec!["id", "Unnamed: 1", "id.1", "name", "id.2", "name.1"]
        );
    }
}
