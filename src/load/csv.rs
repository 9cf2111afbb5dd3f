//! Delimited file reader

use std::path::Path;

use super::{Dataset, LoadError, LoadResult, normalize_headers};

/// Read a delimited file with a header row into a [`Dataset`]
pub fn read_csv(path: impl AsRef<Path>, delimiter: char) -> LoadResult<Dataset> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(LoadError::FileNotFound(path.to_path_buf()));
    }

    let file = std::fs::File::open(path).map_err(|e| LoadError::Io(e.to_string()))?;
    let dataset = read_csv_from_reader(file, delimiter).map_err(|e| match e {
        LoadError::Csv { message, .. } => LoadError::Csv {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })?;

    tracing::info!(
        "Read {} rows x {} columns from {}",
        dataset.row_count(),
        dataset.column_count(),
        path.display()
    );
    Ok(dataset)
}

/// Read delimited data from any reader
pub fn read_csv_from_reader<R: std::io::Read>(reader: R, delimiter: char) -> LoadResult<Dataset> {
    if !delimiter.is_ascii() {
        return Err(LoadError::InvalidDelimiter(delimiter));
    }

    let mut rdr = ::csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let csv_error = |e: ::csv::Error| LoadError::Csv {
        path: Default::default(),
        message: e.to_string(),
    };

    let headers = rdr.headers().map_err(csv_error)?.clone();
    let columns = normalize_headers(headers.iter());

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(csv_error)?;
        // Skip fully blank lines
        if record.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        let row = record
            .iter()
            .map(|v| {
                if v.is_empty() {
                    None
                } else {
                    Some(v.to_string())
                }
            })
            .collect();
        rows.push(row);
    }

    Ok(Dataset::new(columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_semicolon_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "col1;col2\na;1\nb;2\n").unwrap();
        file.flush().unwrap();

        let ds = read_csv(file.path(), ';').unwrap();
        assert_eq!(ds.columns(), &["col1".to_string(), "col2".to_string()]);
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.rows()[1][0].as_deref(), Some("b"));
    }

    #[test]
    fn test_missing_file() {
        let err = read_csv("/definitely/not/here.csv", ';').unwrap_err();
        assert!(matches!(err, LoadError::FileNotFound(_)));
    }

    #[test]
    fn test_empty_cells_and_quotes() {
        let data = "name;note;n\n\"Cave; Dupont\";;3\n\nx;\"a \"\"b\"\"\";\n";
        let ds = read_csv_from_reader(data.as_bytes(), ';').unwrap();
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.rows()[0][0].as_deref(), Some("Cave; Dupont"));
        assert_eq!(ds.rows()[0][1], None);
        assert_eq!(ds.rows()[1][1].as_deref(), Some("a \"b\""));
        assert_eq!(ds.rows()[1][2], None);
    }

    #[test]
    fn test_header_only_is_empty() {
        let ds = read_csv_from_reader("a;b\n".as_bytes(), ';').unwrap();
        assert!(ds.is_empty());
        assert_eq!(ds.column_count(), 2);
    }

    #[test]
    fn test_non_ascii_delimiter() {
        let err = read_csv_from_reader("a§b\n".as_bytes(), '§').unwrap_err();
        assert!(matches!(err, LoadError::InvalidDelimiter('§')));
    }
}
