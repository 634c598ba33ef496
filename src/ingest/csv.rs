use crate::ingest::SeedError;
use std::collections::HashSet;
use std::path::Path;

/// Checks that a seed file's header row carries every column the catalog
/// expects for its table. Extra columns are tolerated; DuckDB's reader keeps
/// them and the allow-list simply never exposes them.
pub fn verify_headers(path: &Path, expected: &[String]) -> Result<(), SeedError> {
    let mut reader = ::csv::Reader::from_path(path)?;
    let headers: HashSet<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();

    let missing: Vec<&str> = expected
        .iter()
        .map(String::as_str)
        .filter(|col| !headers.contains(*col))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(SeedError::MissingColumns(format!(
            "{}: {}",
            path.display(),
            missing.join(", ")
        )))
    }
}
