//! Atomic JSON snapshot persistence.
//!
//! Every persistent record (container, network, image catalog, IPAM bitmap)
//! is a single JSON file. Writes are full-file truncating writes after the
//! parent directory has been created; reads tolerate a zero-length file as
//! "empty record". The engine is single-process per host, so no intra-file
//! locking is needed.

use std::fs;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::Result;

/// Create `path`'s parent directory and the file itself if missing.
pub fn ensure_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        fs::File::create(path)?;
    }
    Ok(())
}

/// Serialize `record` and write it through, truncating any previous content.
pub fn dump<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec(record)?;
    fs::write(path, bytes)?;
    Ok(())
}

/// Load a record; `Ok(None)` when the file is missing or empty.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_dump_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/config.json");

        let mut record = BTreeMap::new();
        record.insert("name".to_string(), "web".to_string());
        dump(&path, &record).unwrap();

        let loaded: BTreeMap<String, String> = load(&path).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Vec<String>> = load(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_empty_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        ensure_file(&path).unwrap();
        let loaded: Option<Vec<String>> = load(&path).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_dump_truncates_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");

        dump(&path, &vec!["a"; 100]).unwrap();
        dump(&path, &vec!["b"]).unwrap();

        let loaded: Vec<String> = load(&path).unwrap().unwrap();
        assert_eq!(loaded, vec!["b"]);
    }
}
