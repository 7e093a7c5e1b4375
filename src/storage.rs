//! File-backed JSON stores under the per-user configuration directory.
//!
//! Each store is one document in one file. `load` returns the default
//! document when the file does not exist yet, so first runs need no setup.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read store file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse store file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("No user configuration directory available")]
    NoConfigDir,
}

/// Per-user configuration directory (`~/.config/vpnctl`), created on first use.
pub fn config_dir() -> Result<PathBuf, StoreError> {
    let dir = dirs::config_dir()
        .ok_or(StoreError::NoConfigDir)?
        .join("vpnctl");
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// A JSON document persisted as a single file in the configuration directory.
pub trait JsonFile: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;

    fn path() -> Result<PathBuf, StoreError> {
        Ok(config_dir()?.join(Self::FILE_NAME))
    }

    fn load_from(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save_to(&self, path: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    fn load() -> Result<Self, StoreError> {
        Self::load_from(&Self::path()?)
    }

    fn save(&self) -> Result<(), StoreError> {
        self.save_to(&Self::path()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        value: u32,
    }

    impl JsonFile for Doc {
        const FILE_NAME: &'static str = "doc.json";
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");

        let doc = Doc::load_from(&path).unwrap();
        assert_eq!(doc, Doc::default());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");

        let doc = Doc { value: 42 };
        doc.save_to(&path).unwrap();

        let loaded = Doc::load_from(&path).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_load_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");

        fs::write(&path, "not json {{{").unwrap();

        let result = Doc::load_from(&path);
        assert!(matches!(result, Err(StoreError::Parse(_))));
    }
}
