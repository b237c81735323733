//! Device-local configuration overrides persisted as a flat JSON object.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read override store at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse override store at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write override store at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize override store: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// String key/value overrides that take precedence over static configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
}

impl OverrideStore {
    /// Store that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store at `path`; a missing file yields an empty store bound to it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path: Some(path),
                entries: BTreeMap::new(),
            });
        }
        let raw = fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        let entries = if raw.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str::<BTreeMap<String, String>>(&raw).map_err(|source| {
                StoreError::Parse {
                    path: path.clone(),
                    source,
                }
            })?
        };
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Value for `key`; blank values count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist to the bound path via a temporary file and rename. No-op in memory.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, path).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}
