use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BitarchiveError, Result};

/// Node-local settings for one bitarchive.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    /// Storage roots, in placement order. Each gets `filedir`, `tempdir` and `atticdir`.
    pub storage_dirs: Vec<PathBuf>,
    /// A directory must have at least this many bytes free to be considered for uploads.
    pub min_space_left: u64,
    /// Bytes that must remain free in the chosen directory after the upload lands.
    pub min_space_required: u64,
    /// Accept directories we cannot write to (read-only replicas still serve get/batch).
    pub read_only_allowed: bool,
    /// Ledger file; defaults to `admin.data` under the first storage dir.
    pub admin_data: Option<PathBuf>,
    pub batch: BatchSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Used when a job declares no timeout of its own.
    pub default_timeout_ms: u64,
    /// Exception occurrences kept per batch run; further ones are only logged.
    pub max_exceptions: usize,
    /// Where batch result files are written; defaults to the system temp dir.
    pub output_dir: Option<PathBuf>,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            storage_dirs: Vec::new(),
            min_space_left: 10 * 1024 * 1024,
            min_space_required: 0,
            read_only_allowed: false,
            admin_data: None,
            batch: BatchSettings::default(),
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 14 * 24 * 60 * 60 * 1000,
            max_exceptions: 100,
            output_dir: None,
        }
    }
}

impl ArchiveSettings {
    pub fn with_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            storage_dirs: dirs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|e| {
            BitarchiveError::invalid(format!("settings file '{}': {e}", path.display()))
        })
    }

    pub fn admin_data_path(&self) -> Result<PathBuf> {
        if let Some(p) = &self.admin_data {
            return Ok(p.clone());
        }
        self.storage_dirs
            .first()
            .map(|d| d.join("admin.data"))
            .ok_or_else(|| BitarchiveError::invalid("no storage directories configured"))
    }

    pub fn batch_output_dir(&self) -> PathBuf {
        self.batch
            .output_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
