use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{BitarchiveError, Result};

/// Free-space oracle. Queried on every placement, never cached, since other
/// processes share the same volumes.
pub trait SpaceProbe: Send + Sync {
    fn available(&self, dir: &Path) -> Result<u64>;
}

/// Asks the filesystem holding `dir`.
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available(&self, dir: &Path) -> Result<u64> {
        Ok(fs2::available_space(dir)?)
    }
}

/// Reports configured figures instead of asking the filesystem.
/// Directories without a figure report `default`.
pub struct FixedSpaceProbe {
    default: u64,
    per_dir: Mutex<HashMap<PathBuf, u64>>,
}

impl FixedSpaceProbe {
    pub fn new(default: u64) -> Self {
        Self {
            default,
            per_dir: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, dir: impl Into<PathBuf>, bytes: u64) {
        if let Ok(mut m) = self.per_dir.lock() {
            m.insert(dir.into(), bytes);
        }
    }
}

impl SpaceProbe for FixedSpaceProbe {
    fn available(&self, dir: &Path) -> Result<u64> {
        let m = self
            .per_dir
            .lock()
            .map_err(|_| BitarchiveError::io_failure("space probe lock poisoned"))?;
        Ok(m.get(dir).copied().unwrap_or(self.default))
    }
}
