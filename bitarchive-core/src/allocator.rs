use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{BitarchiveError, Result};
use crate::space::SpaceProbe;

pub const FILE_DIR: &str = "filedir";
pub const TEMP_DIR: &str = "tempdir";
pub const ATTIC_DIR: &str = "atticdir";

/// One configured storage root and its three working subdirectories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageDirectory {
    pub base: PathBuf,
    pub file_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub attic_dir: PathBuf,
}

impl StorageDirectory {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            file_dir: base.join(FILE_DIR),
            temp_dir: base.join(TEMP_DIR),
            attic_dir: base.join(ATTIC_DIR),
        }
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.file_dir.join(filename)
    }

    fn subdirs(&self) -> [&Path; 4] {
        [&self.base, &self.file_dir, &self.temp_dir, &self.attic_dir]
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PlacementPolicy {
    pub min_space_left: u64,
    pub min_space_required: u64,
    pub read_only_allowed: bool,
}

impl PlacementPolicy {
    fn admits(&self, free: u64, size: u64) -> bool {
        free >= self.min_space_left && free >= size.saturating_add(self.min_space_required)
    }
}

/// Chooses where new uploads land: round-robin from the last used directory,
/// skipping directories without enough free space.
pub struct DirectoryAllocator {
    dirs: Vec<StorageDirectory>,
    policy: PlacementPolicy,
    probe: Arc<dyn SpaceProbe>,
    current: Mutex<usize>,
}

impl DirectoryAllocator {
    /// Create missing directories and verify each is writable. The first
    /// directory in `roots` is the initial placement target.
    pub fn new(roots: &[PathBuf], policy: PlacementPolicy, probe: Arc<dyn SpaceProbe>) -> Result<Self> {
        if roots.is_empty() {
            return Err(BitarchiveError::invalid("no storage directories configured"));
        }
        let mut dirs = Vec::with_capacity(roots.len());
        for root in roots {
            let dir = StorageDirectory::new(root);
            prepare(&dir, policy.read_only_allowed)?;
            dirs.push(dir);
        }
        tracing::info!(dirs = dirs.len(), "storage directories ready");
        Ok(Self {
            dirs,
            policy,
            probe,
            current: Mutex::new(0),
        })
    }

    pub fn all_directories(&self) -> &[StorageDirectory] {
        &self.dirs
    }

    /// Pick the directory for a new file of `size` bytes and move the pointer to it.
    pub fn pick_directory_for(&self, filename: &str, size: u64) -> Result<&StorageDirectory> {
        let mut cur = self
            .current
            .lock()
            .map_err(|_| BitarchiveError::io_failure("allocator lock poisoned"))?;
        let n = self.dirs.len();
        for step in 0..n {
            let idx = (*cur + step) % n;
            let dir = &self.dirs[idx];
            let free = match self.probe.available(&dir.base) {
                Ok(free) => free,
                Err(e) => {
                    tracing::warn!(dir = %dir.base.display(), error = %e, "cannot query free space");
                    continue;
                }
            };
            if self.policy.admits(free, size) {
                *cur = idx;
                tracing::debug!(%filename, size, free, dir = %dir.base.display(), "placement chosen");
                return Ok(dir);
            }
            tracing::debug!(%filename, size, free, dir = %dir.base.display(), "directory too full");
        }
        tracing::warn!(%filename, size, "no directory has room");
        Err(BitarchiveError::NoSpace {
            filename: filename.to_string(),
            size,
            dirs: self.dirs.iter().map(|d| d.base.clone()).collect(),
        })
    }

    /// True if at least one directory is above the free-space floor.
    pub fn has_enough_space(&self) -> bool {
        self.dirs.iter().any(|d| {
            self.probe
                .available(&d.base)
                .map(|free| free >= self.policy.min_space_left)
                .unwrap_or(false)
        })
    }

    pub fn free_space(&self, dir: &StorageDirectory) -> Result<u64> {
        self.probe.available(&dir.base)
    }

    /// Locate an admitted file by looking in every `filedir`. Recovery path only.
    pub fn find_existing(&self, filename: &str) -> Option<(&StorageDirectory, PathBuf)> {
        self.dirs.iter().find_map(|d| {
            let p = d.file_path(filename);
            p.is_file().then_some((d, p))
        })
    }

    /// Total bytes of stored files under `dir`'s `filedir`.
    pub fn bytes_used(&self, dir: &StorageDirectory) -> u64 {
        walkdir::WalkDir::new(&dir.file_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

fn prepare(dir: &StorageDirectory, read_only_allowed: bool) -> Result<()> {
    for p in dir.subdirs() {
        if !p.is_dir() {
            std::fs::create_dir_all(p).map_err(|e| {
                BitarchiveError::denied(format!("cannot create '{}': {e}", p.display()))
            })?;
        }
    }
    for p in dir.subdirs() {
        if let Err(e) = tempfile::tempfile_in(p) {
            if read_only_allowed {
                tracing::warn!(path = %p.display(), error = %e, "directory is not writable, serving read-only");
            } else {
                return Err(BitarchiveError::denied(format!(
                    "directory '{}' is not writable: {e}",
                    p.display()
                )));
            }
        }
    }
    Ok(())
}
