use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{BitarchiveError, Result};

/// Something the store can copy a new container from. Treated as untrusted:
/// implementations validate before the store consumes them.
pub trait UploadSource: Send + Sync {
    /// Display name, for logs.
    fn name(&self) -> &str;

    /// Expected byte count; used for placement and checked after the copy.
    fn size(&self) -> u64;

    fn open(&self) -> Result<Box<dyn Read + Send + '_>>;

    fn copy_to(&self, dst: &mut dyn Write) -> Result<u64> {
        let mut r = self.open()?;
        Ok(std::io::copy(&mut r, dst)?)
    }
}

/// A regular file on a local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    size: u64,
}

impl LocalFile {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let md = std::fs::metadata(path).map_err(|e| {
            BitarchiveError::invalid(format!("upload source '{}': {e}", path.display()))
        })?;
        if !md.is_file() {
            return Err(BitarchiveError::invalid(format!(
                "upload source '{}' is not a regular file",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            name: path.display().to_string(),
            size: md.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UploadSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn open(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_and_missing_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            LocalFile::new(dir.path()),
            Err(BitarchiveError::InvalidArgument(_))
        ));
        assert!(matches!(
            LocalFile::new(dir.path().join("nope.arc")),
            Err(BitarchiveError::InvalidArgument(_))
        ));
    }

    #[test]
    fn copies_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("Upload1.ARC");
        std::fs::write(&p, b"0123456789").unwrap();
        let src = LocalFile::new(&p).unwrap();
        let mut out = Vec::new();
        assert_eq!(src.size(), 10);
        assert_eq!(src.copy_to(&mut out).unwrap(), 10);
        assert_eq!(out, b"0123456789");
    }
}
