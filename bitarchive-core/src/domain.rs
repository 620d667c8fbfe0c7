use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A container file admitted to this node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Usage figures for one storage root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryReport {
    pub base: PathBuf,
    /// `None` when the free-space query failed.
    pub free: Option<u64>,
    pub used: u64,
    pub files: usize,
}
