#![forbid(unsafe_code)]

pub mod error;
pub mod settings;

pub mod util {
    pub mod counting;
    pub mod hashing;
}

pub mod codec;

pub mod container {
    pub mod reader;
    pub mod record;
    pub mod writer;
}

pub mod allocator;
pub mod batch;
pub mod domain;
pub mod ledger;
pub mod space;
pub mod store;
pub mod upload;

// Re-exports: stable API surface
pub use batch::{BatchJob, BatchRunner, BatchStatus, Filter, FilterSpec, JobRegistry};
pub use codec::CodecId;
pub use container::reader::{ArchiveRecord, ContainerReader};
pub use container::writer::ContainerWriter;
pub use domain::ArchiveFile;
pub use error::{BitarchiveError, ErrorClass, Result};
pub use settings::{ArchiveSettings, BatchSettings};
pub use store::Bitarchive;
pub use upload::{LocalFile, UploadSource};
