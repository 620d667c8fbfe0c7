use bitarchive_core::BitarchiveError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Unknown replica: {0}")]
    UnknownReplica(String),

    #[error("Unknown node '{node}' in replica '{replica}'")]
    UnknownNode { replica: String, node: String },

    #[error("Settings error: {0}")]
    Settings(String),

    /// The channel to a node failed before a reply arrived.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Core(#[from] BitarchiveError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
