use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BitarchiveError {
    /// Malformed request from the caller; never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Well-formed request refused by policy (duplicate upload, unwritable dir).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown id: {0}")]
    UnknownId(String),

    #[error("No space left in dirs {dirs:?} to store '{filename}' of size {size}")]
    NoSpace {
        filename: String,
        size: u64,
        dirs: Vec<PathBuf>,
    },

    #[error("Offset {offset} in '{filename}' is not at a record boundary")]
    Misaligned { filename: String, offset: u64 },

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),
}

/// Coarse taxonomy callers use to decide on retries and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidArgument,
    PermissionDenied,
    UnknownId,
    IoFailure,
}

impl BitarchiveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BitarchiveError::InvalidArgument(_) => ErrorClass::InvalidArgument,
            BitarchiveError::PermissionDenied(_) => ErrorClass::PermissionDenied,
            BitarchiveError::UnknownId(_) => ErrorClass::UnknownId,
            BitarchiveError::NoSpace { .. }
            | BitarchiveError::Misaligned { .. }
            | BitarchiveError::IoFailure(_)
            | BitarchiveError::Io(_)
            | BitarchiveError::Format(_) => ErrorClass::IoFailure,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        BitarchiveError::InvalidArgument(msg.into())
    }

    pub(crate) fn denied(msg: impl Into<String>) -> Self {
        BitarchiveError::PermissionDenied(msg.into())
    }

    pub(crate) fn io_failure(msg: impl Into<String>) -> Self {
        BitarchiveError::IoFailure(msg.into())
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, BitarchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_flavoured_errors_share_the_io_failure_class() {
        let misaligned = BitarchiveError::Misaligned {
            filename: "a.arc".into(),
            offset: 3,
        };
        let no_space = BitarchiveError::NoSpace {
            filename: "a.arc".into(),
            size: 10,
            dirs: vec![],
        };
        let io: BitarchiveError = std::io::Error::other("disk gone").into();

        assert_eq!(misaligned.class(), ErrorClass::IoFailure);
        assert_eq!(no_space.class(), ErrorClass::IoFailure);
        assert_eq!(io.class(), ErrorClass::IoFailure);
        assert_eq!(
            BitarchiveError::invalid("x").class(),
            ErrorClass::InvalidArgument
        );
        assert_eq!(
            BitarchiveError::denied("x").class(),
            ErrorClass::PermissionDenied
        );
    }
}
