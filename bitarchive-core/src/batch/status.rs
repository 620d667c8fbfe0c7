use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub filename: String,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    ProcessFile,
    ProcessRecord,
    Finish,
}

/// One caught error, with enough position to find it again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionOccurrence {
    pub phase: Phase,
    pub filename: Option<String>,
    /// Record offset inside the file, for record-level jobs.
    pub file_offset: Option<u64>,
    /// Bytes of job output written when the error was caught.
    pub output_offset: u64,
    pub message: String,
}

/// Outcome of one batch run on one node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchStatus {
    pub app_id: String,
    pub job: String,
    pub files_matched: usize,
    /// Files handed to `process_file`, successful or not.
    pub files_processed: usize,
    pub failures: Vec<FileFailure>,
    pub exceptions: Vec<ExceptionOccurrence>,
    /// Occurrences beyond the cap, counted but not kept.
    pub exceptions_dropped: usize,
    pub finish_error: Option<String>,
    pub result_file: Option<PathBuf>,
    /// Operator-facing progress lines.
    pub log: Vec<String>,
    pub elapsed_ms: u64,
    pub timeout_ms: u64,
    pub overran_timeout: bool,
}

impl BatchStatus {
    pub fn succeeded(&self) -> usize {
        self.files_processed.saturating_sub(self.failures.len())
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.finish_error.is_none()
    }
}
