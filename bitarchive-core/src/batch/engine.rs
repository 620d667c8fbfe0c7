use std::any::Any;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use crate::batch::job::BatchJob;
use crate::batch::status::{BatchStatus, ExceptionOccurrence, FileFailure, Phase};
use crate::domain::ArchiveFile;
use crate::error::{BitarchiveError, Result};
use crate::settings::BatchSettings;
use crate::util::counting::CountingWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Created,
    Initialized,
    Processing,
    Finished,
}

impl BatchState {
    fn advance(self, next: BatchState) -> Result<BatchState> {
        use BatchState::*;
        match (self, next) {
            (Created, Initialized)
            | (Initialized, Processing)
            | (Initialized, Finished)
            | (Processing, Processing)
            | (Processing, Finished) => Ok(next),
            _ => Err(BitarchiveError::io_failure(format!(
                "illegal batch transition {self:?} -> {next:?}"
            ))),
        }
    }
}

/// Drives one job over a list of files on this node.
pub struct BatchRunner {
    max_exceptions: usize,
    default_timeout: Duration,
}

fn panic_message(p: Box<dyn Any + Send>) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = p.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Run `f`, turning both errors and panics into a message.
fn guarded<T>(f: impl FnOnce() -> Result<T>) -> std::result::Result<T, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.to_string()),
        Err(p) => Err(panic_message(p)),
    }
}

impl BatchRunner {
    pub fn new(settings: &BatchSettings) -> Self {
        Self {
            max_exceptions: settings.max_exceptions,
            default_timeout: Duration::from_millis(settings.default_timeout_ms),
        }
    }

    fn note_exception(&self, status: &mut BatchStatus, occ: ExceptionOccurrence) {
        if status.exceptions.len() < self.max_exceptions {
            status.exceptions.push(occ);
        } else {
            status.exceptions_dropped += 1;
        }
    }

    /// Run `job` over `files`, writing all job output to `sink`.
    ///
    /// Only a failing `initialize` fails the call. Per-file errors and panics,
    /// and a failing `finish`, are recorded in the returned status. The job is
    /// never interrupted; `overran_timeout` only reports that it ran long.
    pub fn run(
        &self,
        app_id: &str,
        job: &mut dyn BatchJob,
        files: &[ArchiveFile],
        sink: &mut dyn Write,
    ) -> Result<BatchStatus> {
        let started = Instant::now();
        let timeout = job.timeout().unwrap_or(self.default_timeout);
        let name = job.name().to_string();
        let mut status = BatchStatus {
            app_id: app_id.to_string(),
            job: name.clone(),
            files_matched: files.len(),
            timeout_ms: timeout.as_millis() as u64,
            ..Default::default()
        };
        let mut out = CountingWriter::new(sink);
        let mut state = BatchState::Created;

        status
            .log
            .push(format!("Started batch job '{name}' ({app_id}) on {} file(s)", files.len()));
        tracing::info!(%app_id, job = %name, files = files.len(), "batch started");

        if let Err(msg) = guarded(|| job.initialize(&mut out)) {
            tracing::warn!(%app_id, job = %name, error = %msg, "batch initialization failed");
            return Err(BitarchiveError::io_failure(format!(
                "batch initialization failed: {msg}"
            )));
        }
        state = state.advance(BatchState::Initialized)?;

        for file in files {
            state = state.advance(BatchState::Processing)?;
            let outcome = guarded(|| job.process_file(file, &mut out));
            status.files_processed += 1;

            for fault in job.drain_faults() {
                self.note_exception(
                    &mut status,
                    ExceptionOccurrence {
                        phase: Phase::ProcessRecord,
                        filename: Some(fault.filename),
                        file_offset: Some(fault.offset),
                        output_offset: out.count(),
                        message: fault.message,
                    },
                );
            }

            let message = match outcome {
                Ok(true) => {
                    tracing::debug!(file = %file.name, "batch file done");
                    continue;
                }
                Ok(false) => "job reported failure".to_string(),
                Err(msg) => {
                    self.note_exception(
                        &mut status,
                        ExceptionOccurrence {
                            phase: Phase::ProcessFile,
                            filename: Some(file.name.clone()),
                            file_offset: None,
                            output_offset: out.count(),
                            message: msg.clone(),
                        },
                    );
                    msg
                }
            };
            tracing::warn!(file = %file.name, error = %message, "batch file failed");
            status.failures.push(FileFailure {
                filename: file.name.clone(),
                message,
            });
        }
        status.log.push(format!(
            "Processed {} file(s), {} failed",
            status.files_processed,
            status.failures.len()
        ));

        state.advance(BatchState::Finished)?;
        if let Err(msg) = guarded(|| job.finish(&mut out)) {
            tracing::warn!(%app_id, job = %name, error = %msg, "batch finish failed");
            self.note_exception(
                &mut status,
                ExceptionOccurrence {
                    phase: Phase::Finish,
                    filename: None,
                    file_offset: None,
                    output_offset: out.count(),
                    message: msg.clone(),
                },
            );
            status.finish_error = Some(msg);
        }
        out.flush()?;

        let elapsed = started.elapsed();
        status.elapsed_ms = elapsed.as_millis() as u64;
        status.overran_timeout = elapsed > timeout;
        if status.overran_timeout {
            tracing::warn!(%app_id, job = %name, elapsed_ms = status.elapsed_ms, "batch ran past its timeout");
        }
        status
            .log
            .push(format!("Finished batch job '{name}' in {} ms", status.elapsed_ms));
        tracing::info!(
            %app_id,
            job = %name,
            processed = status.files_processed,
            failed = status.failures.len(),
            "batch finished"
        );
        Ok(status)
    }
}
