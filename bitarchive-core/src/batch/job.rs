use std::io::{Read, Write};
use std::time::Duration;

use crate::container::reader::{ArchiveRecord, ContainerReader};
use crate::domain::ArchiveFile;
use crate::error::Result;

/// A record-level error a job caught and wants reported without failing
/// the whole file.
#[derive(Clone, Debug)]
pub struct RecordFault {
    pub filename: String,
    pub offset: u64,
    pub message: String,
}

/// A whole-file batch job. The runner calls `initialize` once, `process_file`
/// once per selected file, then `finish` once, all with the same sink.
pub trait BatchJob: Send {
    /// Registry key or display name.
    fn name(&self) -> &str;

    /// How long a remote caller should wait for this job. `None` defers to the node default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn initialize(&mut self, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// `Ok(false)` marks the file failed without an error message of its own.
    fn process_file(&mut self, file: &ArchiveFile, out: &mut dyn Write) -> Result<bool>;

    fn finish(&mut self, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Record-level faults caught since the last call.
    fn drain_faults(&mut self) -> Vec<RecordFault> {
        Vec::new()
    }

    /// Rewrite the concatenated output of several nodes. Returns `false`
    /// when the job does no post-processing and `output` was left untouched.
    fn post_process(&self, _input: &mut dyn Read, _output: &mut dyn Write) -> Result<bool> {
        Ok(false)
    }
}

/// A job that visits every record of every selected container.
pub trait RecordJob: Send {
    fn name(&self) -> &str;

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn initialize(&mut self, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn process_record(&mut self, record: &mut ArchiveRecord, out: &mut dyn Write) -> Result<()>;

    fn finish(&mut self, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn post_process(&self, _input: &mut dyn Read, _output: &mut dyn Write) -> Result<bool> {
        Ok(false)
    }
}

/// Runs a [`RecordJob`] as a [`BatchJob`]. A file fails if any of its records
/// failed; each failing record is reported as a fault and the scan continues.
pub struct RecordScan<J> {
    inner: J,
    faults: Vec<RecordFault>,
}

impl<J: RecordJob> RecordScan<J> {
    pub fn new(inner: J) -> Self {
        Self {
            inner,
            faults: Vec::new(),
        }
    }
}

impl<J: RecordJob> BatchJob for RecordScan<J> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    fn initialize(&mut self, out: &mut dyn Write) -> Result<()> {
        self.inner.initialize(out)
    }

    fn process_file(&mut self, file: &ArchiveFile, out: &mut dyn Write) -> Result<bool> {
        let reader = ContainerReader::open(&file.path)?;
        let mut ok = true;
        // a broken header ends the walk; everything before it was still visited
        for item in reader.records()? {
            let (offset, _) = item?;
            let outcome = reader
                .read_record_at(offset)
                .and_then(|mut rec| self.inner.process_record(&mut rec, out));
            if let Err(e) = outcome {
                ok = false;
                self.faults.push(RecordFault {
                    filename: file.name.clone(),
                    offset,
                    message: e.to_string(),
                });
            }
        }
        Ok(ok)
    }

    fn finish(&mut self, out: &mut dyn Write) -> Result<()> {
        self.inner.finish(out)
    }

    fn drain_faults(&mut self) -> Vec<RecordFault> {
        std::mem::take(&mut self.faults)
    }

    fn post_process(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<bool> {
        self.inner.post_process(input, output)
    }
}
