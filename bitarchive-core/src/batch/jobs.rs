//! Jobs shipped with the node.

use std::io::{BufRead, BufReader, Read, Write};

use crate::batch::job::{BatchJob, RecordJob};
use crate::container::reader::ArchiveRecord;
use crate::domain::ArchiveFile;
use crate::error::Result;
use crate::util::hashing::checksum_file;

/// Sort the lines of `input` into `output`.
fn sort_lines(input: &mut dyn Read, output: &mut dyn Write) -> Result<bool> {
    let mut lines = BufReader::new(input)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?;
    lines.sort();
    for l in lines {
        writeln!(output, "{l}")?;
    }
    Ok(true)
}

/// Emits `filename##blake3` for every file.
#[derive(Default)]
pub struct ChecksumJob;

impl BatchJob for ChecksumJob {
    fn name(&self) -> &str {
        "checksum"
    }

    fn process_file(&mut self, file: &ArchiveFile, out: &mut dyn Write) -> Result<bool> {
        let digest = checksum_file(&file.path)?;
        writeln!(out, "{}##{}", file.name, digest)?;
        Ok(true)
    }

    fn post_process(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<bool> {
        sort_lines(input, output)
    }
}

/// Emits each filename on its own line.
#[derive(Default)]
pub struct FileListJob;

impl BatchJob for FileListJob {
    fn name(&self) -> &str {
        "filelist"
    }

    fn process_file(&mut self, file: &ArchiveFile, out: &mut dyn Write) -> Result<bool> {
        writeln!(out, "{}", file.name)?;
        Ok(true)
    }

    fn post_process(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<bool> {
        sort_lines(input, output)
    }
}

/// Emits `filename offset length uri` for every record.
#[derive(Default)]
pub struct RecordIndexJob;

impl RecordJob for RecordIndexJob {
    fn name(&self) -> &str {
        "record-index"
    }

    fn process_record(&mut self, record: &mut ArchiveRecord, out: &mut dyn Write) -> Result<()> {
        writeln!(
            out,
            "{} {} {} {}",
            record.filename(),
            record.offset(),
            record.length(),
            record.uri()
        )?;
        Ok(())
    }
}
