use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec::{CodecId, codec_for};
use crate::container::record::RecordHeader;
use crate::error::{BitarchiveError, Result};
use crate::util::counting::CountingWriter;

const ZSTD_LEVEL: i32 = 3;

/// Appends records to a new container file.
pub struct ContainerWriter {
    out: BufWriter<File>,
    path: PathBuf,
    next_off: u64,
}

impl ContainerWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let f = File::create(path)?;
        Ok(Self {
            out: BufWriter::new(f),
            path: path.to_path_buf(),
            next_off: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and return the offset its header starts at.
    pub fn append(&mut self, uri: &str, codec: CodecId, mut payload: impl Read) -> Result<u64> {
        let offset = self.next_off;
        let mut header = RecordHeader::new(uri, codec);

        // placeholder header; lengths are patched once the payload is through the codec
        header.write_to(&mut self.out)?;
        let (raw_len, stored_len) = {
            let mut counted = CountingWriter::new(&mut self.out);
            let (raw, _) = codec_for(codec).encode(&mut payload, &mut counted, ZSTD_LEVEL)?;
            (raw, counted.count())
        };
        header.raw_len = raw_len;
        header.stored_len = stored_len;

        let end = header
            .record_len()
            .and_then(|n| offset.checked_add(n))
            .ok_or_else(|| BitarchiveError::Format("container grew past u64 offsets".into()))?;
        self.out.seek(SeekFrom::Start(offset))?;
        header.write_to(&mut self.out)?;
        self.out.seek(SeekFrom::Start(end))?;
        self.next_off = end;
        Ok(offset)
    }

    /// Flush and sync; returns the container length.
    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        let f = self.out.into_inner().map_err(|e| e.into_error())?;
        f.sync_all()?;
        Ok(self.next_off)
    }
}
