use std::io::{Read, Write};

use crate::codec::CodecId;
use crate::error::{BitarchiveError, Result};

pub const RECORD_MAGIC: &[u8; 4] = b"BREC";
/// Fixed part of a record header, before the uri bytes.
pub const FIXED_HEADER_LEN: u64 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub codec: CodecId,
    pub uri: String,
    /// Payload bytes as stored on disk.
    pub stored_len: u64,
    /// Payload bytes after decoding.
    pub raw_len: u64,
}

impl RecordHeader {
    pub fn new(uri: impl Into<String>, codec: CodecId) -> Self {
        Self {
            codec,
            uri: uri.into(),
            stored_len: 0,
            raw_len: 0,
        }
    }

    pub fn header_len(&self) -> u64 {
        FIXED_HEADER_LEN + self.uri.len() as u64
    }

    /// Header plus stored payload; `None` when the lengths overflow.
    pub fn record_len(&self) -> Option<u64> {
        self.header_len().checked_add(self.stored_len)
    }

    pub fn write_to(&self, mut w: impl Write) -> Result<()> {
        let uri_len = u16::try_from(self.uri.len()).map_err(|_| {
            BitarchiveError::invalid(format!("record uri longer than {} bytes", u16::MAX))
        })?;
        w.write_all(RECORD_MAGIC)?;
        w.write_all(&[self.codec as u8, 0])?;
        w.write_all(&uri_len.to_le_bytes())?;
        w.write_all(&self.stored_len.to_le_bytes())?;
        w.write_all(&self.raw_len.to_le_bytes())?;
        w.write_all(self.uri.as_bytes())?;
        Ok(())
    }

    /// Returns `Ok(None)` when the bytes at the cursor are not a record header
    /// (bad magic or a header cut short by EOF).
    pub fn read_from(mut r: impl Read) -> Result<Option<Self>> {
        let mut fixed = [0u8; FIXED_HEADER_LEN as usize];
        match r.read_exact(&mut fixed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if &fixed[0..4] != RECORD_MAGIC {
            return Ok(None);
        }
        // Layout: [0..4]=magic, [4]=codec, [5]=reserved, [6..8]=uri_len, [8..16]=stored, [16..24]=raw
        let codec = CodecId::try_from(fixed[4])?;
        let uri_len = u16::from_le_bytes([fixed[6], fixed[7]]) as usize;
        let stored_len = le64(&fixed[8..16]);
        let raw_len = le64(&fixed[16..24]);

        let mut uri = vec![0u8; uri_len];
        match r.read_exact(&mut uri) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let uri = String::from_utf8(uri)
            .map_err(|_| BitarchiveError::Format("record uri is not UTF-8".into()))?;
        Ok(Some(Self {
            codec,
            uri,
            stored_len,
            raw_len,
        }))
    }
}

#[inline]
fn le64(x: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&x[..8]);
    u64::from_le_bytes(b)
}
