use crate::error::{BitarchiveError, Result};
use crate::util::counting::CountingWriter;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Payload encoding of a container record, stored in the record header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    Stored = 0,
    Zstd = 1,
}

impl TryFrom<u8> for CodecId {
    type Error = BitarchiveError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CodecId::Stored),
            1 => Ok(CodecId::Zstd),
            other => Err(BitarchiveError::Format(format!("unknown codec id {other}"))),
        }
    }
}

pub trait Codec: Send + Sync {
    fn id(&self) -> CodecId;
    /// Returns `(raw bytes consumed, stored bytes written)`.
    fn encode(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> Result<(u64, u64)>;
    /// Returns raw bytes written to `dst`.
    fn decode(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64>;
}

pub struct Stored;

impl Codec for Stored {
    fn id(&self) -> CodecId {
        CodecId::Stored
    }

    fn encode(&self, src: &mut dyn Read, dst: &mut dyn Write, _level: i32) -> Result<(u64, u64)> {
        let n = std::io::copy(src, dst)?;
        Ok((n, n))
    }

    fn decode(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        Ok(std::io::copy(src, dst)?)
    }
}

pub struct Zstd;

impl Codec for Zstd {
    fn id(&self) -> CodecId {
        CodecId::Zstd
    }

    fn encode(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> Result<(u64, u64)> {
        let mut counted = CountingWriter::new(dst);
        let raw = {
            let mut enc = zstd::stream::Encoder::new(&mut counted, level.max(1))?;
            let raw = std::io::copy(src, &mut enc)?;
            enc.finish()?;
            raw
        };
        Ok((raw, counted.count()))
    }

    fn decode(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        let mut dec = zstd::stream::Decoder::new(src)?;
        Ok(std::io::copy(&mut dec, dst)?)
    }
}

pub fn codec_for(id: CodecId) -> &'static dyn Codec {
    match id {
        CodecId::Stored => &Stored,
        CodecId::Zstd => &Zstd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_reports_stored_length_and_decodes_back() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-type: text/html\r\n\r\n".repeat(64);
        let mut packed = Vec::new();
        let (consumed, stored) = codec_for(CodecId::Zstd)
            .encode(&mut &raw[..], &mut packed, 3)
            .unwrap();
        assert_eq!(consumed, raw.len() as u64);
        assert_eq!(stored, packed.len() as u64);
        assert!(stored < consumed);

        let mut out = Vec::new();
        let n = codec_for(CodecId::Zstd)
            .decode(&mut &packed[..], &mut out)
            .unwrap();
        assert_eq!(n, raw.len() as u64);
        assert_eq!(out, raw);
    }

    #[test]
    fn unknown_codec_byte_is_a_format_error() {
        assert!(matches!(
            CodecId::try_from(7),
            Err(BitarchiveError::Format(_))
        ));
    }
}
