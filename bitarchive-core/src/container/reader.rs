use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec::{CodecId, codec_for};
use crate::container::record::RecordHeader;
use crate::error::{BitarchiveError, Result};

/// Random-access view over one container file.
pub struct ContainerReader {
    path: PathBuf,
    name: String,
    len: u64,
}

impl ContainerReader {
    pub fn open(path: &Path) -> Result<Self> {
        let md = std::fs::metadata(path)?;
        if !md.is_file() {
            return Err(BitarchiveError::invalid(format!(
                "'{}' is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            name,
            len: md.len(),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record whose header starts exactly at `offset`.
    pub fn read_record_at(&self, offset: u64) -> Result<ArchiveRecord> {
        if offset >= self.len {
            return Err(BitarchiveError::invalid(format!(
                "offset {offset} beyond end of '{}' ({} bytes)",
                self.name, self.len
            )));
        }
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(offset))?;
        let header = RecordHeader::read_from(BufReader::new(&mut f))?.ok_or_else(|| {
            BitarchiveError::Misaligned {
                filename: self.name.clone(),
                offset,
            }
        })?;
        // Lengths come from the file; bytes inside a payload can look like a header.
        let payload_off = offset
            .checked_add(header.header_len())
            .filter(|&p| p <= self.len)
            .ok_or_else(|| BitarchiveError::Misaligned {
                filename: self.name.clone(),
                offset,
            })?;
        if header.stored_len > self.len - payload_off {
            return Err(BitarchiveError::Format(format!(
                "record at {offset} in '{}' runs past end of file",
                self.name
            )));
        }
        Ok(ArchiveRecord {
            filename: self.name.clone(),
            offset,
            header,
            payload_off,
            file: f,
        })
    }

    /// Walk the container from the start, yielding each record's offset and header.
    pub fn records(&self) -> Result<RecordIter> {
        let f = File::open(&self.path)?;
        Ok(RecordIter {
            r: BufReader::new(f),
            name: self.name.clone(),
            pos: 0,
            len: self.len,
            done: false,
        })
    }
}

pub struct RecordIter {
    r: BufReader<File>,
    name: String,
    pos: u64,
    len: u64,
    done: bool,
}

impl Iterator for RecordIter {
    type Item = Result<(u64, RecordHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.len {
            return None;
        }
        let offset = self.pos;
        let header = match RecordHeader::read_from(&mut self.r) {
            Ok(Some(h)) => h,
            Ok(None) => {
                self.done = true;
                return Some(Err(BitarchiveError::Misaligned {
                    filename: self.name.clone(),
                    offset,
                }));
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        match header
            .record_len()
            .and_then(|n| offset.checked_add(n))
            .filter(|&end| end <= self.len)
        {
            Some(end) => self.pos = end,
            None => {
                self.done = true;
                return Some(Err(BitarchiveError::Format(format!(
                    "record at {offset} in '{}' runs past end of file",
                    self.name
                ))));
            }
        }
        if let Err(e) = self.r.seek(SeekFrom::Start(self.pos)) {
            self.done = true;
            return Some(Err(e.into()));
        }
        Some(Ok((offset, header)))
    }
}

/// One record inside a container. Holds its own file handle, so dropping it
/// never interferes with other handles on the same container.
pub struct ArchiveRecord {
    filename: String,
    offset: u64,
    header: RecordHeader,
    payload_off: u64,
    file: File,
}

impl ArchiveRecord {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    pub fn uri(&self) -> &str {
        &self.header.uri
    }

    /// Decoded payload length.
    pub fn length(&self) -> u64 {
        self.header.raw_len
    }

    /// Stream the decoded payload into `sink`; returns bytes written.
    pub fn get_data(&mut self, sink: &mut dyn Write) -> Result<u64> {
        self.file.seek(SeekFrom::Start(self.payload_off))?;
        let mut stored = (&mut self.file).take(self.header.stored_len);
        let n = codec_for(self.header.codec).decode(&mut stored, sink)?;
        if n != self.header.raw_len {
            return Err(BitarchiveError::Format(format!(
                "record at {} in '{}' decoded to {n} bytes, header says {}",
                self.offset, self.filename, self.header.raw_len
            )));
        }
        Ok(n)
    }

    /// Pull-style access to the decoded payload. Consumes the record and its handle.
    pub fn into_reader(mut self) -> Result<Box<dyn Read + Send>> {
        self.file.seek(SeekFrom::Start(self.payload_off))?;
        let stored = BufReader::new(self.file.take(self.header.stored_len));
        Ok(match self.header.codec {
            CodecId::Stored => Box::new(stored),
            CodecId::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(stored)?),
        })
    }

    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        // raw_len is untrusted until the decode agrees with it
        let mut out = Vec::new();
        self.get_data(&mut out)?;
        Ok(out)
    }
}

impl std::fmt::Debug for ArchiveRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveRecord")
            .field("filename", &self.filename)
            .field("offset", &self.offset)
            .field("header", &self.header)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::record::{FIXED_HEADER_LEN, RECORD_MAGIC};
    use crate::container::writer::ContainerWriter;
    use crate::error::ErrorClass;

    fn sample(dir: &Path) -> (PathBuf, Vec<u64>) {
        let path = dir.join("sample.arc");
        let mut w = ContainerWriter::create(&path).unwrap();
        let offsets = vec![
            w.append("dns:netarkivet.dk", CodecId::Stored, &b"130.226.228.8"[..])
                .unwrap(),
            w.append("http://netarkivet.dk/empty", CodecId::Stored, &b""[..])
                .unwrap(),
            w.append(
                "http://netarkivet.dk/index.html",
                CodecId::Zstd,
                &b"<html>hello</html>".repeat(20)[..],
            )
            .unwrap(),
        ];
        w.finish().unwrap();
        (path, offsets)
    }

    /// Bytes of a bare header (no uri) carrying the given lengths.
    fn lying_header(stored_len: u64, raw_len: u64) -> Vec<u8> {
        let mut b = RECORD_MAGIC.to_vec();
        b.extend_from_slice(&[CodecId::Stored as u8, 0, 0, 0]);
        b.extend_from_slice(&stored_len.to_le_bytes());
        b.extend_from_slice(&raw_len.to_le_bytes());
        b
    }

    /// A container with one stored record whose payload looks like a header.
    /// Returns the path and the offset of the look-alike.
    fn header_inside_payload(dir: &Path, stored_len: u64, raw_len: u64) -> (PathBuf, u64) {
        let path = dir.join("nested.arc");
        let mut w = ContainerWriter::create(&path).unwrap();
        let uri = "http://netarkivet.dk/nested";
        let off = w
            .append(uri, CodecId::Stored, &lying_header(stored_len, raw_len)[..])
            .unwrap();
        w.finish().unwrap();
        (path, off + FIXED_HEADER_LEN + uri.len() as u64)
    }

    #[test]
    fn huge_stored_length_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let (path, inner) = header_inside_payload(dir.path(), u64::MAX - 10, 0);
        let reader = ContainerReader::open(&path).unwrap();

        let err = reader.read_record_at(inner).unwrap_err();
        assert_eq!(err.class(), ErrorClass::IoFailure);
    }

    #[test]
    fn huge_raw_length_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let (path, inner) = header_inside_payload(dir.path(), 0, u64::MAX);
        let reader = ContainerReader::open(&path).unwrap();

        let mut rec = reader.read_record_at(inner).unwrap();
        assert_eq!(rec.length(), u64::MAX);
        assert!(matches!(rec.read_all(), Err(BitarchiveError::Format(_))));
    }

    #[test]
    fn iterator_stops_on_overflowing_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lying.arc");
        std::fs::write(&path, lying_header(u64::MAX - 10, 1)).unwrap();
        let reader = ContainerReader::open(&path).unwrap();

        let mut it = reader.records().unwrap();
        assert!(matches!(it.next(), Some(Err(BitarchiveError::Format(_)))));
        assert!(it.next().is_none());
    }

    #[test]
    fn reads_every_record_at_its_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (path, offsets) = sample(dir.path());
        let reader = ContainerReader::open(&path).unwrap();

        let mut first = reader.read_record_at(offsets[0]).unwrap();
        assert_eq!(first.uri(), "dns:netarkivet.dk");
        assert_eq!(first.read_all().unwrap(), b"130.226.228.8");

        let mut empty = reader.read_record_at(offsets[1]).unwrap();
        assert_eq!(empty.length(), 0);
        assert!(empty.read_all().unwrap().is_empty());

        let mut html = reader.read_record_at(offsets[2]).unwrap();
        assert_eq!(html.read_all().unwrap(), b"<html>hello</html>".repeat(20));
    }

    #[test]
    fn into_reader_streams_decoded_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (path, offsets) = sample(dir.path());
        let reader = ContainerReader::open(&path).unwrap();

        let mut body = String::new();
        reader
            .read_record_at(offsets[2])
            .unwrap()
            .into_reader()
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "<html>hello</html>".repeat(20));

        let mut dns = Vec::new();
        reader
            .read_record_at(offsets[0])
            .unwrap()
            .into_reader()
            .unwrap()
            .read_to_end(&mut dns)
            .unwrap();
        assert_eq!(dns, b"130.226.228.8");
    }

    #[test]
    fn iterator_visits_records_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let (path, offsets) = sample(dir.path());
        let reader = ContainerReader::open(&path).unwrap();
        let seen: Vec<u64> = reader
            .records()
            .unwrap()
            .map(|r| r.map(|(off, _)| off))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(seen, offsets);
    }

    #[test]
    fn offset_errors_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let (path, offsets) = sample(dir.path());
        let reader = ContainerReader::open(&path).unwrap();

        assert!(matches!(
            reader.read_record_at(reader.len()),
            Err(BitarchiveError::InvalidArgument(_))
        ));
        assert!(matches!(
            reader.read_record_at(offsets[1] + 3),
            Err(BitarchiveError::Misaligned { offset, .. }) if offset == offsets[1] + 3
        ));
    }

    #[test]
    fn truncated_payload_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let (path, offsets) = sample(dir.path());
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        // keep the whole header (24 fixed + 31 uri bytes) but cut the payload short
        f.set_len(offsets[2] + 57).unwrap();
        drop(f);

        let reader = ContainerReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_record_at(offsets[2]),
            Err(BitarchiveError::Format(_))
        ));
    }
}
