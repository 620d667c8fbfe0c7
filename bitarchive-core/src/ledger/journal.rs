use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{BitarchiveError, Result};
use crate::ledger::AdmissionEntry;

const MAGIC: &[u8; 8] = b"BALEDGER";
const VERSION: u8 = 1;
const HEADER_LEN: u64 = (MAGIC.len() + 1) as u64;

/// One durable ledger mutation. Replaying all records in order rebuilds the ledger.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum LedgerRecord {
    Started {
        filename: String,
        dir: PathBuf,
        at: i64,
    },
    Completed {
        filename: String,
        checksum: String,
        size: u64,
        at: i64,
    },
    Failed {
        filename: String,
        reason: String,
        at: i64,
    },
    Removed {
        filename: String,
        at: i64,
    },
    /// Full entry, written by reconcile and by compaction.
    Restored(AdmissionEntry),
}

pub struct Journal {
    f: File,
    path: PathBuf,
}

pub struct JournalIter<R: Read> {
    r: R,
}

impl<R: Read> Iterator for JournalIter<R> {
    type Item = Result<LedgerRecord>;
    fn next(&mut self) -> Option<Self::Item> {
        read_next_record(&mut self.r).transpose()
    }
}

fn read_next_record<R: Read>(r: &mut R) -> Result<Option<LedgerRecord>> {
    let len = match get_uvarint(r)? {
        Some(n) => n,
        None => return Ok(None),
    };
    // the prefix may be garbage, so grow with what is actually there
    let mut buf = Vec::new();
    let got = r.by_ref().take(len).read_to_end(&mut buf)?;
    if (got as u64) < len {
        // torn tail from a crash mid-append
        return Ok(None);
    }
    let rec: LedgerRecord = ciborium::from_reader(&buf[..])
        .map_err(|e| BitarchiveError::Format(format!("ledger record: {e}")))?;
    Ok(Some(rec))
}

fn put_uvarint(out: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        out.push((x as u8) | 0x80);
        x >>= 7;
    }
    out.push(x as u8);
}

fn get_uvarint<R: Read>(r: &mut R) -> Result<Option<u64>> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                let byte = b[0];
                x |= ((byte & 0x7f) as u64) << s;
                if byte < 0x80 {
                    return Ok(Some(x));
                }
                s += 7;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(BitarchiveError::Format("ledger varint too long".into()))
}

fn uvarint_len(mut x: u64) -> u64 {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}

/// Offset just past the last complete record.
fn scan_valid_end(f: &mut File) -> Result<u64> {
    f.seek(SeekFrom::Start(HEADER_LEN))?;
    let mut r = BufReader::new(f);
    let mut end = HEADER_LEN;
    while let Some(len) = get_uvarint(&mut r)? {
        let copied = std::io::copy(&mut (&mut r).take(len), &mut std::io::sink())?;
        if copied < len {
            break;
        }
        end += uvarint_len(len) + len;
    }
    Ok(end)
}

fn write_header(f: &mut File) -> Result<()> {
    f.write_all(MAGIC)?;
    f.write_all(&[VERSION])?;
    Ok(())
}

fn encode_record(rec: &LedgerRecord) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(128);
    ciborium::into_writer(rec, &mut body)
        .map_err(|e| BitarchiveError::Format(format!("ledger record: {e}")))?;
    let mut out = Vec::with_capacity(body.len() + 10);
    put_uvarint(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    Ok(out)
}

impl Journal {
    /// Open or create the journal. An existing file with a foreign header is refused
    /// rather than overwritten.
    pub fn open(path: &Path) -> Result<Self> {
        let existed = path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if !existed || f.metadata()?.len() == 0 {
            write_header(&mut f)?;
            f.sync_data()?;
        } else {
            let mut magic = [0u8; 8];
            let mut ver = [0u8; 1];
            f.read_exact(&mut magic)?;
            f.read_exact(&mut ver)?;
            if &magic != MAGIC {
                return Err(BitarchiveError::Format(format!(
                    "'{}' is not a bitarchive ledger",
                    path.display()
                )));
            }
            if ver[0] != VERSION {
                return Err(BitarchiveError::Format(format!(
                    "ledger version {} not supported",
                    ver[0]
                )));
            }
            let end = scan_valid_end(&mut f)?;
            if end < f.metadata()?.len() {
                tracing::warn!(path = %path.display(), end, "truncating torn ledger tail");
                f.set_len(end)?;
            }
        }
        f.seek(SeekFrom::End(0))?;
        Ok(Self {
            f,
            path: path.to_path_buf(),
        })
    }

    /// Append one record and sync it to disk before returning.
    pub fn append(&mut self, rec: &LedgerRecord) -> Result<()> {
        let bytes = encode_record(rec)?;
        self.f.seek(SeekFrom::End(0))?;
        self.f.write_all(&bytes)?;
        self.f.sync_data()?;
        Ok(())
    }

    /// Iterate from the first record. Partial tails end the iteration silently.
    pub fn iter(&mut self) -> Result<JournalIter<BufReader<&mut File>>> {
        self.f.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(JournalIter {
            r: BufReader::new(&mut self.f),
        })
    }

    pub fn sync(&mut self) -> Result<()> {
        self.f.sync_all()?;
        Ok(())
    }

    /// Replace the journal with `records`, written to a temp file in the same
    /// directory and renamed over the old one.
    pub fn rewrite(&mut self, records: &[LedgerRecord]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let f = tmp.as_file_mut();
            write_header(f)?;
            for rec in records {
                f.write_all(&encode_record(rec)?)?;
            }
            f.sync_all()?;
        }
        tmp.persist(&self.path).map_err(|e| e.error)?;
        let mut f = OpenOptions::new().read(true).write(true).open(&self.path)?;
        f.seek(SeekFrom::End(0))?;
        self.f = f;
        Ok(())
    }
}
