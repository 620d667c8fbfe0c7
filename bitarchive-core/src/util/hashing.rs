use std::io::{Result, Write};

/// Forwards writes to `inner` while feeding a blake3 hasher and counting bytes.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: blake3::Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            written: 0,
        }
    }

    /// Hex digest and byte count, plus the inner writer for final syncing.
    pub fn finish(self) -> (String, u64, W) {
        let digest = hex::encode(self.hasher.finalize().as_bytes());
        (digest, self.written, self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let k = self.inner.write(buf)?;
        self.hasher.update(&buf[..k]);
        self.written += k as u64;
        Ok(k)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

/// Stream a file through blake3 and return the hex digest.
pub fn checksum_file(path: &std::path::Path) -> std::io::Result<String> {
    let mut f = std::fs::File::open(path)?;
    let mut w = HashingWriter::new(std::io::sink());
    std::io::copy(&mut f, &mut w)?;
    Ok(w.finish().0)
}
