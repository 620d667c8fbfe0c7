use rayon::prelude::*;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::allocator::{DirectoryAllocator, PlacementPolicy, StorageDirectory};
use crate::batch::{BatchJob, BatchRunner, BatchStatus, Filter};
use crate::container::reader::{ArchiveRecord, ContainerReader};
use crate::domain::{ArchiveFile, DirectoryReport};
use crate::error::{BitarchiveError, Result};
use crate::ledger::{AdmissionEntry, AdmissionState, Ledger, now};
use crate::settings::ArchiveSettings;
use crate::space::{FsSpaceProbe, SpaceProbe};
use crate::upload::UploadSource;
use crate::util::hashing::{HashingWriter, checksum_file};

/// One node's bitarchive: placement, admission, retrieval and batch runs over
/// its storage directories. Owned by the process entry point and shared by handle.
pub struct Bitarchive {
    settings: ArchiveSettings,
    allocator: DirectoryAllocator,
    ledger: Ledger,
    runner: BatchRunner,
    closed: AtomicBool,
}

fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() {
        return Err(BitarchiveError::invalid("filename must not be empty"));
    }
    if filename == "." || filename == ".." || filename.contains(['/', '\\']) {
        return Err(BitarchiveError::invalid(format!(
            "'{filename}' is not a plain filename"
        )));
    }
    Ok(())
}

impl Bitarchive {
    pub fn open(settings: ArchiveSettings) -> Result<Self> {
        Self::open_with_probe(settings, Arc::new(FsSpaceProbe))
    }

    /// Verify every storage directory, open the ledger, and rebuild it from
    /// disk when the ledger file does not exist yet.
    pub fn open_with_probe(settings: ArchiveSettings, probe: Arc<dyn SpaceProbe>) -> Result<Self> {
        let policy = PlacementPolicy {
            min_space_left: settings.min_space_left,
            min_space_required: settings.min_space_required,
            read_only_allowed: settings.read_only_allowed,
        };
        let allocator = DirectoryAllocator::new(&settings.storage_dirs, policy, probe)?;
        let ledger_path = settings.admin_data_path()?;
        let fresh = !ledger_path.exists();
        let ledger = Ledger::open(&ledger_path)?;
        let runner = BatchRunner::new(&settings.batch);

        let store = Self {
            settings,
            allocator,
            ledger,
            runner,
            closed: AtomicBool::new(false),
        };
        if fresh {
            let restored = store.reconcile_ledger_from_disk()?;
            if restored > 0 {
                tracing::info!(restored, "ledger rebuilt from storage directories");
            }
        }
        tracing::info!(ledger = %ledger_path.display(), "bitarchive open");
        Ok(store)
    }

    pub fn settings(&self) -> &ArchiveSettings {
        &self.settings
    }

    pub fn allocator(&self) -> &DirectoryAllocator {
        &self.allocator
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Whether this node should be offered uploads at all: open, and with at
    /// least one directory above the free-space floor.
    pub fn accepts_uploads(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.allocator.has_enough_space()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BitarchiveError::io_failure("bitarchive is closed"));
        }
        Ok(())
    }

    /// Admit `filename` with the bytes of `source`.
    ///
    /// The copy goes to the chosen directory's `tempdir` and is renamed into
    /// `filedir` only once complete, so readers never see a partial file.
    pub fn upload(&self, source: &dyn UploadSource, filename: &str) -> Result<ArchiveFile> {
        self.ensure_open()?;
        validate_filename(filename)?;
        if !self.allocator.has_enough_space() {
            tracing::warn!(%filename, "every directory is below the free-space floor, refusing upload");
            return Err(BitarchiveError::NoSpace {
                filename: filename.to_string(),
                size: source.size(),
                dirs: self
                    .allocator
                    .all_directories()
                    .iter()
                    .map(|d| d.base.clone())
                    .collect(),
            });
        }

        let admitted = self
            .ledger
            .lookup(filename)?
            .is_some_and(|e| e.state == AdmissionState::UploadCompleted);
        if admitted {
            tracing::warn!(%filename, "duplicate upload refused");
            return Err(BitarchiveError::denied(format!(
                "file '{filename}' has already been uploaded"
            )));
        }
        if let Some((dir, _)) = self.allocator.find_existing(filename) {
            return Err(BitarchiveError::denied(format!(
                "file '{filename}' already present in '{}'",
                dir.file_dir.display()
            )));
        }

        let size = source.size();
        let dir = self.allocator.pick_directory_for(filename, size)?;
        self.ledger.record_upload_start(filename, &dir.base)?;

        match copy_into(source, dir, filename, size) {
            Ok((checksum, path)) => {
                self.ledger
                    .record_upload_complete(filename, &checksum, size)?;
                tracing::info!(%filename, size, dir = %dir.base.display(), "upload completed");
                Ok(ArchiveFile {
                    name: filename.to_string(),
                    path,
                    size,
                })
            }
            Err(e) => {
                tracing::warn!(%filename, source = source.name(), error = %e, "upload failed");
                self.ledger.record_upload_failed(filename, &e.to_string())?;
                Err(BitarchiveError::io_failure(format!(
                    "upload of '{filename}' failed: {e}"
                )))
            }
        }
    }

    /// Resolve a completed file to its path. A ledger entry whose file has
    /// gone missing triggers a scan of all directories.
    fn locate(&self, filename: &str) -> Result<Option<PathBuf>> {
        let Some(entry) = self.ledger.lookup(filename)? else {
            return Ok(None);
        };
        if entry.state != AdmissionState::UploadCompleted {
            return Ok(None);
        }
        let expected = StorageDirectory::new(&entry.dir).file_path(filename);
        if expected.is_file() {
            return Ok(Some(expected));
        }
        tracing::warn!(%filename, dir = %entry.dir.display(), "file not where the ledger says, scanning");
        match self.allocator.find_existing(filename) {
            Some((dir, path)) => {
                self.ledger.restore(AdmissionEntry {
                    dir: dir.base.clone(),
                    updated: now(),
                    ..entry
                })?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    /// Fetch the record starting at `offset` in `filename`.
    ///
    /// `Ok(None)` when the file is unknown here. An offset of `-1` is the
    /// existence probe: it yields `Ok(None)` for unknown files and
    /// `InvalidArgument` for known ones. Any other negative offset is invalid.
    pub fn get(&self, filename: &str, offset: i64) -> Result<Option<ArchiveRecord>> {
        if filename.is_empty() {
            return Err(BitarchiveError::invalid("filename must not be empty"));
        }
        if offset < -1 {
            return Err(BitarchiveError::invalid(format!(
                "offset {offset} is negative"
            )));
        }
        let Some(path) = self.locate(filename)? else {
            tracing::debug!(%filename, offset, "get for unknown file");
            return Ok(None);
        };
        if offset == -1 {
            return Err(BitarchiveError::invalid(format!(
                "offset -1 on existing file '{filename}'; it only probes for absence"
            )));
        }
        let reader = ContainerReader::open(&path)?;
        let record = reader.read_record_at(offset as u64)?;
        tracing::debug!(%filename, offset, length = record.length(), "record read");
        Ok(Some(record))
    }

    pub fn get_file(&self, filename: &str) -> Result<Option<PathBuf>> {
        if filename.is_empty() {
            return Err(BitarchiveError::invalid("filename must not be empty"));
        }
        self.locate(filename)
    }

    pub fn contains(&self, filename: &str) -> Result<bool> {
        Ok(self.get_file(filename)?.is_some())
    }

    /// All completed files present on disk, in filename order.
    pub fn files(&self) -> Result<Vec<ArchiveFile>> {
        let mut out = Vec::new();
        for e in self.ledger.completed()? {
            let path = StorageDirectory::new(&e.dir).file_path(&e.filename);
            match std::fs::metadata(&path) {
                Ok(md) if md.is_file() => out.push(ArchiveFile {
                    name: e.filename,
                    path,
                    size: md.len(),
                }),
                _ => tracing::warn!(filename = %e.filename, "admitted file missing from disk"),
            }
        }
        Ok(out)
    }

    pub fn files_matching(&self, filter: &Filter) -> Result<Vec<ArchiveFile>> {
        Ok(filter.select(&self.files()?))
    }

    /// Move a stored file into its directory's attic and drop it from the
    /// ledger. `checksum` must match the stored bytes.
    pub fn remove_and_get_file(&self, filename: &str, checksum: &str) -> Result<PathBuf> {
        self.ensure_open()?;
        validate_filename(filename)?;
        let entry = match self.ledger.lookup(filename)? {
            Some(e) if e.state == AdmissionState::UploadCompleted => e,
            _ => return Err(BitarchiveError::UnknownId(filename.to_string())),
        };
        let path = self
            .locate(filename)?
            .ok_or_else(|| BitarchiveError::io_failure(format!("'{filename}' missing from disk")))?;
        let actual = checksum_file(&path)?;
        if actual != checksum {
            tracing::warn!(%filename, expected = %checksum, %actual, "remove refused, checksum mismatch");
            return Err(BitarchiveError::denied(format!(
                "checksum mismatch for '{filename}'"
            )));
        }
        let dir = path
            .parent()
            .and_then(Path::parent)
            .map(StorageDirectory::new)
            .unwrap_or_else(|| StorageDirectory::new(&entry.dir));
        let attic = dir.attic_dir.join(filename);
        std::fs::rename(&path, &attic)?;
        self.ledger.record_removed(filename)?;
        tracing::info!(%filename, attic = %attic.display(), "file moved to attic");
        Ok(attic)
    }

    /// Run `job` over the files `filter` selects, writing output to a fresh
    /// file under the batch output directory. The file is only kept when the
    /// run produces a status.
    pub fn batch(&self, app_id: &str, job: &mut dyn BatchJob, filter: &Filter) -> Result<BatchStatus> {
        let files = self.files_matching(filter)?;
        let out_dir = self.settings.batch_output_dir();
        std::fs::create_dir_all(&out_dir)?;
        let out = tempfile::Builder::new()
            .prefix(&format!("batch-{app_id}-"))
            .suffix(".out")
            .tempfile_in(&out_dir)?;
        let mut status = {
            let mut sink = BufWriter::new(out.as_file());
            let status = self.runner.run(app_id, job, &files, &mut sink)?;
            sink.flush()?;
            status
        };
        let (_, result_path) = out.keep().map_err(|e| e.error)?;
        status.result_file = Some(result_path);
        Ok(status)
    }

    /// Rebuild ledger entries for every file found in a `filedir` that the
    /// ledger does not list as completed. Returns the number restored.
    pub fn reconcile_ledger_from_disk(&self) -> Result<usize> {
        let mut found: Vec<(PathBuf, String, PathBuf)> = Vec::new();
        for dir in self.allocator.all_directories() {
            for entry in walkdir::WalkDir::new(&dir.file_dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let known = self
                    .ledger
                    .lookup(&name)?
                    .is_some_and(|e| e.state == AdmissionState::UploadCompleted);
                if !known {
                    found.push((dir.base.clone(), name, entry.into_path()));
                }
            }
        }

        let hashed: Vec<Result<AdmissionEntry>> = found
            .into_par_iter()
            .map(|(base, name, path)| -> Result<AdmissionEntry> {
                let size = std::fs::metadata(&path)?.len();
                let checksum = checksum_file(&path)?;
                Ok(AdmissionEntry {
                    filename: name,
                    checksum: Some(checksum),
                    state: AdmissionState::UploadCompleted,
                    dir: base,
                    size: Some(size),
                    updated: now(),
                })
            })
            .collect();

        let mut restored = 0;
        for entry in hashed {
            let entry = entry?;
            tracing::debug!(filename = %entry.filename, "restoring ledger entry from disk");
            self.ledger.restore(entry)?;
            restored += 1;
        }
        Ok(restored)
    }

    pub fn directory_report(&self) -> Vec<DirectoryReport> {
        self.allocator
            .all_directories()
            .iter()
            .map(|d| {
                let files = std::fs::read_dir(&d.file_dir)
                    .map(|rd| rd.filter_map(|e| e.ok()).count())
                    .unwrap_or(0);
                DirectoryReport {
                    base: d.base.clone(),
                    free: self.allocator.free_space(d).ok(),
                    used: self.allocator.bytes_used(d),
                    files,
                }
            })
            .collect()
    }

    /// Flush and compact the ledger. Safe to call more than once; later
    /// uploads and removals fail.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ledger.flush()?;
        self.ledger.compact()?;
        tracing::info!("bitarchive closed");
        Ok(())
    }
}

/// Copy `source` into `dir`'s tempdir, hashing on the way, then rename it
/// into `filedir`. The temp file is removed on every error path.
fn copy_into(
    source: &dyn UploadSource,
    dir: &StorageDirectory,
    filename: &str,
    expected: u64,
) -> Result<(String, PathBuf)> {
    let mut tmp = tempfile::NamedTempFile::new_in(&dir.temp_dir)?;
    let (checksum, written) = {
        let mut w = HashingWriter::new(BufWriter::new(tmp.as_file_mut()));
        source.copy_to(&mut w)?;
        let (checksum, written, buf) = w.finish();
        buf.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        (checksum, written)
    };
    if written != expected {
        return Err(BitarchiveError::io_failure(format!(
            "source '{}' yielded {written} bytes, expected {expected}",
            source.name()
        )));
    }
    let dest = dir.file_path(filename);
    tmp.persist_noclobber(&dest).map_err(|e| e.error)?;
    Ok((checksum, dest))
}

impl Drop for Bitarchive {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "closing bitarchive on drop failed");
        }
    }
}
