//! Admission ledger: the durable record of which filenames this node has
//! accepted, and in what state. Every mutation goes through one mutex so the
//! duplicate check and the state change happen as a single step.

pub mod journal;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{BitarchiveError, Result};
use journal::{Journal, LedgerRecord};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionState {
    UploadStarted,
    UploadCompleted,
    UploadFailed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AdmissionEntry {
    pub filename: String,
    pub checksum: Option<String>,
    pub state: AdmissionState,
    /// Storage root the file was placed under.
    pub dir: PathBuf,
    pub size: Option<u64>,
    /// Unix seconds of the last state change.
    pub updated: i64,
}

struct Inner {
    journal: Journal,
    entries: BTreeMap<String, AdmissionEntry>,
}

pub struct Ledger {
    inner: Mutex<Inner>,
}

pub(crate) fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn apply(entries: &mut BTreeMap<String, AdmissionEntry>, rec: &LedgerRecord) {
    match rec {
        LedgerRecord::Started { filename, dir, at } => {
            entries.insert(
                filename.clone(),
                AdmissionEntry {
                    filename: filename.clone(),
                    checksum: None,
                    state: AdmissionState::UploadStarted,
                    dir: dir.clone(),
                    size: None,
                    updated: *at,
                },
            );
        }
        LedgerRecord::Completed {
            filename,
            checksum,
            size,
            at,
        } => {
            if let Some(e) = entries.get_mut(filename) {
                e.state = AdmissionState::UploadCompleted;
                e.checksum = Some(checksum.clone());
                e.size = Some(*size);
                e.updated = *at;
            }
        }
        LedgerRecord::Failed { filename, at, .. } => {
            if let Some(e) = entries.get_mut(filename) {
                e.state = AdmissionState::UploadFailed;
                e.updated = *at;
            }
        }
        LedgerRecord::Removed { filename, .. } => {
            entries.remove(filename);
        }
        LedgerRecord::Restored(entry) => {
            entries.insert(entry.filename.clone(), entry.clone());
        }
    }
}

impl Ledger {
    /// Open the ledger at `path`, replaying its journal. Uploads left in
    /// `UploadStarted` by a previous process are marked failed so they can be retried.
    pub fn open(path: &Path) -> Result<Self> {
        let mut journal = Journal::open(path)?;
        let mut entries = BTreeMap::new();
        for rec in journal.iter()? {
            apply(&mut entries, &rec?);
        }

        let stale: Vec<String> = entries
            .values()
            .filter(|e| e.state == AdmissionState::UploadStarted)
            .map(|e| e.filename.clone())
            .collect();
        for filename in stale {
            tracing::warn!(%filename, "upload interrupted by restart, marking failed");
            let rec = LedgerRecord::Failed {
                filename,
                reason: "interrupted by restart".into(),
                at: now(),
            };
            journal.append(&rec)?;
            apply(&mut entries, &rec);
        }

        tracing::debug!(path = %path.display(), entries = entries.len(), "ledger opened");
        Ok(Self {
            inner: Mutex::new(Inner { journal, entries }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| BitarchiveError::io_failure("ledger lock poisoned"))
    }

    pub fn lookup(&self, filename: &str) -> Result<Option<AdmissionEntry>> {
        Ok(self.lock()?.entries.get(filename).cloned())
    }

    /// Admit `filename` for upload into `dir`. Refused if the name is already
    /// stored or currently being uploaded; a failed earlier attempt may be retried.
    pub fn record_upload_start(&self, filename: &str, dir: &Path) -> Result<()> {
        let mut g = self.lock()?;
        match g.entries.get(filename).map(|e| e.state) {
            Some(AdmissionState::UploadCompleted) => {
                return Err(BitarchiveError::denied(format!(
                    "file '{filename}' has already been uploaded"
                )));
            }
            Some(AdmissionState::UploadStarted) => {
                return Err(BitarchiveError::denied(format!(
                    "upload of '{filename}' is already in progress"
                )));
            }
            Some(AdmissionState::UploadFailed) | None => {}
        }
        let rec = LedgerRecord::Started {
            filename: filename.to_string(),
            dir: dir.to_path_buf(),
            at: now(),
        };
        g.journal.append(&rec)?;
        apply(&mut g.entries, &rec);
        Ok(())
    }

    pub fn record_upload_complete(&self, filename: &str, checksum: &str, size: u64) -> Result<()> {
        let mut g = self.lock()?;
        expect_started(&g.entries, filename)?;
        let rec = LedgerRecord::Completed {
            filename: filename.to_string(),
            checksum: checksum.to_string(),
            size,
            at: now(),
        };
        g.journal.append(&rec)?;
        apply(&mut g.entries, &rec);
        Ok(())
    }

    pub fn record_upload_failed(&self, filename: &str, reason: &str) -> Result<()> {
        let mut g = self.lock()?;
        expect_started(&g.entries, filename)?;
        let rec = LedgerRecord::Failed {
            filename: filename.to_string(),
            reason: reason.to_string(),
            at: now(),
        };
        g.journal.append(&rec)?;
        apply(&mut g.entries, &rec);
        Ok(())
    }

    /// Forget a completed file after it has been moved out of the store.
    pub fn record_removed(&self, filename: &str) -> Result<AdmissionEntry> {
        let mut g = self.lock()?;
        let entry = match g.entries.get(filename) {
            Some(e) if e.state == AdmissionState::UploadCompleted => e.clone(),
            Some(_) => {
                return Err(BitarchiveError::invalid(format!(
                    "'{filename}' is not a completed upload"
                )));
            }
            None => return Err(BitarchiveError::UnknownId(filename.to_string())),
        };
        let rec = LedgerRecord::Removed {
            filename: filename.to_string(),
            at: now(),
        };
        g.journal.append(&rec)?;
        apply(&mut g.entries, &rec);
        Ok(entry)
    }

    /// Insert or overwrite an entry wholesale. Used when rebuilding from disk.
    pub fn restore(&self, entry: AdmissionEntry) -> Result<()> {
        let mut g = self.lock()?;
        let rec = LedgerRecord::Restored(entry);
        g.journal.append(&rec)?;
        apply(&mut g.entries, &rec);
        Ok(())
    }

    pub fn completed(&self) -> Result<Vec<AdmissionEntry>> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|e| e.state == AdmissionState::UploadCompleted)
            .cloned()
            .collect())
    }

    pub fn flush(&self) -> Result<()> {
        self.lock()?.journal.sync()
    }

    /// Rewrite the journal as one `Restored` record per live entry.
    pub fn compact(&self) -> Result<()> {
        let mut g = self.lock()?;
        let records: Vec<LedgerRecord> = g
            .entries
            .values()
            .cloned()
            .map(LedgerRecord::Restored)
            .collect();
        g.journal.rewrite(&records)?;
        tracing::debug!(entries = records.len(), "ledger compacted");
        Ok(())
    }
}

fn expect_started(entries: &BTreeMap<String, AdmissionEntry>, filename: &str) -> Result<()> {
    match entries.get(filename) {
        Some(e) if e.state == AdmissionState::UploadStarted => Ok(()),
        Some(e) => Err(BitarchiveError::invalid(format!(
            "'{filename}' is {:?}, not an upload in progress",
            e.state
        ))),
        None => Err(BitarchiveError::UnknownId(filename.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(dir: &Path) -> Ledger {
        Ledger::open(&dir.join("admin.data")).unwrap()
    }

    #[test]
    fn lookup_before_upload_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ledger(dir.path()).lookup("X.ARC").unwrap(), None);
    }

    #[test]
    fn duplicate_admission_leaves_entry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.record_upload_start("Upload1.ARC", Path::new("/data/wa001"))
            .unwrap();
        l.record_upload_complete("Upload1.ARC", "abc", 42).unwrap();
        let before = l.lookup("Upload1.ARC").unwrap();

        let err = l
            .record_upload_start("Upload1.ARC", Path::new("/data/wa002"))
            .unwrap_err();
        assert!(matches!(err, BitarchiveError::PermissionDenied(_)));
        assert_eq!(l.lookup("Upload1.ARC").unwrap(), before);
    }

    #[test]
    fn in_flight_upload_blocks_second_start_but_failed_can_retry() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.record_upload_start("a.arc", Path::new("/d")).unwrap();
        assert!(matches!(
            l.record_upload_start("a.arc", Path::new("/d")),
            Err(BitarchiveError::PermissionDenied(_))
        ));
        l.record_upload_failed("a.arc", "disk full").unwrap();
        assert_eq!(
            l.lookup("a.arc").unwrap().unwrap().state,
            AdmissionState::UploadFailed
        );
        l.record_upload_start("a.arc", Path::new("/d")).unwrap();
    }

    #[test]
    fn completion_requires_a_started_upload() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        assert!(matches!(
            l.record_upload_complete("ghost.arc", "x", 1),
            Err(BitarchiveError::UnknownId(_))
        ));
        l.record_upload_start("a.arc", Path::new("/d")).unwrap();
        l.record_upload_complete("a.arc", "x", 1).unwrap();
        assert!(matches!(
            l.record_upload_failed("a.arc", "late"),
            Err(BitarchiveError::InvalidArgument(_))
        ));
    }

    #[test]
    fn state_survives_restart_and_compaction() {
        let dir = tempfile::tempdir().unwrap();
        {
            let l = ledger(dir.path());
            l.record_upload_start("a.arc", Path::new("/d1")).unwrap();
            l.record_upload_complete("a.arc", "sum-a", 10).unwrap();
            l.record_upload_start("b.arc", Path::new("/d2")).unwrap();
            l.record_upload_complete("b.arc", "sum-b", 20).unwrap();
            l.record_removed("b.arc").unwrap();
            l.compact().unwrap();
        }
        let l = ledger(dir.path());
        let a = l.lookup("a.arc").unwrap().unwrap();
        assert_eq!(a.state, AdmissionState::UploadCompleted);
        assert_eq!(a.checksum.as_deref(), Some("sum-a"));
        assert_eq!(a.dir, PathBuf::from("/d1"));
        assert_eq!(l.lookup("b.arc").unwrap(), None);
        assert_eq!(l.completed().unwrap().len(), 1);
    }

    #[test]
    fn interrupted_upload_is_failed_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let l = ledger(dir.path());
            l.record_upload_start("half.arc", Path::new("/d")).unwrap();
        }
        let l = ledger(dir.path());
        assert_eq!(
            l.lookup("half.arc").unwrap().unwrap().state,
            AdmissionState::UploadFailed
        );
        l.record_upload_start("half.arc", Path::new("/d")).unwrap();
    }
}
