use std::collections::BTreeMap;

use crate::batch::job::{BatchJob, RecordScan};
use crate::batch::jobs::{ChecksumJob, FileListJob, RecordIndexJob};
use crate::error::{BitarchiveError, Result};

type Factory = Box<dyn Fn() -> Box<dyn BatchJob> + Send + Sync>;

/// Jobs a node will run, by key. Requests name a key; nothing is loaded at runtime.
pub struct JobRegistry {
    factories: BTreeMap<String, Factory>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl JobRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register("checksum", || Box::new(ChecksumJob));
        r.register("filelist", || Box::new(FileListJob));
        r.register("record-index", || Box::new(RecordScan::new(RecordIndexJob)));
        r
    }

    /// Add or replace the factory for `key`.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn BatchJob> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Box::new(factory));
    }

    pub fn create(&self, key: &str) -> Result<Box<dyn BatchJob>> {
        self.factories
            .get(key)
            .map(|f| f())
            .ok_or_else(|| BitarchiveError::UnknownId(format!("batch job '{key}'")))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
