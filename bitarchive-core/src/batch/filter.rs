use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::ArchiveFile;
use crate::error::{BitarchiveError, Result};

/// Serialisable form of a filter, as carried in batch requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterSpec {
    All,
    /// Exact filename. Regex metacharacters are literal.
    Named(String),
    NamedAny(Vec<String>),
    /// Regexes matched against the whole filename; a file matching any is selected.
    Matching(Vec<String>),
}

/// Compiled filter.
#[derive(Clone, Debug)]
pub enum Filter {
    All,
    Named(String),
    NamedAny(BTreeSet<String>),
    Matching(Vec<Regex>),
}

impl Filter {
    pub fn all() -> Self {
        Filter::All
    }

    pub fn named(name: impl Into<String>) -> Self {
        Filter::Named(name.into())
    }

    pub fn named_any<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::NamedAny(names.into_iter().map(Into::into).collect())
    }

    pub fn matching<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        for p in patterns {
            let p = p.as_ref();
            let re = Regex::new(&format!("^(?:{p})$"))
                .map_err(|e| BitarchiveError::invalid(format!("bad filter pattern '{p}': {e}")))?;
            out.push(re);
        }
        Ok(Filter::Matching(out))
    }

    pub fn compile(spec: &FilterSpec) -> Result<Self> {
        Ok(match spec {
            FilterSpec::All => Filter::All,
            FilterSpec::Named(n) => Filter::named(n.clone()),
            FilterSpec::NamedAny(ns) => Filter::named_any(ns.iter().cloned()),
            FilterSpec::Matching(ps) => Filter::matching(ps)?,
        })
    }

    pub fn matches(&self, filename: &str) -> bool {
        match self {
            Filter::All => true,
            Filter::Named(n) => n == filename,
            Filter::NamedAny(ns) => ns.contains(filename),
            Filter::Matching(res) => res.iter().any(|re| re.is_match(filename)),
        }
    }

    /// Files that pass, in filename order. Each file appears once even if
    /// several patterns match it.
    pub fn select(&self, files: &[ArchiveFile]) -> Vec<ArchiveFile> {
        let mut out: Vec<ArchiveFile> = files
            .iter()
            .filter(|f| self.matches(&f.name))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out.dedup_by(|a, b| a.name == b.name);
        out
    }
}
