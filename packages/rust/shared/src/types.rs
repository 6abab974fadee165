//! Core domain types: sitemap tasks, task sets, and content keys.

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SiteIndexerError};

/// Date format used in sitemap `<lastmod>` values and the baseline CSV.
pub const LASTMOD_FORMAT: &str = "%Y-%m-%d";

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single sitemap entry: one URL at one content version.
///
/// Identity is the `(url, last_modified)` pair, so the same URL with a new
/// modification date is a different task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Task {
    /// Absolute page URL as listed in the sitemap.
    pub url: String,
    /// Calendar date of the last modification.
    pub last_modified: NaiveDate,
}

impl Task {
    pub fn new(url: impl Into<String>, last_modified: NaiveDate) -> Self {
        Self {
            url: url.into(),
            last_modified,
        }
    }

    /// Build a task from a raw `<lastmod>` value.
    ///
    /// Accepts plain dates (`2024-01-31`) and W3C datetimes
    /// (`2024-01-31T08:00:00+00:00`); only the date part is kept.
    pub fn parse(url: impl Into<String>, lastmod: &str) -> Result<Self> {
        let url = url.into();
        let trimmed = lastmod.trim();
        let date_part = trimmed.get(..10).unwrap_or(trimmed);
        let last_modified = NaiveDate::parse_from_str(date_part, LASTMOD_FORMAT).map_err(|e| {
            SiteIndexerError::parse(format!("invalid lastmod '{trimmed}' for {url}: {e}"))
        })?;
        Ok(Self { url, last_modified })
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.url, self.last_modified)
    }
}

// ---------------------------------------------------------------------------
// TaskSet
// ---------------------------------------------------------------------------

/// A set of tasks with set semantics.
///
/// Backed by a `BTreeSet`, so iteration is sorted by `(url, last_modified)`.
/// That order is stable across runs and is what deterministic sampling uses;
/// set operations themselves never depend on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskSet(BTreeSet<Task>);

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: Task) -> bool {
        self.0.insert(task)
    }

    pub fn contains(&self, task: &Task) -> bool {
        self.0.contains(task)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.0.iter()
    }

    /// Tasks in `self` that are not in `other`.
    pub fn difference(&self, other: &TaskSet) -> TaskSet {
        self.0.difference(&other.0).cloned().collect()
    }

    /// Tasks in either set.
    pub fn union(&self, other: &TaskSet) -> TaskSet {
        self.0.union(&other.0).cloned().collect()
    }

    /// The first `n` tasks in stable order.
    pub fn prefix(&self, n: usize) -> TaskSet {
        self.0.iter().take(n).cloned().collect()
    }
}

impl FromIterator<Task> for TaskSet {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for TaskSet {
    type Item = Task;
    type IntoIter = std::collections::btree_set::IntoIter<Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TaskSet {
    type Item = &'a Task;
    type IntoIter = std::collections::btree_set::Iter<'a, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ---------------------------------------------------------------------------
// ContentKey
// ---------------------------------------------------------------------------

/// Deterministic blob name for the extracted text of one task.
///
/// Format: `<project>/<relative-path>_<YYYYMMDD>.txt`. In the relative path
/// `/` becomes `_` and any other byte outside `[A-Za-z0-9.-]` is written as
/// `%XX`, so distinct paths never share a key. A trailing `/` is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    /// Derive the key for `task` relative to the site's `base_url`.
    ///
    /// Pure: identical inputs always produce the identical key.
    pub fn derive(project: &str, base_url: &str, task: &Task) -> Self {
        let base = base_url.trim_end_matches('/');
        let relative = task
            .url
            .strip_prefix(base)
            .unwrap_or(task.url.as_str())
            .trim_end_matches('/');

        let mut slug = String::with_capacity(relative.len());
        for byte in relative.bytes() {
            match byte {
                b'/' => slug.push('_'),
                b if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-') => slug.push(b as char),
                b => slug.push_str(&format!("%{b:02X}")),
            }
        }
        if slug.is_empty() {
            slug.push('_');
        }

        Self(format!(
            "{project}/{slug}_{}.txt",
            task.last_modified.format("%Y%m%d")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
