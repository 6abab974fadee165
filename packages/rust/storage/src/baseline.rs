//! Task Store: the per-project baseline of the last fully crawled sitemap.
//!
//! Persisted as a CSV blob (`url,last_modified`) at
//! `<project>-sitemap/sitemap.csv` in the content container.

use std::sync::Arc;

use siteindexer_shared::{Result, SiteIndexerError, Task, TaskSet};

use crate::blob::BlobStore;

/// Reads and writes project baselines through a [`BlobStore`].
#[derive(Clone)]
pub struct TaskStore {
    blobs: Arc<dyn BlobStore>,
}

impl TaskStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Blob key of a project's baseline.
    pub fn baseline_key(project: &str) -> String {
        format!("{project}-sitemap/sitemap.csv")
    }

    /// Load the baseline. A project that has never completed a run has an
    /// empty baseline.
    pub async fn read_baseline(&self, project: &str) -> Result<TaskSet> {
        let key = Self::baseline_key(project);
        match self.blobs.get(&key).await? {
            Some(bytes) => decode(&bytes),
            None => {
                tracing::debug!(project, "no baseline found, starting empty");
                Ok(TaskSet::new())
            }
        }
    }

    /// Replace the baseline with `tasks`.
    pub async fn write_baseline(&self, project: &str, tasks: &TaskSet) -> Result<()> {
        let key = Self::baseline_key(project);
        let bytes = encode(tasks)?;
        self.blobs.put(&key, &bytes).await?;
        tracing::info!(project, tasks = tasks.len(), "baseline written");
        Ok(())
    }
}

fn encode(tasks: &TaskSet) -> Result<Vec<u8>> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    wtr.write_record(["url", "last_modified"])
        .map_err(|e| SiteIndexerError::Storage(format!("baseline encode: {e}")))?;
    for task in tasks {
        wtr.serialize(task)
            .map_err(|e| SiteIndexerError::Storage(format!("baseline encode: {e}")))?;
    }

    wtr.into_inner()
        .map_err(|e| SiteIndexerError::Storage(format!("baseline encode: {e}")))
}

fn decode(bytes: &[u8]) -> Result<TaskSet> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);

    rdr.deserialize::<Task>()
        .enumerate()
        .map(|(i, row)| {
            row.map_err(|e| {
                SiteIndexerError::parse(format!("baseline row {}: {e}", i + 2))
            })
        })
        .collect()
}
