//! Durable orchestration history.
//!
//! An instance is one orchestration run. Its events are the recorded results
//! of completed steps, keyed by a deterministic step id, so a restarted run
//! can replay them instead of re-executing side effects.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siteindexer_shared::{Result, SiteIndexerError};

/// Terminal or in-flight status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Completed,
    /// Crawl succeeded, some provisioning steps did not.
    Degraded,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = SiteIndexerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "degraded" => Ok(Self::Degraded),
            "failed" => Ok(Self::Failed),
            other => Err(SiteIndexerError::Storage(format!(
                "unknown instance status '{other}'"
            ))),
        }
    }
}

/// One orchestration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub project: String,
    /// Last state-machine state reached.
    pub state: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub summary: Option<serde_json::Value>,
}

/// A recorded step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub seq: i64,
    pub step_id: String,
    pub result: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Checkpoint store for orchestration instances.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a `running` instance. Fails with `AlreadyRunning` if the project
    /// already has one.
    async fn begin_instance(&self, id: &str, project: &str) -> Result<InstanceRecord>;

    /// Mark an unfinished or failed instance `running` again for replay.
    async fn reopen_instance(&self, id: &str) -> Result<InstanceRecord>;

    /// Recorded events in recording order.
    async fn load_events(&self, id: &str) -> Result<Vec<HistoryEvent>>;

    /// Record a step result. Returns `false` if the step was already recorded;
    /// the earlier result is kept.
    async fn append_event(&self, id: &str, step_id: &str, result: &serde_json::Value)
    -> Result<bool>;

    /// Update the state-machine state of a running instance.
    async fn set_state(&self, id: &str, state: &str) -> Result<()>;

    /// Close an instance with its final status and summary.
    async fn finish_instance(
        &self,
        id: &str,
        status: InstanceStatus,
        summary: &serde_json::Value,
    ) -> Result<()>;

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>>;

    /// Most recent instances first.
    async fn list_instances(&self, project: Option<&str>, limit: usize)
    -> Result<Vec<InstanceRecord>>;
}

pub(crate) fn not_found(id: &str) -> SiteIndexerError {
    SiteIndexerError::workflow(format!("instance {id} not found"))
}

pub(crate) fn not_resumable(record: &InstanceRecord) -> SiteIndexerError {
    SiteIndexerError::workflow(format!(
        "instance {} already finished with status {}",
        record.id, record.status
    ))
}

pub(crate) fn superseded(record: &InstanceRecord, newer: &str) -> SiteIndexerError {
    SiteIndexerError::workflow(format!(
        "instance {} was superseded by newer instance {newer}; its recorded sitemap and baseline are stale",
        record.id
    ))
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    instances: Vec<InstanceRecord>,
    events: HashMap<String, Vec<HistoryEvent>>,
    next_seq: i64,
}

/// History kept in memory. Used by tests.
#[derive(Default)]
pub struct MemoryHistory {
    inner: Mutex<MemoryInner>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| SiteIndexerError::Storage("memory history poisoned".into()))
    }
}

impl MemoryInner {
    fn running_for(&self, project: &str, except: &str) -> Option<&InstanceRecord> {
        self.instances
            .iter()
            .find(|r| r.project == project && r.status == InstanceStatus::Running && r.id != except)
    }

    fn instance_mut(&mut self, id: &str) -> Result<&mut InstanceRecord> {
        self.instances
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| not_found(id))
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn begin_instance(&self, id: &str, project: &str) -> Result<InstanceRecord> {
        let mut inner = self.lock()?;
        if let Some(running) = inner.running_for(project, id) {
            return Err(SiteIndexerError::AlreadyRunning {
                project: project.to_string(),
                instance_id: running.id.clone(),
            });
        }
        let now = Utc::now();
        let record = InstanceRecord {
            id: id.to_string(),
            project: project.to_string(),
            state: "start".into(),
            status: InstanceStatus::Running,
            created_at: now,
            updated_at: now,
            summary: None,
        };
        inner.instances.push(record.clone());
        Ok(record)
    }

    async fn reopen_instance(&self, id: &str) -> Result<InstanceRecord> {
        let mut inner = self.lock()?;
        let project = inner
            .instances
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| not_found(id))?
            .project
            .clone();
        if let Some(running) = inner.running_for(&project, id) {
            return Err(SiteIndexerError::AlreadyRunning {
                project,
                instance_id: running.id.clone(),
            });
        }
        let position = inner
            .instances
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| not_found(id))?;
        let record = &inner.instances[position];
        if matches!(
            record.status,
            InstanceStatus::Completed | InstanceStatus::Degraded
        ) {
            return Err(not_resumable(record));
        }
        if let Some(newer) = inner.instances[position + 1..]
            .iter()
            .find(|r| r.project == project)
        {
            return Err(superseded(record, &newer.id));
        }
        let record = &mut inner.instances[position];
        record.status = InstanceStatus::Running;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn load_events(&self, id: &str) -> Result<Vec<HistoryEvent>> {
        Ok(self.lock()?.events.get(id).cloned().unwrap_or_default())
    }

    async fn append_event(
        &self,
        id: &str,
        step_id: &str,
        result: &serde_json::Value,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        // Recording a step counts as progress for staleness checks.
        inner.instance_mut(id)?.updated_at = Utc::now();
        if inner
            .events
            .get(id)
            .is_some_and(|events| events.iter().any(|e| e.step_id == step_id))
        {
            return Ok(false);
        }
        inner.next_seq += 1;
        let event = HistoryEvent {
            seq: inner.next_seq,
            step_id: step_id.to_string(),
            result: result.clone(),
            recorded_at: Utc::now(),
        };
        inner.events.entry(id.to_string()).or_default().push(event);
        Ok(true)
    }

    async fn set_state(&self, id: &str, state: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let record = inner.instance_mut(id)?;
        record.state = state.to_string();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn finish_instance(
        &self,
        id: &str,
        status: InstanceStatus,
        summary: &serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let record = inner.instance_mut(id)?;
        record.status = status;
        record.summary = Some(summary.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.lock()?.instances.iter().find(|r| r.id == id).cloned())
    }

    async fn list_instances(
        &self,
        project: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .lock()?
            .instances
            .iter()
            .rev()
            .filter(|r| project.is_none_or(|p| r.project == p))
            .take(limit)
            .cloned()
            .collect())
    }
}
