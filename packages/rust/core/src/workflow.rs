//! Replayable workflow steps backed by a [`HistoryStore`].
//!
//! Every non-deterministic action of an orchestration (reading the clock,
//! fetching the sitemap, running an activity) is a step with a stable id.
//! The first execution records the step's result; a replay of the same
//! instance returns the recorded value instead of running the action again.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use siteindexer_shared::{Result, SiteIndexerError};
use siteindexer_storage::HistoryStore;

/// Orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Start,
    DiffComputed,
    Crawling,
    CrawlComplete,
    Provisioning,
    Done,
    Failed,
}

impl OrchestrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::DiffComputed => "diff_computed",
            Self::Crawling => "crawling",
            Self::CrawlComplete => "crawl_complete",
            Self::Provisioning => "provisioning",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step memo for one orchestration instance.
pub struct WorkflowContext {
    instance_id: String,
    history: Arc<dyn HistoryStore>,
    recorded: Mutex<HashMap<String, Value>>,
}

impl WorkflowContext {
    /// Load the recorded steps of `instance_id`.
    pub async fn load(instance_id: &str, history: Arc<dyn HistoryStore>) -> Result<Self> {
        let events = history.load_events(instance_id).await?;
        if !events.is_empty() {
            info!(instance = instance_id, steps = events.len(), "replaying recorded steps");
        }
        let recorded = events
            .into_iter()
            .map(|event| (event.step_id, event.result))
            .collect();

        Ok(Self {
            instance_id: instance_id.to_string(),
            history,
            recorded: Mutex::new(recorded),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn memo(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of steps with a recorded result.
    pub fn recorded_count(&self) -> usize {
        self.memo().len()
    }

    /// The recorded result of `step_id`, if any.
    pub fn recorded<T: DeserializeOwned>(&self, step_id: &str) -> Result<Option<T>> {
        let Some(value) = self.memo().get(step_id).cloned() else {
            return Ok(None);
        };
        serde_json::from_value(value).map(Some).map_err(|e| {
            SiteIndexerError::workflow(format!(
                "recorded result of step '{step_id}' in instance {} is unreadable: {e}",
                self.instance_id
            ))
        })
    }

    /// Durably record the result of `step_id`. A step that is already
    /// recorded keeps its first result.
    pub async fn record<T: Serialize>(&self, step_id: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| {
            SiteIndexerError::workflow(format!("cannot serialize result of step '{step_id}': {e}"))
        })?;
        let appended = self
            .history
            .append_event(&self.instance_id, step_id, &value)
            .await?;
        if appended {
            self.memo().insert(step_id.to_string(), value);
        } else {
            debug!(step = step_id, "step already recorded");
        }
        Ok(())
    }

    /// Return the recorded result of `step_id`, or run `op` and record its
    /// result. An `op` error is returned without recording anything, so the
    /// step runs again on the next replay.
    pub async fn step<T, F, Fut>(&self, step_id: &str, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.recorded(step_id)? {
            debug!(step = step_id, "replayed");
            return Ok(value);
        }
        let value = op().await?;
        self.record(step_id, &value).await?;
        Ok(value)
    }

    /// Persist a state transition.
    pub async fn transition(&self, state: OrchestrationState) -> Result<()> {
        self.history.set_state(&self.instance_id, state.as_str()).await?;
        info!(instance = %self.instance_id, %state, "state transition");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use siteindexer_storage::MemoryHistory;

    use super::*;

    #[tokio::test]
    async fn step_runs_once_and_replays() {
        let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistory::new());
        history.begin_instance("i1", "contoso").await.unwrap();
        let calls = AtomicU32::new(0);

        let ctx = WorkflowContext::load("i1", history.clone()).await.unwrap();
        let first: u32 = ctx
            .step("roll", || async {
                Ok::<_, SiteIndexerError>(calls.fetch_add(1, Ordering::SeqCst) + 7)
            })
            .await
            .unwrap();

        let replay = WorkflowContext::load("i1", history.clone()).await.unwrap();
        let second: u32 = replay
            .step("roll", || async {
                Ok::<_, SiteIndexerError>(calls.fetch_add(1, Ordering::SeqCst) + 100)
            })
            .await
            .unwrap();

        assert_eq!(first, 7);
        assert_eq!(second, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(replay.recorded_count(), 1);
    }

    #[tokio::test]
    async fn failed_step_is_not_recorded() {
        let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistory::new());
        history.begin_instance("i1", "contoso").await.unwrap();
        let ctx = WorkflowContext::load("i1", history.clone()).await.unwrap();

        let result: Result<u32> = ctx
            .step("fetch", || async { Err(SiteIndexerError::Network("down".into())) })
            .await;
        assert!(result.is_err());
        assert!(ctx.recorded::<u32>("fetch").unwrap().is_none());
        assert!(history.load_events("i1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transitions_are_persisted() {
        let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistory::new());
        history.begin_instance("i1", "contoso").await.unwrap();
        let ctx = WorkflowContext::load("i1", history.clone()).await.unwrap();

        ctx.transition(OrchestrationState::CrawlComplete).await.unwrap();
        let record = history.get_instance("i1").await.unwrap().unwrap();
        assert_eq!(record.state, "crawl_complete");
    }
}
