//! In-process search backend for dry runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use siteindexer_shared::{Result, SiteIndexerError};

use crate::backend::{BackendResponse, SearchBackend};
use crate::resource::{ResourceKind, ResourceRef};

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<String, Value>,
    calls: Vec<String>,
    failures: HashMap<String, u16>,
    unreachable: bool,
}

/// Keeps resource definitions in memory and records every call.
///
/// Calls are labelled `"<METHOD> <path>"`, e.g. `"PUT indexes/web-index"` or
/// `"POST indexers/web-indexer/run"`. A label registered with
/// [`fail`](Self::fail) answers with the given status instead.
#[derive(Debug, Default)]
pub struct MemorySearchBackend {
    state: Mutex<State>,
}

impl MemorySearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every call labelled `call` with `status`.
    pub fn fail(&self, call: impl Into<String>, status: u16) {
        self.state().failures.insert(call.into(), status);
    }

    /// Make every call fail at the transport level.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Seed a resource as if it had been provisioned earlier.
    pub fn insert(&self, resource: &ResourceRef, payload: Value) {
        self.state().resources.insert(resource.path(), payload);
    }

    pub fn get(&self, resource: &ResourceRef) -> Option<Value> {
        self.state().resources.get(&resource.path()).cloned()
    }

    /// Labels of all calls so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn record(&self, label: String) -> Result<Option<BackendResponse>> {
        let mut state = self.state();
        if state.unreachable {
            return Err(SiteIndexerError::Network(format!("{label}: connection refused")));
        }
        let injected = state
            .failures
            .get(&label)
            .map(|&status| BackendResponse::new(status, format!("injected failure for {label}")));
        state.calls.push(label);
        Ok(injected)
    }

    fn indexer_action(&self, name: &str, action: &str, status: u16) -> Result<BackendResponse> {
        let label = format!("POST indexers/{name}/{action}");
        if let Some(injected) = self.record(label)? {
            return Ok(injected);
        }
        let path = ResourceRef::new(ResourceKind::Indexer, name).path();
        if self.state().resources.contains_key(&path) {
            Ok(BackendResponse::new(status, ""))
        } else {
            Ok(BackendResponse::new(404, format!("indexer '{name}' not found")))
        }
    }
}

#[async_trait]
impl SearchBackend for MemorySearchBackend {
    async fn exists(&self, resource: &ResourceRef) -> Result<BackendResponse> {
        if let Some(injected) = self.record(format!("GET {}", resource.path()))? {
            return Ok(injected);
        }
        Ok(match self.state().resources.get(&resource.path()) {
            Some(payload) => BackendResponse::new(200, payload.to_string()),
            None => BackendResponse::new(404, format!("{resource} not found")),
        })
    }

    async fn upsert(&self, resource: &ResourceRef, payload: &Value) -> Result<BackendResponse> {
        if let Some(injected) = self.record(format!("PUT {}", resource.path()))? {
            return Ok(injected);
        }
        let replaced = self
            .state()
            .resources
            .insert(resource.path(), payload.clone())
            .is_some();
        let status = if replaced { 200 } else { 201 };
        Ok(BackendResponse::new(status, payload.to_string()))
    }

    async fn reset_indexer(&self, name: &str) -> Result<BackendResponse> {
        self.indexer_action(name, "reset", 204)
    }

    async fn run_indexer(&self, name: &str) -> Result<BackendResponse> {
        self.indexer_action(name, "run", 202)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn upsert_then_replace() {
        let backend = MemorySearchBackend::new();
        let index = ResourceRef::new(ResourceKind::SearchIndex, "idx");

        assert_eq!(backend.exists(&index).await.unwrap().status, 404);
        assert_eq!(backend.upsert(&index, &json!({"v": 1})).await.unwrap().status, 201);
        assert_eq!(backend.upsert(&index, &json!({"v": 2})).await.unwrap().status, 200);
        assert_eq!(backend.get(&index), Some(json!({"v": 2})));
        assert_eq!(
            backend.calls(),
            ["GET indexes/idx", "PUT indexes/idx", "PUT indexes/idx"]
        );
    }

    #[tokio::test]
    async fn injected_failures_and_unknown_indexers() {
        let backend = MemorySearchBackend::new();
        backend.fail("PUT skillsets/s", 400);

        let skillset = ResourceRef::new(ResourceKind::Skillset, "s");
        assert_eq!(backend.upsert(&skillset, &json!({})).await.unwrap().status, 400);
        assert!(backend.get(&skillset).is_none());
        assert_eq!(backend.run_indexer("missing").await.unwrap().status, 404);

        backend.set_unreachable(true);
        assert!(backend.reset_indexer("missing").await.is_err());
    }
}
