//! Idempotent provisioning of a [`ProvisioningPlan`].
//!
//! Resources are processed wave by wave; members of one wave run
//! concurrently up to a limit. A resource is attempted only when every
//! dependency succeeded in this run and is confirmed present on the service.
//! Failures never abort the run: each step gets an outcome, and callers
//! judge the [`ProvisioningReport`] as a whole.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use siteindexer_shared::IndexerSettings;

use crate::backend::{BackendResponse, SearchBackend};
use crate::definition::ResourceDefinition;
use crate::plan::ProvisioningPlan;
use crate::resource::{ResourceKind, ResourceRef};

/// Longest response excerpt kept in an outcome.
const MAX_DETAIL_CHARS: usize = 500;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningAction {
    Upsert,
    Reset,
    Run,
}

impl fmt::Display for ProvisioningAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upsert => "upsert",
            Self::Reset => "reset",
            Self::Run => "run",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    /// Not attempted because a prerequisite was missing.
    Skipped,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        })
    }
}

/// Result of one provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningOutcome {
    pub resource: ResourceRef,
    pub action: ProvisioningAction,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProvisioningOutcome {
    fn skipped(resource: ResourceRef, action: ProvisioningAction, detail: String) -> Self {
        Self {
            resource,
            action,
            status: OutcomeStatus::Skipped,
            http_status: None,
            detail: Some(detail),
        }
    }

    fn from_response(
        resource: ResourceRef,
        action: ProvisioningAction,
        response: siteindexer_shared::Result<BackendResponse>,
    ) -> Self {
        match response {
            Ok(response) if response.is_success() => Self {
                resource,
                action,
                status: OutcomeStatus::Succeeded,
                http_status: Some(response.status),
                detail: None,
            },
            Ok(response) => Self {
                resource,
                action,
                status: OutcomeStatus::Failed,
                http_status: Some(response.status),
                detail: Some(excerpt(&response.body)),
            },
            Err(e) => Self {
                resource,
                action,
                status: OutcomeStatus::Failed,
                http_status: None,
                detail: Some(e.to_string()),
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= MAX_DETAIL_CHARS {
        body.to_string()
    } else {
        let mut out: String = body.chars().take(MAX_DETAIL_CHARS).collect();
        out.push_str("...");
        out
    }
}

/// Overall verdict of a provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningHealth {
    Healthy,
    /// Some steps succeeded, some did not.
    Degraded,
    /// No step succeeded.
    Failed,
}

/// Every step outcome of one provisioning run, in plan order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningReport {
    pub outcomes: Vec<ProvisioningOutcome>,
}

impl ProvisioningReport {
    pub fn health(&self) -> ProvisioningHealth {
        let succeeded = self.count(OutcomeStatus::Succeeded);
        if succeeded == self.outcomes.len() {
            ProvisioningHealth::Healthy
        } else if succeeded == 0 {
            ProvisioningHealth::Failed
        } else {
            ProvisioningHealth::Degraded
        }
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn outcome(
        &self,
        resource: &ResourceRef,
        action: ProvisioningAction,
    ) -> Option<&ProvisioningOutcome> {
        self.outcomes
            .iter()
            .find(|o| &o.resource == resource && o.action == action)
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// What to do with the indexer once it is provisioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerTrigger {
    /// Reset change tracking first; a run is only started after the reset
    /// is confirmed.
    pub reset: bool,
    pub run: bool,
}

impl From<&IndexerSettings> for IndexerTrigger {
    fn from(settings: &IndexerSettings) -> Self {
        Self {
            reset: settings.reset,
            run: settings.run,
        }
    }
}

pub struct IndexProvisioner {
    backend: Arc<dyn SearchBackend>,
    max_concurrency: usize,
}

impl IndexProvisioner {
    pub fn new(backend: Arc<dyn SearchBackend>, max_concurrency: usize) -> Self {
        Self {
            backend,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Provision every resource of `plan`, then reset and run the indexer as
    /// requested. Never fails; problems are reported per step.
    #[instrument(skip_all, fields(resources = plan.len()))]
    pub async fn provision(
        &self,
        plan: &ProvisioningPlan,
        trigger: IndexerTrigger,
    ) -> ProvisioningReport {
        let mut settled: HashMap<ResourceRef, OutcomeStatus> = HashMap::new();
        let mut outcomes = Vec::with_capacity(plan.len() + 2);

        for (wave_no, wave) in plan.waves().into_iter().enumerate() {
            info!(wave = wave_no, size = wave.len(), "provisioning wave");
            let tasks = wave.into_iter().map(|def| {
                let resource = def.resource();
                let deps = plan.dependencies(&resource);
                let blocked = deps
                    .iter()
                    .find(|dep| settled.get(*dep) != Some(&OutcomeStatus::Succeeded))
                    .cloned();
                self.provision_one(def, resource, deps, blocked)
            });
            let mut results: Vec<ProvisioningOutcome> = stream::iter(tasks)
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

            let position = |r: &ResourceRef| {
                plan.definitions()
                    .position(|d| d.resource() == *r)
                    .unwrap_or(usize::MAX)
            };
            results.sort_by_key(|o| position(&o.resource));

            for outcome in results {
                settled.insert(outcome.resource.clone(), outcome.status);
                outcomes.push(outcome);
            }
        }

        if let Some(indexer) = plan.indexer() {
            let resource = indexer.resource();
            let ready = settled.get(&resource) == Some(&OutcomeStatus::Succeeded);
            outcomes.extend(self.trigger(resource, ready, trigger).await);
        }

        let report = ProvisioningReport { outcomes };
        info!(
            succeeded = report.count(OutcomeStatus::Succeeded),
            failed = report.count(OutcomeStatus::Failed),
            skipped = report.count(OutcomeStatus::Skipped),
            health = ?report.health(),
            "provisioning finished"
        );
        report
    }

    async fn provision_one(
        &self,
        def: &ResourceDefinition,
        resource: ResourceRef,
        deps: Vec<ResourceRef>,
        blocked: Option<ResourceRef>,
    ) -> ProvisioningOutcome {
        if let Some(dep) = blocked {
            let outcome = ProvisioningOutcome::skipped(
                resource,
                ProvisioningAction::Upsert,
                format!("dependency {dep} was not provisioned"),
            );
            warn!(resource = %outcome.resource, "skipped: dependency not provisioned");
            return outcome;
        }

        for dep in &deps {
            match self.backend.exists(dep).await {
                Ok(response) if response.is_success() => {}
                Ok(response) => {
                    warn!(resource = %resource, dependency = %dep, status = response.status, "skipped: dependency missing");
                    return ProvisioningOutcome {
                        http_status: Some(response.status),
                        ..ProvisioningOutcome::skipped(
                            resource,
                            ProvisioningAction::Upsert,
                            format!("dependency {dep} not found"),
                        )
                    };
                }
                Err(e) => {
                    warn!(resource = %resource, dependency = %dep, error = %e, "skipped: existence check failed");
                    return ProvisioningOutcome::skipped(
                        resource,
                        ProvisioningAction::Upsert,
                        format!("existence check for {dep} failed: {e}"),
                    );
                }
            }
        }

        let response = self.backend.upsert(&resource, &def.payload()).await;
        let outcome = ProvisioningOutcome::from_response(resource, ProvisioningAction::Upsert, response);
        log_outcome(&outcome);
        outcome
    }

    async fn trigger(
        &self,
        indexer: ResourceRef,
        ready: bool,
        trigger: IndexerTrigger,
    ) -> Vec<ProvisioningOutcome> {
        debug_assert_eq!(indexer.kind, ResourceKind::Indexer);
        let mut outcomes = Vec::new();
        let mut reset_confirmed = true;

        if trigger.reset {
            let outcome = if ready {
                let response = self.backend.reset_indexer(&indexer.name).await;
                ProvisioningOutcome::from_response(indexer.clone(), ProvisioningAction::Reset, response)
            } else {
                ProvisioningOutcome::skipped(
                    indexer.clone(),
                    ProvisioningAction::Reset,
                    "indexer was not provisioned".into(),
                )
            };
            log_outcome(&outcome);
            reset_confirmed = outcome.succeeded();
            outcomes.push(outcome);
        }

        if trigger.run {
            let outcome = if !ready {
                ProvisioningOutcome::skipped(
                    indexer,
                    ProvisioningAction::Run,
                    "indexer was not provisioned".into(),
                )
            } else if !reset_confirmed {
                ProvisioningOutcome::skipped(
                    indexer,
                    ProvisioningAction::Run,
                    "indexer reset did not complete".into(),
                )
            } else {
                let response = self.backend.run_indexer(&indexer.name).await;
                ProvisioningOutcome::from_response(indexer, ProvisioningAction::Run, response)
            };
            log_outcome(&outcome);
            outcomes.push(outcome);
        }

        outcomes
    }
}

fn log_outcome(outcome: &ProvisioningOutcome) {
    match outcome.status {
        OutcomeStatus::Succeeded => info!(
            resource = %outcome.resource,
            action = %outcome.action,
            status = ?outcome.http_status,
            "provisioning step succeeded"
        ),
        _ => warn!(
            resource = %outcome.resource,
            action = %outcome.action,
            outcome = %outcome.status,
            status = ?outcome.http_status,
            detail = outcome.detail.as_deref().unwrap_or(""),
            "provisioning step did not succeed"
        ),
    }
}
