//! Crawl → diff → index orchestration.
//!
//! One instance runs the state machine
//! `Start → DiffComputed → Crawling → CrawlComplete → Provisioning → Done`,
//! with `Failed` reachable from `Crawling` and `Provisioning`. Every side
//! effect is a recorded step of a [`WorkflowContext`], so [`Orchestrator::resume`]
//! continues a crashed instance without repeating finished work.
//!
//! The baseline is written only after every crawl and delete activity of the
//! run succeeded. A failed activity leaves the previous baseline in place and
//! the next run retries the same delta.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use siteindexer_crawler::{CrawlActivity, CrawlOptions, CrawlReceipt, PageCrawler, RemoveReceipt};
use siteindexer_discovery::{DiscoveryOptions, HttpSitemapSource, SitemapSource};
use siteindexer_search::{
    IndexProvisioner, IndexerTrigger, ProvisioningHealth, ProvisioningPlan, ProvisioningReport,
    RestSearchBackend, SearchBackend,
};
use siteindexer_shared::{PipelineConfig, Result, SiteIndexerError, Task, TaskSet};
use siteindexer_storage::{BlobStore, FsBlobStore, HistoryStore, InstanceStatus, Storage, TaskStore};

use crate::diff::{TaskDiff, diff};
use crate::progress::ProgressReporter;
use crate::workflow::{OrchestrationState, WorkflowContext};

// ---------------------------------------------------------------------------
// Settings & collaborators
// ---------------------------------------------------------------------------

/// Orchestration knobs taken from the resolved configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub project: String,
    pub sitemap_url: Url,
    /// Maximum crawl/delete activities in flight.
    pub concurrency: usize,
    /// Cap on crawl activities per run.
    pub sample_size: Option<usize>,
    pub trigger: IndexerTrigger,
    /// Concurrent provisioning calls within one DAG wave.
    pub provisioning_concurrency: usize,
    /// A running instance without recorded progress for this long is
    /// treated as abandoned by a dead process.
    pub stale_after: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            project: config.project.clone(),
            sitemap_url: config.sitemap_url.clone(),
            concurrency: config.crawl.concurrency,
            sample_size: config.crawl.sample_size,
            trigger: IndexerTrigger::from(&config.indexer),
            provisioning_concurrency: config.search.max_concurrency,
            stale_after: config.schedule.stale_after,
        }
    }
}

/// External collaborators of the orchestrator.
pub struct Collaborators {
    pub sitemap: Arc<dyn SitemapSource>,
    pub crawler: Arc<dyn PageCrawler>,
    pub blobs: Arc<dyn BlobStore>,
    pub history: Arc<dyn HistoryStore>,
    pub search: Arc<dyn SearchBackend>,
    pub plan: Arc<ProvisioningPlan>,
}

impl Collaborators {
    /// Production collaborators: HTTP sitemap source and crawler, filesystem
    /// content store, libSQL history and the search REST API.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.container_dir()));

        let sitemap = HttpSitemapSource::new(&DiscoveryOptions {
            timeout_secs: config.crawl.timeout.as_secs(),
            retry: config.crawl.retry.clone(),
        })?;
        let crawler = CrawlActivity::new(CrawlOptions::from_config(config), blobs.clone())?;

        if let Some(parent) = config.history_db.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SiteIndexerError::io(parent, e))?;
        }
        let history = Storage::open(&config.history_db).await?;
        let search = RestSearchBackend::new(&config.search, config.crawl.timeout.max(Duration::from_secs(30)))?;

        Ok(Self {
            sitemap: Arc::new(sitemap),
            crawler: Arc::new(crawler),
            blobs,
            history: Arc::new(history),
            search: Arc::new(search),
            plan: Arc::new(ProvisioningPlan::from_config(config)?),
        })
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A crawl or delete activity that failed after its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFailure {
    pub step_id: String,
    pub url: String,
    pub error: String,
}

/// Summary of one orchestration instance, also stored as its history summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub instance_id: String,
    pub project: String,
    pub status: InstanceStatus,
    pub state: OrchestrationState,
    pub started_at: DateTime<Utc>,
    pub live: usize,
    pub cached: usize,
    pub to_add: usize,
    pub to_delete: usize,
    pub crawled: usize,
    pub removed: usize,
    /// Activities whose result came from history instead of a new execution.
    pub replayed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ActivityFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<ProvisioningReport>,
}

/// What a run would do, computed without side effects.
#[derive(Debug, Clone)]
pub struct DiffPreview {
    pub live: TaskSet,
    pub cached: TaskSet,
    pub diff: TaskDiff,
}

enum ActivityResult {
    Crawled(Task, CrawlReceipt),
    Removed(RemoveReceipt),
    Failed(ActivityFailure),
}

#[derive(Default)]
struct FanIn {
    crawled: TaskSet,
    removed: usize,
    replayed: usize,
    failures: Vec<ActivityFailure>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    settings: OrchestratorSettings,
    sitemap: Arc<dyn SitemapSource>,
    crawler: Arc<dyn PageCrawler>,
    tasks: TaskStore,
    history: Arc<dyn HistoryStore>,
    provisioner: IndexProvisioner,
    plan: Arc<ProvisioningPlan>,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, parts: Collaborators) -> Self {
        let provisioner = IndexProvisioner::new(parts.search, settings.provisioning_concurrency);
        Self {
            settings,
            sitemap: parts.sitemap,
            crawler: parts.crawler,
            tasks: TaskStore::new(parts.blobs),
            history: parts.history,
            provisioner,
            plan: parts.plan,
        }
    }

    /// Start a new instance. Fails with `AlreadyRunning` if the project has
    /// an instance in flight.
    pub async fn start(&self, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let id = Uuid::now_v7().to_string();
        self.history
            .begin_instance(&id, &self.settings.project)
            .await?;
        self.drive(&id, progress).await
    }

    /// Start a new instance, taking over the project's running instance
    /// instead when it has gone stale.
    pub async fn trigger(&self, progress: &dyn ProgressReporter) -> Result<RunReport> {
        match self.start(progress).await {
            Err(SiteIndexerError::AlreadyRunning {
                project,
                instance_id,
            }) => {
                if self.is_stale(&instance_id).await? {
                    warn!(instance = %instance_id, "taking over stale running instance");
                    self.resume(&instance_id, progress).await
                } else {
                    Err(SiteIndexerError::AlreadyRunning {
                        project,
                        instance_id,
                    })
                }
            }
            other => other,
        }
    }

    /// Resume the project's running instance if it has gone stale, as after
    /// a process restart.
    pub async fn recover(&self, progress: &dyn ProgressReporter) -> Result<Option<RunReport>> {
        let latest = self
            .history
            .list_instances(Some(&self.settings.project), 1)
            .await?;
        let Some(record) = latest.first() else {
            return Ok(None);
        };
        if !self.is_stale(&record.id).await? {
            return Ok(None);
        }
        warn!(instance = %record.id, "recovering stale running instance");
        self.resume(&record.id, progress).await.map(Some)
    }

    async fn is_stale(&self, id: &str) -> Result<bool> {
        let Some(record) = self.history.get_instance(id).await? else {
            return Ok(false);
        };
        let stale_after = TimeDelta::from_std(self.settings.stale_after).unwrap_or(TimeDelta::MAX);
        Ok(record.status == InstanceStatus::Running && Utc::now() - record.updated_at >= stale_after)
    }

    /// Continue an unfinished or failed instance from its recorded history.
    pub async fn resume(&self, id: &str, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let record = self.history.reopen_instance(id).await?;
        if record.project != self.settings.project {
            return Err(SiteIndexerError::workflow(format!(
                "instance {id} belongs to project '{}', not '{}'",
                record.project, self.settings.project
            )));
        }
        self.drive(id, progress).await
    }

    /// Compute the diff a run would act on. Writes nothing.
    pub async fn preview(&self) -> Result<DiffPreview> {
        let cached = self.tasks.read_baseline(&self.settings.project).await?;
        let live = self.sitemap.fetch(&self.settings.sitemap_url).await?;
        let diff = diff(&live, &cached).sample(self.settings.sample_size);
        Ok(DiffPreview { live, cached, diff })
    }

    #[instrument(skip_all, fields(instance = %id, project = %self.settings.project))]
    async fn drive(&self, id: &str, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let ctx = Arc::new(WorkflowContext::load(id, self.history.clone()).await?);

        match self.execute(&ctx, progress).await {
            Ok(report) => {
                self.history
                    .finish_instance(id, report.status, &summary(&report))
                    .await?;
                info!(
                    status = %report.status,
                    crawled = report.crawled,
                    removed = report.removed,
                    replayed = report.replayed,
                    "orchestration finished"
                );
                progress.done(&report);
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "orchestration failed");
                if let Err(state_err) = ctx.transition(OrchestrationState::Failed).await {
                    warn!(error = %state_err, "could not record failed state");
                }
                let detail = serde_json::json!({ "error": e.to_string() });
                if let Err(finish_err) = self
                    .history
                    .finish_instance(id, InstanceStatus::Failed, &detail)
                    .await
                {
                    warn!(error = %finish_err, "could not close failed instance");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &Arc<WorkflowContext>,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        let project = self.settings.project.as_str();

        // --- Start → DiffComputed ---
        ctx.transition(OrchestrationState::Start).await?;
        progress.phase("Computing diff");
        let started_at: DateTime<Utc> = ctx
            .step("clock.started_at", || async {
                Ok::<_, SiteIndexerError>(Utc::now())
            })
            .await?;
        let cached: TaskSet = ctx
            .step("baseline.read", || self.tasks.read_baseline(project))
            .await?;
        let live: TaskSet = ctx
            .step("sitemap.fetch", || self.sitemap.fetch(&self.settings.sitemap_url))
            .await?;

        let delta = diff(&live, &cached).sample(self.settings.sample_size);
        ctx.transition(OrchestrationState::DiffComputed).await?;
        info!(
            live = live.len(),
            cached = cached.len(),
            to_add = delta.to_add.len(),
            to_delete = delta.to_delete.len(),
            "diff computed"
        );

        let mut report = RunReport {
            instance_id: ctx.instance_id().to_string(),
            project: project.to_string(),
            status: InstanceStatus::Running,
            state: OrchestrationState::DiffComputed,
            started_at,
            live: live.len(),
            cached: cached.len(),
            to_add: delta.to_add.len(),
            to_delete: delta.to_delete.len(),
            crawled: 0,
            removed: 0,
            replayed: 0,
            failures: Vec::new(),
            baseline_size: None,
            provisioning: None,
        };

        // --- DiffComputed → Crawling → CrawlComplete ---
        ctx.transition(OrchestrationState::Crawling).await?;
        progress.phase("Crawling pages");
        let fan_in = self.fan_out(ctx, &live, &delta, progress).await?;
        report.crawled = fan_in.crawled.len();
        report.removed = fan_in.removed;
        report.replayed = fan_in.replayed;

        if !fan_in.failures.is_empty() {
            warn!(
                failed = fan_in.failures.len(),
                "activities failed, baseline left unchanged"
            );
            ctx.transition(OrchestrationState::Failed).await?;
            report.failures = fan_in.failures;
            report.state = OrchestrationState::Failed;
            report.status = InstanceStatus::Failed;
            return Ok(report);
        }
        ctx.transition(OrchestrationState::CrawlComplete).await?;

        // --- CrawlComplete → Provisioning ---
        progress.phase("Writing baseline");
        let baseline = cached.difference(&delta.to_delete).union(&fan_in.crawled);
        let baseline_size: usize = ctx
            .step("baseline.write", || async {
                self.tasks.write_baseline(project, &baseline).await?;
                Ok::<_, SiteIndexerError>(baseline.len())
            })
            .await?;
        report.baseline_size = Some(baseline_size);

        ctx.transition(OrchestrationState::Provisioning).await?;
        progress.phase("Provisioning search resources");
        // A run where nothing provisioned is not recorded, so resume retries it.
        let provisioning = match ctx.recorded::<ProvisioningReport>("provision")? {
            Some(recorded) => recorded,
            None => {
                let fresh = self.provisioner.provision(&self.plan, self.settings.trigger).await;
                if fresh.health() != ProvisioningHealth::Failed {
                    ctx.record("provision", &fresh).await?;
                }
                fresh
            }
        };

        // --- Provisioning → Done | Failed ---
        let (state, status) = match provisioning.health() {
            ProvisioningHealth::Healthy => (OrchestrationState::Done, InstanceStatus::Completed),
            ProvisioningHealth::Degraded => (OrchestrationState::Done, InstanceStatus::Degraded),
            ProvisioningHealth::Failed => (OrchestrationState::Failed, InstanceStatus::Failed),
        };
        ctx.transition(state).await?;
        report.state = state;
        report.status = status;
        report.provisioning = Some(provisioning);
        Ok(report)
    }

    /// Schedule every crawl and delete activity, then wait for all of them.
    async fn fan_out(
        &self,
        ctx: &Arc<WorkflowContext>,
        live: &TaskSet,
        delta: &TaskDiff,
        progress: &dyn ProgressReporter,
    ) -> Result<FanIn> {
        let mut fan_in = FanIn::default();
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut set: JoinSet<ActivityResult> = JoinSet::new();

        let live_keys: HashSet<String> = live
            .iter()
            .map(|task| self.crawler.content_key(task).to_string())
            .collect();

        let mut scheduled = 0usize;
        for task in &delta.to_add {
            let step_id = format!("crawl:{}", self.crawler.content_key(task));
            if ctx.recorded::<CrawlReceipt>(&step_id)?.is_some() {
                fan_in.crawled.insert(task.clone());
                fan_in.replayed += 1;
                continue;
            }
            let crawler = self.crawler.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let task = task.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return failure(step_id, &task, "activity pool closed");
                };
                let result = match crawler.crawl(&task).await {
                    Ok(receipt) => ctx.record(&step_id, &receipt).await.map(|()| receipt),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(receipt) => ActivityResult::Crawled(task, receipt),
                    Err(e) => failure(step_id, &task, e),
                }
            });
            scheduled += 1;
        }

        for task in &delta.to_delete {
            let key = self.crawler.content_key(task);
            if live_keys.contains(key.as_str()) {
                // A live task owns this blob.
                continue;
            }
            let step_id = format!("delete:{key}");
            if ctx.recorded::<RemoveReceipt>(&step_id)?.is_some() {
                fan_in.removed += 1;
                fan_in.replayed += 1;
                continue;
            }
            let crawler = self.crawler.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let task = task.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return failure(step_id, &task, "activity pool closed");
                };
                let result = match crawler.remove(&task).await {
                    Ok(receipt) => ctx.record(&step_id, &receipt).await.map(|()| receipt),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(receipt) => ActivityResult::Removed(receipt),
                    Err(e) => failure(step_id, &task, e),
                }
            });
            scheduled += 1;
        }

        info!(
            scheduled,
            replayed = fan_in.replayed,
            "activities scheduled"
        );
        progress.activities_scheduled(delta.to_add.len(), delta.to_delete.len());

        let total = scheduled;
        let mut finished = 0usize;
        while let Some(joined) = set.join_next().await {
            finished += 1;
            let result = joined.map_err(|e| {
                SiteIndexerError::workflow(format!("activity task aborted: {e}"))
            })?;
            match result {
                ActivityResult::Crawled(task, receipt) => {
                    progress.activity_finished(&format!("crawl:{}", receipt.key), true, finished, total);
                    fan_in.crawled.insert(task);
                }
                ActivityResult::Removed(receipt) => {
                    progress.activity_finished(&format!("delete:{}", receipt.key), true, finished, total);
                    fan_in.removed += 1;
                }
                ActivityResult::Failed(f) => {
                    warn!(step = %f.step_id, url = %f.url, error = %f.error, "activity failed");
                    progress.activity_finished(&f.step_id, false, finished, total);
                    fan_in.failures.push(f);
                }
            }
        }

        fan_in.failures.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(fan_in)
    }
}

fn failure(step_id: String, task: &Task, error: impl ToString) -> ActivityResult {
    ActivityResult::Failed(ActivityFailure {
        step_id,
        url: task.url.clone(),
        error: error.to_string(),
    })
}

fn summary(report: &RunReport) -> serde_json::Value {
    serde_json::to_value(report).unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use siteindexer_search::{MemorySearchBackend, OutcomeStatus};
    use siteindexer_shared::{AppConfig, ContentKey};
    use siteindexer_storage::{MemoryBlobStore, MemoryHistory};

    use super::*;
    use crate::progress::SilentProgress;

    const BASE: &str = "https://www.contoso.com";

    // --- fakes ---

    struct FixedSitemap(Mutex<TaskSet>);

    #[async_trait]
    impl SitemapSource for FixedSitemap {
        async fn fetch(&self, _sitemap_url: &Url) -> Result<TaskSet> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    /// Writes a fixed body per task; fails for URLs listed in `failing`.
    struct FakeCrawler {
        blobs: Arc<MemoryBlobStore>,
        failing: Mutex<HashSet<String>>,
        crawls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeCrawler {
        fn new(blobs: Arc<MemoryBlobStore>) -> Self {
            Self {
                blobs,
                failing: Mutex::new(HashSet::new()),
                crawls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageCrawler for FakeCrawler {
        async fn crawl(&self, task: &Task) -> Result<CrawlReceipt> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.crawls.fetch_add(1, Ordering::SeqCst);

            let fail = self.failing.lock().unwrap().contains(&task.url);
            let result = if fail {
                Err(SiteIndexerError::Http {
                    url: task.url.clone(),
                    status: 500,
                })
            } else {
                let key = self.content_key(task);
                let body = format!("text of {}", task.url);
                self.blobs.put(key.as_str(), body.as_bytes()).await.map(|()| CrawlReceipt {
                    key,
                    bytes: body.len(),
                    content_hash: String::new(),
                    title: None,
                })
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn remove(&self, task: &Task) -> Result<RemoveReceipt> {
            let key = self.content_key(task);
            let existed = self.blobs.delete(key.as_str()).await?;
            Ok(RemoveReceipt { key, existed })
        }

        fn content_key(&self, task: &Task) -> ContentKey {
            ContentKey::derive("contoso", BASE, task)
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        sitemap: Arc<FixedSitemap>,
        crawler: Arc<FakeCrawler>,
        blobs: Arc<MemoryBlobStore>,
        history: Arc<MemoryHistory>,
        search: Arc<MemorySearchBackend>,
    }

    fn task(path: &str, date: &str) -> Task {
        Task::new(
            format!("{BASE}{path}"),
            NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        )
    }

    fn set(tasks: &[Task]) -> TaskSet {
        tasks.iter().cloned().collect()
    }

    fn settings(sample_size: Option<usize>) -> OrchestratorSettings {
        OrchestratorSettings {
            project: "contoso".into(),
            sitemap_url: Url::parse(&format!("{BASE}/sitemap.xml")).unwrap(),
            concurrency: 2,
            sample_size,
            trigger: IndexerTrigger {
                reset: false,
                run: true,
            },
            provisioning_concurrency: 2,
            stale_after: Duration::from_secs(3600),
        }
    }

    fn plan() -> Arc<ProvisioningPlan> {
        let mut app = AppConfig::default();
        app.project.name = "contoso".into();
        app.project.base_url = BASE.into();
        app.search.service_name = "contoso-search".into();
        app.embedding.uri = "https://contoso-openai.openai.azure.com".into();
        let config = PipelineConfig::resolve_with(&app, |_| Some("secret".to_string())).unwrap();
        Arc::new(ProvisioningPlan::from_config(&config).unwrap())
    }

    fn harness(live: TaskSet, sample_size: Option<usize>) -> Harness {
        harness_with(live, settings(sample_size))
    }

    fn harness_with(live: TaskSet, settings: OrchestratorSettings) -> Harness {
        let blobs = Arc::new(MemoryBlobStore::new());
        let sitemap = Arc::new(FixedSitemap(Mutex::new(live)));
        let crawler = Arc::new(FakeCrawler::new(blobs.clone()));
        let history = Arc::new(MemoryHistory::new());
        let search = Arc::new(MemorySearchBackend::new());

        let orchestrator = Orchestrator::new(
            settings,
            Collaborators {
                sitemap: sitemap.clone(),
                crawler: crawler.clone(),
                blobs: blobs.clone(),
                history: history.clone(),
                search: search.clone(),
                plan: plan(),
            },
        );
        Harness {
            orchestrator,
            sitemap,
            crawler,
            blobs,
            history,
            search,
        }
    }

    async fn seed_baseline(h: &Harness, tasks: &TaskSet) {
        TaskStore::new(h.blobs.clone())
            .write_baseline("contoso", tasks)
            .await
            .unwrap();
    }

    async fn baseline(h: &Harness) -> TaskSet {
        TaskStore::new(h.blobs.clone())
            .read_baseline("contoso")
            .await
            .unwrap()
    }

    fn key(t: &Task) -> String {
        ContentKey::derive("contoso", BASE, t).to_string()
    }

    // --- tests ---

    #[tokio::test]
    async fn incremental_run_adds_deletes_and_advances_baseline() {
        let a = task("/a", "2024-01-01");
        let b = task("/b", "2024-01-02");
        let c = task("/c", "2023-12-01");
        let live = set(&[a.clone(), b.clone()]);
        let h = harness(live.clone(), None);

        seed_baseline(&h, &set(&[a.clone(), c.clone()])).await;
        h.blobs.put(&key(&a), b"old a").await.unwrap();
        h.blobs.put(&key(&c), b"old c").await.unwrap();

        let report = h.orchestrator.start(&SilentProgress).await.unwrap();

        assert_eq!(report.status, InstanceStatus::Completed);
        assert_eq!(report.state, OrchestrationState::Done);
        assert_eq!((report.to_add, report.to_delete), (1, 1));
        assert_eq!(h.crawler.crawls.load(Ordering::SeqCst), 1);
        assert_eq!(baseline(&h).await, live);
        assert!(h.blobs.get(&key(&b)).await.unwrap().is_some());
        assert!(h.blobs.get(&key(&c)).await.unwrap().is_none());
        assert_eq!(h.blobs.get(&key(&a)).await.unwrap().unwrap(), b"old a");

        let record = h.history.get_instance(&report.instance_id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert_eq!(record.state, "done");
    }

    #[tokio::test]
    async fn sample_cap_crawls_a_stable_prefix() {
        let live: TaskSet = (1..=5).map(|i| task(&format!("/p{i}"), "2024-01-01")).collect();
        let h = harness(live.clone(), Some(1));

        let report = h.orchestrator.start(&SilentProgress).await.unwrap();

        assert_eq!(report.to_add, 1);
        assert_eq!(h.crawler.crawls.load(Ordering::SeqCst), 1);
        let first = live.iter().next().unwrap();
        assert!(h.blobs.get(&key(first)).await.unwrap().is_some());
        // Uncrawled additions stay out of the baseline and are offered again.
        assert_eq!(baseline(&h).await, set(&[first.clone()]));
    }

    #[tokio::test]
    async fn fan_out_schedules_every_task_within_concurrency() {
        let live: TaskSet = (0..20).map(|i| task(&format!("/doc/{i}"), "2024-03-01")).collect();
        let h = harness(live.clone(), None);

        let report = h.orchestrator.start(&SilentProgress).await.unwrap();

        assert_eq!(report.crawled, 20);
        assert_eq!(h.crawler.crawls.load(Ordering::SeqCst), 20);
        assert!(h.crawler.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(baseline(&h).await, live);
        assert!(h.search.calls().iter().any(|c| c == "POST indexers/web-indexer/run"));
    }

    #[tokio::test]
    async fn crawl_failure_blocks_baseline_and_provisioning() {
        let a = task("/a", "2024-01-01");
        let b = task("/b", "2024-01-02");
        let h = harness(set(&[a.clone(), b.clone()]), None);
        h.crawler.failing.lock().unwrap().insert(b.url.clone());

        let report = h.orchestrator.start(&SilentProgress).await.unwrap();

        assert_eq!(report.status, InstanceStatus::Failed);
        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].url, b.url);
        assert!(baseline(&h).await.is_empty());
        assert!(h.search.calls().is_empty());
    }

    #[tokio::test]
    async fn resume_skips_recorded_activities() {
        let a = task("/a", "2024-01-01");
        let b = task("/b", "2024-01-02");
        let h = harness(set(&[a.clone(), b.clone()]), None);
        h.crawler.failing.lock().unwrap().insert(b.url.clone());

        let failed = h.orchestrator.start(&SilentProgress).await.unwrap();
        assert_eq!(h.crawler.crawls.load(Ordering::SeqCst), 2);

        // The sitemap changes meanwhile; replay must use the recorded one.
        *h.sitemap.0.lock().unwrap() = TaskSet::new();
        h.crawler.failing.lock().unwrap().clear();

        let resumed = h
            .orchestrator
            .resume(&failed.instance_id, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(resumed.status, InstanceStatus::Completed);
        assert_eq!(resumed.started_at, failed.started_at);
        assert_eq!(resumed.replayed, 1);
        assert_eq!(h.crawler.crawls.load(Ordering::SeqCst), 3);
        assert_eq!(baseline(&h).await, set(&[a, b]));
    }

    #[tokio::test]
    async fn completed_instance_cannot_resume() {
        let h = harness(set(&[task("/a", "2024-01-01")]), None);
        let report = h.orchestrator.start(&SilentProgress).await.unwrap();
        assert!(h
            .orchestrator
            .resume(&report.instance_id, &SilentProgress)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn one_running_instance_per_project() {
        let h = harness(TaskSet::new(), None);
        h.history.begin_instance("other", "contoso").await.unwrap();

        let err = h.orchestrator.start(&SilentProgress).await.unwrap_err();
        assert!(matches!(err, SiteIndexerError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn provisioning_failure_degrades_run_but_keeps_baseline() {
        let a = task("/a", "2024-01-01");
        let h = harness(set(&[a.clone()]), None);
        h.search.fail("PUT skillsets/web-vector-skillset", 400);

        let report = h.orchestrator.start(&SilentProgress).await.unwrap();

        assert_eq!(report.status, InstanceStatus::Degraded);
        assert_eq!(report.state, OrchestrationState::Done);
        assert_eq!(baseline(&h).await, set(&[a]));
        let provisioning = report.provisioning.unwrap();
        assert_eq!(provisioning.count(OutcomeStatus::Failed), 1);
        assert!(provisioning.count(OutcomeStatus::Skipped) >= 1);
    }

    #[tokio::test]
    async fn unreachable_search_fails_run_after_baseline() {
        let a = task("/a", "2024-01-01");
        let h = harness(set(&[a.clone()]), None);
        h.search.set_unreachable(true);

        let report = h.orchestrator.start(&SilentProgress).await.unwrap();

        assert_eq!(report.status, InstanceStatus::Failed);
        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(baseline(&h).await, set(&[a]));
    }

    #[tokio::test]
    async fn preview_writes_nothing() {
        let h = harness(set(&[task("/a", "2024-01-01")]), None);
        let preview = h.orchestrator.preview().await.unwrap();

        assert_eq!(preview.diff.to_add.len(), 1);
        assert!(h.blobs.is_empty());
        assert!(h.history.list_instances(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_is_stored_with_instance() {
        let h = harness(set(&[task("/a", "2024-01-01")]), None);
        let report = h.orchestrator.start(&SilentProgress).await.unwrap();

        let record = h.history.get_instance(&report.instance_id).await.unwrap().unwrap();
        let stored: RunReport = serde_json::from_value(record.summary.unwrap()).unwrap();
        assert_eq!(stored.crawled, 1);
        let events: HashMap<String, serde_json::Value> = h
            .history
            .load_events(&report.instance_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.step_id, e.result))
            .collect();
        assert!(events.contains_key("provision"));
        assert!(events.contains_key("baseline.write"));
    }

    #[tokio::test]
    async fn resume_survives_process_restart_with_on_disk_history() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("history.db");
        let a = task("/a", "2024-01-01");
        let b = task("/b", "2024-01-02");
        let blobs = Arc::new(MemoryBlobStore::new());
        let crawler = Arc::new(FakeCrawler::new(blobs.clone()));
        crawler.failing.lock().unwrap().insert(b.url.clone());

        let build = |history: Storage| {
            Orchestrator::new(
                settings(None),
                Collaborators {
                    sitemap: Arc::new(FixedSitemap(Mutex::new(set(&[a.clone(), b.clone()])))),
                    crawler: crawler.clone(),
                    blobs: blobs.clone(),
                    history: Arc::new(history),
                    search: Arc::new(MemorySearchBackend::new()),
                    plan: plan(),
                },
            )
        };

        let failed = build(Storage::open(&db).await.unwrap())
            .start(&SilentProgress)
            .await
            .unwrap();
        assert_eq!(failed.status, InstanceStatus::Failed);

        crawler.failing.lock().unwrap().clear();
        let resumed = build(Storage::open(&db).await.unwrap())
            .resume(&failed.instance_id, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(resumed.status, InstanceStatus::Completed);
        assert_eq!(resumed.replayed, 1);
        assert_eq!(crawler.crawls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stale_delete_never_removes_blob_of_live_task() {
        // Trailing slashes are ignored in keys, so both versions share one blob.
        let live_task = task("/a/", "2024-01-01");
        let stale = task("/a", "2024-01-01");
        let h = harness(set(&[live_task.clone()]), None);
        assert_eq!(key(&live_task), key(&stale));

        seed_baseline(&h, &set(&[live_task.clone(), stale])).await;
        h.blobs.put(&key(&live_task), b"live").await.unwrap();

        let report = h.orchestrator.start(&SilentProgress).await.unwrap();

        assert_eq!(report.status, InstanceStatus::Completed);
        assert_eq!(report.removed, 0);
        assert_eq!(baseline(&h).await, set(&[live_task.clone()]));
        assert_eq!(h.blobs.get(&key(&live_task)).await.unwrap().unwrap(), b"live");
    }

    #[tokio::test]
    async fn trigger_takes_over_stale_running_instance() {
        let mut stale = settings(None);
        stale.stale_after = Duration::ZERO;
        let h = harness_with(set(&[task("/a", "2024-01-01")]), stale);
        h.history.begin_instance("crashed", "contoso").await.unwrap();

        let report = h.orchestrator.trigger(&SilentProgress).await.unwrap();
        assert_eq!(report.instance_id, "crashed");
        assert_eq!(report.status, InstanceStatus::Completed);

        // The project is free again for the next trigger.
        let next = h.orchestrator.trigger(&SilentProgress).await.unwrap();
        assert_ne!(next.instance_id, "crashed");
    }

    #[tokio::test]
    async fn trigger_leaves_live_running_instance_alone() {
        let h = harness(set(&[task("/a", "2024-01-01")]), None);
        h.history.begin_instance("busy", "contoso").await.unwrap();

        let err = h.orchestrator.trigger(&SilentProgress).await.unwrap_err();
        assert!(matches!(
            err,
            SiteIndexerError::AlreadyRunning { ref instance_id, .. } if instance_id == "busy"
        ));
        assert!(h.orchestrator.recover(&SilentProgress).await.unwrap().is_none());
        assert_eq!(h.crawler.crawls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recover_resumes_stale_instance_at_startup() {
        let mut stale = settings(None);
        stale.stale_after = Duration::ZERO;
        let h = harness_with(set(&[task("/a", "2024-01-01")]), stale);
        h.history.begin_instance("crashed", "contoso").await.unwrap();

        let report = h.orchestrator.recover(&SilentProgress).await.unwrap().unwrap();
        assert_eq!(report.instance_id, "crashed");
        assert_eq!(report.status, InstanceStatus::Completed);
        assert!(h.orchestrator.recover(&SilentProgress).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_provisioning_runs_again_on_resume() {
        let a = task("/a", "2024-01-01");
        let h = harness(set(&[a.clone()]), None);
        h.search.set_unreachable(true);

        let failed = h.orchestrator.start(&SilentProgress).await.unwrap();
        assert_eq!(failed.status, InstanceStatus::Failed);

        h.search.set_unreachable(false);
        let calls_before = h.search.calls().len();
        let resumed = h
            .orchestrator
            .resume(&failed.instance_id, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(resumed.status, InstanceStatus::Completed);
        assert!(h.search.calls().len() > calls_before);
        assert!(h.search.calls()[calls_before..]
            .iter()
            .any(|c| c == "POST indexers/web-indexer/run"));
        assert_eq!(h.crawler.crawls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn superseded_instance_cannot_roll_baseline_back() {
        let a = task("/a", "2024-01-01");
        let b = task("/b", "2024-01-01");
        let h = harness(set(&[a.clone(), b.clone()]), None);
        h.crawler.failing.lock().unwrap().insert(b.url.clone());

        let first = h.orchestrator.start(&SilentProgress).await.unwrap();
        assert_eq!(first.status, InstanceStatus::Failed);

        let a2 = task("/a", "2024-02-01");
        h.crawler.failing.lock().unwrap().clear();
        *h.sitemap.0.lock().unwrap() = set(&[a2.clone(), b.clone()]);
        let second = h.orchestrator.start(&SilentProgress).await.unwrap();
        assert_eq!(second.status, InstanceStatus::Completed);

        let err = h
            .orchestrator
            .resume(&first.instance_id, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("superseded"));
        assert_eq!(baseline(&h).await, set(&[a2, b]));
    }
}
