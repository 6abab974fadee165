//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use siteindexer_core::{
    Collaborators, Orchestrator, OrchestratorSettings, ProgressReporter, RunReport,
    SilentProgress,
};
use siteindexer_search::{
    IndexProvisioner, IndexerTrigger, MemorySearchBackend, ProvisioningHealth, ProvisioningPlan,
    ProvisioningReport, RestSearchBackend, SearchBackend,
};
use siteindexer_shared::{
    AppConfig, PipelineConfig, SiteIndexerError, expand_home, init_config, load_config,
    load_config_from,
};
use siteindexer_storage::{HistoryStore, InstanceStatus, Storage};

use crate::schedule::next_run_after;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// siteindexer: crawl a sitemap and keep a search index in sync with it.
#[derive(Parser)]
#[command(
    name = "siteindexer",
    version,
    about = "Crawl new and changed sitemap pages and provision the search index over them.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.siteindexer/siteindexer.toml).
    #[arg(long, global = true, env = "SITEINDEXER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run one orchestration now.
    Run,

    /// Resume a crashed or failed orchestration from its history.
    Resume {
        /// Instance ID as shown by `status`.
        instance: String,
    },

    /// Trigger one orchestration per day at the configured time.
    Serve {
        /// Also run once immediately.
        #[arg(long)]
        run_on_startup: bool,
    },

    /// Show what the next run would crawl and delete, without writing anything.
    Diff {
        /// Maximum URLs to list per section.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Provision the search resources without crawling.
    Provision {
        /// Provision against an in-memory backend and print the payloads.
        #[arg(long)]
        dry_run: bool,

        /// Reset the indexer before running it.
        #[arg(long)]
        reset: bool,

        /// Do not start an indexer run.
        #[arg(long)]
        no_run: bool,
    },

    /// List recent orchestration instances.
    Status {
        /// Number of instances to show.
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show the loaded configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "siteindexer=info",
        1 => "siteindexer=debug",
        _ => "siteindexer=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run => cmd_run(config_path).await,
        Command::Resume { instance } => cmd_resume(config_path, &instance).await,
        Command::Serve { run_on_startup } => cmd_serve(config_path, run_on_startup).await,
        Command::Diff { limit } => cmd_diff(config_path, limit).await,
        Command::Provision {
            dry_run,
            reset,
            no_run,
        } => cmd_provision(config_path, dry_run, reset, no_run).await,
        Command::Status { limit } => cmd_status(config_path, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Load and validate the configuration once, before any work starts.
fn load_pipeline(path: Option<&Path>) -> Result<PipelineConfig> {
    let app = load_app_config(path)?;
    Ok(PipelineConfig::resolve(&app)?)
}

async fn build_orchestrator(config: &PipelineConfig) -> Result<Orchestrator> {
    let parts = Collaborators::from_config(config).await?;
    Ok(Orchestrator::new(OrchestratorSettings::from_config(config), parts))
}

// ---------------------------------------------------------------------------
// Orchestration commands
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>) -> Result<()> {
    let config = load_pipeline(config_path)?;
    let orchestrator = build_orchestrator(&config).await?;

    info!(project = %config.project, sitemap = %config.sitemap_url, "starting run");
    let reporter = CliProgress::new();
    let report = orchestrator.trigger(&reporter).await;
    reporter.clear();
    finish(report?)
}

async fn cmd_resume(config_path: Option<&Path>, instance: &str) -> Result<()> {
    let config = load_pipeline(config_path)?;
    let orchestrator = build_orchestrator(&config).await?;

    info!(instance, "resuming run");
    let reporter = CliProgress::new();
    let report = orchestrator.resume(instance, &reporter).await;
    reporter.clear();
    finish(report?)
}

fn finish(report: RunReport) -> Result<()> {
    print_run_report(&report);
    match report.status {
        InstanceStatus::Failed if !report.failures.is_empty() => Err(eyre!(
            "run {} failed while crawling; fix the cause and `siteindexer resume {}`",
            report.instance_id,
            report.instance_id
        )),
        InstanceStatus::Failed => Err(eyre!(
            "run {} could not provision any search resource; check the search service, \
             then `siteindexer resume {}` to provision again",
            report.instance_id,
            report.instance_id
        )),
        _ => Ok(()),
    }
}

async fn cmd_serve(config_path: Option<&Path>, run_on_startup: bool) -> Result<()> {
    let config = load_pipeline(config_path)?;
    let orchestrator = build_orchestrator(&config).await?;
    let at = config.schedule.daily_at;

    info!(project = %config.project, daily_at = %at, "scheduler started");
    if run_on_startup || config.schedule.run_on_startup {
        trigger(&orchestrator).await;
    } else {
        match orchestrator.recover(&SilentProgress).await {
            Ok(Some(report)) => log_scheduled_report(&report, "recovered run finished"),
            Ok(None) => {}
            Err(e) => error!(error = %e, "recovering stale run failed"),
        }
    }

    loop {
        let now = Utc::now();
        let next = next_run_after(now, at);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next = %next, "next run scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => trigger(&orchestrator).await,
            _ = tokio::signal::ctrl_c() => {
                info!("scheduler stopped");
                return Ok(());
            }
        }
    }
}

fn log_scheduled_report(report: &RunReport, message: &str) {
    info!(
        instance = %report.instance_id,
        status = %report.status,
        crawled = report.crawled,
        removed = report.removed,
        "{message}"
    );
    if let Some(provisioning) = &report.provisioning {
        log_provisioning(provisioning);
    }
}

/// Run one scheduled instance. A trigger that finds a live instance still
/// running is dropped; a stale one is taken over.
async fn trigger(orchestrator: &Orchestrator) {
    match orchestrator.trigger(&SilentProgress).await {
        Ok(report) => log_scheduled_report(&report, "scheduled run finished"),
        Err(SiteIndexerError::AlreadyRunning {
            project,
            instance_id,
        }) => {
            warn!(
                %project,
                running = %instance_id,
                "trigger skipped, instance still running; resume or wait for it"
            );
        }
        Err(e) => error!(error = %e, "scheduled run failed"),
    }
}

async fn cmd_diff(config_path: Option<&Path>, limit: usize) -> Result<()> {
    let config = load_pipeline(config_path)?;
    let orchestrator = build_orchestrator(&config).await?;
    let preview = orchestrator.preview().await?;

    println!();
    println!("  Project:   {}", config.project);
    println!("  Live:      {}", preview.live.len());
    println!("  Baseline:  {}", preview.cached.len());
    println!("  To crawl:  {}", preview.diff.to_add.len());
    for task in preview.diff.to_add.iter().take(limit) {
        println!("    + {task}");
    }
    println!("  To delete: {}", preview.diff.to_delete.len());
    for task in preview.diff.to_delete.iter().take(limit) {
        println!("    - {task}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

async fn cmd_provision(
    config_path: Option<&Path>,
    dry_run: bool,
    reset: bool,
    no_run: bool,
) -> Result<()> {
    let config = load_pipeline(config_path)?;
    let plan = ProvisioningPlan::from_config(&config)?;
    let trigger = IndexerTrigger {
        reset: reset || config.indexer.reset,
        run: config.indexer.run && !no_run,
    };

    let backend: Arc<dyn SearchBackend> = if dry_run {
        for (wave_no, wave) in plan.waves().iter().enumerate() {
            for def in wave {
                println!("# wave {wave_no}: {} (PUT {})", def.resource(), def.resource().path());
                println!("{}", serde_json::to_string_pretty(&def.redacted_payload())?);
            }
        }
        Arc::new(MemorySearchBackend::new())
    } else {
        Arc::new(RestSearchBackend::new(&config.search, config.crawl.timeout)?)
    };

    let provisioner = IndexProvisioner::new(backend, config.search.max_concurrency);
    let report = provisioner.provision(&plan, trigger).await;
    print_provisioning(&report);

    match report.health() {
        ProvisioningHealth::Failed => {
            Err(eyre!("provisioning failed: no step succeeded"))
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Status & config
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: Option<&Path>, limit: usize) -> Result<()> {
    let app = load_app_config(config_path)?;
    let db_path = expand_home(&app.storage.history_db)?;
    if !db_path.exists() {
        println!("No runs recorded yet ({}).", db_path.display());
        return Ok(());
    }

    let storage = Storage::open(&db_path).await?;
    let project = (!app.project.name.is_empty()).then_some(app.project.name.as_str());
    let instances = storage.list_instances(project, limit).await?;

    if instances.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!();
    println!(
        "  {:<38} {:<12} {:<10} {:<16} {}",
        "INSTANCE", "PROJECT", "STATUS", "STATE", "UPDATED"
    );
    for record in instances {
        println!(
            "  {:<38} {:<12} {:<10} {:<16} {}",
            record.id,
            record.project,
            record.status.as_str(),
            record.state,
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = record
            .summary
            .as_ref()
            .and_then(|s| s.get("error"))
            .and_then(|e| e.as_str())
        {
            println!("    error: {error}");
        }
    }
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load_app_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_run_report(report: &RunReport) {
    println!();
    println!("  Instance:  {}", report.instance_id);
    println!("  Status:    {} ({})", report.status, report.state);
    println!("  Live:      {}", report.live);
    println!("  Crawled:   {} of {}", report.crawled, report.to_add);
    println!("  Removed:   {} of {}", report.removed, report.to_delete);
    if report.replayed > 0 {
        println!("  Replayed:  {}", report.replayed);
    }
    if let Some(size) = report.baseline_size {
        println!("  Baseline:  {size}");
    }
    for failure in &report.failures {
        println!("  ! {} {}: {}", failure.step_id, failure.url, failure.error);
    }
    if let Some(provisioning) = &report.provisioning {
        print_provisioning(provisioning);
    }
    println!();
}

fn print_provisioning(report: &ProvisioningReport) {
    println!("  Provisioning: {:?}", report.health());
    for outcome in &report.outcomes {
        let status = outcome
            .http_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "    {:<9} {:<6} {:<40} HTTP {}",
            outcome.status.to_string(),
            outcome.action.to_string(),
            outcome.resource.to_string(),
            status
        );
        if let Some(detail) = &outcome.detail {
            println!("              {detail}");
        }
    }
}

fn log_provisioning(report: &ProvisioningReport) {
    for outcome in &report.outcomes {
        info!(
            resource = %outcome.resource,
            action = %outcome.action,
            outcome = %outcome.status,
            status = ?outcome.http_status,
            "provisioning outcome"
        );
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn activities_scheduled(&self, crawls: usize, deletes: usize) {
        self.spinner
            .set_message(format!("Scheduled {crawls} crawls and {deletes} deletes"));
    }

    fn activity_finished(&self, step_id: &str, ok: bool, current: usize, total: usize) {
        let mark = if ok { "" } else { " (failed)" };
        self.spinner
            .set_message(format!("[{current}/{total}] {step_id}{mark}"));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}
