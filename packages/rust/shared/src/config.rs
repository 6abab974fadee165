//! Application configuration for siteindexer.
//!
//! User config lives at `~/.siteindexer/siteindexer.toml`.
//! Secrets are never written to the file; it names the environment variables
//! that hold them. The file is resolved once at startup into an immutable
//! [`PipelineConfig`] that is handed to every component.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SiteIndexerError};
use crate::retry::RetryPolicy;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "siteindexer.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".siteindexer";

// ---------------------------------------------------------------------------
// Config structs (matching siteindexer.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub crawl: CrawlPolicyConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// `[project]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project identifier; prefixes every content key.
    #[serde(default)]
    pub name: String,
    /// Root URL of the web property.
    #[serde(default)]
    pub base_url: String,
    /// Sitemap location relative to `base_url`.
    #[serde(default = "default_sitemap_path")]
    pub sitemap_path: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: String::new(),
            sitemap_path: default_sitemap_path(),
        }
    }
}

fn default_sitemap_path() -> String {
    "sitemap.xml".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding blob containers.
    #[serde(default = "default_content_root")]
    pub content_root: String,
    /// Container for page text and the baseline.
    #[serde(default = "default_container")]
    pub container: String,
    /// Name of the env var holding the storage connection string the search
    /// service uses to read the container.
    #[serde(default = "default_connection_env")]
    pub connection_string_env: String,
    /// Orchestration history database.
    #[serde(default = "default_history_db")]
    pub history_db: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            content_root: default_content_root(),
            container: default_container(),
            connection_string_env: default_connection_env(),
            history_db: default_history_db(),
        }
    }
}

fn default_content_root() -> String {
    "~/siteindexer-data".into()
}
fn default_container() -> String {
    "web-scraper-container".into()
}
fn default_connection_env() -> String {
    "SITEINDEXER_STORAGE_CONNECTION".into()
}
fn default_history_db() -> String {
    "~/.siteindexer/history.db".into()
}

/// Text representation stored for each page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextFormat {
    #[default]
    Plain,
    Markdown,
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPolicyConfig {
    /// Maximum concurrent crawl activities.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Cap on crawls per run; 0 means no cap.
    #[serde(default)]
    pub sample_size: u32,
    /// Attempts per page fetch/upload, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub text_format: TextFormat,
    /// Permit fetching loopback/private addresses.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for CrawlPolicyConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            sample_size: 0,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            text_format: TextFormat::default(),
            allow_private_hosts: false,
        }
    }
}

fn default_concurrency() -> u32 {
    8
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_timeout_secs() -> u64 {
    30
}

/// Which index the indexer writes documents into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexerTarget {
    Search,
    #[default]
    Vector,
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search service name; the endpoint is derived from it.
    #[serde(default)]
    pub service_name: String,
    /// Explicit endpoint, overriding `service_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_data_source_name")]
    pub data_source_name: String,
    #[serde(default = "default_search_index_name")]
    pub search_index_name: String,
    #[serde(default = "default_vector_index_name")]
    pub vector_index_name: String,
    #[serde(default = "default_skillset_name")]
    pub skillset_name: String,
    #[serde(default = "default_indexer_name")]
    pub indexer_name: String,
    #[serde(default)]
    pub indexer_target: IndexerTarget,
    /// Maximum concurrent provisioning calls.
    #[serde(default = "default_search_concurrency")]
    pub max_concurrency: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            endpoint: None,
            api_key_env: default_search_key_env(),
            api_version: default_api_version(),
            data_source_name: default_data_source_name(),
            search_index_name: default_search_index_name(),
            vector_index_name: default_vector_index_name(),
            skillset_name: default_skillset_name(),
            indexer_name: default_indexer_name(),
            indexer_target: IndexerTarget::default(),
            max_concurrency: default_search_concurrency(),
        }
    }
}

fn default_search_key_env() -> String {
    "SEARCH_API_KEY".into()
}
fn default_api_version() -> String {
    "2024-07-01".into()
}
fn default_data_source_name() -> String {
    "web-datasource".into()
}
fn default_search_index_name() -> String {
    "web-index".into()
}
fn default_vector_index_name() -> String {
    "web-vector-index".into()
}
fn default_skillset_name() -> String {
    "web-vector-skillset".into()
}
fn default_indexer_name() -> String {
    "web-indexer".into()
}
fn default_search_concurrency() -> u32 {
    2
}

/// `[indexer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// ISO-8601 duration between scheduled indexer runs.
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval: String,
    /// Trigger an indexer run after provisioning.
    #[serde(default = "default_true")]
    pub run: bool,
    /// Reset incremental state before the run.
    #[serde(default)]
    pub reset: bool,
    /// Keep an enrichment cache in the storage account.
    #[serde(default = "default_true")]
    pub enable_cache: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            schedule_interval: default_schedule_interval(),
            run: true,
            reset: false,
            enable_cache: true,
        }
    }
}

fn default_batch_size() -> u32 {
    10
}
fn default_schedule_interval() -> String {
    "PT1H".into()
}
fn default_true() -> bool {
    true
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding model resource URI.
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embedding_model")]
    pub deployment_id: String,
    #[serde(default = "default_embedding_model")]
    pub model_name: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            api_key_env: default_embedding_key_env(),
            deployment_id: default_embedding_model(),
            model_name: default_embedding_model(),
            dimensions: default_dimensions(),
        }
    }
}

fn default_embedding_key_env() -> String {
    "EMBEDDING_API_KEY".into()
}
fn default_embedding_model() -> String {
    "text-embedding-ada-002".into()
}
fn default_dimensions() -> u32 {
    1536
}

/// `[vector]` section: ANN graph and chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "default_profile_name")]
    pub profile_name: String,
    #[serde(default = "default_algorithm_name")]
    pub algorithm_name: String,
    /// Graph fan-out (bi-directional links per node).
    #[serde(default = "default_hnsw_m")]
    pub m: u32,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: u32,
    /// Search-time candidate list size.
    #[serde(default = "default_ef_search")]
    pub ef_search: u32,
    #[serde(default = "default_chunk_length")]
    pub chunk_length: u32,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: u32,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            profile_name: default_profile_name(),
            algorithm_name: default_algorithm_name(),
            m: default_hnsw_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            chunk_length: default_chunk_length(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_profile_name() -> String {
    "vector-profile".into()
}
fn default_algorithm_name() -> String {
    "hnsw-cosine".into()
}
fn default_hnsw_m() -> u32 {
    4
}
fn default_ef_construction() -> u32 {
    400
}
fn default_ef_search() -> u32 {
    500
}
fn default_chunk_length() -> u32 {
    2000
}
fn default_chunk_overlap() -> u32 {
    500
}

/// `[schedule]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Daily trigger time, `HH:MM` in UTC.
    #[serde(default = "default_daily_at")]
    pub daily_at: String,
    #[serde(default)]
    pub run_on_startup: bool,
    /// A running instance that records no progress for this long is taken
    /// over by the next trigger.
    #[serde(default = "default_stale_after_mins")]
    pub stale_after_mins: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_at: default_daily_at(),
            run_on_startup: false,
            stale_after_mins: default_stale_after_mins(),
        }
    }
}

fn default_daily_at() -> String {
    "10:00".into()
}

fn default_stale_after_mins() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Resolved runtime config
// ---------------------------------------------------------------------------

/// A secret value whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Crawl activity settings.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub concurrency: usize,
    /// `None` crawls every addition.
    pub sample_size: Option<usize>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub text_format: TextFormat,
    pub allow_private_hosts: bool,
}

/// Names of the provisioned search resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub data_source: String,
    pub search_index: String,
    pub vector_index: String,
    pub skillset: String,
    pub indexer: String,
}

/// Search backend connection settings.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub endpoint: Url,
    pub api_key: Secret,
    pub api_version: String,
    pub names: ResourceNames,
    pub indexer_target: IndexerTarget,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

/// Indexer definition and trigger settings.
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub batch_size: u32,
    pub schedule_interval: String,
    pub run: bool,
    pub reset: bool,
    pub enable_cache: bool,
}

/// Embedding model used by the vectorizer and the skillset.
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub uri: String,
    pub api_key: Secret,
    pub deployment_id: String,
    pub model_name: String,
    pub dimensions: u32,
}

/// Daily trigger settings.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub daily_at: NaiveTime,
    pub run_on_startup: bool,
    pub stale_after: Duration,
}

/// Immutable runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub project: String,
    pub base_url: Url,
    pub sitemap_url: Url,
    pub content_root: PathBuf,
    pub container: String,
    pub storage_connection: Secret,
    pub history_db: PathBuf,
    pub crawl: CrawlSettings,
    pub search: SearchSettings,
    pub indexer: IndexerSettings,
    pub embedding: EmbeddingSettings,
    pub vector: VectorConfig,
    pub schedule: ScheduleSettings,
}

impl PipelineConfig {
    /// Resolve against the process environment.
    pub fn resolve(config: &AppConfig) -> Result<Self> {
        Self::resolve_with(config, |name| std::env::var(name).ok())
    }

    /// Resolve using `env` to look up secret variables.
    ///
    /// Fails on the first missing or invalid setting; nothing is partially
    /// applied.
    pub fn resolve_with(config: &AppConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let project = required("project.name", &config.project.name)?;
        if project.contains('/') {
            return Err(SiteIndexerError::config(
                "project.name must not contain '/'",
            ));
        }

        let base_url = Url::parse(required("project.base_url", &config.project.base_url)?)
            .map_err(|e| SiteIndexerError::config(format!("invalid project.base_url: {e}")))?;
        let sitemap_url = sitemap_url(&base_url, &config.project.sitemap_path)?;

        let crawl = &config.crawl;
        let crawl = CrawlSettings {
            concurrency: crawl.concurrency.max(1) as usize,
            sample_size: (crawl.sample_size > 0).then_some(crawl.sample_size as usize),
            retry: RetryPolicy {
                max_attempts: crawl.max_attempts.max(1),
                initial_backoff: Duration::from_millis(crawl.initial_backoff_ms),
                max_backoff: Duration::from_millis(crawl.max_backoff_ms),
            },
            timeout: Duration::from_secs(crawl.timeout_secs.max(1)),
            text_format: crawl.text_format,
            allow_private_hosts: crawl.allow_private_hosts,
        };

        let search = &config.search;
        let endpoint = match search.endpoint.as_deref() {
            Some(endpoint) => Url::parse(endpoint)
                .map(|url| as_directory(&url))
                .map_err(|e| SiteIndexerError::config(format!("invalid search.endpoint: {e}")))?,
            None => {
                let service = required("search.service_name", &search.service_name)?;
                Url::parse(&format!("https://{service}.search.windows.net")).map_err(|e| {
                    SiteIndexerError::config(format!("invalid search.service_name: {e}"))
                })?
            }
        };
        let search = SearchSettings {
            endpoint,
            api_key: secret(&env, &search.api_key_env, "search API key")?,
            api_version: required("search.api_version", &search.api_version)?.to_string(),
            names: ResourceNames {
                data_source: required("search.data_source_name", &search.data_source_name)?
                    .to_string(),
                search_index: required("search.search_index_name", &search.search_index_name)?
                    .to_string(),
                vector_index: required("search.vector_index_name", &search.vector_index_name)?
                    .to_string(),
                skillset: required("search.skillset_name", &search.skillset_name)?.to_string(),
                indexer: required("search.indexer_name", &search.indexer_name)?.to_string(),
            },
            indexer_target: search.indexer_target,
            max_concurrency: search.max_concurrency.max(1) as usize,
            retry: crawl.retry.clone(),
        };

        let embedding = EmbeddingSettings {
            uri: required("embedding.uri", &config.embedding.uri)?.to_string(),
            api_key: secret(&env, &config.embedding.api_key_env, "embedding API key")?,
            deployment_id: required("embedding.deployment_id", &config.embedding.deployment_id)?
                .to_string(),
            model_name: required("embedding.model_name", &config.embedding.model_name)?
                .to_string(),
            dimensions: match config.embedding.dimensions {
                0 => return Err(SiteIndexerError::config("embedding.dimensions must be > 0")),
                d => d,
            },
        };

        if config.vector.chunk_overlap >= config.vector.chunk_length {
            return Err(SiteIndexerError::config(
                "vector.chunk_overlap must be smaller than vector.chunk_length",
            ));
        }

        let daily_at = NaiveTime::parse_from_str(&config.schedule.daily_at, "%H:%M").map_err(
            |e| {
                SiteIndexerError::config(format!(
                    "invalid schedule.daily_at '{}': {e}",
                    config.schedule.daily_at
                ))
            },
        )?;

        Ok(Self {
            project: project.to_string(),
            base_url,
            sitemap_url,
            content_root: expand_home(&config.storage.content_root)?,
            container: required("storage.container", &config.storage.container)?.to_string(),
            storage_connection: secret(
                &env,
                &config.storage.connection_string_env,
                "storage connection string",
            )?,
            history_db: expand_home(&config.storage.history_db)?,
            crawl,
            search,
            indexer: IndexerSettings {
                batch_size: config.indexer.batch_size.max(1),
                schedule_interval: config.indexer.schedule_interval.clone(),
                run: config.indexer.run,
                reset: config.indexer.reset,
                enable_cache: config.indexer.enable_cache,
            },
            embedding,
            vector: config.vector.clone(),
            schedule: ScheduleSettings {
                daily_at,
                run_on_startup: config.schedule.run_on_startup,
                stale_after: Duration::from_secs(config.schedule.stale_after_mins.max(1) * 60),
            },
        })
    }

    /// Directory backing the configured container.
    pub fn container_dir(&self) -> PathBuf {
        self.content_root.join(&self.container)
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(SiteIndexerError::config(format!("{field} is required")))
    } else {
        Ok(trimmed)
    }
}

fn secret(env: &impl Fn(&str) -> Option<String>, var_name: &str, what: &str) -> Result<Secret> {
    match env(var_name) {
        Some(val) if !val.is_empty() => Ok(Secret(val)),
        _ => Err(SiteIndexerError::config(format!(
            "{what} not found. Set the {var_name} environment variable."
        ))),
    }
}

/// `url` with a trailing `/`, so relative joins append instead of replacing
/// the last path segment.
fn as_directory(url: &Url) -> Url {
    let mut dir = url.clone();
    if !dir.path().ends_with('/') {
        let path = format!("{}/", dir.path());
        dir.set_path(&path);
    }
    dir
}

fn sitemap_url(base_url: &Url, sitemap_path: &str) -> Result<Url> {
    as_directory(base_url)
        .join(sitemap_path.trim_start_matches('/'))
        .map_err(|e| SiteIndexerError::config(format!("invalid project.sitemap_path: {e}")))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| SiteIndexerError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.siteindexer/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SiteIndexerError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.siteindexer/siteindexer.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SiteIndexerError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        SiteIndexerError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SiteIndexerError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SiteIndexerError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SiteIndexerError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
