//! Shared types, error model, and configuration for siteindexer.
//!
//! This crate is the foundation depended on by all other siteindexer crates.
//! It provides:
//! - [`SiteIndexerError`], the unified error type
//! - Domain types ([`Task`], [`TaskSet`], [`ContentKey`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)
//! - Bounded retry for transient I/O ([`RetryPolicy`], [`retry()`])

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlSettings, EmbeddingSettings, IndexerSettings, IndexerTarget, PipelineConfig,
    ResourceNames, ScheduleSettings, SearchSettings, Secret, TextFormat, VectorConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
};
pub use error::{Result, SiteIndexerError};
pub use retry::{RetryPolicy, retry};
pub use types::{ContentKey, LASTMOD_FORMAT, Task, TaskSet};
