//! Crawl activity for siteindexer.
//!
//! - [`PageCrawler`]: the per-task activities the orchestrator fans out
//! - [`CrawlActivity`]: HTTP fetch, text extraction, upload under the
//!   task's content key

pub mod activity;
mod guard;

pub use activity::{CrawlActivity, CrawlOptions, CrawlReceipt, PageCrawler, RemoveReceipt};
