//! Sitemap discovery: fetch a site's sitemap and turn it into a [`TaskSet`].
//!
//! Supports `<urlset>` documents in both known layouts, and `<sitemapindex>`
//! documents whose children are fetched once each (no deeper nesting).
//! Every entry must carry a parseable `<lastmod>`; a sitemap without one is
//! rejected rather than silently producing tasks with a made-up date.

mod parser;

use async_trait::async_trait;
use reqwest::Client;
use siteindexer_shared::{Result, RetryPolicy, SiteIndexerError, Task, TaskSet, retry};
use tracing::{debug, info, instrument};
use url::Url;

pub use parser::{SitemapDocument, SitemapEntry};

/// Maximum number of redirects to follow when fetching a sitemap.
const MAX_REDIRECTS: usize = 5;

/// Default timeout in seconds for fetching a sitemap.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum response size we consider valid (50 MB, the sitemap protocol limit).
const MAX_RESPONSE_SIZE: u64 = 50 * 1024 * 1024;

/// User-Agent string for discovery requests.
const USER_AGENT: &str = concat!("siteindexer/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// SitemapSource
// ---------------------------------------------------------------------------

/// Yields the live URL set of a site.
#[async_trait]
pub trait SitemapSource: Send + Sync {
    /// Fetch and parse the sitemap at `sitemap_url`.
    async fn fetch(&self, sitemap_url: &Url) -> Result<TaskSet>;
}

/// Configuration for the HTTP sitemap source.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,
    /// Retry policy for each document fetch.
    pub retry: RetryPolicy,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Fetches sitemaps over HTTP.
pub struct HttpSitemapSource {
    client: Client,
    retry: RetryPolicy,
}

impl HttpSitemapSource {
    pub fn new(opts: &DiscoveryOptions) -> Result<Self> {
        Ok(Self {
            client: build_client(opts)?,
            retry: opts.retry.clone(),
        })
    }

    async fn fetch_document(&self, url: &Url) -> Result<SitemapDocument> {
        let body = retry(&self.retry, "sitemap fetch", || {
            fetch_text(&self.client, url)
        })
        .await?;
        parser::parse_sitemap(&body)
            .map_err(|e| SiteIndexerError::parse(format!("{url}: {e}")))
    }
}

#[async_trait]
impl SitemapSource for HttpSitemapSource {
    #[instrument(skip_all, fields(url = %sitemap_url))]
    async fn fetch(&self, sitemap_url: &Url) -> Result<TaskSet> {
        info!("fetching sitemap");

        let entries = match self.fetch_document(sitemap_url).await? {
            SitemapDocument::UrlSet(entries) => entries,
            SitemapDocument::Index(children) => {
                info!(children = children.len(), "sitemap index found");
                let mut all = Vec::new();
                for child in children {
                    let child_url = sitemap_url.join(&child).map_err(|e| {
                        SiteIndexerError::parse(format!("invalid child sitemap '{child}': {e}"))
                    })?;
                    match self.fetch_document(&child_url).await? {
                        SitemapDocument::UrlSet(entries) => {
                            debug!(url = %child_url, entries = entries.len(), "child sitemap parsed");
                            all.extend(entries);
                        }
                        SitemapDocument::Index(_) => {
                            return Err(SiteIndexerError::parse(format!(
                                "{child_url}: nested sitemap index is not supported"
                            )));
                        }
                    }
                }
                all
            }
        };

        let tasks = entries_to_tasks(entries)?;
        info!(tasks = tasks.len(), "sitemap parsed");
        Ok(tasks)
    }
}

/// Convert parsed entries into tasks. Duplicates collapse.
pub fn entries_to_tasks(entries: Vec<SitemapEntry>) -> Result<TaskSet> {
    entries
        .into_iter()
        .map(|entry| match entry.lastmod {
            Some(lastmod) => Task::parse(entry.loc, &lastmod),
            None => Err(SiteIndexerError::parse(format!(
                "sitemap entry {} has no <lastmod>",
                entry.loc
            ))),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &DiscoveryOptions) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(std::time::Duration::from_secs(opts.timeout_secs))
        .build()
        .map_err(|e| SiteIndexerError::Network(format!("failed to build HTTP client: {e}")))
}

/// Fetch a URL and return the body as text.
async fn fetch_text(client: &Client, url: &Url) -> Result<String> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| SiteIndexerError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SiteIndexerError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(SiteIndexerError::validation(format!(
                "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    response
        .text()
        .await
        .map_err(|e| SiteIndexerError::Network(format!("{url}: failed to read body: {e}")))
}
