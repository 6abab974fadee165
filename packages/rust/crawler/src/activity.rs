//! The crawl activity: one page in, one stored text blob out.
//!
//! Each invocation fetches the task's URL, extracts its text and writes it
//! under the task's [`ContentKey`], overwriting earlier content. Running it
//! twice for the same task leaves exactly one blob with the same content.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;

use siteindexer_shared::{
    ContentKey, PipelineConfig, Result, RetryPolicy, SiteIndexerError, Task, TextFormat, retry,
};
use siteindexer_storage::BlobStore;

use crate::guard::is_ssrf_target;

/// User-Agent string for crawl requests.
const USER_AGENT: &str = concat!("siteindexer/", env!("CARGO_PKG_VERSION"));

const MAX_REDIRECTS: usize = 5;

/// Outcome of a successful crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlReceipt {
    pub key: ContentKey,
    /// Size of the stored text.
    pub bytes: usize,
    /// SHA-256 of the stored text, hex encoded.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Outcome of removing a stale task's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveReceipt {
    pub key: ContentKey,
    /// Whether a blob was actually present.
    pub existed: bool,
}

/// Per-task content activities scheduled by the orchestrator.
#[async_trait]
pub trait PageCrawler: Send + Sync {
    /// Fetch the task's page and store its text.
    async fn crawl(&self, task: &Task) -> Result<CrawlReceipt>;

    /// Delete the stored text of a task that left the sitemap.
    async fn remove(&self, task: &Task) -> Result<RemoveReceipt>;

    /// Key under which `task`'s text is stored.
    fn content_key(&self, task: &Task) -> ContentKey;
}

/// Settings for [`CrawlActivity`].
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub project: String,
    /// Prefix stripped from page URLs when deriving content keys.
    pub base_url: String,
    pub text_format: TextFormat,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Allow crawling localhost/private IPs.
    pub allow_private_hosts: bool,
}

impl CrawlOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            project: config.project.clone(),
            base_url: config.base_url.to_string(),
            text_format: config.crawl.text_format,
            timeout: config.crawl.timeout,
            retry: config.crawl.retry.clone(),
            allow_private_hosts: config.crawl.allow_private_hosts,
        }
    }
}

/// HTTP crawl activity writing into a [`BlobStore`].
pub struct CrawlActivity {
    opts: CrawlOptions,
    client: Client,
    blobs: Arc<dyn BlobStore>,
}

impl CrawlActivity {
    pub fn new(opts: CrawlOptions, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(redirect_policy(opts.allow_private_hosts))
            .timeout(opts.timeout)
            .build()
            .map_err(|e| {
                SiteIndexerError::Network(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            opts,
            client,
            blobs,
        })
    }

    /// One attempt: fetch, extract, upload.
    async fn fetch_and_store(&self, url: &Url, key: &ContentKey) -> Result<CrawlReceipt> {
        debug!(%url, "fetching page");

        let response = self
            .client
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

        let body = response
            .text()
            .await
            .map_err(|e| SiteIndexerError::Network(format!("{url}: body read failed: {e}")))?;

        let extracted = siteindexer_text::extract(&body, url.as_str(), self.opts.text_format)?;
        self.blobs
            .put(key.as_str(), extracted.text.as_bytes())
            .await?;

        Ok(CrawlReceipt {
            key: key.clone(),
            bytes: extracted.text.len(),
            content_hash: compute_hash(&extracted.text),
            title: extracted.title,
        })
    }
}

#[async_trait]
impl PageCrawler for CrawlActivity {
    #[instrument(skip_all, fields(url = %task.url, lastmod = %task.last_modified))]
    async fn crawl(&self, task: &Task) -> Result<CrawlReceipt> {
        let url = Url::parse(&task.url)
            .map_err(|e| SiteIndexerError::validation(format!("invalid URL {}: {e}", task.url)))?;

        if !self.opts.allow_private_hosts && is_ssrf_target(&url) {
            return Err(SiteIndexerError::validation(format!(
                "refusing to fetch private or non-HTTP address {url}"
            )));
        }

        let key = self.content_key(task);
        let receipt = retry(&self.opts.retry, "page crawl", || {
            self.fetch_and_store(&url, &key)
        })
        .await?;

        info!(key = %receipt.key, bytes = receipt.bytes, "page stored");
        Ok(receipt)
    }

    #[instrument(skip_all, fields(url = %task.url, lastmod = %task.last_modified))]
    async fn remove(&self, task: &Task) -> Result<RemoveReceipt> {
        let key = self.content_key(task);
        let existed = retry(&self.opts.retry, "content delete", || {
            self.blobs.delete(key.as_str())
        })
        .await?;

        info!(key = %key, existed, "stale content removed");
        Ok(RemoveReceipt { key, existed })
    }

    fn content_key(&self, task: &Task) -> ContentKey {
        ContentKey::derive(&self.opts.project, &self.opts.base_url, task)
    }
}

/// Follow up to [`MAX_REDIRECTS`] hops, applying the private-host guard to
/// every hop. A refused hop stops the chain and surfaces the 3xx response.
fn redirect_policy(allow_private_hosts: bool) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if !allow_private_hosts && is_ssrf_target(attempt.url()) {
            warn!(target_url = %attempt.url(), "redirect to private address refused");
            attempt.stop()
        } else {
            attempt.follow()
        }
    })
}

/// Compute a SHA-256 hash of the content.
fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
