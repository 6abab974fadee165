//! Error types for siteindexer.
//!
//! Library crates use [`SiteIndexerError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all siteindexer operations.
#[derive(Debug, thiserror::Error)]
pub enum SiteIndexerError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transport-level failure (connect, timeout, body read).
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx HTTP response from a remote endpoint.
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// Sitemap, CSV, or HTML parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Blob store or history database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad key, malformed definition, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-text conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Search backend error outside a provisioning step.
    #[error("search backend error: {0}")]
    Search(String),

    /// Orchestration history or replay error.
    #[error("workflow error: {message}")]
    Workflow { message: String },

    /// Another orchestration instance still holds the project.
    #[error("project '{project}' already has a running instance ({instance_id})")]
    AlreadyRunning {
        project: String,
        instance_id: String,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SiteIndexerError>;

impl SiteIndexerError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a workflow error from any displayable message.
    pub fn workflow(msg: impl Into<String>) -> Self {
        Self::Workflow {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry of the same operation could plausibly succeed.
    ///
    /// Transport failures, throttling, server errors and storage writes are
    /// transient. Everything caused by bad input or configuration is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Storage(_) | Self::Io { .. } => true,
            Self::Http { status, .. } => matches!(status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = SiteIndexerError::config("missing search service name");
        assert_eq!(err.to_string(), "config error: missing search service name");

        let err = SiteIndexerError::Http {
            url: "https://example.com/a".into(),
            status: 503,
        };
        assert_eq!(err.to_string(), "HTTP 503 from https://example.com/a");
    }

    #[test]
    fn transient_classification() {
        assert!(SiteIndexerError::Network("reset".into()).is_transient());
        assert!(SiteIndexerError::Storage("disk full".into()).is_transient());
        assert!(
            SiteIndexerError::Http {
                url: String::new(),
                status: 429
            }
            .is_transient()
        );
        assert!(
            !SiteIndexerError::Http {
                url: String::new(),
                status: 404
            }
            .is_transient()
        );
        assert!(!SiteIndexerError::parse("bad xml").is_transient());
        assert!(!SiteIndexerError::config("missing").is_transient());
    }
}
