//! Fetch strategies for resolving script URLs
//!
//! Two interchangeable strategies sit behind the [`Fetcher`] trait: a plain
//! HTTP client ([`DirectFetcher`]) and a managed-browser driver
//! ([`BrowserFetcher`]). The strategy is chosen once per process from
//! configuration and shared by every resolution: scripts fetch through it via
//! the `fetch_data` capability, and the orchestrator's download path reuses
//! the same strategy for the second fetch.

pub mod browser;
pub mod direct;

pub use browser::BrowserFetcher;
pub use direct::DirectFetcher;

use crate::config::Config;
use crate::error::FetchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result alias for fetcher operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Generic binary content type used when a response declares none.
pub(crate) const OCTET_STREAM: &str = "application/octet-stream";

/// What a fetch produced, as seen by scripts.
///
/// Serialized with a `kind` tag — this exact shape crosses the JS bridge, so
/// scripts branch on `outcome.kind`. A non-success HTTP status is a value
/// here, not a failure: scripts may inspect or ignore it. Transport-level
/// failures never construct a `FetchOutcome`; they surface as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// Response declared `application/json` and parsed successfully.
    Structured {
        /// The parsed document.
        body: serde_json::Value,
    },
    /// Any other renderable or textual response body.
    Text {
        /// Body decoded as UTF-8 (lossily where needed).
        body: String,
    },
    /// The server answered with a non-success status.
    HttpError {
        /// The HTTP status code.
        status: u16,
    },
}

impl FetchOutcome {
    /// Tag string matching the serialized `kind` field, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchOutcome::Structured { .. } => "structured",
            FetchOutcome::Text { .. } => "text",
            FetchOutcome::HttpError { .. } => "http_error",
        }
    }
}

/// Raw bytes fetched for the download path.
///
/// The filename here is only ever a *hint* (from `Content-Disposition`, the
/// URL path, or the browser's suggestion); the orchestrator replaces it with
/// the caller's name before anything reaches a user.
#[derive(Debug, Clone)]
pub struct Download {
    /// The buffered payload.
    pub bytes: Vec<u8>,
    /// Declared content type, or `application/octet-stream` when absent.
    pub content_type: String,
    /// Server- or browser-suggested filename, for logs only.
    pub hinted_filename: Option<String>,
}

/// A URL fetch strategy.
///
/// Implementations must be safe to share across concurrent resolutions; each
/// call is independent (no pooling, no retries).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Strategy name for logs (`direct` or `browser`).
    fn name(&self) -> &'static str;

    /// Fetch `url` on behalf of a script and classify the response.
    async fn fetch(&self, url: &str) -> FetchResult<FetchOutcome>;

    /// Fetch `url` for the download path, returning buffered bytes. Unlike
    /// [`Fetcher::fetch`], a non-success status is an error here.
    async fn download(&self, url: &str) -> FetchResult<Download>;
}

/// Classify a successful response body the way scripts expect: a declared
/// JSON content type parses into a structured document, falling back to text
/// when the body does not actually parse; everything else is text.
pub(crate) fn classify_text(content_type: &str, body: &str) -> FetchOutcome {
    if content_type.contains("application/json") {
        if let Ok(value) = serde_json::from_str(body) {
            return FetchOutcome::Structured { body: value };
        }
    }
    FetchOutcome::Text {
        body: body.to_string(),
    }
}

/// Select the process-wide fetch strategy from configuration: a configured
/// `browser.endpoint` selects the browser strategy, otherwise fetches go
/// direct.
pub fn fetcher_from_config(config: &Config) -> Arc<dyn Fetcher> {
    match &config.browser.endpoint {
        Some(endpoint) => Arc::new(BrowserFetcher::new(
            endpoint.clone(),
            &config.browser,
            &config.fetch,
        )),
        None => Arc::new(DirectFetcher::new(&config.fetch)),
    }
}
