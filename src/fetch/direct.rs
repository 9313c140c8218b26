//! Direct HTTP fetch strategy.
//!
//! A plain `reqwest` client with a bounded timeout and a capped redirect
//! chain. Responses are classified for scripts by status and declared
//! content type; bodies are read chunk-wise against a byte ceiling so an
//! oversized response cannot balloon memory.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::fetch::{classify_text, Download, FetchOutcome, FetchResult, Fetcher, OCTET_STREAM};

/// Redirect hops allowed before a fetch is abandoned.
const MAX_REDIRECTS: usize = 5;

/// Fetch strategy that talks HTTP directly.
pub struct DirectFetcher {
    client: Client,
    max_body_bytes: usize,
    max_download_bytes: usize,
}

impl DirectFetcher {
    /// Create a new direct fetcher from fetch settings.
    pub fn new(cfg: &FetchConfig) -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(cfg.user_agent.clone())
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            max_body_bytes: cfg.max_body_bytes,
            max_download_bytes: cfg.max_download_bytes,
        }
    }
}

#[async_trait]
impl Fetcher for DirectFetcher {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn fetch(&self, url: &str) -> FetchResult<FetchOutcome> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            debug!(url, status = status.as_u16(), "direct fetch: http error");
            return Ok(FetchOutcome::HttpError {
                status: status.as_u16(),
            });
        }

        let content_type = declared_content_type(&response).unwrap_or_default();
        let body = read_body_limited(response, self.max_body_bytes).await?;
        let text = String::from_utf8_lossy(&body);
        let outcome = classify_text(&content_type, &text);
        debug!(
            url,
            status = status.as_u16(),
            kind = outcome.kind(),
            bytes = body.len(),
            "direct fetch complete"
        );
        Ok(outcome)
    }

    async fn download(&self, url: &str) -> FetchResult<Download> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type =
            declared_content_type(&response).unwrap_or_else(|| OCTET_STREAM.to_string());
        let hinted_filename = filename_hint(&response);
        // Read one byte past the ceiling so an oversized payload is detected
        // instead of silently truncated into a corrupt file.
        let bytes = read_body_limited(response, self.max_download_bytes + 1).await?;
        if bytes.len() > self.max_download_bytes {
            return Err(FetchError::TooLarge {
                limit: self.max_download_bytes,
            });
        }
        debug!(
            url,
            bytes = bytes.len(),
            content_type,
            hint = hinted_filename.as_deref().unwrap_or("-"),
            "direct download complete"
        );

        Ok(Download {
            bytes,
            content_type,
            hinted_filename,
        })
    }
}

/// The response's declared content type, if any.
fn declared_content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Best-effort filename hint: `Content-Disposition` first, then the final
/// URL's last path segment. Hints are for logs only; the caller's filename
/// always wins on the download path.
fn filename_hint(response: &reqwest::Response) -> Option<String> {
    if let Some(name) = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_filename)
    {
        return Some(name);
    }

    response
        .url()
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
}

/// Pull a `filename=` parameter out of a `Content-Disposition` header value.
fn disposition_filename(header: &str) -> Option<String> {
    let raw = header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?;
    let name = raw.trim().trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Read a response body in chunks, enforcing a maximum byte limit.
///
/// Accumulation stops at the ceiling so a server cannot force an unbounded
/// allocation; whatever was read up to that point is returned.
async fn read_body_limited(response: reqwest::Response, max_bytes: usize) -> FetchResult<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    let mut stream = response;

    loop {
        match stream.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = max_bytes.saturating_sub(buf.len());
                if remaining == 0 {
                    break;
                }
                let take = chunk.len().min(remaining);
                buf.extend_from_slice(&chunk[..take]);
                if buf.len() >= max_bytes {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                return Err(FetchError::Connection(format!(
                    "failed to read response body: {e}"
                )));
            }
        }
    }

    Ok(buf)
}
