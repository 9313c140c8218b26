//! Browser fetch strategy over the Chrome DevTools Protocol.
//!
//! Drives an already-running, externally managed browser. Every call opens
//! its own connection and an ephemeral browser context, so concurrent
//! resolutions never share cookies, cache, or download state. Two outcomes
//! are possible per navigation: the page renders (body captured from the
//! serialized DOM, status and MIME from the document's network response), or
//! the navigation itself triggers a file download — in which case the
//! download is intercepted through browser download events, buffered from a
//! temp staging directory, and used as the result instead.
//!
//! The browser is shared infrastructure: teardown closes our page, disposes
//! our context and drops the connection, but never closes the browser
//! itself. Teardown also holds when the caller drops a visit mid-flight:
//! the handler task is aborted on drop, the websocket closes, and the
//! browser reaps the contexts of a disconnected client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::{
    BrowserContextId, DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::network::{self, EventResponseReceived, ResourceType};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::{Stream, StreamExt};
use reqwest::Client;
use tempfile::TempDir;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{BrowserConfig, FetchConfig};
use crate::error::FetchError;
use crate::fetch::{classify_text, Download, FetchOutcome, FetchResult, Fetcher, OCTET_STREAM};

/// Timeout for resolving the websocket URL from an http(s) endpoint.
const ENDPOINT_RESOLVE_SECS: u64 = 10;
/// Window for draining buffered document-response events after navigation.
const RESPONSE_DRAIN_MS: u64 = 750;

/// Fetch strategy that renders URLs through a managed browser.
pub struct BrowserFetcher {
    endpoint: String,
    navigation_timeout: Duration,
    download_timeout: Duration,
    max_body_bytes: usize,
    max_download_bytes: usize,
}

/// Owns the handler event loop task and aborts it on drop. The handler only
/// stops on a browser-level close or a websocket error, so if a caller
/// abandons a visit mid-flight this is what closes the websocket — and a
/// disconnect is what makes the browser reap our ephemeral context.
struct HandlerGuard(tokio::task::JoinHandle<()>);

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// What a single navigation produced.
#[derive(Debug)]
enum Visit {
    /// The page rendered; body is the serialized document (or its inner text
    /// for JSON documents wrapped in a viewer).
    Rendered {
        status: u16,
        content_type: String,
        body: String,
    },
    /// Navigation turned into a file download, buffered from staging.
    Downloaded {
        bytes: Vec<u8>,
        content_type: String,
        suggested_filename: Option<String>,
    },
}

impl BrowserFetcher {
    /// Create a new browser fetcher for the given DevTools endpoint.
    pub fn new(endpoint: impl Into<String>, browser: &BrowserConfig, fetch: &FetchConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            navigation_timeout: Duration::from_secs(browser.navigation_timeout_secs),
            download_timeout: Duration::from_secs(browser.download_timeout_secs),
            max_body_bytes: fetch.max_body_bytes,
            max_download_bytes: fetch.max_download_bytes,
        }
    }

    /// Resolve the configured endpoint to a websocket debugger URL. A
    /// `ws(s)://` endpoint is used as-is; an `http(s)://` endpoint is asked
    /// for its `/json/version` document.
    async fn resolve_ws_url(&self) -> FetchResult<String> {
        if self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://") {
            return Ok(self.endpoint.clone());
        }

        let version_url = format!("{}/json/version", self.endpoint.trim_end_matches('/'));
        let client = Client::builder()
            .timeout(Duration::from_secs(ENDPOINT_RESOLVE_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());

        let value: serde_json::Value = client
            .get(&version_url)
            .send()
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("query {version_url}: {e}")))?
            .json()
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("parse {version_url}: {e}")))?;

        value
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                FetchError::BrowserUnavailable(format!(
                    "{version_url} reported no webSocketDebuggerUrl"
                ))
            })
    }

    /// Connect, run one navigation in an ephemeral context, tear down.
    async fn visit(&self, url: &str) -> FetchResult<Visit> {
        let ws_url = self.resolve_ws_url().await?;
        let (browser, mut handler) = Browser::connect(ws_url.as_str())
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("connect to {ws_url}: {e}")))?;

        let handler_guard = HandlerGuard(tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        }));

        let result = self.with_context(&browser, url).await;

        // Shared, externally managed browser: drop our connection and stop
        // the event loop. Never issue a browser-level close here.
        drop(browser);
        drop(handler_guard);

        result
    }

    /// Create an ephemeral browser context, drive the page inside it, and
    /// dispose the context whatever happened.
    async fn with_context(&self, browser: &Browser, url: &str) -> FetchResult<Visit> {
        let created = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("create browser context: {e}")))?;
        let context_id = created.result.browser_context_id.clone();

        let result = self.drive_page(browser, context_id.clone(), url).await;

        if let Err(e) = browser
            .execute(DisposeBrowserContextParams::new(context_id))
            .await
        {
            warn!(error = %e, "failed to dispose ephemeral browser context");
        }

        result
    }

    /// Arm download interception, open a page in the context, navigate, and
    /// capture either the rendered document or the intercepted download.
    async fn drive_page(
        &self,
        browser: &Browser,
        context_id: BrowserContextId,
        url: &str,
    ) -> FetchResult<Visit> {
        let staging = TempDir::new()
            .map_err(|e| FetchError::Connection(format!("create download staging dir: {e}")))?;

        // Download handling must be armed before any navigation starts:
        // files are written under generated names into the staging dir and
        // will-begin/progress events are enabled for this context only.
        let behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::AllowAndName)
            .browser_context_id(context_id.clone())
            .download_path(staging.path().to_string_lossy().to_string())
            .events_enabled(true)
            .build()
            .map_err(FetchError::BrowserUnavailable)?;
        browser
            .execute(behavior)
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("set download behavior: {e}")))?;

        let mut will_begin = browser
            .event_listener::<EventDownloadWillBegin>()
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("listen for downloads: {e}")))?;
        let mut progress = browser
            .event_listener::<EventDownloadProgress>()
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("listen for downloads: {e}")))?;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id)
            .build()
            .map_err(FetchError::BrowserUnavailable)?;
        let page = browser
            .new_page(target)
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("create page: {e}")))?;

        let result = self
            .navigate(&page, &staging, &mut will_begin, &mut progress, url)
            .await;

        if let Err(e) = page.close().await {
            warn!(error = %e, "failed to close page");
        }

        result
    }

    /// Navigate and capture the outcome. A navigation abort is re-checked
    /// against the download listeners before it counts as a failure.
    async fn navigate<B, P>(
        &self,
        page: &Page,
        staging: &TempDir,
        will_begin: &mut B,
        progress: &mut P,
        url: &str,
    ) -> FetchResult<Visit>
    where
        B: Stream<Item = Arc<EventDownloadWillBegin>> + Unpin,
        P: Stream<Item = Arc<EventDownloadProgress>> + Unpin,
    {
        // The network domain supplies the document response's status and
        // MIME; subscribe before navigating so nothing is missed.
        page.execute(network::EnableParams::default())
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("enable network events: {e}")))?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| FetchError::BrowserUnavailable(format!("listen for responses: {e}")))?;

        let nav = timeout(self.navigation_timeout, async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            Ok::<(), CdpError>(())
        })
        .await;

        match nav {
            Ok(Ok(())) => self.capture_rendered(page, &mut responses).await,
            Ok(Err(e)) => {
                let detail = e.to_string();
                if detail.contains("ERR_ABORTED") {
                    // Chrome aborts the navigation command when it turns
                    // into a download; the download events tell the rest.
                    debug!(url, "navigation aborted; waiting for download events");
                    self.capture_download(staging, will_begin, progress, &mut responses)
                        .await
                } else {
                    Err(FetchError::Connection(format!("navigation failed: {detail}")))
                }
            }
            Err(_) => Err(FetchError::Connection(format!(
                "navigation timed out after {}s",
                self.navigation_timeout.as_secs()
            ))),
        }
    }

    /// Capture a rendered page: status and MIME from the last buffered
    /// document response, body from the DOM.
    async fn capture_rendered<R>(&self, page: &Page, responses: &mut R) -> FetchResult<Visit>
    where
        R: Stream<Item = Arc<EventResponseReceived>> + Unpin,
    {
        let mut status: u16 = 200;
        let mut content_type = "text/html".to_string();

        // With a redirect chain there is one document response per hop; the
        // last one describes what actually rendered.
        let drain_deadline = tokio::time::Instant::now() + Duration::from_millis(RESPONSE_DRAIN_MS);
        loop {
            match tokio::time::timeout_at(drain_deadline, responses.next()).await {
                Ok(Some(event)) if event.r#type == ResourceType::Document => {
                    status = event.response.status as u16;
                    content_type = event.response.mime_type.clone();
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }

        let body = if content_type.contains("application/json") {
            // Chrome wraps raw JSON in a viewer document; the inner text is
            // the original payload.
            page.evaluate("document.body ? document.body.innerText : ''")
                .await
                .map_err(|e| FetchError::Connection(format!("read document text: {e}")))?
                .into_value::<String>()
                .map_err(|e| FetchError::Connection(format!("decode document text: {e}")))?
        } else {
            page.content()
                .await
                .map_err(|e| FetchError::Connection(format!("serialize document: {e}")))?
        };

        debug!(
            status,
            content_type,
            bytes = body.len(),
            "browser navigation rendered"
        );
        Ok(Visit::Rendered {
            status,
            content_type,
            body,
        })
    }

    /// Wait out the will-begin/progress event pair and read the completed
    /// file from the staging directory.
    async fn capture_download<B, P, R>(
        &self,
        staging: &TempDir,
        will_begin: &mut B,
        progress: &mut P,
        responses: &mut R,
    ) -> FetchResult<Visit>
    where
        B: Stream<Item = Arc<EventDownloadWillBegin>> + Unpin,
        P: Stream<Item = Arc<EventDownloadProgress>> + Unpin,
        R: Stream<Item = Arc<EventResponseReceived>> + Unpin,
    {
        let wait_secs = self.download_timeout.as_secs();
        let begin = timeout(self.download_timeout, will_begin.next())
            .await
            .map_err(|_| FetchError::NoBody(format!("no download began within {wait_secs}s")))?
            .ok_or_else(|| FetchError::NoBody("download event stream closed".to_string()))?;

        let guid = begin.guid.clone();
        let suggested_filename = if begin.suggested_filename.is_empty() {
            None
        } else {
            Some(begin.suggested_filename.clone())
        };
        debug!(url = %begin.url, guid = %guid, "download intercepted");

        let deadline = tokio::time::Instant::now() + self.download_timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, progress.next())
                .await
                .map_err(|_| {
                    FetchError::NoBody(format!("download did not complete within {wait_secs}s"))
                })?
                .ok_or_else(|| {
                    FetchError::NoBody("download progress stream closed".to_string())
                })?;

            if event.guid != guid {
                continue;
            }
            match &event.state {
                DownloadProgressState::Completed => break,
                DownloadProgressState::Canceled => {
                    return Err(FetchError::NoBody("download canceled by browser".to_string()));
                }
                DownloadProgressState::InProgress => continue,
            }
        }

        // AllowAndName stores the file under its GUID in the staging dir.
        let path = staging.path().join(&guid);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FetchError::NoBody(format!("downloaded file unreadable: {e}")))?;
        if bytes.len() > self.max_download_bytes {
            return Err(FetchError::TooLarge {
                limit: self.max_download_bytes,
            });
        }

        // Chrome usually reported the aborted document response before the
        // download began; its MIME is the payload's real content type.
        let mut content_type = String::new();
        let drain_deadline = tokio::time::Instant::now() + Duration::from_millis(RESPONSE_DRAIN_MS);
        loop {
            match tokio::time::timeout_at(drain_deadline, responses.next()).await {
                Ok(Some(event)) if event.r#type == ResourceType::Document => {
                    content_type = event.response.mime_type.clone();
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        if content_type.is_empty() {
            content_type = OCTET_STREAM.to_string();
        }

        debug!(
            guid = %guid,
            bytes = bytes.len(),
            content_type,
            hint = suggested_filename.as_deref().unwrap_or("-"),
            "download buffered"
        );
        Ok(Visit::Downloaded {
            bytes,
            content_type,
            suggested_filename,
        })
    }
}

#[async_trait]
impl Fetcher for BrowserFetcher {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn fetch(&self, url: &str) -> FetchResult<FetchOutcome> {
        let visit = self.visit(url).await?;
        Ok(outcome_from_visit(visit, self.max_body_bytes))
    }

    async fn download(&self, url: &str) -> FetchResult<Download> {
        let visit = self.visit(url).await?;
        download_from_visit(visit)
    }
}

/// Map a navigation outcome onto the script-facing fetch classification.
fn outcome_from_visit(visit: Visit, max_body_bytes: usize) -> FetchOutcome {
    match visit {
        Visit::Rendered {
            status,
            content_type,
            mut body,
        } => {
            if !(200..300).contains(&status) {
                return FetchOutcome::HttpError { status };
            }
            truncate_utf8(&mut body, max_body_bytes);
            classify_text(&content_type, &body)
        }
        Visit::Downloaded {
            bytes,
            content_type,
            ..
        } => {
            // Navigation became a download; scripts still get a classified
            // outcome built from the buffered bytes.
            let slice = &bytes[..bytes.len().min(max_body_bytes)];
            let text = String::from_utf8_lossy(slice);
            classify_text(&content_type, &text)
        }
    }
}

/// Map a navigation outcome onto the download path, where a non-success
/// status is a failure.
fn download_from_visit(visit: Visit) -> FetchResult<Download> {
    match visit {
        Visit::Rendered {
            status,
            content_type,
            body,
        } => {
            if !(200..300).contains(&status) {
                return Err(FetchError::Status(status));
            }
            Ok(Download {
                bytes: body.into_bytes(),
                content_type,
                hinted_filename: None,
            })
        }
        Visit::Downloaded {
            bytes,
            content_type,
            suggested_filename,
        } => Ok(Download {
            bytes,
            content_type,
            hinted_filename: suggested_filename,
        }),
    }
}

/// Truncate a string to at most `max` bytes without splitting a character.
fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}
