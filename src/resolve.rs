//! Resolution orchestrator.
//!
//! Ties the pipeline together: run a registered script to a URL, then either
//! hand the URL back as a redirect target or retrieve its bytes as a named
//! download. One fetch strategy backs both the script-visible `fetch_data`
//! capability and the download retrieval, so a script and the download path
//! see the same web.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::fetch::{fetcher_from_config, Fetcher};
use crate::sandbox::{CapabilityRegistry, ScriptEngine};

/// A retrieved payload plus the name it should be served under.
#[derive(Debug, Clone)]
pub struct DownloadPayload {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Always the caller-supplied name; any filename suggested by the source
    /// is logged and discarded.
    pub filename: String,
}

/// Runs scripts and acts on the URLs they resolve.
#[derive(Clone)]
pub struct Resolver {
    engine: ScriptEngine,
    fetcher: Arc<dyn Fetcher>,
}

impl Resolver {
    /// Build a resolver using the fetch strategy the configuration selects.
    pub fn from_config(cfg: &Config) -> Self {
        Self::with_fetcher(cfg, fetcher_from_config(cfg))
    }

    /// Build a resolver around an explicit fetch strategy.
    pub fn with_fetcher(cfg: &Config, fetcher: Arc<dyn Fetcher>) -> Self {
        let registry = Arc::new(CapabilityRegistry::new(fetcher.clone()));
        let engine = ScriptEngine::new(registry, &cfg.script);
        Self { engine, fetcher }
    }

    /// Run a script and return the URL it resolves, for use as a redirect
    /// target. The URL is not visited.
    pub async fn resolve_redirect(&self, script: &str) -> Result<String> {
        let url = self.engine.run(script).await?;
        info!(url = %url, "resolved redirect target");
        Ok(url)
    }

    /// Run a script, retrieve the URL it resolves, and return the bytes as a
    /// payload named `filename`.
    pub async fn resolve_download(&self, script: &str, filename: &str) -> Result<DownloadPayload> {
        let url = self.engine.run(script).await?;
        let download = self.fetcher.download(&url).await?;

        if let Some(hint) = download.hinted_filename.as_deref() {
            if hint != filename {
                debug!(hint = %hint, using = %filename, "ignoring source filename hint");
            }
        }
        info!(
            url = %url,
            bytes = download.bytes.len(),
            content_type = %download.content_type,
            filename = %filename,
            "resolved download"
        );

        Ok(DownloadPayload {
            bytes: download.bytes,
            content_type: download.content_type,
            filename: filename.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, KeyportError};
    use crate::fetch::{Download, MockFetcher};

    const SCRIPT: &str = "function main() { return 'http://files.test/pkg.zip'; }";

    fn resolver_with(mock: MockFetcher) -> Resolver {
        Resolver::with_fetcher(&Config::default(), Arc::new(mock))
    }

    #[tokio::test]
    async fn test_resolve_redirect_returns_script_url() {
        let url = resolver_with(MockFetcher::new())
            .resolve_redirect(SCRIPT)
            .await
            .unwrap();
        assert_eq!(url, "http://files.test/pkg.zip");
    }

    #[tokio::test]
    async fn test_resolve_download_fetches_the_resolved_url() {
        let mut mock = MockFetcher::new();
        mock.expect_download()
            .withf(|url| url == "http://files.test/pkg.zip")
            .returning(|_| {
                Ok(Download {
                    bytes: b"PKzip".to_vec(),
                    content_type: "application/zip".to_string(),
                    hinted_filename: Some("upstream-name.zip".to_string()),
                })
            });

        let payload = resolver_with(mock)
            .resolve_download(SCRIPT, "release.zip")
            .await
            .unwrap();
        assert_eq!(payload.bytes, b"PKzip");
        assert_eq!(payload.content_type, "application/zip");
        // The caller's name wins over the source's suggestion.
        assert_eq!(payload.filename, "release.zip");
    }

    #[tokio::test]
    async fn test_download_http_error_surfaces_as_fetch_failure() {
        let mut mock = MockFetcher::new();
        mock.expect_download()
            .returning(|_| Err(FetchError::Status(503)));

        let err = resolver_with(mock)
            .resolve_download(SCRIPT, "x.bin")
            .await
            .unwrap_err();
        assert!(
            matches!(err, KeyportError::Fetch(FetchError::Status(503))),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_download_without_body_is_unresolvable() {
        let mut mock = MockFetcher::new();
        mock.expect_download()
            .returning(|_| Err(FetchError::NoBody("no download event".to_string())));

        let err = resolver_with(mock)
            .resolve_download(SCRIPT, "x.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, KeyportError::UnresolvableDownload), "got {err:?}");
    }

    #[tokio::test]
    async fn test_browser_outage_is_capability_unavailable() {
        let mut mock = MockFetcher::new();
        mock.expect_download()
            .returning(|_| Err(FetchError::BrowserUnavailable("connect refused".to_string())));

        let err = resolver_with(mock)
            .resolve_download(SCRIPT, "x.bin")
            .await
            .unwrap_err();
        assert!(
            matches!(err, KeyportError::CapabilityUnavailable(_)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_script_failure_short_circuits_the_download() {
        // No download expectation: the fetcher must not be reached.
        let err = resolver_with(MockFetcher::new())
            .resolve_download("function main() { return 7; }", "x.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, KeyportError::InvalidResult(_)), "got {err:?}");
    }
}
