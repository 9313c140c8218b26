//! Configuration for keyport
//!
//! All settings live in one serde struct with sensible defaults, loadable
//! from a JSON file and overridable through `KEYPORT_*` environment
//! variables. `.env` files are honored when loading from the environment.
//!
//! The one setting that changes pipeline behavior is `browser.endpoint`:
//! when present, every fetch in the process goes through the managed browser;
//! when absent, the direct HTTP strategy is used.

use crate::error::{KeyportError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Direct fetch strategy settings (timeouts, byte ceilings).
    pub fetch: FetchConfig,
    /// Managed browser endpoint and navigation limits.
    pub browser: BrowserConfig,
    /// Script engine limits.
    pub script: ScriptConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

// ============================================================================
// Fetch Configuration
// ============================================================================

/// Settings for HTTP fetches performed on behalf of scripts and for the
/// download path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Ceiling on bytes read from a script-visible fetch response.
    pub max_body_bytes: usize,
    /// Ceiling on bytes buffered for a download payload.
    pub max_download_bytes: usize,
    /// User-Agent header sent with direct fetches.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_body_bytes: 2 * 1024 * 1024,
            max_download_bytes: 64 * 1024 * 1024,
            user_agent: format!("keyport/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// ============================================================================
// Browser Configuration
// ============================================================================

/// Managed browser settings for the browser fetch strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// DevTools endpoint of the already-running browser. Accepts a
    /// `ws://.../devtools/browser/<id>` URL directly, or an `http(s)://`
    /// address whose `/json/version` handler reveals the websocket URL.
    /// `None` selects the direct fetch strategy for the whole process.
    pub endpoint: Option<String>,
    /// Seconds to wait for a navigation to settle.
    pub navigation_timeout_secs: u64,
    /// Seconds to wait for an intercepted download to complete.
    pub download_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            navigation_timeout_secs: 30,
            download_timeout_secs: 60,
        }
    }
}

// ============================================================================
// Script Configuration
// ============================================================================

/// Script engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Wall-clock deadline in seconds covering script evaluation and the
    /// `main()` invocation, enforced through the interpreter's interrupt
    /// handler.
    pub timeout_secs: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact single-line text output.
    Compact,
    /// Structured JSON lines for log aggregators.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter level when `RUST_LOG` is unset (e.g. `info`,
    /// `keyport=debug`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Build a configuration from defaults plus environment overrides only.
    /// `.env` files in the working directory are honored.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file with environment overrides.
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                KeyportError::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                KeyportError::Config(format!("failed to parse {}: {e}", path.display()))
            })?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides using the pattern
    /// `KEYPORT_SECTION_KEY`.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("KEYPORT_BROWSER_ENDPOINT") {
            self.browser.endpoint = if val.is_empty() { None } else { Some(val) };
        }
        if let Ok(val) = std::env::var("KEYPORT_BROWSER_NAVIGATION_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.browser.navigation_timeout_secs = v;
            }
        }
        if let Ok(val) = std::env::var("KEYPORT_BROWSER_DOWNLOAD_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.browser.download_timeout_secs = v;
            }
        }

        if let Ok(val) = std::env::var("KEYPORT_FETCH_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.fetch.timeout_secs = v;
            }
        }
        if let Ok(val) = std::env::var("KEYPORT_FETCH_MAX_BODY_BYTES") {
            if let Ok(v) = val.parse() {
                self.fetch.max_body_bytes = v;
            }
        }
        if let Ok(val) = std::env::var("KEYPORT_FETCH_MAX_DOWNLOAD_BYTES") {
            if let Ok(v) = val.parse() {
                self.fetch.max_download_bytes = v;
            }
        }
        if let Ok(val) = std::env::var("KEYPORT_FETCH_USER_AGENT") {
            self.fetch.user_agent = val;
        }

        if let Ok(val) = std::env::var("KEYPORT_SCRIPT_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.script.timeout_secs = v;
            }
        }

        if let Ok(val) = std::env::var("KEYPORT_LOGGING_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("KEYPORT_LOGGING_FORMAT") {
            if let Ok(v) = serde_json::from_value(serde_json::Value::String(val)) {
                self.logging.format = v;
            }
        }
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.fetch.timeout_secs == 0 {
            return Err(KeyportError::Config(
                "fetch.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.script.timeout_secs == 0 {
            return Err(KeyportError::Config(
                "script.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.fetch.max_body_bytes == 0 || self.fetch.max_download_bytes == 0 {
            return Err(KeyportError::Config(
                "fetch byte ceilings must be greater than zero".to_string(),
            ));
        }
        if let Some(endpoint) = &self.browser.endpoint {
            let ok = endpoint.starts_with("ws://")
                || endpoint.starts_with("wss://")
                || endpoint.starts_with("http://")
                || endpoint.starts_with("https://");
            if !ok {
                return Err(KeyportError::Config(format!(
                    "browser.endpoint must be a ws(s):// or http(s):// address, got '{endpoint}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serializes the tests that mutate process environment variables.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert!(cfg.browser.endpoint.is_none());
        assert_eq!(cfg.fetch.timeout_secs, 30);
        assert_eq!(cfg.script.timeout_secs, 30);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Compact);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"script":{"timeout_secs":5}}"#).unwrap();
        assert_eq!(cfg.script.timeout_secs, 5);
        assert_eq!(cfg.fetch.timeout_secs, 30);
        assert!(cfg.browser.endpoint.is_none());
    }

    #[test]
    fn test_browser_endpoint_from_file() {
        let cfg: Config =
            serde_json::from_str(r#"{"browser":{"endpoint":"http://127.0.0.1:9222"}}"#).unwrap();
        assert_eq!(
            cfg.browser.endpoint.as_deref(),
            Some("http://127.0.0.1:9222")
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_log_format_deserialize() {
        let cfg: LoggingConfig = serde_json::from_str(r#"{"format":"json"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, "info");
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut cfg = Config::default();
        cfg.script.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_endpoint_scheme() {
        let mut cfg = Config::default();
        cfg.browser.endpoint = Some("ftp://127.0.0.1:9222".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_override_endpoint() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("KEYPORT_BROWSER_ENDPOINT", "ws://127.0.0.1:9222/devtools");
        let cfg = Config::from_env().unwrap();
        std::env::remove_var("KEYPORT_BROWSER_ENDPOINT");
        assert_eq!(
            cfg.browser.endpoint.as_deref(),
            Some("ws://127.0.0.1:9222/devtools")
        );
    }

    #[test]
    fn test_env_override_numeric() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("KEYPORT_SCRIPT_TIMEOUT_SECS", "7");
        let cfg = Config::from_env().unwrap();
        std::env::remove_var("KEYPORT_SCRIPT_TIMEOUT_SECS");
        assert_eq!(cfg.script.timeout_secs, 7);
    }

    #[test]
    fn test_env_path_validates_like_the_file_path() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("KEYPORT_FETCH_TIMEOUT_SECS", "0");
        let result = Config::from_env();
        std::env::remove_var("KEYPORT_FETCH_TIMEOUT_SECS");
        assert!(
            matches!(result, Err(KeyportError::Config(_))),
            "got {result:?}"
        );
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let cfg = Config::load_from_path(Path::new("/nonexistent/keyport.json")).unwrap();
        assert_eq!(cfg.fetch.timeout_secs, 30);
    }
}
