//! Error types for keyport
//!
//! The resolution pipeline reports failures through one typed taxonomy so an
//! embedding application can map each class onto its own HTTP or UI surface.
//! Messages are operator-grade diagnostics destined for logs, never end-user
//! copy.

use thiserror::Error;

/// Main error type for keyport operations.
#[derive(Error, Debug)]
pub enum KeyportError {
    /// The script source failed to parse.
    #[error("Script failed to compile: {0}")]
    Compile(String),

    /// The script evaluated cleanly but defines no callable `main`.
    #[error("Script defines no callable `main` entry point")]
    NoEntryPoint,

    /// The script threw during top-level evaluation or invocation, or its
    /// returned promise rejected.
    #[error("Script execution failed: {0}")]
    Execution(String),

    /// The script settled with something other than a valid URL string.
    #[error("Script result is not a resolvable URL: {0}")]
    InvalidResult(String),

    /// The execution deadline elapsed before the script settled.
    #[error("Script exceeded the {seconds}s execution deadline")]
    Timeout {
        /// Configured deadline that was exceeded.
        seconds: u64,
    },

    /// Fetching the resolved URL failed on the download path.
    #[error("Fetch failed: {0}")]
    Fetch(FetchError),

    /// Neither the direct response nor a triggered download produced bytes.
    #[error("Resolved URL produced neither a response body nor a download")]
    UnresolvableDownload,

    /// The configured fetch capability could not be provided (for example the
    /// managed browser endpoint refused the connection).
    #[error("Fetch capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Configuration loading or validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal engine failure: runtime construction, lost worker thread.
    #[error("Script engine failure: {0}")]
    Engine(String),
}

/// Result type alias for keyport operations.
pub type Result<T> = std::result::Result<T, KeyportError>;

/// Failure classes for fetch operations.
///
/// A non-success HTTP status is only an error on the download path; the
/// script-facing fetch capability hands scripts an `HttpError` *value*
/// instead, keeping the status-vs-transport distinction first-class.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The server answered with a non-success status.
    #[error("request failed with status {0}")]
    Status(u16),

    /// Transport-level failure: DNS, connect, TLS, timeout, protocol.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The managed browser endpoint could not be reached or refused us.
    #[error("browser endpoint unavailable: {0}")]
    BrowserUnavailable(String),

    /// Browser navigation produced neither a renderable body nor a download.
    #[error("navigation produced neither a body nor a download: {0}")]
    NoBody(String),

    /// The payload exceeded the configured byte ceiling.
    #[error("payload exceeds the {limit} byte ceiling")]
    TooLarge {
        /// The ceiling that was exceeded, in bytes.
        limit: usize,
    },
}

impl FetchError {
    /// HTTP status carried by this error, if the server answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Connection(err.to_string())
    }
}

impl From<FetchError> for KeyportError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::BrowserUnavailable(detail) => KeyportError::CapabilityUnavailable(detail),
            FetchError::NoBody(_) => KeyportError::UnresolvableDownload,
            other => KeyportError::Fetch(other),
        }
    }
}
