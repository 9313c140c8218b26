//! Keyport - sandboxed script-to-URL resolution pipeline
//!
//! Operators register small untrusted scripts that each resolve a URL;
//! keyport runs them in capability-restricted interpreters and either hands
//! the URL back as a redirect target or retrieves its bytes as a named
//! download. Retrieval is pluggable: a plain HTTP client by default, or a
//! remote-controlled browser that renders pages and intercepts the
//! downloads they trigger.
//!
//! ```
//! use keyport::{Config, Resolver};
//!
//! let resolver = Resolver::from_config(&Config::default());
//! let url = tokio_test::block_on(
//!     resolver.resolve_redirect("function main() { return 'https://example.com/latest'; }"),
//! )
//! .unwrap();
//! assert_eq!(url, "https://example.com/latest");
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod resolve;
pub mod sandbox;
pub mod store;
pub mod validate;

pub use config::Config;
pub use error::{FetchError, KeyportError, Result};
pub use fetch::{fetcher_from_config, Download, FetchOutcome, Fetcher};
pub use resolve::{DownloadPayload, Resolver};
pub use sandbox::{CapabilityRegistry, ScriptEngine};
pub use store::{generate_key, MemoryScriptStore, ScriptRecord, ScriptStore};
