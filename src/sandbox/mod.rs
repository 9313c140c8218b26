//! Capability-restricted script sandbox.
//!
//! [`registry::CapabilityRegistry`] defines everything a script can touch;
//! [`engine::ScriptEngine`] runs scripts against it, one fresh interpreter
//! per invocation. Scripts interact with the outside world only through the
//! installed bindings — `fetch_data`, `parse_html`, and `console` — and must
//! hand back a URL string from their `main` entry point.

pub mod engine;
mod html;
pub mod registry;

pub use engine::ScriptEngine;
pub use registry::CapabilityRegistry;
