//! Script execution engine.
//!
//! Each invocation builds a fresh QuickJS runtime and context on a dedicated
//! OS thread with its own single-threaded tokio runtime; the result comes
//! back over a oneshot channel, which keeps the public API `async` and
//! `Send` while the interpreter handles never leave their thread. Nothing
//! survives between invocations: no warm contexts, no shared globals, no
//! state carried from one script to the next.
//!
//! An invocation walks four stages: evaluate the source, locate the `main`
//! entry point, invoke it (sync returns, async functions and sync throws all
//! normalize into one promise), and validate that the settled value is a
//! fetchable URL string.
//!
//! The entry point must be a property of the global object, so `function
//! main() {}`, `var main = ...` and bare `main = ...` all work; a top-level
//! `const`/`let` binding stays in the script's lexical environment and is
//! not found.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::{
    async_with, AsyncContext, AsyncRuntime, CatchResultExt, CaughtError, Ctx, Function, Promise,
    Value,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ScriptConfig;
use crate::error::{KeyportError, Result};
use crate::sandbox::registry::CapabilityRegistry;
use crate::validate::is_valid_url;

/// Global name scripts must bind their entry point to.
const ENTRY_POINT: &str = "main";

/// Wraps the entry point so that a synchronous return, a returned promise,
/// and a synchronous throw all surface through one promise.
const INVOKE_NORMALIZER: &str = "(entry) => Promise.resolve().then(() => entry())";

// ============================================================================
// Engine
// ============================================================================

/// Executes untrusted scripts in capability-restricted QuickJS contexts.
#[derive(Clone)]
pub struct ScriptEngine {
    registry: Arc<CapabilityRegistry>,
    timeout: Duration,
}

impl ScriptEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, cfg: &ScriptConfig) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    /// Run a script to a validated URL.
    pub async fn run(&self, script: &str) -> Result<String> {
        debug!(script_bytes = script.len(), "executing resolution script");

        let (tx, rx) = oneshot::channel();
        let registry = self.registry.clone();
        let limit = self.timeout;
        let source = script.to_string();

        std::thread::Builder::new()
            .name("keyport-script".to_string())
            .spawn(move || {
                let outcome = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(run_script(registry, &source, limit)),
                    Err(e) => Err(KeyportError::Engine(format!("script runtime: {e}"))),
                };
                if tx.send(outcome).is_err() {
                    warn!("script result receiver dropped before completion");
                }
            })
            .map_err(|e| KeyportError::Engine(format!("spawn script thread: {e}")))?;

        rx.await
            .map_err(|_| KeyportError::Engine("script thread terminated unexpectedly".to_string()))?
    }
}

/// Drive one invocation on the engine thread.
async fn run_script(
    registry: Arc<CapabilityRegistry>,
    source: &str,
    limit: Duration,
) -> Result<String> {
    let runtime = AsyncRuntime::new()
        .map_err(|e| KeyportError::Engine(format!("create script runtime: {e}")))?;

    // The interrupt handler is polled from inside the interpreter, so it
    // reaches busy loops that never yield to the async timeout below.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let started = Instant::now();
    runtime
        .set_interrupt_handler(Some(Box::new(move || {
            if started.elapsed() >= limit {
                flag.store(true, Ordering::Relaxed);
                true
            } else {
                false
            }
        })))
        .await;

    let context = AsyncContext::full(&runtime)
        .await
        .map_err(|e| KeyportError::Engine(format!("create script context: {e}")))?;

    let outcome = tokio::time::timeout(
        limit,
        async_with!(context => |ctx| {
            execute(&ctx, &registry, source).await
        }),
    )
    .await;

    match outcome {
        Ok(_) if interrupted.load(Ordering::Relaxed) => Err(KeyportError::Timeout {
            seconds: limit.as_secs(),
        }),
        Ok(result) => result,
        Err(_) => Err(KeyportError::Timeout {
            seconds: limit.as_secs(),
        }),
    }
}

/// The four stages of an invocation, inside the context lock.
async fn execute(ctx: &Ctx<'_>, registry: &CapabilityRegistry, source: &str) -> Result<String> {
    registry
        .install(ctx)
        .map_err(|e| KeyportError::Engine(format!("install capabilities: {e}")))?;

    // Stage 1: evaluate the script source.
    if let Err(caught) = ctx.eval::<(), _>(source).catch(ctx) {
        return Err(classify_load_error(caught));
    }

    // Stage 2: locate the entry point.
    let main_value: Value = ctx
        .globals()
        .get(ENTRY_POINT)
        .map_err(|e| KeyportError::Engine(format!("read entry point: {e}")))?;
    let Some(main_fn) = main_value.into_function() else {
        return Err(KeyportError::NoEntryPoint);
    };

    // Stage 3: invoke through the promise normalizer. The host-side eval is
    // unaffected by the bootstrap having removed the script-visible `eval`.
    let normalizer: Function = ctx
        .eval(INVOKE_NORMALIZER)
        .map_err(|e| KeyportError::Engine(format!("build invoker: {e}")))?;
    let promise: Promise = normalizer
        .call((main_fn,))
        .catch(ctx)
        .map_err(|caught| KeyportError::Execution(describe_caught(&caught)))?;
    let settled: Value = promise
        .into_future()
        .await
        .catch(ctx)
        .map_err(|caught| KeyportError::Execution(describe_caught(&caught)))?;

    // Stage 4: validate the settled value.
    let resolved = match settled.as_string() {
        Some(text) => text
            .to_string()
            .map_err(|e| KeyportError::Engine(format!("read result string: {e}")))?,
        None => {
            return Err(KeyportError::InvalidResult(format!(
                "expected a URL string, got {}",
                js_type_name(&settled)
            )))
        }
    };
    if !is_valid_url(&resolved) {
        return Err(KeyportError::InvalidResult(format!(
            "'{resolved}' is not a fetchable URL"
        )));
    }

    debug!(url = %resolved, "script resolved a URL");
    Ok(resolved)
}

// ============================================================================
// Error shaping
// ============================================================================

fn classify_load_error(caught: CaughtError<'_>) -> KeyportError {
    if let CaughtError::Exception(exception) = &caught {
        let name: Option<String> = exception.get("name").ok();
        if name.as_deref() == Some("SyntaxError") {
            return KeyportError::Compile(describe_caught(&caught));
        }
    }
    KeyportError::Execution(describe_caught(&caught))
}

fn describe_caught(caught: &CaughtError<'_>) -> String {
    match caught {
        CaughtError::Exception(exception) => {
            let message = exception
                .message()
                .unwrap_or_else(|| "unknown error".to_string());
            match exception.stack() {
                Some(stack) if !stack.is_empty() => format!("{message}\n{stack}"),
                _ => message,
            }
        }
        CaughtError::Value(value) => match value.as_string().and_then(|s| s.to_string().ok()) {
            Some(text) => format!("script threw: {text}"),
            None => format!("script threw a {}", js_type_name(value)),
        },
        CaughtError::Error(e) => format!("interpreter failure: {e}"),
    }
}

fn js_type_name(value: &Value<'_>) -> &'static str {
    if value.is_undefined() {
        "undefined"
    } else if value.is_null() {
        "null"
    } else if value.is_bool() {
        "boolean"
    } else if value.is_int() || value.is_float() {
        "number"
    } else if value.is_string() {
        "string"
    } else if value.is_function() {
        "function"
    } else if value.is_array() {
        "array"
    } else if value.is_object() {
        "object"
    } else {
        "value"
    }
}
