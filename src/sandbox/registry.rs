//! Capability surface installed into every script context.
//!
//! Host functions are registered under private `__`-prefixed names, then a
//! bootstrap script wraps them into the public `fetch_data`, `parse_html`
//! and `console` bindings, deletes the private names, freezes the wrappers,
//! and strips the interpreter's dynamic code-generation escape hatches
//! (`eval`, the `Function` constructor and its async/generator variants).
//! Scripts get no filesystem, process, environment, or network access beyond
//! what is wired up here.

use std::sync::Arc;

use rquickjs::function::Async;
use rquickjs::{Ctx, Exception, Function};
use tracing::{debug, warn};

use crate::fetch::Fetcher;
use crate::sandbox::html;

// ============================================================================
// Bootstrap
// ============================================================================

/// Turns the raw host functions into the public capability surface, then
/// removes everything a script could use to break out of it.
const BOOTSTRAP: &str = r#"
(() => {
    const rawFetch = globalThis.__fetch_data;
    const rawSelect = globalThis.__html_select;
    const rawText = globalThis.__html_text;
    const rawLog = globalThis.__log;
    delete globalThis.__fetch_data;
    delete globalThis.__html_select;
    delete globalThis.__html_text;
    delete globalThis.__log;

    globalThis.fetch_data = async (url) => {
        const outcome = JSON.parse(await rawFetch(String(url)));
        if (outcome.kind === "failure") {
            throw new Error(outcome.message);
        }
        return outcome;
    };

    globalThis.parse_html = (html) => {
        const source = String(html);
        return Object.freeze({
            select: (selector) => JSON.parse(rawSelect(source, String(selector))),
            text: () => rawText(source),
        });
    };

    const render = (value) =>
        typeof value === "string" ? value : JSON.stringify(value);
    const emit = (level) => (...args) =>
        rawLog(level, args.map(render).join(" "));
    globalThis.console = Object.freeze({
        log: emit("log"),
        error: emit("error"),
    });
    globalThis.log = globalThis.console.log;

    Object.freeze(globalThis.fetch_data);
    Object.freeze(globalThis.parse_html);
    Object.freeze(globalThis.log);

    const hidden = [
        Function,
        (async () => {}).constructor,
        (function* () {}).constructor,
        (async function* () {}).constructor,
    ];
    for (const ctor of hidden) {
        Object.defineProperty(ctor.prototype, "constructor", {
            value: undefined,
            writable: false,
            configurable: false,
        });
    }
    delete globalThis.Function;
    delete globalThis.eval;
})();
"#;

// ============================================================================
// Registry
// ============================================================================

/// Fixed set of host functions exposed to scripts. One registry serves every
/// invocation; the bindings it installs are identical each time.
pub struct CapabilityRegistry {
    fetcher: Arc<dyn Fetcher>,
}

impl CapabilityRegistry {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    /// The fetch strategy backing `fetch_data`. The download path reuses it
    /// so a resolved URL is retrieved the same way the script saw the web.
    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        self.fetcher.clone()
    }

    /// Install the capability bindings into a fresh context and run the
    /// bootstrap that locks the surface down.
    pub fn install(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let globals = ctx.globals();

        let fetcher = self.fetcher.clone();
        let fetch_fn = Function::new(
            ctx.clone(),
            Async(move |url: String| {
                let fetcher = fetcher.clone();
                async move { fetch_envelope(fetcher, url).await }
            }),
        )?;
        globals.set("__fetch_data", fetch_fn)?;

        let select_fn = Function::new(
            ctx.clone(),
            |ctx: Ctx<'_>, source: String, selector: String| -> rquickjs::Result<String> {
                html::select(&source, &selector)
                    .map_err(|message| Exception::throw_message(&ctx, &message))
            },
        )?;
        globals.set("__html_select", select_fn)?;

        let text_fn = Function::new(ctx.clone(), |source: String| html::text(&source))?;
        globals.set("__html_text", text_fn)?;

        let log_fn = Function::new(ctx.clone(), |level: String, message: String| {
            if level == "error" {
                warn!(target: "sandbox", "script: {message}");
            } else {
                debug!(target: "sandbox", "script: {message}");
            }
        })?;
        globals.set("__log", log_fn)?;

        ctx.eval::<(), _>(BOOTSTRAP)?;
        Ok(())
    }
}

/// Run a fetch on behalf of a script and serialize the result envelope.
/// Transport failures become a `failure` envelope so the bootstrap wrapper
/// can rethrow them inside the interpreter instead of unwinding the host.
async fn fetch_envelope(fetcher: Arc<dyn Fetcher>, url: String) -> String {
    match fetcher.fetch(&url).await {
        Ok(outcome) => {
            debug!(target: "sandbox", url = %url, kind = outcome.kind(), "fetch_data");
            serde_json::to_string(&outcome).unwrap_or_else(|e| {
                serde_json::json!({
                    "kind": "failure",
                    "message": format!("serialize fetch outcome: {e}"),
                })
                .to_string()
            })
        }
        Err(e) => {
            debug!(target: "sandbox", url = %url, error = %e, "fetch_data failed");
            serde_json::json!({ "kind": "failure", "message": e.to_string() }).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::{FetchOutcome, MockFetcher};
    use rquickjs::{async_with, AsyncContext, AsyncRuntime, Promise};

    async fn sandbox_eval_bool(expr: &'static str) -> bool {
        let registry = CapabilityRegistry::new(Arc::new(MockFetcher::new()));
        let rt = AsyncRuntime::new().unwrap();
        let ctx = AsyncContext::full(&rt).await.unwrap();
        ctx.with(|ctx| {
            registry.install(&ctx).unwrap();
            ctx.eval::<bool, _>(expr).unwrap()
        })
        .await
    }

    async fn sandbox_eval_string(expr: &'static str) -> String {
        let registry = CapabilityRegistry::new(Arc::new(MockFetcher::new()));
        let rt = AsyncRuntime::new().unwrap();
        let ctx = AsyncContext::full(&rt).await.unwrap();
        ctx.with(|ctx| {
            registry.install(&ctx).unwrap();
            ctx.eval::<String, _>(expr).unwrap()
        })
        .await
    }

    async fn sandbox_await_string(fetcher: Arc<dyn Fetcher>, expr: &'static str) -> String {
        let registry = CapabilityRegistry::new(fetcher);
        let rt = AsyncRuntime::new().unwrap();
        let ctx = AsyncContext::full(&rt).await.unwrap();
        async_with!(ctx => |ctx| {
            registry.install(&ctx).unwrap();
            let promise: Promise = ctx.eval(expr).unwrap();
            promise.into_future::<String>().await.unwrap()
        })
        .await
    }

    #[tokio::test]
    async fn test_install_removes_dynamic_code_generation() {
        assert!(
            sandbox_eval_bool(
                "typeof eval === 'undefined' && typeof Function === 'undefined'"
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_function_constructor_is_neutered() {
        let verdict = sandbox_eval_string(
            r#"
            (() => {
                try {
                    (function () {}).constructor("return 1")();
                    return "escaped";
                } catch (e) {
                    return "blocked";
                }
            })()
            "#,
        )
        .await;
        assert_eq!(verdict, "blocked");
    }

    #[tokio::test]
    async fn test_private_natives_are_removed() {
        assert!(
            sandbox_eval_bool(
                "typeof __fetch_data === 'undefined' \
                 && typeof __html_select === 'undefined' \
                 && typeof __html_text === 'undefined' \
                 && typeof __log === 'undefined'"
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_capability_bindings_are_frozen() {
        assert!(
            sandbox_eval_bool(
                "Object.isFrozen(fetch_data) \
                 && Object.isFrozen(parse_html) \
                 && Object.isFrozen(console)"
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_parse_html_select_reads_attributes() {
        let href = sandbox_eval_string(
            r#"parse_html("<a href='/x.zip'>Go</a>").select("a")[0].attributes.href"#,
        )
        .await;
        assert_eq!(href, "/x.zip");
    }

    #[tokio::test]
    async fn test_parse_html_invalid_selector_throws_in_script() {
        let verdict = sandbox_eval_string(
            r#"
            (() => {
                try {
                    parse_html("<p>x</p>").select(":::nope");
                    return "no error";
                } catch (e) {
                    return e.message;
                }
            })()
            "#,
        )
        .await;
        assert!(verdict.contains("invalid selector"), "got: {verdict}");
    }

    #[tokio::test]
    async fn test_fetch_data_returns_structured_outcome() {
        let mut mock = MockFetcher::new();
        mock.expect_fetch().returning(|_| {
            Ok(FetchOutcome::Structured {
                body: serde_json::json!({ "answer": 42 }),
            })
        });
        let got = sandbox_await_string(
            Arc::new(mock),
            "fetch_data('http://api.test/info').then(o => o.kind + ':' + o.body.answer)",
        )
        .await;
        assert_eq!(got, "structured:42");
    }

    #[tokio::test]
    async fn test_fetch_data_http_error_is_a_value_not_a_throw() {
        let mut mock = MockFetcher::new();
        mock.expect_fetch()
            .returning(|_| Ok(FetchOutcome::HttpError { status: 404 }));
        let got = sandbox_await_string(
            Arc::new(mock),
            "fetch_data('http://api.test/missing').then(o => o.kind + ':' + o.status)",
        )
        .await;
        assert_eq!(got, "http_error:404");
    }

    #[tokio::test]
    async fn test_fetch_data_transport_failure_throws_in_script() {
        let mut mock = MockFetcher::new();
        mock.expect_fetch()
            .returning(|_| Err(FetchError::Connection("connection refused".to_string())));
        let got = sandbox_await_string(
            Arc::new(mock),
            "fetch_data('http://down.test/').then(() => 'ok', e => 'caught: ' + e.message)",
        )
        .await;
        assert!(got.starts_with("caught:"), "got: {got}");
        assert!(got.contains("connection refused"), "got: {got}");
    }
}
