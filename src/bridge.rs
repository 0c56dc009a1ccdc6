//! The seam between the async engine and a rule's sandbox.
//!
//! [`SandboxBridge`] is built per call. It fetches pages on the rule's
//! behalf (honouring a rule-supplied `fetch` hook and the shared page
//! cache) and runs the rule's Lua code on a blocking thread, converting
//! values to and from JSON at the boundary.

use mlua::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::fetch::{FetchRequest, Fetcher};
use crate::lua_runtime::lua_value_to_json;
use crate::models::{Env, InvocationRequest};
use crate::page_cache::PageCache;
use crate::rule::{Operation, RuleDefinition};
use crate::sandbox::{ContextFork, SandboxError};

pub(crate) struct SandboxBridge {
    rule: Arc<RuleDefinition>,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<PageCache>,
    env: Env,
}

impl SandboxBridge {
    pub fn new(
        rule: Arc<RuleDefinition>,
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<PageCache>,
        env: Env,
    ) -> Self {
        Self {
            rule,
            fetcher,
            cache,
            env,
        }
    }

    pub fn rule(&self) -> &Arc<RuleDefinition> {
        &self.rule
    }

    /// Fetch `url` with the rule's request defaults.
    ///
    /// With a `cache_site`, the body is served from and stored in the page
    /// cache under the rule host's namespace. Failures are logged and
    /// yield an empty body.
    pub async fn fetch_page(&self, url: &str, cache_site: Option<&str>) -> String {
        let request = self
            .rule
            .context
            .services()
            .prepare(self.rule.page_request(url));

        let key = cache_site.map(|site| PageCache::key(&self.rule.cache_namespace(site), &request));
        if let Some(key) = &key {
            if let Some(body) = self.cache.get(key) {
                debug!(rule = %self.rule.name(), url = url, "page cache hit");
                return body;
            }
        }

        let body = match &self.rule.fetch_hook {
            Some(hook) => self.fetch_via_hook(hook.clone(), &request).await,
            None => self.fetch_direct(&request).await,
        };

        if let Some(key) = key {
            if !body.is_empty() {
                self.cache.set(&key, body.clone());
            }
        }
        body
    }

    async fn fetch_direct(&self, request: &FetchRequest) -> String {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.rule
                    .context
                    .services()
                    .cookies
                    .store_set_cookies(&request.url, response.header_values("set-cookie"));
                if !response.ok() {
                    warn!(
                        rule = %self.rule.name(),
                        url = %request.url,
                        status = response.status,
                        "page fetch returned non-success status"
                    );
                }
                response.body
            }
            Err(e) => {
                let err = EngineError::Fetch {
                    url: request.url.clone(),
                    reason: format!("{:#}", e),
                };
                warn!(rule = %self.rule.name(), error = %err, "page fetch failed");
                String::new()
            }
        }
    }

    /// Call the rule's `fetch(self, url, opts)` hook. It may return the
    /// body as a string or a table with a `body` field.
    async fn fetch_via_hook(&self, hook: LuaFunction, request: &FetchRequest) -> String {
        let url = request.url.clone();
        let opts = serde_json::json!({
            "method": request.method,
            "headers": request
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect::<serde_json::Map<_, _>>(),
            "encoding": request.encoding,
        });
        let env = self.env.clone();
        let result = self
            .rule
            .context
            .with_lua(move |ctx| {
                ctx.set_env(&env)?;
                let fork = ContextFork::new(ctx, &serde_json::Map::new())?;
                let value = fork.call(&hook, &[serde_json::Value::String(url), opts])?;
                Ok(match value {
                    LuaValue::String(s) => s.to_string_lossy(),
                    LuaValue::Table(t) => t.get::<Option<String>>("body")?.unwrap_or_default(),
                    _ => String::new(),
                })
            })
            .await;

        result.unwrap_or_else(|e| {
            warn!(rule = %self.rule.name(), url = %request.url, error = %e, "rule fetch hook failed");
            String::new()
        })
    }

    /// Run a native implementation as `f(self, args...)`.
    pub async fn call_native(
        &self,
        op: Operation,
        f: LuaFunction,
        request: InvocationRequest,
    ) -> EngineResult<serde_json::Value> {
        let env = self.env.clone();
        let result = self
            .rule
            .context
            .with_lua(move |ctx| {
                ctx.set_env(&env)?;
                let fork = ContextFork::new(ctx, &request.vars)?;
                let value = fork.call(&f, &request.args)?;
                lua_value_to_json(value)
            })
            .await;
        result.map_err(|e| self.script_error(op, e))
    }

    /// Evaluate a snippet. Its value is what it returns, else its `result`
    /// variable, else (for play) its `input` variable.
    pub async fn eval_snippet(
        &self,
        op: Operation,
        code: String,
        request: InvocationRequest,
    ) -> EngineResult<serde_json::Value> {
        let env = self.env.clone();
        let chunk = format!("{}:{}", self.rule.name(), op);
        let result = self
            .rule
            .context
            .with_lua(move |ctx| {
                ctx.set_env(&env)?;
                let fork = ContextFork::new(ctx, &request.vars)?;
                let (mut value, scope) = fork.eval_snippet(&code, &chunk)?;
                if value.is_nil() {
                    value = scope.raw_get("result")?;
                }
                if value.is_nil() && op == Operation::Play {
                    value = scope.raw_get("input")?;
                }
                lua_value_to_json(value)
            })
            .await;
        result.map_err(|e| self.script_error(op, e))
    }

    /// Call `f(self)` with `vars` as the call's variables. Used for the
    /// function-valued parts of a structured detail.
    pub async fn call_with_vars(
        &self,
        op: Operation,
        f: LuaFunction,
        vars: serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        self.call_native(op, f, InvocationRequest { args: Vec::new(), vars })
            .await
    }

    fn script_error(&self, op: Operation, e: SandboxError) -> EngineError {
        EngineError::script(self.rule.name(), op, e)
    }
}
