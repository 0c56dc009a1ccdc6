//! Per-rule Lua execution context.
//!
//! A [`SandboxContext`] owns one Lua VM, the rule's `rule` table and the
//! services its host APIs use. It lives exactly as long as the
//! [`RuleDefinition`](crate::rule::RuleDefinition) built from it.
//!
//! Lua only ever runs on blocking threads. [`SandboxContext::with_lua`]
//! moves a closure onto one; [`SandboxContext::with_lua_until`] does the
//! same under a wall-clock deadline, enforced both by an instruction hook
//! inside the VM and by a `tokio` timeout around the blocking task.
//!
//! [`ContextFork`] gives each call its own variable scope layered over the
//! shared rule table.

use mlua::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::lua_runtime::{json_value_to_lua, register_all_host_apis, HostServices};
use crate::models::Env;

/// How a sandboxed run failed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SandboxError {
    /// The execution budget ran out.
    Timeout,
    /// The script raised, or did not produce what was expected of it.
    Script(String),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Timeout => write!(f, "execution budget exceeded"),
            SandboxError::Script(msg) => f.write_str(msg),
        }
    }
}

const PAUSE_SLICE: Duration = Duration::from_millis(5);

/// Wall-clock deadline checked from the VM's instruction hook.
#[derive(Debug, Default)]
pub(crate) struct ExecutionBudget {
    deadline: Mutex<Option<Instant>>,
    cancelled: AtomicBool,
    expired: AtomicBool,
}

impl ExecutionBudget {
    pub fn arm(&self, deadline: Instant) {
        if let Ok(mut slot) = self.deadline.lock() {
            *slot = Some(deadline);
        }
        self.cancelled.store(false, Ordering::SeqCst);
        self.expired.store(false, Ordering::SeqCst);
    }

    /// Remove the deadline. Later calls run unbounded.
    pub fn disarm(&self) {
        if let Ok(mut slot) = self.deadline.lock() {
            *slot = None;
        }
    }

    /// Abort whatever is running at the next hook check.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the hook has aborted a run for this budget.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Fail with a budget error once the deadline has passed or the run was
    /// cancelled, marking the budget expired.
    pub fn check(&self) -> LuaResult<()> {
        if self.exhausted() {
            self.expired.store(true, Ordering::SeqCst);
            return Err(LuaError::RuntimeError(
                "execution budget exceeded".to_string(),
            ));
        }
        Ok(())
    }

    /// Block for `duration` in short slices, failing as soon as the budget
    /// runs out.
    pub fn pause(&self, duration: Duration) -> LuaResult<()> {
        let until = Instant::now().checked_add(duration);
        loop {
            self.check()?;
            let left = match until {
                Some(until) => until.saturating_duration_since(Instant::now()),
                None => PAUSE_SLICE,
            };
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(left.min(PAUSE_SLICE));
        }
    }

    fn exhausted(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.deadline.lock() {
            Ok(slot) => slot.is_some_and(|d| Instant::now() >= d),
            Err(_) => false,
        }
    }
}

pub(crate) struct SandboxContext {
    lua: Lua,
    rule: LuaTable,
    name: String,
    budget: Arc<ExecutionBudget>,
    services: HostServices,
}

impl SandboxContext {
    /// Create a fresh VM and execute `source` in it.
    ///
    /// Blocking; run it on a blocking thread. `budget` must already be
    /// armed. The source has to assign a global `rule` table.
    pub fn boot(
        name: &str,
        chunk_name: &str,
        source: &str,
        services: HostServices,
        env: &Env,
        budget: Arc<ExecutionBudget>,
    ) -> Result<Self, SandboxError> {
        let lua = Lua::new();

        let hook_budget = Arc::clone(&budget);
        lua.set_hook(
            mlua::HookTriggers::new().every_nth_instruction(10_000),
            move |_lua, _debug| hook_budget.check().map(|_| mlua::VmState::Continue),
        );

        let setup = register_all_host_apis(&lua, name, &services, &budget).and_then(|_| set_env(&lua, env));
        if let Err(e) = setup {
            return Err(SandboxError::Script(format!("sandbox setup failed: {}", e)));
        }

        if let Err(e) = lua.load(source).set_name(chunk_name).exec() {
            return Err(classify(&budget, e));
        }

        let rule = match lua.globals().get::<LuaValue>("rule") {
            Ok(LuaValue::Table(t)) => t,
            _ => {
                return Err(SandboxError::Script(
                    "script must define a global 'rule' table".to_string(),
                ))
            }
        };

        Ok(Self {
            lua,
            rule,
            name: name.to_string(),
            budget,
            services,
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// The shared, mutable `rule` table.
    pub fn rule(&self) -> &LuaTable {
        &self.rule
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn budget(&self) -> &ExecutionBudget {
        &self.budget
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    /// Replace the `ENV` global.
    pub fn set_env(&self, env: &Env) -> LuaResult<()> {
        set_env(&self.lua, env)
    }

    /// Run `f` against this context on a blocking thread.
    pub async fn with_lua<T, F>(self: &Arc<Self>, f: F) -> Result<T, SandboxError>
    where
        F: FnOnce(&SandboxContext) -> LuaResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let ctx = Arc::clone(self);
        match tokio::task::spawn_blocking(move || f(&ctx)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(&self.budget, e)),
            Err(join) => Err(SandboxError::Script(format!("sandbox task failed: {}", join))),
        }
    }

    /// Like [`with_lua`](Self::with_lua), but gives up at `deadline`.
    ///
    /// When the async timeout fires first the budget is cancelled, so the
    /// orphaned run stops at its next hook check.
    pub async fn with_lua_until<T, F>(
        self: &Arc<Self>,
        deadline: Instant,
        f: F,
    ) -> Result<T, SandboxError>
    where
        F: FnOnce(&SandboxContext) -> LuaResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.with_lua(f)).await {
            Ok(result) => result,
            Err(_) => {
                self.budget.cancel();
                Err(SandboxError::Timeout)
            }
        }
    }
}

fn set_env(lua: &Lua, env: &Env) -> LuaResult<()> {
    let value = serde_json::to_value(env).map_err(mlua::Error::external)?;
    lua.globals().set("ENV", json_value_to_lua(lua, &value)?)
}

/// Map a Lua error to a [`SandboxError`], using the budget to spot timeouts.
pub(crate) fn classify(budget: &ExecutionBudget, error: mlua::Error) -> SandboxError {
    if budget.is_expired() {
        SandboxError::Timeout
    } else {
        SandboxError::Script(error.to_string())
    }
}

/// A per-call view over the shared rule table.
///
/// Reads resolve from the call's own variables first, then from the shared
/// rule table. Writes always land in the shared table, so they are visible
/// to every later call on the same rule.
pub(crate) struct ContextFork<'a> {
    lua: &'a Lua,
    shared: LuaTable,
    vars: LuaTable,
    view: LuaTable,
}

impl<'a> ContextFork<'a> {
    pub fn new(
        ctx: &'a SandboxContext,
        vars: &serde_json::Map<String, serde_json::Value>,
    ) -> LuaResult<Self> {
        let lua = ctx.lua();
        let vars_table = lua.create_table()?;
        for (k, v) in vars {
            vars_table.raw_set(k.as_str(), json_value_to_lua(lua, v)?)?;
        }

        let meta = lua.create_table()?;
        let (local, shared) = (vars_table.clone(), ctx.rule().clone());
        meta.set(
            "__index",
            lua.create_function(move |_lua, (_view, key): (LuaValue, LuaValue)| {
                let value: LuaValue = local.raw_get(key.clone())?;
                if !value.is_nil() {
                    return Ok(value);
                }
                shared.get::<LuaValue>(key)
            })?,
        )?;
        let shared = ctx.rule().clone();
        meta.set(
            "__newindex",
            lua.create_function(
                move |_lua, (_view, key, value): (LuaValue, LuaValue, LuaValue)| {
                    shared.set(key, value)
                },
            )?,
        )?;

        let view = lua.create_table()?;
        view.set_metatable(Some(meta));

        Ok(Self {
            lua,
            shared: ctx.rule().clone(),
            vars: vars_table,
            view,
        })
    }

    /// Call `f(self, args...)`.
    pub fn call(&self, f: &LuaFunction, args: &[serde_json::Value]) -> LuaResult<LuaValue> {
        let values = args
            .iter()
            .map(|arg| json_value_to_lua(self.lua, arg))
            .collect::<LuaResult<Vec<_>>>()?;
        self.call_values(f, values)
    }

    /// Call `f(self, args...)` with arguments already in the VM.
    pub fn call_values(&self, f: &LuaFunction, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
        let mut values = Vec::with_capacity(args.len() + 1);
        values.push(LuaValue::Table(self.view.clone()));
        values.extend(args);
        f.call::<LuaValue>(LuaMultiValue::from_iter(values))
    }

    /// Evaluate a snippet body.
    ///
    /// Lookup order inside the snippet: call variables (and anything the
    /// snippet assigned), `self`, rule fields, then globals. Plain
    /// assignments stay local to the snippet. Returns the snippet's value
    /// together with its local scope.
    pub fn eval_snippet(&self, code: &str, chunk_name: &str) -> LuaResult<(LuaValue, LuaTable)> {
        let scope = self.lua.create_table()?;
        for pair in self.vars.pairs::<LuaValue, LuaValue>() {
            let (k, v) = pair?;
            scope.raw_set(k, v)?;
        }
        scope.raw_set("self", self.view.clone())?;

        let meta = self.lua.create_table()?;
        let (shared, globals) = (self.shared.clone(), self.lua.globals());
        meta.set(
            "__index",
            self.lua
                .create_function(move |_lua, (_scope, key): (LuaValue, LuaValue)| {
                    let value: LuaValue = shared.get(key.clone())?;
                    if !value.is_nil() {
                        return Ok(value);
                    }
                    globals.raw_get::<LuaValue>(key)
                })?,
        )?;
        scope.set_metatable(Some(meta));

        let value: LuaValue = self
            .lua
            .load(code)
            .set_name(chunk_name)
            .set_environment(scope.clone())
            .eval()?;
        Ok((value, scope))
    }
}

/// Strip the snippet marker, if `text` is a snippet.
pub(crate) fn snippet_body(text: &str) -> Option<&str> {
    text.trim_start().strip_prefix("lua:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fetch::{FetchRequest, FetchResponse, Fetcher};
    use crate::lua_runtime::{CookieJar, RequestDefaults};
    use serde_json::json;
    use std::sync::RwLock;

    struct NoNetwork;

    #[async_trait::async_trait]
    impl Fetcher for NoNetwork {
        async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<FetchResponse> {
            anyhow::bail!("no network for {}", request.url)
        }
    }

    fn services() -> HostServices {
        HostServices {
            fetcher: Arc::new(NoNetwork),
            handle: tokio::runtime::Handle::current(),
            cookies: Arc::new(CookieJar::default()),
            defaults: Arc::new(RwLock::new(RequestDefaults::default())),
            settings: Arc::new(Settings::default()),
        }
    }

    async fn boot(source: &'static str, budget: Duration) -> Result<Arc<SandboxContext>, SandboxError> {
        let services = services();
        let budget_handle = Arc::new(ExecutionBudget::default());
        budget_handle.arm(Instant::now() + budget);
        tokio::task::spawn_blocking(move || {
            SandboxContext::boot("t", "t.lua", source, services, &Env::default(), budget_handle)
        })
        .await
        .unwrap()
        .map(Arc::new)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_boot_requires_rule_table() {
        let err = boot("x = 1", Duration::from_secs(5)).await.err().unwrap();
        assert!(matches!(err, SandboxError::Script(ref m) if m.contains("'rule'")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runaway_script_times_out() {
        let err = boot("while true do end", Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert_eq!(err, SandboxError::Timeout);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fork_reads_vars_then_rule_and_writes_shared() {
        let ctx = boot(
            r#"rule = { title = "shared", peek = function(self) self.seen = self.input; return self.title end }"#,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        ctx.budget().disarm();

        let (returned, seen) = ctx
            .with_lua(|c| {
                let mut vars = serde_json::Map::new();
                vars.insert("input".to_string(), json!("https://a.com/1"));
                vars.insert("title".to_string(), json!("local"));
                let fork = ContextFork::new(c, &vars)?;
                let peek: LuaFunction = c.rule().get("peek")?;
                let returned: String = String::from_lua(fork.call(&peek, &[])?, c.lua())?;
                let seen: String = c.rule().get("seen")?;
                Ok((returned, seen))
            })
            .await
            .unwrap();
        assert_eq!(returned, "local");
        assert_eq!(seen, "https://a.com/1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_snippet_scope_is_local() {
        let ctx = boot(r#"rule = { host = "https://a.com" }"#, Duration::from_secs(5))
            .await
            .unwrap();
        ctx.budget().disarm();

        let (value, leaked) = ctx
            .with_lua(|c| {
                let mut vars = serde_json::Map::new();
                vars.insert("id".to_string(), json!("7"));
                let fork = ContextFork::new(c, &vars)?;
                let (_, scope) = fork.eval_snippet("result = host .. '/v/' .. id", "snippet")?;
                let value: String = scope.raw_get("result")?;
                let leaked: LuaValue = c.rule().get("result")?;
                Ok((value, leaked.is_nil()))
            })
            .await
            .unwrap();
        assert_eq!(value, "https://a.com/v/7");
        assert!(leaked);
    }

    #[test]
    fn test_pause_gives_up_at_deadline() {
        let budget = ExecutionBudget::default();
        budget.arm(Instant::now() + Duration::from_millis(30));
        let started = Instant::now();
        assert!(budget.pause(Duration::from_secs(3)).is_err());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(budget.is_expired());
    }

    #[test]
    fn test_pause_stops_when_cancelled() {
        let budget = Arc::new(ExecutionBudget::default());
        let sleeper = Arc::clone(&budget);
        let handle = std::thread::spawn(move || sleeper.pause(Duration::MAX));
        std::thread::sleep(Duration::from_millis(20));
        budget.cancel();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn test_pause_without_deadline_completes() {
        let budget = ExecutionBudget::default();
        assert!(budget.pause(Duration::from_millis(10)).is_ok());
        assert!(!budget.is_expired());
    }

    #[test]
    fn test_snippet_body() {
        assert_eq!(snippet_body("lua: return 1"), Some(" return 1"));
        assert_eq!(snippet_body(".item;.title"), None);
    }
}
