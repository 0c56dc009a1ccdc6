//! Rule loading and normalization.
//!
//! [`RuleLoader::load`] turns a rule file into a cached
//! [`RuleDefinition`]:
//!
//! 1. read the file and fingerprint it; an unchanged, cached definition is
//!    returned as is
//! 2. run the decoding chain ([`crate::decode`])
//! 3. execute the source in a fresh sandbox under the load budget
//! 4. apply template inheritance (`template`, `template_modify`, `auto`)
//! 5. normalize fields and write the defaults back into the `rule` table
//! 6. run the `host_resolver` and `init` hooks inside the remaining budget
//! 7. re-derive URL templates from the final host and snapshot everything
//!
//! Steps 3 to 7 share one wall-clock deadline. Overrunning it yields
//! [`EngineError::Timeout`].

use mlua::prelude::*;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{Config, DecodeConfig, Settings};
use crate::decode::{decode_source, DecodeStage};
use crate::error::{EngineError, EngineResult};
use crate::fetch::{FetchRequest, Fetcher};
use crate::interpreter::extract_classes;
use crate::lua_runtime::{
    json_value_to_lua, lua_value_to_json, CookieJar, HostServices, RequestDefaults,
};
use crate::models::{ClassItem, Env, RuleRef, RuleSource};
use crate::rule::{absolute_url, Implementation, Operation, RuleDefinition};
use crate::sandbox::{snippet_body, ContextFork, ExecutionBudget, SandboxContext, SandboxError};
use crate::templates::{TemplateFields, TemplateRegistry};

/// Category names hidden unless a rule says otherwise.
pub const DEFAULT_CATE_EXCLUDE: &str = "首页|留言|APP|下载|资讯|新闻|动态";
/// Source (tab) names hidden unless a rule says otherwise.
pub const DEFAULT_TAB_EXCLUDE: &str = "猜你|喜欢|下载|剧情|热播";
/// URLs matching this are treated as directly playable media.
pub const DEFAULT_MEDIA_PATTERN: &str =
    r"(?i)\.(m3u8|mp4|m4a|mp3|flv|avi|mkv|mov|wmv|webm|ts|aac)(\?|#|$)";

const URL_FIELDS: [&str; 4] = ["homeUrl", "url", "detailUrl", "searchUrl"];

type DefinitionKey = (PathBuf, String);

/// Values normalization falls back to when a rule declares nothing.
#[derive(Debug, Clone)]
struct NormalizeDefaults {
    timeout_ms: u64,
    user_agent: String,
    sniffer: bool,
}

/// Loads rules and owns the definition cache.
pub struct RuleLoader {
    definitions: RwLock<HashMap<DefinitionKey, Arc<RuleDefinition>>>,
    fetcher: Arc<dyn Fetcher>,
    templates: Arc<dyn TemplateRegistry>,
    settings: Arc<Settings>,
    decode: DecodeConfig,
    budget: Duration,
    defaults: NormalizeDefaults,
}

impl RuleLoader {
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        templates: Arc<dyn TemplateRegistry>,
    ) -> Self {
        let settings = Arc::new(Settings::new(config.settings.clone()));
        let defaults = NormalizeDefaults {
            timeout_ms: config.engine.request_timeout_ms,
            user_agent: config.engine.user_agent.clone(),
            sniffer: settings.flag("enable_sniffer"),
        };
        Self {
            definitions: RwLock::new(HashMap::new()),
            fetcher,
            templates,
            settings,
            decode: config.decode.clone(),
            budget: Duration::from_millis(config.engine.load_timeout_ms),
            defaults,
        }
    }

    /// Load `rule`, reusing the cached definition when its file is unchanged.
    pub async fn load(
        &self,
        rule: &RuleRef,
        env: &Env,
        force_refresh: bool,
    ) -> EngineResult<Arc<RuleDefinition>> {
        let source = RuleSource::read(&rule.path).map_err(|e| EngineError::load(&rule.path, e))?;
        let key: DefinitionKey = (rule.path.clone(), rule.ext.clone());

        if !force_refresh {
            if let Some(existing) = self.cached(&key) {
                if existing.fingerprint == source.fingerprint {
                    debug!(rule = %rule.display_name(), "reusing cached rule definition");
                    return Ok(existing);
                }
            }
        }

        let definition = Arc::new(self.build(rule, source, env).await?);
        if let Ok(mut definitions) = self.definitions.write() {
            definitions.insert(key, Arc::clone(&definition));
        }
        info!(
            rule = %definition.name(),
            host = %definition.host,
            cost_ms = definition.load_cost.as_millis() as u64,
            "rule loaded"
        );
        Ok(definition)
    }

    fn cached(&self, key: &DefinitionKey) -> Option<Arc<RuleDefinition>> {
        self.definitions.read().ok()?.get(key).cloned()
    }

    /// Drop every cached definition.
    pub fn clear(&self) {
        if let Ok(mut definitions) = self.definitions.write() {
            definitions.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.definitions.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn build(
        &self,
        rule: &RuleRef,
        source: RuleSource,
        env: &Env,
    ) -> EngineResult<RuleDefinition> {
        let name = rule.display_name();
        let started = Instant::now();
        let deadline = started + self.budget;

        let (text, stage) = decode_source(&source.text, &self.decode)
            .map_err(|e| EngineError::load(&rule.path, format!("{:#}", e)))?;
        if stage != DecodeStage::Plain {
            debug!(rule = %name, stage = ?stage, "decoded rule source");
        }

        let services = HostServices {
            fetcher: Arc::clone(&self.fetcher),
            handle: tokio::runtime::Handle::current(),
            cookies: Arc::new(CookieJar::default()),
            defaults: Arc::new(RwLock::new(RequestDefaults {
                headers: vec![("User-Agent".to_string(), self.defaults.user_agent.clone())],
                timeout: Some(Duration::from_millis(self.defaults.timeout_ms)),
                encoding: None,
            })),
            settings: Arc::clone(&self.settings),
        };

        let ctx = self
            .boot(rule, &name, text, services.clone(), env, deadline)
            .await?;

        self.inherit_template(rule, &ctx, &services, deadline).await?;

        let defaults = self.defaults.clone();
        ctx.with_lua_until(deadline, move |c| normalize_table(c, &defaults))
            .await
            .map_err(|e| self.sandbox_error(rule, e))?;

        ctx.with_lua_until(deadline, run_init_hooks)
            .await
            .map_err(|e| self.sandbox_error(rule, e))?;

        let parts = ctx
            .with_lua_until(deadline, read_definition)
            .await
            .map_err(|e| self.sandbox_error(rule, e))?;
        ctx.budget().disarm();

        if let Ok(mut request_defaults) = services.defaults.write() {
            *request_defaults = RequestDefaults {
                headers: parts.headers.clone(),
                timeout: Some(parts.timeout),
                encoding: Some(parts.encoding.clone()),
            };
        }

        Ok(parts.into_definition(rule.clone(), source.fingerprint, stage, started.elapsed(), ctx))
    }

    async fn boot(
        &self,
        rule: &RuleRef,
        name: &str,
        text: String,
        services: HostServices,
        env: &Env,
        deadline: Instant,
    ) -> EngineResult<Arc<SandboxContext>> {
        let budget = Arc::new(ExecutionBudget::default());
        budget.arm(deadline);

        let boot_budget = Arc::clone(&budget);
        let name = name.to_string();
        let chunk = rule.path.to_string_lossy().to_string();
        let env = env.clone();
        let task = tokio::task::spawn_blocking(move || {
            SandboxContext::boot(&name, &chunk, &text, services, &env, boot_budget)
        });

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, task).await {
            Err(_) => {
                budget.cancel();
                Err(self.sandbox_error(rule, SandboxError::Timeout))
            }
            Ok(Err(join)) => Err(EngineError::load(&rule.path, join)),
            Ok(Ok(Err(e))) => Err(self.sandbox_error(rule, e)),
            Ok(Ok(Ok(ctx))) => Ok(Arc::new(ctx)),
        }
    }

    /// Resolve `rule.template` and merge the template under the rule.
    async fn inherit_template(
        &self,
        rule: &RuleRef,
        ctx: &Arc<SandboxContext>,
        services: &HostServices,
        deadline: Instant,
    ) -> EngineResult<()> {
        let (template, host, headers) = ctx
            .with_lua_until(deadline, |c| {
                let template = match c.rule().get::<LuaValue>("template")? {
                    LuaValue::String(s) => Some(s.to_string_lossy().trim().to_string()),
                    _ => None,
                };
                let host = string_field(c.rule(), "host")?;
                let headers = header_pairs(c.rule())?;
                Ok((template, host.trim().trim_end_matches('/').to_string(), headers))
            })
            .await
            .map_err(|e| self.sandbox_error(rule, e))?;

        let Some(template) = template.filter(|t| !t.is_empty()) else {
            return Ok(());
        };

        let resolved = if template == "auto" {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.probe_template(&host, headers, services)).await {
                Ok(found) => found,
                Err(_) => {
                    ctx.budget().cancel();
                    return Err(self.sandbox_error(rule, SandboxError::Timeout));
                }
            }
        } else {
            match self.templates.by_name(&template) {
                Some(fields) => Some((template.clone(), fields)),
                None => {
                    warn!(rule = %rule.display_name(), template = %template, "unknown template, ignoring");
                    None
                }
            }
        };

        let Some((template_name, fields)) = resolved else {
            if template == "auto" {
                warn!(rule = %rule.display_name(), host = %host, "no template matched the homepage, ignoring");
            }
            return Ok(());
        };

        debug!(rule = %rule.display_name(), template = %template_name, "applying template");
        ctx.with_lua_until(deadline, move |c| merge_template(c, fields))
            .await
            .map_err(|e| self.sandbox_error(rule, e))
    }

    /// Try each template's `class_parse` against the homepage; first hit wins.
    async fn probe_template(
        &self,
        host: &str,
        headers: Vec<(String, String)>,
        services: &HostServices,
    ) -> Option<(String, TemplateFields)> {
        if host.is_empty() {
            return None;
        }
        let mut request = FetchRequest::get(host);
        request.headers = headers;
        let request = services.prepare(request);
        let body = match self.fetcher.fetch(&request).await {
            Ok(response) => response.body,
            Err(e) => {
                warn!(host = host, error = %e, "template probe fetch failed");
                return None;
            }
        };

        self.templates.names().into_iter().find_map(|name| {
            let fields = self.templates.by_name(&name)?;
            let selector = fields.get("class_parse")?.as_str()?;
            (!extract_classes(selector, &body).is_empty()).then_some((name, fields))
        })
    }

    fn sandbox_error(&self, rule: &RuleRef, e: SandboxError) -> EngineError {
        match e {
            SandboxError::Timeout => EngineError::Timeout {
                path: rule.path.clone(),
                budget_ms: self.budget.as_millis() as u64,
            },
            SandboxError::Script(message) => EngineError::load(&rule.path, message),
        }
    }
}

/// Run `template_modify(self, template)` if present, then copy every
/// template field the rule does not declare.
fn merge_template(c: &SandboxContext, fields: TemplateFields) -> LuaResult<()> {
    let template = match json_value_to_lua(c.lua(), &serde_json::Value::Object(fields))? {
        LuaValue::Table(t) => t,
        _ => c.lua().create_table()?,
    };

    if let LuaValue::Function(hook) = c.rule().get::<LuaValue>("template_modify")? {
        let fork = ContextFork::new(c, &serde_json::Map::new())?;
        if let Err(e) = fork.call_values(&hook, vec![LuaValue::Table(template.clone())]) {
            if c.budget().is_expired() {
                return Err(e);
            }
            warn!(rule = %c.name(), error = %e, "template_modify failed, using template as is");
        }
    }

    for pair in template.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        if c.rule().raw_get::<LuaValue>(key.clone())?.is_nil() {
            c.rule().raw_set(key, value)?;
        }
    }
    Ok(())
}

/// Fill in defaults and write them back so scripts see normalized values.
fn normalize_table(c: &SandboxContext, defaults: &NormalizeDefaults) -> LuaResult<()> {
    let rule = c.rule();
    rule.raw_set("template", LuaValue::Nil)?;
    rule.raw_set("template_modify", LuaValue::Nil)?;

    let host = string_field(rule, "host")?
        .trim()
        .trim_end_matches('/')
        .to_string();
    rule.raw_set("host", host.as_str())?;
    c.lua().globals().set("HOST", host.as_str())?;

    for field in URL_FIELDS {
        let value = string_field(rule, field)?;
        let value = if field == "homeUrl" && value.trim().is_empty() {
            host.clone()
        } else {
            absolute_url(&host, &value)
        };
        rule.raw_set(field, value)?;
    }

    if number_field(rule, "timeout")?.map_or(true, |t| t <= 0.0) {
        rule.raw_set("timeout", defaults.timeout_ms)?;
    }
    if string_field(rule, "encoding")?.trim().is_empty() {
        rule.raw_set("encoding", "utf-8")?;
    }

    if !matches!(rule.raw_get::<LuaValue>("headers")?, LuaValue::Table(_)) {
        let headers = c.lua().create_table()?;
        headers.set("User-Agent", defaults.user_agent.as_str())?;
        rule.raw_set("headers", headers)?;
    }

    rule.raw_set(
        "cate_exclude",
        merge_pattern(&string_field(rule, "cate_exclude")?, DEFAULT_CATE_EXCLUDE),
    )?;
    rule.raw_set(
        "tab_exclude",
        merge_pattern(&string_field(rule, "tab_exclude")?, DEFAULT_TAB_EXCLUDE),
    )?;

    if rule.raw_get::<LuaValue>("sniffer")?.is_nil() {
        rule.raw_set("sniffer", defaults.sniffer)?;
    }
    if string_field(rule, "media_pattern")?.trim().is_empty() {
        rule.raw_set("media_pattern", DEFAULT_MEDIA_PATTERN)?;
    }
    Ok(())
}

fn merge_pattern(declared: &str, default: &str) -> String {
    let declared = declared.trim().trim_matches('|');
    if declared.is_empty() || declared == default {
        default.to_string()
    } else {
        format!("{}|{}", declared, default)
    }
}

/// Run `host_resolver` then `init`. Failures are logged and skipped unless
/// the budget ran out.
fn run_init_hooks(c: &SandboxContext) -> LuaResult<()> {
    let old_host = string_field(c.rule(), "host")?;

    if let Some(value) = run_hook(c, "host_resolver")? {
        if let LuaValue::String(s) = value {
            let host = s.to_string_lossy().trim().trim_end_matches('/').to_string();
            if !host.is_empty() {
                debug!(rule = %c.name(), host = %host, "host resolved");
                c.rule().raw_set("host", host.as_str())?;
                c.lua().globals().set("HOST", host.as_str())?;
            }
        }
    }

    run_hook(c, "init")?;

    // Templates that were made absolute against the old host follow the new one.
    let new_host = string_field(c.rule(), "host")?;
    if !old_host.is_empty() && new_host != old_host {
        for field in URL_FIELDS {
            let value = string_field(c.rule(), field)?;
            if let Some(rest) = value.strip_prefix(&old_host) {
                c.rule().raw_set(field, format!("{}{}", new_host, rest))?;
            }
        }
    }
    Ok(())
}

fn run_hook(c: &SandboxContext, field: &str) -> LuaResult<Option<LuaValue>> {
    let fork = ContextFork::new(c, &serde_json::Map::new())?;
    let outcome = match c.rule().get::<LuaValue>(field)? {
        LuaValue::Function(f) => fork.call_values(&f, Vec::new()),
        LuaValue::String(s) => {
            let text = s.to_string_lossy();
            match snippet_body(&text) {
                Some(body) => fork
                    .eval_snippet(body, &format!("{}:{}", c.name(), field))
                    .and_then(|(value, scope)| {
                        if value.is_nil() {
                            scope.raw_get::<LuaValue>("result")
                        } else {
                            Ok(value)
                        }
                    }),
                None => return Ok(None),
            }
        }
        _ => return Ok(None),
    };

    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(e) if c.budget().is_expired() => Err(e),
        Err(e) => {
            warn!(rule = %c.name(), hook = field, error = %e, "init hook failed, keeping declared values");
            Ok(None)
        }
    }
}

/// Everything read back from the normalized `rule` table.
struct DefinitionParts {
    title: String,
    host: String,
    home_url: String,
    category_url: String,
    detail_url: String,
    search_url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    encoding: String,
    cate_exclude: Option<Regex>,
    tab_exclude: Option<Regex>,
    double: bool,
    limit: usize,
    quick_search: bool,
    play_parse: bool,
    sniffer: bool,
    media_pattern: Regex,
    declared_classes: Vec<ClassItem>,
    filters: serde_json::Map<String, serde_json::Value>,
    filter_url: String,
    filter_defaults: serde_json::Map<String, serde_json::Value>,
    play_overrides: Vec<(Regex, serde_json::Value)>,
    fetch_hook: Option<LuaFunction>,
    snapshot: serde_json::Map<String, serde_json::Value>,
    implementations: Vec<Implementation>,
}

impl DefinitionParts {
    fn into_definition(
        self,
        reference: RuleRef,
        fingerprint: String,
        decode_stage: DecodeStage,
        load_cost: Duration,
        context: Arc<SandboxContext>,
    ) -> RuleDefinition {
        RuleDefinition {
            reference,
            fingerprint,
            decode_stage,
            title: self.title,
            host: self.host,
            home_url: self.home_url,
            category_url: self.category_url,
            detail_url: self.detail_url,
            search_url: self.search_url,
            headers: self.headers,
            timeout: self.timeout,
            encoding: self.encoding,
            cate_exclude: self.cate_exclude,
            tab_exclude: self.tab_exclude,
            double: self.double,
            limit: self.limit,
            quick_search: self.quick_search,
            play_parse: self.play_parse,
            sniffer: self.sniffer,
            media_pattern: self.media_pattern,
            declared_classes: self.declared_classes,
            filters: self.filters,
            filter_url: self.filter_url,
            filter_defaults: self.filter_defaults,
            play_overrides: self.play_overrides,
            fetch_hook: self.fetch_hook,
            load_cost,
            snapshot: self.snapshot,
            implementations: self.implementations,
            context,
        }
    }
}

fn read_definition(c: &SandboxContext) -> LuaResult<DefinitionParts> {
    let rule = c.rule();
    let host = string_field(rule, "host")?;

    let headers = header_pairs(rule)?;

    let timeout_ms = number_field(rule, "timeout")?.unwrap_or(5000.0).max(1.0) as u64;

    let media_pattern = compile_or(&string_field(rule, "media_pattern")?, DEFAULT_MEDIA_PATTERN, c.name());

    let implementations = Operation::ALL
        .iter()
        .map(|op| Implementation::resolve(*op, rule.get::<LuaValue>(op.field())?))
        .collect::<LuaResult<Vec<_>>>()?;

    let fetch_hook = match rule.get::<LuaValue>("fetch")? {
        LuaValue::Function(f) => Some(f),
        _ => None,
    };

    let mut play_overrides = Vec::new();
    if let serde_json::Value::Object(map) = json_field(rule, "play_overrides")? {
        for (pattern, value) in map {
            match Regex::new(&pattern) {
                Ok(re) => play_overrides.push((re, value)),
                Err(e) => warn!(rule = %c.name(), pattern = %pattern, error = %e, "ignoring play override"),
            }
        }
    }

    let snapshot = match lua_value_to_json(LuaValue::Table(rule.clone()))? {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    Ok(DefinitionParts {
        title: or_fallback(string_field(rule, "title")?.trim().to_string(), c.name()),
        home_url: or_fallback(string_field(rule, "homeUrl")?, &host),
        category_url: string_field(rule, "url")?,
        detail_url: string_field(rule, "detailUrl")?,
        search_url: string_field(rule, "searchUrl")?,
        headers,
        timeout: Duration::from_millis(timeout_ms),
        encoding: or_fallback(string_field(rule, "encoding")?, "utf-8"),
        cate_exclude: compile_optional(&string_field(rule, "cate_exclude")?, c.name()),
        tab_exclude: compile_optional(&string_field(rule, "tab_exclude")?, c.name()),
        double: bool_field(rule, "double", false)?,
        limit: number_field(rule, "limit")?.map(|n| n.max(0.0) as usize).unwrap_or(0),
        quick_search: bool_field(rule, "quick_search", false)?,
        play_parse: bool_field(rule, "play_parse", false)?,
        sniffer: bool_field(rule, "sniffer", false)?,
        media_pattern,
        declared_classes: declared_classes(
            &string_field(rule, "class_name")?,
            &string_field(rule, "class_url")?,
        ),
        filters: json_object(json_field(rule, "filters")?),
        filter_url: string_field(rule, "filter_url")?,
        filter_defaults: json_object(json_field(rule, "filter_def")?),
        play_overrides,
        fetch_hook,
        snapshot,
        implementations,
        host,
    })
}

/// The rule's `headers` table as sorted name/value pairs.
fn header_pairs(rule: &LuaTable) -> LuaResult<Vec<(String, String)>> {
    let mut headers = Vec::new();
    if let LuaValue::Table(table) = rule.get::<LuaValue>("headers")? {
        for pair in table.pairs::<String, LuaValue>() {
            let (k, v) = pair?;
            headers.push((k, lua_text(&v)));
        }
    }
    headers.sort();
    Ok(headers)
}

fn or_fallback(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

/// `class_name` / `class_url` are parallel `&`-separated lists.
fn declared_classes(names: &str, ids: &str) -> Vec<ClassItem> {
    if names.trim().is_empty() {
        return Vec::new();
    }
    let ids: Vec<&str> = ids.split('&').collect();
    names
        .split('&')
        .enumerate()
        .filter_map(|(i, name)| {
            let name = name.trim();
            let id = ids.get(i).map(|s| s.trim()).unwrap_or(name);
            (!name.is_empty() && !id.is_empty()).then(|| ClassItem {
                type_id: id.to_string(),
                type_name: name.to_string(),
            })
        })
        .collect()
}

fn compile_optional(pattern: &str, rule: &str) -> Option<Regex> {
    if pattern.trim().is_empty() {
        return None;
    }
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(rule = rule, pattern = pattern, error = %e, "invalid exclusion pattern, ignoring");
            None
        }
    }
}

fn compile_or(pattern: &str, fallback: &str, rule: &str) -> Regex {
    compile_optional(pattern, rule)
        .or_else(|| Regex::new(fallback).ok())
        .unwrap_or_else(|| Regex::new("$^").expect("static regex"))
}

fn lua_text(value: &LuaValue) -> String {
    match value {
        LuaValue::String(s) => s.to_string_lossy(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        _ => String::new(),
    }
}

fn string_field(table: &LuaTable, key: &str) -> LuaResult<String> {
    Ok(lua_text(&table.get::<LuaValue>(key)?))
}

fn number_field(table: &LuaTable, key: &str) -> LuaResult<Option<f64>> {
    Ok(match table.get::<LuaValue>(key)? {
        LuaValue::Integer(i) => Some(i as f64),
        LuaValue::Number(n) => Some(n),
        LuaValue::String(s) => s.to_string_lossy().trim().parse().ok(),
        _ => None,
    })
}

fn bool_field(table: &LuaTable, key: &str, default: bool) -> LuaResult<bool> {
    Ok(match table.get::<LuaValue>(key)? {
        LuaValue::Boolean(b) => b,
        LuaValue::Integer(i) => i != 0,
        LuaValue::Number(n) => n != 0.0,
        LuaValue::String(s) => matches!(
            s.to_string_lossy().trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        ),
        _ => default,
    })
}

/// A field as JSON; strings holding JSON text are parsed.
fn json_field(table: &LuaTable, key: &str) -> LuaResult<serde_json::Value> {
    Ok(match table.get::<LuaValue>(key)? {
        LuaValue::String(s) => {
            serde_json::from_str(&s.to_string_lossy()).unwrap_or(serde_json::Value::Null)
        }
        other => lua_value_to_json(other)?,
    })
}

fn json_object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_pattern() {
        assert_eq!(merge_pattern("", DEFAULT_TAB_EXCLUDE), DEFAULT_TAB_EXCLUDE);
        assert_eq!(
            merge_pattern("VIP|", DEFAULT_TAB_EXCLUDE),
            format!("VIP|{}", DEFAULT_TAB_EXCLUDE)
        );
    }

    #[test]
    fn test_declared_classes() {
        let classes = declared_classes("Movies&Shows&", "1&2");
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[1].type_id, "2");
        assert_eq!(classes[1].type_name, "Shows");
        assert!(declared_classes("", "").is_empty());
    }

    #[test]
    fn test_default_media_pattern() {
        let re = Regex::new(DEFAULT_MEDIA_PATTERN).unwrap();
        assert!(re.is_match("https://c.com/v/index.m3u8?token=1"));
        assert!(re.is_match("https://c.com/a.MP4"));
        assert!(!re.is_match("https://site.com/play/1.html"));
    }
}
