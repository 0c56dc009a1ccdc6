//! Host APIs exposed to rule scripts.
//!
//! Rule scripts run inside a sandboxed Lua 5.4 VM on a blocking thread (via
//! [`tokio::task::spawn_blocking`]). Host functions are synchronous; the
//! ones that need the async [`Fetcher`] reach it through the runtime handle
//! captured in [`HostServices`].
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `http` | `get`, `post`, `put`, `request` |
//! | `json` | `parse`, `encode` |
//! | `html` | `one`, `all`, `url` |
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `cookies` | `get`, `set` |
//! | `settings` | `get` |
//! | `base64` | `encode`, `decode` |
//! | `crypto` | `sha256`, `md5`, `hmac_sha256` |
//! | `sleep` | `sleep(seconds)` |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile`, `dofile`, `require` and `package` are
//! removed. Rules have no filesystem or process access.

use hmac::{Hmac, Mac};
use md5::Md5;
use mlua::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::fetch::{FetchRequest, Fetcher};
use crate::query::{self, MarkupDoc};
use crate::sandbox::ExecutionBudget;

/// Request defaults applied to every `http.*` call a rule makes.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestDefaults {
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub encoding: Option<String>,
}

/// Per-host cookie store shared by a rule's scripts and its page fetches.
#[derive(Debug, Default)]
pub(crate) struct CookieJar {
    by_host: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl CookieJar {
    /// `Cookie` header value for `url`, if any cookies are stored for its host.
    pub fn header_for(&self, url: &str) -> Option<String> {
        let host = query::host_of(url);
        let jar = self.by_host.lock().ok()?;
        let pairs = jar.get(&host)?;
        if pairs.is_empty() {
            return None;
        }
        Some(
            pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Merge `name=value` pairs (a `Cookie` header or `Set-Cookie` value) into the jar.
    pub fn store(&self, url: &str, raw: &str) {
        let host = query::host_of(url);
        let Ok(mut jar) = self.by_host.lock() else {
            return;
        };
        let entry = jar.entry(host).or_default();
        for part in raw.split(';') {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() || is_cookie_attribute(name) {
                continue;
            }
            let value = value.trim().to_string();
            match entry.iter_mut().find(|(k, _)| k == name) {
                Some(slot) => slot.1 = value,
                None => entry.push((name.to_string(), value)),
            }
        }
    }

    /// Record every `Set-Cookie` value; only the leading pair of each counts.
    pub fn store_set_cookies<'a>(&self, url: &str, values: impl Iterator<Item = &'a str>) {
        for value in values {
            let pair = value.split(';').next().unwrap_or_default();
            self.store(url, pair);
        }
    }
}

fn is_cookie_attribute(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "path" | "domain" | "expires" | "max-age" | "samesite"
    )
}

/// Everything the host APIs of one rule context need.
#[derive(Clone)]
pub(crate) struct HostServices {
    pub fetcher: Arc<dyn Fetcher>,
    pub handle: tokio::runtime::Handle,
    pub cookies: Arc<CookieJar>,
    pub defaults: Arc<RwLock<RequestDefaults>>,
    pub settings: Arc<Settings>,
}

impl HostServices {
    /// Apply the rule's request defaults and stored cookies to `request`.
    pub fn prepare(&self, mut request: FetchRequest) -> FetchRequest {
        if let Ok(defaults) = self.defaults.read() {
            for (k, v) in &defaults.headers {
                if !request.has_header(k) {
                    request.headers.push((k.clone(), v.clone()));
                }
            }
            if request.timeout.is_none() {
                request.timeout = defaults.timeout;
            }
            if request.encoding.is_none() {
                request.encoding = defaults.encoding.clone();
            }
        }
        if !request.has_header("cookie") {
            if let Some(cookie) = self.cookies.header_for(&request.url) {
                request.headers.push(("Cookie".to_string(), cookie));
            }
        }
        request
    }
}

/// Register all host APIs on a rule VM and sandbox its globals.
pub(crate) fn register_all_host_apis(
    lua: &Lua,
    rule_name: &str,
    services: &HostServices,
    budget: &Arc<ExecutionBudget>,
) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_http_api(lua, services)?;
    register_json_api(lua)?;
    register_html_api(lua)?;
    register_log_api(lua, rule_name)?;
    register_cookies_api(lua, services)?;
    register_settings_api(lua, services)?;
    register_base64_api(lua)?;
    register_crypto_api(lua)?;
    register_sleep(lua, budget)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing
// ═══════════════════════════════════════════════════════════════════════

/// Remove dangerous standard library functions from the Lua globals.
pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in ["os", "io", "loadfile", "dofile", "debug", "require", "package"] {
        globals.set(name, LuaValue::Nil)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: http
// ═══════════════════════════════════════════════════════════════════════

fn register_http_api(lua: &Lua, services: &HostServices) -> LuaResult<()> {
    let http = lua.create_table()?;

    // http.get(url, opts?)
    let s = services.clone();
    http.set(
        "get",
        lua.create_function(move |lua, (url, opts): (String, Option<LuaTable>)| {
            do_http_request(lua, &s, "GET", &url, None, opts)
        })?,
    )?;

    // http.post(url, body, opts?) and http.put(url, body, opts?)
    for method in ["POST", "PUT"] {
        let s = services.clone();
        let with_body = lua.create_function(
            move |lua, (url, body, opts): (String, Option<String>, Option<LuaTable>)| {
                do_http_request(lua, &s, method, &url, body, opts)
            },
        )?;
        http.set(method.to_ascii_lowercase(), with_body)?;
    }

    // http.request(method, url, opts?) with the body in opts.body
    let s = services.clone();
    let generic = lua.create_function(
        move |lua, (method, url, opts): (String, String, Option<LuaTable>)| {
            let body = opts
                .as_ref()
                .map(|o| o.get::<Option<String>>("body"))
                .transpose()?
                .flatten();
            do_http_request(lua, &s, &method.to_uppercase(), &url, body, opts)
        },
    )?;
    http.set("request", generic)?;

    lua.globals().set("http", http)?;
    Ok(())
}

/// Execute a request through the shared fetcher and return a response table.
///
/// Transport failures do not raise: the table carries `status = 0`,
/// `ok = false` and an `error` message, matching how page fetches degrade
/// to an empty body.
fn do_http_request(
    lua: &Lua,
    services: &HostServices,
    method: &str,
    url: &str,
    body: Option<String>,
    opts: Option<LuaTable>,
) -> LuaResult<LuaTable> {
    let mut request = FetchRequest::get(url);
    request.method = method.to_string();
    request.body = body;

    if let Some(ref opts) = opts {
        if let Ok(headers) = opts.get::<LuaTable>("headers") {
            for pair in headers.pairs::<String, String>() {
                let (k, v) = pair?;
                request.headers.push((k, v));
            }
        }

        if let Ok(params) = opts.get::<LuaTable>("params") {
            let mut parsed = url::Url::parse(url).map_err(mlua::Error::external)?;
            {
                let mut query = parsed.query_pairs_mut();
                for pair in params.pairs::<String, String>() {
                    let (k, v) = pair?;
                    query.append_pair(&k, &v);
                }
            }
            request.url = parsed.to_string();
        }

        if let Ok(timeout) = opts.get::<f64>("timeout") {
            request.timeout = Duration::try_from_secs_f64(timeout.max(0.0)).ok();
        }

        if let Ok(encoding) = opts.get::<String>("encoding") {
            request.encoding = Some(encoding);
        }
    }

    let request = services.prepare(request);
    let outcome = services.handle.block_on(services.fetcher.fetch(&request));

    let result = lua.create_table()?;
    match outcome {
        Ok(response) => {
            services
                .cookies
                .store_set_cookies(&request.url, response.header_values("set-cookie"));

            let headers_table = lua.create_table()?;
            for (name, value) in &response.headers {
                headers_table.set(name.to_ascii_lowercase(), value.as_str())?;
            }

            result.set("status", response.status)?;
            result.set("ok", response.ok())?;
            result.set("headers", headers_table)?;
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&response.body) {
                result.set("json", json_value_to_lua(lua, &json)?)?;
            }
            result.set("body", response.body)?;
        }
        Err(e) => {
            warn!(url = %request.url, method = method, error = %e, "rule http request failed");
            result.set("status", 0)?;
            result.set("ok", false)?;
            result.set("headers", lua.create_table()?)?;
            result.set("body", "")?;
            result.set("error", format!("{:#}", e))?;
        }
    }

    Ok(result)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json = lua.create_table()?;

    // json.parse(text) raises on malformed input
    json.set(
        "parse",
        lua.create_function(|lua, text: String| {
            let parsed = serde_json::from_str::<serde_json::Value>(&text)
                .map_err(|e| LuaError::RuntimeError(format!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &parsed)
        })?,
    )?;

    json.set(
        "encode",
        lua.create_function(|_, value: LuaValue| {
            let encoded = serde_json::to_string(&lua_value_to_json(value)?);
            encoded.map_err(|e| LuaError::RuntimeError(format!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: html
// ═══════════════════════════════════════════════════════════════════════

fn register_html_api(lua: &Lua) -> LuaResult<()> {
    let html = lua.create_table()?;

    // html.one(doc, expr) → string | nil
    html.set(
        "one",
        lua.create_function(|_lua, (doc, expr): (String, String)| {
            Ok(MarkupDoc::parse(&doc).select_one(&expr))
        })?,
    )?;

    // html.all(doc, selector) → { outer html, ... }
    html.set(
        "all",
        lua.create_function(|lua, (doc, selector): (String, String)| {
            let parsed = MarkupDoc::parse(&doc);
            let fragments: Vec<String> = parsed
                .select_all(&selector)
                .into_iter()
                .map(|el| el.html())
                .collect();
            lua.create_sequence_from(fragments)
        })?,
    )?;

    // html.url(doc, expr, base) → absolute url | nil
    html.set(
        "url",
        lua.create_function(|_lua, (doc, expr, base): (String, String, String)| {
            Ok(MarkupDoc::parse(&doc)
                .select_one(&expr)
                .map(|link| query::join_url(&base, &link))
                .filter(|link| !link.is_empty()))
        })?,
    )?;

    lua.globals().set("html", html)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua, rule_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;
    for level in ["debug", "info", "warn", "error"] {
        let rule = rule_name.to_string();
        let emit = lua.create_function(move |_, msg: String| {
            match level {
                "debug" => debug!(rule = %rule, "{}", msg),
                "info" => info!(rule = %rule, "{}", msg),
                "warn" => warn!(rule = %rule, "{}", msg),
                _ => error!(rule = %rule, "{}", msg),
            }
            Ok(())
        })?;
        log.set(level, emit)?;
    }
    lua.globals().set("log", log)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: cookies, settings
// ═══════════════════════════════════════════════════════════════════════

fn register_cookies_api(lua: &Lua, services: &HostServices) -> LuaResult<()> {
    let cookies = lua.create_table()?;

    let jar = Arc::clone(&services.cookies);
    cookies.set(
        "get",
        lua.create_function(move |_lua, url: String| Ok(jar.header_for(&url)))?,
    )?;

    let jar = Arc::clone(&services.cookies);
    cookies.set(
        "set",
        lua.create_function(move |_lua, (url, value): (String, String)| {
            jar.store(&url, &value);
            Ok(())
        })?,
    )?;

    lua.globals().set("cookies", cookies)?;
    Ok(())
}

fn register_settings_api(lua: &Lua, services: &HostServices) -> LuaResult<()> {
    let settings = lua.create_table()?;

    let store = Arc::clone(&services.settings);
    settings.set(
        "get",
        lua.create_function(move |_lua, key: String| Ok(store.get(&key).map(str::to_string)))?,
    )?;

    lua.globals().set("settings", settings)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: base64
// ═══════════════════════════════════════════════════════════════════════

fn register_base64_api(lua: &Lua) -> LuaResult<()> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let codec = lua.create_table()?;
    codec.set(
        "encode",
        lua.create_function(|_, data: LuaString| Ok(STANDARD.encode(&*data.as_bytes())))?,
    )?;
    // Surrounding whitespace is common in payloads embedded in pages.
    codec.set(
        "decode",
        lua.create_function(|lua, text: String| {
            match STANDARD.decode(text.trim()) {
                Ok(bytes) => lua.create_string(bytes),
                Err(e) => Err(LuaError::RuntimeError(format!("base64.decode: {}", e))),
            }
        })?,
    )?;
    lua.globals().set("base64", codec)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: crypto
// ═══════════════════════════════════════════════════════════════════════

fn hex_digest<D: Digest>(data: &[u8]) -> String {
    hex::encode(D::digest(data))
}

fn register_crypto_api(lua: &Lua) -> LuaResult<()> {
    let crypto = lua.create_table()?;

    crypto.set(
        "md5",
        lua.create_function(|_, data: LuaString| Ok(hex_digest::<Md5>(&data.as_bytes())))?,
    )?;
    crypto.set(
        "sha256",
        lua.create_function(|_, data: LuaString| Ok(hex_digest::<Sha256>(&data.as_bytes())))?,
    )?;
    crypto.set(
        "hmac_sha256",
        lua.create_function(|_, (key, data): (LuaString, LuaString)| {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&key.as_bytes())
                .map_err(|e| LuaError::RuntimeError(format!("crypto.hmac_sha256: {}", e)))?;
            mac.update(&data.as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        })?,
    )?;

    lua.globals().set("crypto", crypto)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: sleep
// ═══════════════════════════════════════════════════════════════════════

/// `sleep(seconds)` blocks the rule's thread but gives up with a budget
/// error once the load deadline passes or the run is cancelled.
fn register_sleep(lua: &Lua, budget: &Arc<ExecutionBudget>) -> LuaResult<()> {
    let budget = Arc::clone(budget);
    let sleep = lua.create_function(move |_, seconds: f64| {
        budget.pause(Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX))
    })?;
    lua.globals().set("sleep", sleep)
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

/// Build the Lua counterpart of a JSON value. Arrays become 1-based
/// sequences; integers stay integers.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    Ok(match value {
        serde_json::Value::Null => LuaValue::Nil,
        serde_json::Value::Bool(b) => LuaValue::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => LuaValue::String(lua.create_string(s)?),
        serde_json::Value::Array(items) => {
            let values = items
                .iter()
                .map(|item| json_value_to_lua(lua, item))
                .collect::<LuaResult<Vec<_>>>()?;
            LuaValue::Table(lua.create_sequence_from(values)?)
        }
        serde_json::Value::Object(fields) => {
            let table = lua.create_table_with_capacity(0, fields.len())?;
            for (key, field) in fields {
                table.raw_set(key.as_str(), json_value_to_lua(lua, field)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

/// Nesting beyond this is cut off as `null`, which also stops
/// self-referencing tables.
const MAX_TABLE_DEPTH: usize = 32;

/// Convert a Lua value to JSON.
///
/// Functions and other non-data values become `null` (and are skipped as
/// object fields). A table with a sequence part is an array; any other
/// table is an object keyed by its string or integer keys.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    to_json_at(value, 0)
}

fn to_json_at(value: LuaValue, depth: usize) -> LuaResult<serde_json::Value> {
    let table = match value {
        LuaValue::Boolean(b) => return Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => return Ok(i.into()),
        LuaValue::Number(n) => {
            return Ok(serde_json::Number::from_f64(n)
                .map_or(serde_json::Value::Null, serde_json::Value::Number))
        }
        LuaValue::String(s) => return Ok(serde_json::Value::String(s.to_string_lossy())),
        LuaValue::Table(t) if depth < MAX_TABLE_DEPTH => t,
        _ => return Ok(serde_json::Value::Null),
    };

    let len = table.raw_len();
    if len > 0 {
        return (1..=len)
            .map(|i| to_json_at(table.raw_get(i)?, depth + 1))
            .collect::<LuaResult<Vec<_>>>()
            .map(serde_json::Value::Array);
    }

    let mut fields = serde_json::Map::new();
    for pair in table.pairs::<LuaValue, LuaValue>() {
        let (key, field) = pair?;
        let key = match key {
            LuaValue::String(s) => s.to_string_lossy(),
            LuaValue::Integer(i) => i.to_string(),
            _ => continue,
        };
        if matches!(field, LuaValue::Function(_)) {
            continue;
        }
        fields.insert(key, to_json_at(field, depth + 1)?);
    }
    Ok(serde_json::Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sandbox_removes_globals() {
        let lua = Lua::new();
        sandbox_globals(&lua).unwrap();
        for name in ["os", "io", "debug", "require", "package", "dofile"] {
            let v: LuaValue = lua.globals().get(name).unwrap();
            assert!(v.is_nil(), "{} should be removed", name);
        }
    }

    #[test]
    fn test_json_roundtrip_through_lua() {
        let lua = Lua::new();
        let value = json!({ "name": "x", "list": [1, 2, 3], "nested": { "ok": true } });
        let lua_value = json_value_to_lua(&lua, &value).unwrap();
        assert_eq!(lua_value_to_json(lua_value).unwrap(), value);
    }

    #[test]
    fn test_lua_functions_skipped_in_objects() {
        let lua = Lua::new();
        let table: LuaTable = lua
            .load(r#"return { title = "t", run = function() end }"#)
            .eval()
            .unwrap();
        assert_eq!(
            lua_value_to_json(LuaValue::Table(table)).unwrap(),
            json!({ "title": "t" })
        );
    }

    #[test]
    fn test_cookie_jar_merges_pairs() {
        let jar = CookieJar::default();
        jar.store("https://a.com/x", "sid=1; theme=dark");
        jar.store_set_cookies("https://a.com/y", ["sid=2; Path=/; HttpOnly"].into_iter());
        assert_eq!(
            jar.header_for("https://a.com/").as_deref(),
            Some("sid=2; theme=dark")
        );
        assert!(jar.header_for("https://b.com/").is_none());
    }

    #[test]
    fn test_html_and_crypto_apis() {
        let lua = Lua::new();
        register_html_api(&lua).unwrap();
        register_crypto_api(&lua).unwrap();
        register_base64_api(&lua).unwrap();
        let (title, count, link, md5, b64): (String, i64, String, String, String) = lua
            .load(
                r#"
                local doc = '<div class="t">Hi</div><a href="/v/1">a</a><a href="/v/2">b</a>'
                return html.one(doc, ".t"), #html.all(doc, "a"),
                    html.url(doc, "a&&href", "https://s.com/list/"),
                    crypto.md5("abc"), base64.decode(base64.encode("xyz"))
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(title, "Hi");
        assert_eq!(count, 2);
        assert_eq!(link, "https://s.com/v/1");
        assert_eq!(md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(b64, "xyz");
    }
}
