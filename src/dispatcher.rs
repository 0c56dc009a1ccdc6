//! Operation dispatch and result post-processing.
//!
//! [`invoke`] runs one operation against whatever shape the rule declared
//! it in and returns a [`RawOutput`]. The `shape_*` functions then turn
//! any raw output into the operation's result type, so callers never see
//! which shape produced it.

use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bridge::SandboxBridge;
use crate::error::{EngineError, EngineResult};
use crate::interpreter::{self, DetailOverrides, ExtractionRule};
use crate::models::{
    json_to_text, ClassItem, HomeResult, InvocationRequest, ListResult, PlayResult,
    ProxyResponse, VodItem,
};
use crate::rule::{DetailSpec, Implementation, ListSource, Operation, RuleDefinition};

/// Per-group item cap on the featured home list when a rule sets no limit.
const DEFAULT_HOME_LIMIT: usize = 6;
/// Page count reported while a listing still returns items.
const OPEN_PAGECOUNT: u32 = 999;

/// What an implementation produced, before post-processing.
#[derive(Debug, Clone)]
pub(crate) enum RawOutput {
    /// Whatever a native function or snippet returned.
    Value(serde_json::Value),
    Items(Vec<VodItem>),
    Classes(Vec<ClassItem>),
    /// No implementation; the operation echoes its input.
    PassThrough,
}

/// Run `op` with the rule's declared implementation.
pub(crate) async fn invoke(
    bridge: &SandboxBridge,
    op: Operation,
    request: InvocationRequest,
) -> EngineResult<RawOutput> {
    let rule = Arc::clone(bridge.rule());
    let implementation = rule.implementation(op).clone();
    debug!(rule = %rule.name(), op = %op, shape = implementation.kind(), "dispatching");

    match implementation {
        Implementation::Native(f) => bridge
            .call_native(op, f, request)
            .await
            .map(RawOutput::Value),
        Implementation::Snippet(code) => bridge
            .eval_snippet(op, code, request)
            .await
            .map(RawOutput::Value),
        Implementation::Declarative(selector) => {
            run_declarative(bridge, op, &selector, &request).await
        }
        Implementation::Structured(layout) if op == Operation::Detail => {
            run_structured_detail(bridge, &layout, &request).await
        }
        Implementation::Structured(_) | Implementation::Absent => absent(&rule, op),
    }
}

fn absent(rule: &RuleDefinition, op: Operation) -> EngineResult<RawOutput> {
    match op {
        Operation::Classes | Operation::Play => Ok(RawOutput::PassThrough),
        Operation::Search | Operation::HomeVod => Ok(RawOutput::Items(Vec::new())),
        Operation::Category | Operation::Detail | Operation::Proxy => {
            Err(EngineError::NotImplemented {
                rule: rule.name(),
                operation: op,
            })
        }
    }
}

fn category_selector(rule: &RuleDefinition) -> Option<&str> {
    match rule.implementation(Operation::Category) {
        Implementation::Declarative(selector) => Some(selector.as_str()),
        _ => None,
    }
}

async fn run_declarative(
    bridge: &SandboxBridge,
    op: Operation,
    selector: &str,
    request: &InvocationRequest,
) -> EngineResult<RawOutput> {
    let rule = Arc::clone(bridge.rule());
    let input = request.var_str("input").unwrap_or_default().to_string();

    match op {
        Operation::Classes => {
            let body = bridge.fetch_page(&input, Some("home")).await;
            Ok(RawOutput::Classes(interpreter::extract_classes(selector, &body)))
        }
        Operation::HomeVod => {
            let body = bridge.fetch_page(&input, Some("home")).await;
            let parsed = ExtractionRule::parse(selector, category_selector(&rule), rule.double);
            let cap = if rule.limit > 0 { rule.limit } else { DEFAULT_HOME_LIMIT };
            let mut items = parsed.extract_items(&body, &input, Some(cap));
            if parsed.groups.is_none() && rule.limit > 0 {
                items.truncate(rule.limit);
            }
            Ok(RawOutput::Items(items))
        }
        Operation::Category => {
            let body = bridge.fetch_page(&input, None).await;
            let parsed = ExtractionRule::parse(selector, None, false);
            Ok(RawOutput::Items(parsed.extract_items(&body, &input, None)))
        }
        Operation::Search => {
            let body = bridge.fetch_page(&input, Some("search")).await;
            let parsed = ExtractionRule::parse(selector, category_selector(&rule), false);
            Ok(RawOutput::Items(parsed.extract_items(&body, &input, None)))
        }
        Operation::Detail => {
            let id = request.var_str("id").unwrap_or_default();
            if selector == "*" {
                return Ok(RawOutput::Items(vec![interpreter::passthrough_detail(id)]));
            }
            let body = bridge.fetch_page(&input, None).await;
            let parsed = ExtractionRule::parse(selector, category_selector(&rule), false);
            let mut items = parsed.extract_items(&body, &input, None);
            items.truncate(1);
            Ok(RawOutput::Items(items))
        }
        Operation::Play => {
            let body = bridge.fetch_page(&input, None).await;
            let url = interpreter::extract_play_url(selector, &body, &input).unwrap_or(input);
            Ok(RawOutput::Value(serde_json::json!({ "url": url })))
        }
        Operation::Proxy => Err(EngineError::NotImplemented {
            rule: rule.name(),
            operation: op,
        }),
    }
}

async fn run_structured_detail(
    bridge: &SandboxBridge,
    layout: &DetailSpec,
    request: &InvocationRequest,
) -> EngineResult<RawOutput> {
    let rule = Arc::clone(bridge.rule());
    let input = request.var_str("input").unwrap_or_default().to_string();
    let body = bridge.fetch_page(&input, None).await;

    let mut vars = request.vars.clone();
    vars.insert("html".to_string(), serde_json::Value::String(body.clone()));

    let tabs = match &layout.tabs {
        Some(source) => list_source_value(bridge, source, &vars)
            .await
            .map(|v| value_strings(&v)),
        None => None,
    };
    let lists = match &layout.lists {
        Some(source) => list_source_value(bridge, source, &vars)
            .await
            .map(|v| value_episode_lists(&v)),
        None => None,
    };

    let item = interpreter::extract_detail(
        layout,
        &body,
        &input,
        rule.tab_exclude.as_ref(),
        DetailOverrides { tabs, lists },
    );
    Ok(RawOutput::Items(vec![item]))
}

/// Evaluate a function- or snippet-valued part of a structured detail.
/// Selector-valued parts are left to the interpreter.
async fn list_source_value(
    bridge: &SandboxBridge,
    source: &ListSource,
    vars: &serde_json::Map<String, serde_json::Value>,
) -> Option<serde_json::Value> {
    let outcome = match source {
        ListSource::Selector(_) => return None,
        ListSource::Native(f) => {
            bridge
                .call_with_vars(Operation::Detail, f.clone(), vars.clone())
                .await
        }
        ListSource::Snippet(code) => {
            let request = InvocationRequest {
                args: Vec::new(),
                vars: vars.clone(),
            };
            bridge
                .eval_snippet(Operation::Detail, code.clone(), request)
                .await
        }
    };
    match outcome {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(rule = %bridge.rule().name(), error = %e, "detail list producer failed");
            None
        }
    }
}

fn value_strings(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items.iter().map(json_to_text).collect(),
        serde_json::Value::String(s) => s.split("$$$").map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Accepts `[[ "ep$url", ... ], ...]`, `[[{name, url}, ...], ...]` or
/// `"ep$url#ep$url$$$..."`.
fn value_episode_lists(value: &serde_json::Value) -> Vec<Vec<String>> {
    let episode = |ep: &serde_json::Value| -> Option<String> {
        match ep {
            serde_json::Value::Object(map) => {
                let url = map.get("url").map(json_to_text).unwrap_or_default();
                let name = map.get("name").map(json_to_text).unwrap_or_default();
                (!url.is_empty()).then(|| format!("{}${}", name, url))
            }
            other => Some(json_to_text(other)).filter(|s| !s.is_empty()),
        }
    };
    match value {
        serde_json::Value::Array(sources) => sources
            .iter()
            .map(|source| match source {
                serde_json::Value::Array(eps) => eps.iter().filter_map(episode).collect(),
                serde_json::Value::String(s) => s.split('#').map(str::to_string).collect(),
                _ => Vec::new(),
            })
            .collect(),
        serde_json::Value::String(s) => s
            .split("$$$")
            .map(|source| source.split('#').map(str::to_string).collect())
            .collect(),
        _ => Vec::new(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Post-processing
// ═══════════════════════════════════════════════════════════════════════

fn items_from_value(value: &serde_json::Value) -> Vec<VodItem> {
    let list = match value {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => match map.get("list") {
            Some(serde_json::Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    list.iter()
        .filter_map(|v| match serde_json::from_value::<VodItem>(v.clone()) {
            Ok(item) => Some(item),
            Err(e) => {
                debug!(error = %e, "skipping malformed item");
                None
            }
        })
        .collect()
}

pub(crate) fn shape_items(raw: RawOutput) -> Vec<VodItem> {
    match raw {
        RawOutput::Value(value) => items_from_value(&value),
        RawOutput::Items(items) => items,
        RawOutput::Classes(_) | RawOutput::PassThrough => Vec::new(),
    }
}

/// Entries that are not objects are skipped one by one.
fn classes_from_value(value: &serde_json::Value) -> Vec<ClassItem> {
    let serde_json::Value::Array(entries) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry {
            serde_json::Value::Object(_) => serde_json::from_value::<ClassItem>(entry.clone()).ok(),
            other => {
                debug!(entry = %other, "skipping malformed class");
                None
            }
        })
        .collect()
}

/// Declared classes first, then parsed ones not already present; excluded
/// names dropped. Filters come from the script's output, else the rule.
pub(crate) fn shape_home(rule: &RuleDefinition, raw: RawOutput, with_filters: bool) -> HomeResult {
    let mut script_filters = None;
    let parsed: Vec<ClassItem> = match raw {
        RawOutput::Classes(classes) => classes,
        RawOutput::Value(value) => {
            let list = match &value {
                serde_json::Value::Object(map) => {
                    if let Some(serde_json::Value::Object(filters)) = map.get("filters") {
                        script_filters = Some(filters.clone());
                    }
                    map.get("class").cloned().unwrap_or(serde_json::Value::Null)
                }
                other => other.clone(),
            };
            classes_from_value(&list)
        }
        RawOutput::Items(_) | RawOutput::PassThrough => Vec::new(),
    };

    let mut class: Vec<ClassItem> = Vec::new();
    for item in rule.declared_classes.iter().cloned().chain(parsed) {
        if item.type_id.is_empty() || class.iter().any(|c| c.type_id == item.type_id) {
            continue;
        }
        if rule
            .cate_exclude
            .as_ref()
            .is_some_and(|re| re.is_match(&item.type_name))
        {
            continue;
        }
        class.push(item);
    }

    let filters = if with_filters {
        script_filters.unwrap_or_else(|| rule.filters.clone())
    } else {
        serde_json::Map::new()
    };
    HomeResult { class, filters }
}

fn declared_number(value: &serde_json::Value, key: &str) -> Option<u32> {
    let v = value.as_object()?.get(key)?;
    match v {
        serde_json::Value::Number(n) => n.as_u64().map(|n| n as u32),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Pagination envelope for category and search results.
pub(crate) fn shape_list(rule: &RuleDefinition, raw: RawOutput, page: u32) -> ListResult {
    let declared = match &raw {
        RawOutput::Value(value) => Some(value.clone()),
        _ => None,
    };
    let list = shape_items(raw);
    let field = |key: &str| declared.as_ref().and_then(|v| declared_number(v, key));

    let page = field("page").unwrap_or(page);
    let pagecount = field("pagecount").unwrap_or(if list.is_empty() { page } else { OPEN_PAGECOUNT });
    let limit = field("limit").unwrap_or(if rule.limit > 0 {
        rule.limit as u32
    } else {
        list.len() as u32
    });
    let total = field("total").unwrap_or(pagecount.saturating_mul(limit));

    ListResult {
        page,
        pagecount,
        limit,
        total,
        list,
    }
}

/// Detail envelope; every item without an id gets the requested one.
pub(crate) fn shape_detail(raw: RawOutput, id: &str) -> Vec<VodItem> {
    let mut items = shape_items(raw);
    for item in &mut items {
        if item.vod_id.is_empty() {
            item.vod_id = id.to_string();
        }
    }
    items
}

/// Classify the play target, then apply matching overrides.
pub(crate) fn shape_play(
    rule: &RuleDefinition,
    raw: RawOutput,
    id: &str,
    flags: &[String],
) -> PlayResult {
    let mut result = PlayResult::default();
    let explicit_parse = match raw {
        RawOutput::Value(serde_json::Value::String(url)) => {
            result.url = url;
            false
        }
        RawOutput::Value(serde_json::Value::Object(fields)) => merge_play_fields(&mut result, &fields),
        _ => false,
    };
    if result.url.is_empty() {
        result.url = id.to_string();
    }

    if !explicit_parse {
        result.parse = if rule.media_pattern.is_match(&result.url) { 0 } else { 1 };
    }
    if result.parse == 1 && result.jx == 0 && host_matches_flag(&result.url, flags) {
        result.jx = 1;
    }

    apply_play_overrides(&rule.play_overrides, result)
}

fn host_matches_flag(url: &str, flags: &[String]) -> bool {
    let host = crate::query::host_of(url).to_ascii_lowercase();
    flags
        .iter()
        .map(|f| f.trim().to_ascii_lowercase())
        .any(|f| !f.is_empty() && host.contains(&f))
}

/// Copy the recognizable fields of a script's play object onto `result`,
/// field by field. Returns `true` when the object carried a usable `parse`.
fn merge_play_fields(
    result: &mut PlayResult,
    fields: &serde_json::Map<String, serde_json::Value>,
) -> bool {
    if let Some(url) = fields.get("url").map(json_to_text).filter(|u| !u.is_empty()) {
        result.url = url;
    }
    if let Some(jx) = fields.get("jx").and_then(lenient_flag) {
        result.jx = jx;
    }
    result.header.extend(header_map(fields.get("header")));
    match fields.get("parse").and_then(lenient_flag) {
        Some(parse) => {
            result.parse = parse;
            true
        }
        None => false,
    }
}

/// `0`/`1` from booleans, numbers or numeric and yes/no strings.
fn lenient_flag(value: &serde_json::Value) -> Option<u8> {
    match value {
        serde_json::Value::Bool(b) => Some(u8::from(*b)),
        serde_json::Value::Number(n) => n.as_f64().map(|f| u8::from(f != 0.0)),
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(1),
            "false" | "no" => Some(0),
            other => other.parse::<f64>().ok().map(|f| u8::from(f != 0.0)),
        },
        _ => None,
    }
}

fn apply_play_overrides(overrides: &[(Regex, serde_json::Value)], mut result: PlayResult) -> PlayResult {
    let matching: Vec<&serde_json::Map<String, serde_json::Value>> = overrides
        .iter()
        .filter(|(re, _)| re.is_match(&result.url))
        .filter_map(|(_, v)| v.as_object())
        .collect();
    for fields in matching {
        merge_play_fields(&mut result, fields);
    }
    result
}

/// Accepts `[status, content_type, body]` or an object with the same fields.
pub(crate) fn shape_proxy(rule: &RuleDefinition, raw: RawOutput) -> EngineResult<ProxyResponse> {
    let unexpected = || {
        EngineError::script(
            rule.name(),
            Operation::Proxy,
            "proxy must return [status, content_type, body] or an object",
        )
    };
    let RawOutput::Value(value) = raw else {
        return Err(unexpected());
    };

    match value {
        serde_json::Value::Array(parts) if parts.len() >= 3 => Ok(ProxyResponse {
            status: parts[0].as_u64().unwrap_or(200) as u16,
            content_type: json_to_text(&parts[1]),
            body: json_to_text(&parts[2]),
            headers: header_map(parts.get(3)),
        }),
        serde_json::Value::Object(map) => Ok(ProxyResponse {
            status: map.get("status").and_then(|s| s.as_u64()).unwrap_or(200) as u16,
            content_type: map
                .get("content_type")
                .map(json_to_text)
                .unwrap_or_else(|| "text/plain".to_string()),
            body: map.get("body").map(json_to_text).unwrap_or_default(),
            headers: header_map(map.get("headers")),
        }),
        _ => Err(unexpected()),
    }
}

fn header_map(value: Option<&serde_json::Value>) -> std::collections::BTreeMap<String, String> {
    match value {
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_text(v)))
            .collect(),
        _ => Default::default(),
    }
}
