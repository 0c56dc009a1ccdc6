//! Normalized rule definitions.
//!
//! A [`RuleDefinition`] is what the loader produces from a rule script:
//! every declared field normalized to a concrete value, one resolved
//! [`Implementation`] per [`Operation`], and the sandbox the rule's own
//! functions live in.

use mlua::prelude::*;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::decode::DecodeStage;
use crate::fetch::{encode_query, FetchRequest};
use crate::models::{ClassItem, RuleRef};
use crate::query;
use crate::sandbox::{snippet_body, SandboxContext};

/// The operations a rule can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Classes,
    HomeVod,
    Category,
    Detail,
    Search,
    Play,
    Proxy,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Classes,
        Operation::HomeVod,
        Operation::Category,
        Operation::Detail,
        Operation::Search,
        Operation::Play,
        Operation::Proxy,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// The rule field that declares this operation.
    pub fn field(self) -> &'static str {
        match self {
            Operation::Classes => "class_parse",
            Operation::HomeVod => "home_vod",
            Operation::Category => "category",
            Operation::Detail => "detail",
            Operation::Search => "search",
            Operation::Play => "play",
            Operation::Proxy => "proxy",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Classes => "classes",
            Operation::HomeVod => "home_vod",
            Operation::Category => "category",
            Operation::Detail => "detail",
            Operation::Search => "search",
            Operation::Play => "play",
            Operation::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

/// Where the episode sources or lists of a structured detail come from.
#[derive(Clone)]
pub(crate) enum ListSource {
    Selector(String),
    Native(LuaFunction),
    Snippet(String),
}

impl ListSource {
    fn from_lua(value: LuaValue) -> Option<Self> {
        match value {
            LuaValue::Function(f) => Some(ListSource::Native(f)),
            LuaValue::String(s) => {
                let text = s.to_string_lossy();
                let text = text.trim();
                if text.is_empty() {
                    None
                } else if let Some(body) = snippet_body(text) {
                    Some(ListSource::Snippet(body.to_string()))
                } else {
                    Some(ListSource::Selector(text.to_string()))
                }
            }
            _ => None,
        }
    }
}

/// Structured (table-shaped) detail declaration.
#[derive(Clone, Default)]
pub(crate) struct DetailSpec {
    pub is_json: bool,
    pub title: Option<String>,
    pub desc: Option<String>,
    pub content: Option<String>,
    pub img: Option<String>,
    pub tabs: Option<ListSource>,
    pub tab_text: Option<String>,
    pub lists: Option<ListSource>,
    pub list_text: Option<String>,
    pub list_url: Option<String>,
    pub play_from: Option<String>,
    pub play_url: Option<String>,
}

impl DetailSpec {
    fn from_table(table: &LuaTable) -> LuaResult<Self> {
        let text = |key: &str| -> LuaResult<Option<String>> {
            Ok(match table.get::<LuaValue>(key)? {
                LuaValue::String(s) => {
                    let s = s.to_string_lossy();
                    (!s.trim().is_empty()).then(|| s.trim().to_string())
                }
                _ => None,
            })
        };
        Ok(Self {
            is_json: matches!(
                table.get::<LuaValue>("is_json")?,
                LuaValue::Boolean(true) | LuaValue::Integer(1)
            ),
            title: text("title")?,
            desc: text("desc")?,
            content: text("content")?,
            img: text("img")?,
            tabs: ListSource::from_lua(table.get("tabs")?),
            tab_text: text("tab_text")?,
            lists: ListSource::from_lua(table.get("lists")?),
            list_text: text("list_text")?,
            list_url: text("list_url")?,
            play_from: text("play_from")?,
            play_url: text("play_url")?,
        })
    }
}

/// How a rule implements one operation, resolved once at load time.
#[derive(Clone)]
pub(crate) enum Implementation {
    Absent,
    Native(LuaFunction),
    /// Body of a `lua:` string.
    Snippet(String),
    /// Selector string for the generic interpreter.
    Declarative(String),
    /// Table-shaped detail declaration.
    Structured(DetailSpec),
}

impl Implementation {
    pub(crate) fn resolve(op: Operation, value: LuaValue) -> LuaResult<Self> {
        Ok(match value {
            LuaValue::Function(f) => Implementation::Native(f),
            LuaValue::String(s) => {
                let text = s.to_string_lossy();
                let text = text.trim();
                if text.is_empty() {
                    Implementation::Absent
                } else if let Some(body) = snippet_body(text) {
                    Implementation::Snippet(body.to_string())
                } else {
                    Implementation::Declarative(text.to_string())
                }
            }
            LuaValue::Table(t) if op == Operation::Detail => {
                Implementation::Structured(DetailSpec::from_table(&t)?)
            }
            _ => Implementation::Absent,
        })
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Implementation::Absent => "absent",
            Implementation::Native(_) => "native",
            Implementation::Snippet(_) => "snippet",
            Implementation::Declarative(_) => "declarative",
            Implementation::Structured(_) => "structured",
        }
    }
}

/// A loaded, normalized rule.
///
/// Shared as `Arc<RuleDefinition>`; a reload produces a new value rather
/// than mutating this one.
pub struct RuleDefinition {
    pub(crate) reference: RuleRef,
    pub fingerprint: String,
    pub decode_stage: DecodeStage,
    pub title: String,
    pub host: String,
    pub home_url: String,
    pub category_url: String,
    pub detail_url: String,
    pub search_url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub encoding: String,
    pub cate_exclude: Option<Regex>,
    pub tab_exclude: Option<Regex>,
    pub double: bool,
    pub limit: usize,
    pub quick_search: bool,
    pub play_parse: bool,
    pub sniffer: bool,
    pub media_pattern: Regex,
    pub declared_classes: Vec<ClassItem>,
    pub filters: serde_json::Map<String, serde_json::Value>,
    pub(crate) filter_url: String,
    pub(crate) filter_defaults: serde_json::Map<String, serde_json::Value>,
    pub(crate) play_overrides: Vec<(Regex, serde_json::Value)>,
    pub(crate) fetch_hook: Option<LuaFunction>,
    /// Wall-clock time spent loading, including init hooks.
    pub load_cost: Duration,
    /// JSON view of every normalized field (functions omitted).
    pub snapshot: serde_json::Map<String, serde_json::Value>,
    /// One entry per operation, in [`Operation::ALL`] order.
    pub(crate) implementations: Vec<Implementation>,
    pub(crate) context: Arc<SandboxContext>,
}

impl std::fmt::Debug for RuleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleDefinition")
            .field("path", &self.reference.path)
            .field("ext", &self.reference.ext)
            .field("title", &self.title)
            .field("host", &self.host)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl RuleDefinition {
    /// Short name used in log fields and errors.
    pub fn name(&self) -> String {
        self.reference.display_name()
    }

    pub fn path(&self) -> &Path {
        &self.reference.path
    }

    pub fn ext(&self) -> &str {
        &self.reference.ext
    }

    pub(crate) fn implementation(&self, op: Operation) -> &Implementation {
        &self.implementations[op.index()]
    }

    /// Which shape each operation was declared with.
    pub fn implementation_kinds(&self) -> Vec<(Operation, &'static str)> {
        Operation::ALL
            .iter()
            .map(|op| (*op, self.implementation(*op).kind()))
            .collect()
    }

    /// Page-cache namespace for a call site on this rule's host.
    pub(crate) fn cache_namespace(&self, site: &str) -> String {
        format!("{}:{}", self.host_key(), site)
    }

    /// Host component used to scope cache entries and sessions.
    pub(crate) fn host_key(&self) -> String {
        query::host_of(&self.host)
    }

    /// A GET request carrying the rule's headers, timeout and charset.
    pub(crate) fn page_request(&self, url: &str) -> FetchRequest {
        let mut request = FetchRequest::get(url);
        request.headers = self.headers.clone();
        request.timeout = Some(self.timeout);
        request.encoding = Some(self.encoding.clone());
        request
    }

    /// Make a URL template absolute against the host.
    pub(crate) fn absolute(&self, template: &str) -> String {
        absolute_url(&self.host, template)
    }

    /// Category listing URL for `tid`, page `page` and the given filters.
    ///
    /// `url[first-page-url]` uses the bracketed form on page 1.
    pub(crate) fn category_target(
        &self,
        tid: &str,
        page: u32,
        extend: &serde_json::Map<String, serde_json::Value>,
    ) -> String {
        let (main, first) = split_first_page(&self.category_url);
        let template = match first {
            Some(first) if page <= 1 => first,
            _ => main,
        };

        let mut fl = match self.filter_defaults.get(tid) {
            Some(serde_json::Value::Object(defaults)) => defaults.clone(),
            _ => serde_json::Map::new(),
        };
        for (k, v) in extend {
            fl.insert(k.clone(), v.clone());
        }

        let filter_part = render_filter_template(&self.filter_url, &fl);
        let url = render_filter_template(template, &fl)
            .replace("fyclass", tid)
            .replace("fypage", &page.to_string())
            .replace("fyfilter", &filter_part);
        self.absolute(&url)
    }

    /// Search URL: `**` is the keyword in the rule's charset.
    pub(crate) fn search_target(&self, keyword: &str, page: u32) -> String {
        let (main, first) = split_first_page(&self.search_url);
        let template = match first {
            Some(first) if page <= 1 => first,
            _ => main,
        };
        let url = template
            .replace("**", &encode_query(keyword, &self.encoding))
            .replace("fypage", &page.to_string());
        self.absolute(&url)
    }

    /// Detail page URL for `id`.
    pub(crate) fn detail_target(&self, id: &str) -> String {
        if !self.detail_url.is_empty() {
            return self.absolute(&self.detail_url.replace("fyid", id));
        }
        self.absolute(id)
    }
}

/// Join a host and a URL template without touching placeholders.
pub(crate) fn absolute_url(host: &str, template: &str) -> String {
    let template = template.trim();
    if template.is_empty() || template.starts_with("http://") || template.starts_with("https://") {
        return template.to_string();
    }
    if template.starts_with("//") {
        let scheme = host.split("://").next().unwrap_or("https");
        return format!("{}:{}", scheme, template);
    }
    if host.is_empty() {
        return template.to_string();
    }
    if template.starts_with('/') {
        format!("{}{}", host, template)
    } else {
        format!("{}/{}", host, template)
    }
}

/// Split `main[first]` into its parts.
fn split_first_page(template: &str) -> (&str, Option<&str>) {
    if let (Some(open), true) = (template.rfind('['), template.ends_with(']')) {
        (&template[..open], Some(&template[open + 1..template.len() - 1]))
    } else {
        (template, None)
    }
}

fn filter_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*fl\.(\w+)\s*\}\}").expect("static regex"))
}

/// Replace `{{fl.key}}` placeholders; missing keys render empty.
pub(crate) fn render_filter_template(
    template: &str,
    values: &serde_json::Map<String, serde_json::Value>,
) -> String {
    filter_pattern()
        .replace_all(template, |caps: &regex::Captures| {
            values
                .get(&caps[1])
                .map(crate::models::json_to_text)
                .unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absolute_url() {
        assert_eq!(absolute_url("https://a.com", "/list/1"), "https://a.com/list/1");
        assert_eq!(absolute_url("https://a.com", "list/1"), "https://a.com/list/1");
        assert_eq!(absolute_url("https://a.com", "https://b.com/x"), "https://b.com/x");
        assert_eq!(absolute_url("https://a.com", "//cdn.com/x"), "https://cdn.com/x");
        assert_eq!(absolute_url("https://a.com", ""), "");
    }

    #[test]
    fn test_split_first_page() {
        assert_eq!(
            split_first_page("/t/fyclass-fypage.html[/t/fyclass.html]"),
            ("/t/fyclass-fypage.html", Some("/t/fyclass.html"))
        );
        assert_eq!(split_first_page("/t/fypage"), ("/t/fypage", None));
    }

    #[test]
    fn test_render_filter_template() {
        let values = json!({ "area": "us", "year": 2020 });
        let values = values.as_object().unwrap();
        assert_eq!(
            render_filter_template("/{{fl.area}}/{{ fl.year }}/{{fl.sort}}", values),
            "/us/2020/"
        );
    }

    #[test]
    fn test_operation_fields() {
        assert_eq!(Operation::Classes.field(), "class_parse");
        assert_eq!(Operation::HomeVod.to_string(), "home_vod");
        assert_eq!(Operation::ALL.len(), 7);
    }
}
