//! Generic parsing interpreter for declarative rules.
//!
//! Turns fetched page bodies into items according to selector strings:
//!
//! ```text
//! list;name;picture;remarks;link;description;regex     (listing)
//! groups;list;name;picture;remarks;link;...            (double mode)
//! list;name;link;regex                                  (class parse)
//! ```
//!
//! A `json:` prefix on the first segment switches to structured mode,
//! where every segment is a dotted path; `jsp:` states markup mode
//! explicitly. Extraction is best effort: a field that cannot be read
//! falls back to its default and never drops the item.
//!
//! Everything here is synchronous. Parsed markup is not `Send`, so callers
//! fetch first and interpret afterwards.

use regex::Regex;
use scraper::ElementRef;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::models::{json_to_text, ClassItem, VodItem};
use crate::query::{self, FieldExpr, MarkupDoc};
use crate::rule::{DetailSpec, ListSource};

/// Name used when an item's name cannot be extracted.
pub(crate) const NAME_PLACEHOLDER: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Markup,
    Json,
}

/// Strip a mode prefix from a list segment.
fn split_mode(segment: &str) -> (Option<Mode>, &str) {
    let segment = segment.trim();
    if let Some(rest) = segment.strip_prefix("json:") {
        (Some(Mode::Json), rest.trim())
    } else if let Some(rest) = segment.strip_prefix("jsp:") {
        (Some(Mode::Markup), rest.trim())
    } else {
        (None, segment)
    }
}

fn non_empty(segment: Option<&String>) -> Option<String> {
    segment
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A parsed listing selector.
#[derive(Debug, Clone)]
pub(crate) struct ExtractionRule {
    pub mode: Mode,
    pub groups: Option<String>,
    pub list: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub remarks: Option<String>,
    pub links: Vec<String>,
    pub description: Option<String>,
    pub refine: Option<Regex>,
}

impl ExtractionRule {
    /// Parse `selector`, resolving `*` against `inherit_from`.
    ///
    /// A whole-string `*` reuses `inherit_from` as is. A `*` segment reuses
    /// the segment at the same field position of `inherit_from`; in double
    /// mode positions are shifted by the extra group segment.
    pub fn parse(selector: &str, inherit_from: Option<&str>, double: bool) -> Self {
        let selector = selector.trim();
        let (selector, double) = match (selector, inherit_from) {
            ("*", Some(parent)) => (parent.trim(), false),
            _ => (selector, double),
        };

        let shift = usize::from(double);
        let parent: Vec<&str> = inherit_from.map(|p| p.split(';').collect()).unwrap_or_default();
        let segments: Vec<String> = selector
            .split(';')
            .enumerate()
            .map(|(i, seg)| {
                if seg.trim() == "*" && i >= shift {
                    parent.get(i - shift).copied().unwrap_or("").to_string()
                } else {
                    seg.to_string()
                }
            })
            .collect();

        let mut mode = None;
        let mut list_segment = |seg: Option<&String>| -> String {
            let (prefix, rest) = split_mode(seg.map(|s| s.as_str()).unwrap_or(""));
            if mode.is_none() {
                mode = prefix;
            }
            rest.to_string()
        };

        let groups = if double {
            Some(list_segment(segments.first())).filter(|g| !g.is_empty())
        } else {
            None
        };
        let list = list_segment(segments.get(shift));
        let field = |offset: usize| non_empty(segments.get(shift + 1 + offset));

        let links = field(3)
            .map(|link| split_links(&link))
            .unwrap_or_default();
        let refine = field(5).and_then(|pattern| compile_refine(&pattern));

        Self {
            mode: mode.unwrap_or(Mode::Markup),
            groups,
            list,
            name: field(0),
            picture: field(1),
            remarks: field(2),
            links,
            description: field(4),
            refine,
        }
    }

    /// Extract items from `body`. `per_group` caps each group in double mode.
    pub fn extract_items(&self, body: &str, base_url: &str, per_group: Option<usize>) -> Vec<VodItem> {
        if body.trim().is_empty() || self.list.is_empty() {
            return Vec::new();
        }
        match self.mode {
            Mode::Markup => self.extract_markup(body, base_url, per_group),
            Mode::Json => self.extract_json(body, base_url, per_group),
        }
    }

    fn extract_markup(&self, body: &str, base_url: &str, per_group: Option<usize>) -> Vec<VodItem> {
        let doc = MarkupDoc::parse(body);
        let elements: Vec<ElementRef<'_>> = match &self.groups {
            Some(groups) => doc
                .select_all(groups)
                .into_iter()
                .flat_map(|group| {
                    let items = query::select_all(group, &self.list);
                    let cap = per_group.unwrap_or(items.len());
                    items.into_iter().take(cap)
                })
                .collect(),
            None => doc.select_all(&self.list),
        };

        elements
            .into_iter()
            .map(|el| {
                let text = |expr: &Option<String>| {
                    expr.as_deref()
                        .and_then(|e| query::extract(el, &FieldExpr::parse(e)))
                        .unwrap_or_default()
                };
                let links: Vec<String> = self
                    .links
                    .iter()
                    .filter_map(|e| query::extract(el, &FieldExpr::parse(e)))
                    .filter(|l| !l.is_empty())
                    .collect();
                self.build_item(
                    text(&self.name),
                    text(&self.picture),
                    text(&self.remarks),
                    links,
                    text(&self.description),
                    base_url,
                )
            })
            .collect()
    }

    fn extract_json(&self, body: &str, base_url: &str, per_group: Option<usize>) -> Vec<VodItem> {
        let value: serde_json::Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "structured listing body is not valid JSON");
                return Vec::new();
            }
        };

        let elements: Vec<&serde_json::Value> = match &self.groups {
            Some(groups) => json_array(&value, groups)
                .into_iter()
                .flat_map(|group| {
                    let items = json_array(group, &self.list);
                    let cap = per_group.unwrap_or(items.len());
                    items.into_iter().take(cap)
                })
                .collect(),
            None => json_array(&value, &self.list),
        };

        elements
            .into_iter()
            .map(|item| {
                let text = |path: &Option<String>| {
                    path.as_deref()
                        .and_then(|p| query::json_text(item, p))
                        .unwrap_or_default()
                };
                let links: Vec<String> = self
                    .links
                    .iter()
                    .filter_map(|p| query::json_text(item, p))
                    .filter(|l| !l.is_empty())
                    .collect();
                self.build_item(
                    text(&self.name),
                    text(&self.picture),
                    text(&self.remarks),
                    links,
                    text(&self.description),
                    base_url,
                )
            })
            .collect()
    }

    fn build_item(
        &self,
        name: String,
        picture: String,
        remarks: String,
        links: Vec<String>,
        description: String,
        base_url: &str,
    ) -> VodItem {
        let name = if name.is_empty() {
            if self.name.is_some() {
                let err = EngineError::Extraction {
                    field: "vod_name".to_string(),
                    reason: "selector matched nothing".to_string(),
                };
                debug!(error = %err, "using placeholder name");
            }
            NAME_PLACEHOLDER.to_string()
        } else {
            name
        };
        let link = links.join("$");
        VodItem {
            vod_id: refine_id(self.refine.as_ref(), &link),
            vod_name: name,
            vod_pic: query::join_url(base_url, &picture),
            vod_remarks: remarks,
            vod_content: description,
            ..Default::default()
        }
    }
}

/// Split link expressions joined by `+`. A `+` with whitespace on either
/// side is a CSS sibling combinator and stays in the selector.
fn split_links(segment: &str) -> Vec<String> {
    let chars: Vec<char> = segment.chars().collect();
    let mut parts = Vec::new();
    let mut current = String::new();
    for (i, &c) in chars.iter().enumerate() {
        let joins = c == '+'
            && i > 0
            && i + 1 < chars.len()
            && !chars[i - 1].is_whitespace()
            && !chars[i + 1].is_whitespace();
        if joins {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn compile_refine(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = pattern, error = %e, "ignoring invalid refinement regex");
            None
        }
    }
}

/// Apply the trailing regex: first capture group, else the whole match,
/// else the link unchanged.
fn refine_id(refine: Option<&Regex>, link: &str) -> String {
    let Some(re) = refine else {
        return link.to_string();
    };
    match re.captures(link) {
        Some(caps) => caps
            .get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| link.to_string()),
        None => link.to_string(),
    }
}

fn json_array<'a>(value: &'a serde_json::Value, path: &str) -> Vec<&'a serde_json::Value> {
    match query::json_path(value, path) {
        Some(serde_json::Value::Array(items)) => items.iter().collect(),
        Some(serde_json::Value::Object(map)) => map.values().collect(),
        _ => Vec::new(),
    }
}

/// Parse categories with a `list;name;link;regex` selector.
pub(crate) fn extract_classes(selector: &str, body: &str) -> Vec<ClassItem> {
    if body.trim().is_empty() {
        return Vec::new();
    }
    let segments: Vec<&str> = selector.split(';').collect();
    let (mode, list) = split_mode(segments.first().copied().unwrap_or(""));
    let name_expr = segments.get(1).map(|s| s.trim()).unwrap_or("");
    let link_expr = segments.get(2).map(|s| s.trim()).unwrap_or("");
    let refine = segments
        .get(3)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .and_then(compile_refine);

    let pairs: Vec<(String, String)> = match mode.unwrap_or(Mode::Markup) {
        Mode::Markup => {
            let doc = MarkupDoc::parse(body);
            let name = FieldExpr::parse(if name_expr.is_empty() { "a&&Text" } else { name_expr });
            let link = FieldExpr::parse(if link_expr.is_empty() { "a&&href" } else { link_expr });
            doc.select_all(list)
                .into_iter()
                .map(|el| {
                    (
                        query::extract(el, &name).unwrap_or_default(),
                        query::extract(el, &link).unwrap_or_default(),
                    )
                })
                .collect()
        }
        Mode::Json => {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
                warn!("class listing body is not valid JSON");
                return Vec::new();
            };
            json_array(&value, list)
                .into_iter()
                .map(|item| {
                    (
                        query::json_text(item, name_expr).unwrap_or_default(),
                        query::json_text(item, link_expr).unwrap_or_default(),
                    )
                })
                .collect()
        }
    };

    pairs
        .into_iter()
        .filter_map(|(name, link)| {
            let type_id = refine_id(refine.as_ref(), &link);
            (!name.is_empty() && !type_id.is_empty()).then_some(ClassItem {
                type_id,
                type_name: name,
            })
        })
        .collect()
}

/// Extract the media URL of a play page with a field expression, or a
/// `json:`-prefixed path.
pub(crate) fn extract_play_url(expr: &str, body: &str, page_url: &str) -> Option<String> {
    let (mode, expr) = split_mode(expr);
    let found = match mode.unwrap_or(Mode::Markup) {
        Mode::Json => serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| query::json_text(&v, expr)),
        Mode::Markup => MarkupDoc::parse(body).select_one(expr),
    };
    found
        .map(|url| query::join_url(page_url, &url))
        .filter(|url| !url.is_empty())
}

/// Detail item whose single episode is the id itself.
pub(crate) fn passthrough_detail(id: &str) -> VodItem {
    VodItem {
        vod_id: id.to_string(),
        vod_name: id.to_string(),
        vod_play_from: "Default".to_string(),
        vod_play_url: format!("Play${}", id),
        ..Default::default()
    }
}

/// Source names and episode lists produced by rule code rather than selectors.
#[derive(Debug, Clone, Default)]
pub(crate) struct DetailOverrides {
    pub tabs: Option<Vec<String>>,
    /// One list of `name$url` episodes per source.
    pub lists: Option<Vec<Vec<String>>>,
}

/// Build a detail record from a structured declaration.
pub(crate) fn extract_detail(
    layout: &DetailSpec,
    body: &str,
    page_url: &str,
    tab_exclude: Option<&Regex>,
    overrides: DetailOverrides,
) -> VodItem {
    let mut item = if layout.is_json {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) => json_detail(layout, &value, page_url, tab_exclude, overrides),
            Err(e) => {
                warn!(url = page_url, error = %e, "structured detail body is not valid JSON");
                VodItem::default()
            }
        }
    } else {
        markup_detail(layout, body, page_url, tab_exclude, overrides)
    };
    if item.vod_name.is_empty() {
        item.vod_name = NAME_PLACEHOLDER.to_string();
    }
    item
}

fn split_fields(expr: &Option<String>) -> Vec<&str> {
    expr.as_deref()
        .map(|e| e.split(';').map(str::trim).collect())
        .unwrap_or_default()
}

fn markup_detail(
    layout: &DetailSpec,
    body: &str,
    page_url: &str,
    tab_exclude: Option<&Regex>,
    overrides: DetailOverrides,
) -> VodItem {
    let doc = MarkupDoc::parse(body);
    let one = |expr: Option<&str>| -> String {
        expr.filter(|e| !e.is_empty())
            .and_then(|e| doc.select_one(e))
            .unwrap_or_default()
    };

    let title = split_fields(&layout.title);
    let desc = split_fields(&layout.desc);
    let mut item = VodItem {
        vod_name: one(title.first().copied()),
        type_name: one(title.get(1).copied()),
        vod_remarks: one(desc.first().copied()),
        vod_year: one(desc.get(1).copied()),
        vod_area: one(desc.get(2).copied()),
        vod_actor: one(desc.get(3).copied()),
        vod_director: one(desc.get(4).copied()),
        vod_content: one(layout.content.as_deref()),
        vod_pic: query::join_url(page_url, &one(layout.img.as_deref())),
        ..Default::default()
    };

    if layout.play_from.is_some() && layout.tabs.is_none() && layout.lists.is_none() {
        item.vod_play_from = one(layout.play_from.as_deref());
        item.vod_play_url = one(layout.play_url.as_deref());
        return item;
    }

    let tabs = overrides.tabs.unwrap_or_else(|| match &layout.tabs {
        Some(ListSource::Selector(sel)) => {
            let text = FieldExpr::parse(layout.tab_text.as_deref().unwrap_or("&&Text"));
            doc.select_all(sel)
                .into_iter()
                .map(|el| query::extract(el, &text).unwrap_or_default())
                .collect()
        }
        _ => Vec::new(),
    });

    let lists = overrides.lists.unwrap_or_else(|| match &layout.lists {
        Some(ListSource::Selector(sel)) => {
            let name = FieldExpr::parse(layout.list_text.as_deref().unwrap_or("&&Text"));
            let url = layout.list_url.as_deref().map(FieldExpr::parse);
            (0..tabs.len().max(1))
                .map(|i| {
                    doc.select_all(&sel.replace("#id", &i.to_string()))
                        .into_iter()
                        .enumerate()
                        .filter_map(|(n, el)| {
                            let link = match &url {
                                Some(expr) => query::extract(el, expr),
                                None => own_link(el),
                            }?;
                            let link = query::join_url(page_url, &link);
                            if link.is_empty() {
                                return None;
                            }
                            let name = query::extract(el, &name)
                                .filter(|n| !n.is_empty())
                                .unwrap_or_else(|| (n + 1).to_string());
                            Some(format!("{}${}", name, link))
                        })
                        .collect()
                })
                .collect()
        }
        _ => Vec::new(),
    });

    let (from, urls) = assemble_sources(tabs, lists, tab_exclude);
    item.vod_play_from = from;
    item.vod_play_url = urls;
    item
}

/// The element's own `href`, else the first descendant link.
fn own_link(el: ElementRef<'_>) -> Option<String> {
    if let Some(href) = el.value().attr("href") {
        return Some(href.trim().to_string());
    }
    query::select_all(el, "a[href]")
        .into_iter()
        .next()
        .and_then(|a| a.value().attr("href").map(|h| h.trim().to_string()))
}

fn json_detail(
    layout: &DetailSpec,
    value: &serde_json::Value,
    page_url: &str,
    tab_exclude: Option<&Regex>,
    overrides: DetailOverrides,
) -> VodItem {
    let one = |path: Option<&str>| -> String {
        path.filter(|p| !p.is_empty())
            .and_then(|p| query::json_text(value, p))
            .unwrap_or_default()
    };

    let title = split_fields(&layout.title);
    let desc = split_fields(&layout.desc);
    let mut item = VodItem {
        vod_name: one(title.first().copied()),
        type_name: one(title.get(1).copied()),
        vod_remarks: one(desc.first().copied()),
        vod_year: one(desc.get(1).copied()),
        vod_area: one(desc.get(2).copied()),
        vod_actor: one(desc.get(3).copied()),
        vod_director: one(desc.get(4).copied()),
        vod_content: one(layout.content.as_deref()),
        vod_pic: query::join_url(page_url, &one(layout.img.as_deref())),
        ..Default::default()
    };

    if layout.play_from.is_some() && layout.tabs.is_none() && layout.lists.is_none() {
        item.vod_play_from = one(layout.play_from.as_deref());
        item.vod_play_url = one(layout.play_url.as_deref());
        return item;
    }

    let tabs = overrides.tabs.unwrap_or_else(|| match &layout.tabs {
        Some(ListSource::Selector(path)) => json_array(value, path)
            .into_iter()
            .map(|tab| match layout.tab_text.as_deref() {
                Some(p) => query::json_text(tab, p).unwrap_or_default(),
                None => json_to_text(tab),
            })
            .collect(),
        _ => Vec::new(),
    });

    let lists = overrides.lists.unwrap_or_else(|| match &layout.lists {
        Some(ListSource::Selector(path)) => (0..tabs.len().max(1))
            .map(|i| {
                json_array(value, &path.replace("#id", &i.to_string()))
                    .into_iter()
                    .enumerate()
                    .filter_map(|(n, ep)| json_episode(layout, ep, n, page_url))
                    .collect()
            })
            .collect(),
        _ => Vec::new(),
    });

    let (from, urls) = assemble_sources(tabs, lists, tab_exclude);
    item.vod_play_from = from;
    item.vod_play_url = urls;
    item
}

fn json_episode(
    layout: &DetailSpec,
    ep: &serde_json::Value,
    index: usize,
    page_url: &str,
) -> Option<String> {
    if let serde_json::Value::String(s) = ep {
        return (!s.is_empty()).then(|| s.clone());
    }
    let url = query::json_text(ep, layout.list_url.as_deref().unwrap_or("url"))?;
    let url = query::join_url(page_url, &url);
    if url.is_empty() {
        return None;
    }
    let name = query::json_text(ep, layout.list_text.as_deref().unwrap_or("name"))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| (index + 1).to_string());
    Some(format!("{}${}", name, url))
}

/// Combine source names and episode lists into the `$$$`-joined play fields.
///
/// Names are whitespace-collapsed, sources without episodes or whose name
/// matches `tab_exclude` are dropped, and repeated names get numeric
/// suffixes (`name`, `name2`, `name3`).
pub(crate) fn assemble_sources(
    tabs: Vec<String>,
    lists: Vec<Vec<String>>,
    tab_exclude: Option<&Regex>,
) -> (String, String) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut froms = Vec::new();
    let mut urls = Vec::new();

    for (i, episodes) in lists.into_iter().enumerate() {
        if episodes.is_empty() {
            continue;
        }
        let raw = tabs
            .get(i)
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("Line {}", i + 1));
        if tab_exclude.is_some_and(|re| re.is_match(&raw)) {
            continue;
        }
        let count = seen.entry(raw.clone()).or_insert(0);
        *count += 1;
        let name = if *count == 1 {
            raw
        } else {
            format!("{}{}", raw, count)
        };
        froms.push(name);
        urls.push(episodes.join("#"));
    }

    (froms.join("$$$"), urls.join("$$$"))
}
