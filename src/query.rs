//! Content query primitives for markup and structured data.
//!
//! Markup selection is delegated to `scraper` CSS selectors, extended with
//! a small field-expression grammar:
//!
//! | Expression | Meaning |
//! |------------|---------|
//! | `.title` | text of the first `.title` |
//! | `.img@src` | `src` attribute of the first `.img` |
//! | `a&&href` | `href` attribute of the first `a` |
//! | `ul:eq(1)&&li:eq(-1)&&Text` | text of the last `li` in the second `ul` |
//! | `&&Html` | inner HTML of the element itself |
//!
//! Structured data is queried with dotted paths (`data.list.0.name`),
//! translated to JSON pointers.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use tracing::debug;

use crate::models::json_to_text;

/// What to read from a selected element.
#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    Text,
    Html,
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    selector: String,
    eq: Option<i64>,
}

/// A parsed field expression: a chain of selector steps plus an attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldExpr {
    steps: Vec<Step>,
    pub attr: Attr,
}

impl FieldExpr {
    pub fn parse(expr: &str) -> Self {
        let expr = expr.trim();
        let (selectors, attr): (Vec<&str>, &str) = if expr.contains("&&") {
            let mut parts: Vec<&str> = expr.split("&&").collect();
            let attr = parts.pop().unwrap_or("Text");
            (parts, attr)
        } else if let Some((sel, attr)) = expr.rsplit_once('@') {
            (vec![sel], attr)
        } else {
            (vec![expr], "Text")
        };

        let attr = match attr.trim() {
            "" | "Text" => Attr::Text,
            "Html" => Attr::Html,
            other => Attr::Named(other.to_string()),
        };

        let steps = selectors
            .into_iter()
            .flat_map(|s| split_steps(s.trim()))
            .collect();

        Self { steps, attr }
    }
}

fn eq_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?):eq\((-?\d+)\)$").expect("static regex"))
}

/// Split a selector on `:eq(n)` tokens, which `scraper` does not support.
fn split_steps(selector: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for token in selector.split_whitespace() {
        if let Some(caps) = eq_pattern().captures(token) {
            let base = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if !base.is_empty() {
                current.push(base);
            }
            let index = caps[2].parse::<i64>().unwrap_or(0);
            steps.push(Step {
                selector: join_selector(&current),
                eq: Some(index),
            });
            current.clear();
        } else {
            current.push(token);
        }
    }
    if !current.is_empty() || steps.is_empty() {
        steps.push(Step {
            selector: join_selector(&current),
            eq: None,
        });
    }
    steps
}

fn join_selector(tokens: &[&str]) -> String {
    tokens
        .join(" ")
        .trim_start_matches('>')
        .trim()
        .to_string()
}

fn compile(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(sel) => Some(sel),
        Err(e) => {
            debug!(selector = selector, error = %e, "invalid selector");
            None
        }
    }
}

fn pick<'a>(mut matches: Vec<ElementRef<'a>>, eq: Option<i64>) -> Vec<ElementRef<'a>> {
    match eq {
        None => matches,
        Some(i) => {
            let len = matches.len() as i64;
            let idx = if i < 0 { len + i } else { i };
            if idx < 0 || idx >= len {
                Vec::new()
            } else {
                vec![matches.swap_remove(idx as usize)]
            }
        }
    }
}

fn apply_step<'a>(root: ElementRef<'a>, step: &Step) -> Vec<ElementRef<'a>> {
    if step.selector.is_empty() {
        return pick(vec![root], step.eq);
    }
    let Some(sel) = compile(&step.selector) else {
        return Vec::new();
    };
    pick(root.select(&sel).collect(), step.eq)
}

/// All elements matched by a (possibly chained) selector under `root`.
///
/// Intermediate steps narrow to their first match; the last step keeps
/// every match.
pub fn select_all<'a>(root: ElementRef<'a>, selector: &str) -> Vec<ElementRef<'a>> {
    let steps: Vec<Step> = selector
        .split("&&")
        .flat_map(|s| split_steps(s.trim()))
        .collect();
    let mut current = root;
    for (i, step) in steps.iter().enumerate() {
        let matches = apply_step(current, step);
        if i + 1 == steps.len() {
            return matches;
        }
        match matches.into_iter().next() {
            Some(next) => current = next,
            None => return Vec::new(),
        }
    }
    vec![current]
}

/// Evaluate a field expression against `root`. `None` when nothing matched.
pub fn extract(root: ElementRef<'_>, expr: &FieldExpr) -> Option<String> {
    let mut current = root;
    for step in &expr.steps {
        current = apply_step(current, step).into_iter().next()?;
    }
    match &expr.attr {
        Attr::Text => Some(element_text(current)),
        Attr::Html => Some(current.inner_html()),
        Attr::Named(name) => current.value().attr(name).map(|v| v.trim().to_string()),
    }
}

/// Text content with whitespace runs collapsed.
pub fn element_text(el: ElementRef<'_>) -> String {
    let raw: String = el.text().collect();
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A parsed markup document.
pub struct MarkupDoc {
    html: Html,
}

impl MarkupDoc {
    pub fn parse(text: &str) -> Self {
        Self {
            html: Html::parse_document(text),
        }
    }

    pub fn root(&self) -> ElementRef<'_> {
        self.html.root_element()
    }

    pub fn select_all(&self, selector: &str) -> Vec<ElementRef<'_>> {
        select_all(self.root(), selector)
    }

    pub fn select_one(&self, expr: &str) -> Option<String> {
        extract(self.root(), &FieldExpr::parse(expr))
    }
}

/// Resolve a dotted path (`data.list.0.name`) inside a JSON value.
pub fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let path = path.trim().trim_start_matches('$').trim_start_matches('.');
    if path.is_empty() {
        return Some(value);
    }
    let pointer: String = path
        .split('.')
        .map(|seg| format!("/{}", seg.replace('~', "~0").replace('/', "~1")))
        .collect();
    value.pointer(&pointer)
}

/// Text of the value at `path`, `None` when missing or null.
pub fn json_text(value: &serde_json::Value, path: &str) -> Option<String> {
    match json_path(value, path)? {
        serde_json::Value::Null => None,
        v => Some(json_to_text(v)),
    }
}

/// Make `link` absolute against `base`. Empty links stay empty.
pub fn join_url(base: &str, link: &str) -> String {
    let link = link.trim();
    if link.is_empty() || url::Url::parse(link).is_ok() {
        return link.to_string();
    }
    match url::Url::parse(base).and_then(|b| b.join(link)) {
        Ok(joined) => joined.to_string(),
        Err(_) => link.to_string(),
    }
}

/// Host part of a URL, or the input itself when it does not parse.
pub fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| url.to_string())
}
