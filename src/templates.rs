//! Template registry for rule inheritance.
//!
//! A rule that sets `template = "<name>"` inherits every field of that
//! template it does not declare itself. Templates are plain field maps.
//! The built-in set covers common site layouts; a TOML file can add or
//! replace templates:
//!
//! ```toml
//! [mysite]
//! class_parse = ".nav li;a&&Text;a&&href;/type/(\\d+)"
//! url = "/type/fyclass-fypage.html"
//! category = ".item;.title;.img@src;.meta;a&&href"
//! ```

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;

/// Fields contributed by a template.
pub type TemplateFields = serde_json::Map<String, serde_json::Value>;

/// Lookup of templates by name.
pub trait TemplateRegistry: Send + Sync {
    fn by_name(&self, name: &str) -> Option<TemplateFields>;

    /// Template names in probing order for automatic detection.
    fn names(&self) -> Vec<String>;
}

/// An ordered, in-memory set of templates.
#[derive(Debug, Clone, Default)]
pub struct StaticTemplates {
    entries: Vec<(String, TemplateFields)>,
}

impl StaticTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, fields: TemplateFields) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = fields,
            None => self.entries.push((name, fields)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, fields: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = fields {
            self.insert(name, map);
        }
        self
    }

    /// Built-in templates for common catalog site layouts.
    pub fn builtin() -> Self {
        Self::new()
            .with(
                "mxpro",
                json!({
                    "class_parse": ".navbar-items li;a&&Text;a&&href;/(\\d+)\\.html",
                    "url": "/vodshow/fyclass--------fypage---.html",
                    "searchUrl": "/vodsearch/**----------fypage---.html",
                    "double": true,
                    "home_vod": ".tab-list.active;a.module-poster-item;.module-poster-item-title&&Text;.lazyload&&data-original;.module-item-note&&Text;&&href",
                    "category": "a.module-poster-item;&&title;.lazyload&&data-original;.module-item-note&&Text;&&href",
                    "detail": {
                        "title": "h1&&Text;.module-info-tag-link:eq(-1)&&Text",
                        "img": ".lazyload&&data-original",
                        "desc": ".module-info-item:eq(-2)&&Text;.module-info-tag-link&&Text;.module-info-tag-link:eq(1)&&Text;.module-info-item:eq(2)&&Text;.module-info-item:eq(1)&&Text",
                        "content": ".module-info-introduction&&Text",
                        "tabs": ".module-tab-item",
                        "lists": ".module-play-list:eq(#id) a"
                    },
                    "search": ".module-card-item;.module-card-item-title&&Text;.lazyload&&data-original;.module-item-note&&Text;a&&href;.module-info-item-content&&Text"
                }),
            )
            .with(
                "mxone5",
                json!({
                    "class_parse": ".nav-menu-items li;a&&Text;a&&href;.*/(.*?)\\.html",
                    "url": "/show/fyclass--------fypage---.html",
                    "searchUrl": "/search/**----------fypage---.html",
                    "double": true,
                    "home_vod": ".module-list;.module-items .module-item;a&&title;img&&data-src;.module-item-text&&Text;a&&href",
                    "category": ".module-items .module-item;a&&title;img&&data-src;.module-item-text&&Text;a&&href",
                    "detail": {
                        "title": "h1&&Text;.tag-link&&Text",
                        "img": ".module-item-pic img&&data-src",
                        "desc": ".video-info-items:eq(3)&&Text;.tag-link:eq(2)&&Text;.tag-link:eq(1)&&Text;.video-info-items:eq(1)&&Text;.video-info-items:eq(0)&&Text",
                        "content": ".vod_content&&Text",
                        "tabs": ".module-tab-item",
                        "lists": ".module-player-list:eq(#id) a"
                    },
                    "search": ".module-items .module-search-item;a&&title;img&&data-src;.video-serial&&Text;a&&href"
                }),
            )
            .with(
                "mac_api",
                json!({
                    "class_parse": "json:class;type_name;type_id",
                    "homeUrl": "/api.php/provide/vod/",
                    "url": "/api.php/provide/vod/?ac=detail&t=fyclass&pg=fypage",
                    "detailUrl": "/api.php/provide/vod/?ac=detail&ids=fyid",
                    "searchUrl": "/api.php/provide/vod/?ac=detail&wd=**&pg=fypage",
                    "category": "json:list;vod_name;vod_pic;vod_remarks;vod_id",
                    "search": "*",
                    "detail": {
                        "is_json": true,
                        "title": "list.0.vod_name;list.0.type_name",
                        "img": "list.0.vod_pic",
                        "desc": "list.0.vod_remarks;list.0.vod_year;list.0.vod_area;list.0.vod_actor;list.0.vod_director",
                        "content": "list.0.vod_content",
                        "play_from": "list.0.vod_play_from",
                        "play_url": "list.0.vod_play_url"
                    }
                }),
            )
    }

    /// Load templates from a TOML file where every top-level table is a template.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read templates file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse templates file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let mut templates = Self::new();
        for (name, value) in table {
            match serde_json::to_value(value)? {
                serde_json::Value::Object(fields) => templates.insert(name, fields),
                _ => anyhow::bail!("template '{}' must be a table", name),
            }
        }
        Ok(templates)
    }

    /// Overlay `other` on top of `self`; `other` wins on name clashes.
    pub fn merged(mut self, other: StaticTemplates) -> Self {
        for (name, fields) in other.entries {
            self.insert(name, fields);
        }
        self
    }
}

impl TemplateRegistry for StaticTemplates {
    fn by_name(&self, name: &str) -> Option<TemplateFields> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f.clone())
    }

    fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }
}
