//! Core data models used throughout the engine.
//!
//! These types represent the rule identities, per-call requests and the
//! result shapes every operation returns, regardless of how the rule
//! implemented it.

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Immutable rule file contents plus a fingerprint used for staleness checks.
#[derive(Debug, Clone)]
pub struct RuleSource {
    pub path: PathBuf,
    pub text: String,
    pub fingerprint: String,
}

impl RuleSource {
    pub fn new(path: impl Into<PathBuf>, text: String) -> Self {
        let fingerprint = hex::encode(Sha256::digest(text.as_bytes()));
        Self {
            path: path.into(),
            text,
            fingerprint,
        }
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(path, text))
    }
}

/// Caller-side identity of a rule: the file plus its extension parameters.
///
/// Two refs with the same path but different `ext` load independent
/// definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleRef {
    pub path: PathBuf,
    pub ext: String,
}

impl RuleRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ext: String::new(),
        }
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = ext.into();
        self
    }

    /// Stable identifier of the browsing session this rule ref belongs to.
    pub fn session_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.ext.as_bytes());
        hex::encode(&hasher.finalize()[..12])
    }

    /// Short name used in log fields.
    pub fn display_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Caller-supplied context injected into the rule's globals as `ENV`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Env {
    /// Base URL under which the front end serves `proxy` calls.
    pub proxy_url: Option<String>,
    /// Host the front end was reached on.
    pub request_host: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// Transient per-call record handed to the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct InvocationRequest {
    /// Positional arguments passed to native implementations after `self`.
    pub args: Vec<serde_json::Value>,
    /// Variables visible to the call ahead of the shared rule fields.
    pub vars: serde_json::Map<String, serde_json::Value>,
}

impl InvocationRequest {
    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn var(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    pub fn var_str(&self, name: &str) -> Option<&str> {
        self.vars.get(name).and_then(|v| v.as_str())
    }
}

/// A content item (listing entry or detail record).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VodItem {
    #[serde(deserialize_with = "lenient_string")]
    pub vod_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub vod_name: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub vod_pic: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub vod_remarks: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub vod_content: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub type_name: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub vod_year: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub vod_area: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub vod_actor: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub vod_director: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub vod_play_from: String,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub vod_play_url: String,
}

/// A browsable category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassItem {
    #[serde(deserialize_with = "lenient_string")]
    pub type_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub type_name: String,
}

/// Result of the `home` operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HomeResult {
    pub class: Vec<ClassItem>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub filters: serde_json::Map<String, serde_json::Value>,
}

/// Result of the featured-home operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeaturedResult {
    pub list: Vec<VodItem>,
}

/// Paginated list envelope used by category, search and detail.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListResult {
    pub page: u32,
    pub pagecount: u32,
    pub limit: u32,
    pub total: u32,
    pub list: Vec<VodItem>,
}

/// Playback descriptor returned by `play`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayResult {
    /// `0` when the URL is directly playable, `1` when it needs a secondary resolver.
    pub parse: u8,
    /// `1` when the URL should be handed to a known-site resolver.
    pub jx: u8,
    #[serde(deserialize_with = "lenient_string")]
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
}

/// Raw response produced by the `proxy` operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Accept strings, numbers and booleans where a string is expected.
///
/// Scripts routinely return numeric ids; rejecting them would drop the
/// whole item.
pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(json_to_text(&value))
}

/// Render a JSON scalar as plain text; containers render as JSON.
pub(crate) fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
