use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    /// Read-only key/value settings exposed to rules and normalization.
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Directory scanned by `rulex list`.
    #[serde(default = "default_rules_dir")]
    pub rules_dir: PathBuf,
    /// Hard wall-clock budget for executing a rule and its init hooks.
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    /// Per-request timeout used when a rule declares none.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rules_dir: default_rules_dir(),
            load_timeout_ms: default_load_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("rules")
}
fn default_load_timeout_ms() -> u64 {
    30_000
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// How long a browsing session keeps reusing cached pages.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_secs: default_ttl_secs(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

fn default_capacity() -> usize {
    20
}
fn default_ttl_secs() -> u64 {
    20
}
fn default_session_ttl_secs() -> u64 {
    600
}

/// Keys for the encrypted stages of the source decoding chain.
///
/// Both are base64-encoded 32-byte keys. A stage without a key is skipped.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DecodeConfig {
    #[serde(default)]
    pub aes_key: Option<String>,
    #[serde(default)]
    pub box_secret_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TemplatesConfig {
    /// Optional TOML file with extra templates, layered over the built-ins.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Read-only key/value settings store.
///
/// Rules read it through `settings.get(key)`; normalization reads feature
/// flags such as `enable_sniffer` from it.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    /// Interpret a setting as a boolean flag; missing keys are `false`.
    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("1" | "true" | "yes" | "on")
        )
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.engine.load_timeout_ms == 0 {
        anyhow::bail!("engine.load_timeout_ms must be > 0");
    }

    if config.cache.capacity == 0 {
        anyhow::bail!("cache.capacity must be > 0");
    }

    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }

    for (name, key) in [
        ("decode.aes_key", &config.decode.aes_key),
        ("decode.box_secret_key", &config.decode.box_secret_key),
    ] {
        if let Some(key) = key {
            crate::decode::decode_key(key).with_context(|| format!("{} is invalid", name))?;
        }
    }

    Ok(())
}
