//! # rulex CLI
//!
//! Loads scraper rules and runs their operations from the command line,
//! printing results as JSON.
//!
//! ## Usage
//!
//! ```bash
//! rulex --config ./config/rulex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rulex list` | List rule files under `engine.rules_dir` |
//! | `rulex check <rule>` | Load a rule and show how it implements each operation |
//! | `rulex run <rule> <op>` | Run one operation and print the result |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use rulex::config::{self, Config};
use rulex::models::{Env, RuleRef};
use rulex::Engine;

/// rulex: run site scraper rules in a sandbox.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file falls back to the built-in defaults.
#[derive(Parser)]
#[command(name = "rulex", version, about = "Sandboxed execution engine for site scraper rules")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rulex.toml")]
    config: PathBuf,

    /// Proxy endpoint exposed to rules as `ENV.proxy_url`.
    #[arg(long, global = true)]
    proxy_url: Option<String>,

    /// Caller host exposed to rules as `ENV.request_host`.
    #[arg(long, global = true)]
    request_host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List rule files found under the rules directory.
    List {
        /// Glob matched against paths relative to the rules directory.
        #[arg(long, default_value = "**/*.lua")]
        glob: Vec<String>,
    },

    /// Load a rule and print its normalized summary.
    Check {
        /// Path to the rule file.
        rule: PathBuf,
        /// Query extension distinguishing otherwise identical rule refs.
        #[arg(long, default_value = "")]
        ext: String,
    },

    /// Run one operation against a rule.
    Run {
        /// Path to the rule file.
        rule: PathBuf,
        #[arg(long, default_value = "")]
        ext: String,
        #[command(subcommand)]
        op: OperationCmd,
    },
}

#[derive(Subcommand)]
enum OperationCmd {
    /// Categories and filters.
    Home {
        #[arg(long)]
        filter: bool,
    },
    /// Featured items on the landing page.
    HomeVod,
    /// One page of a category listing.
    Category {
        tid: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        filter: bool,
        /// Filter selections as `key=value` pairs.
        #[arg(long = "extend", value_parser = parse_key_val)]
        extend: Vec<(String, String)>,
    },
    /// Detail records for one or more ids.
    Detail {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Keyword search.
    Search {
        keyword: String,
        #[arg(long)]
        quick: bool,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Resolve a playable target.
    Play {
        flag: String,
        id: String,
        /// Source names handled by a known-site resolver.
        #[arg(long = "flags", value_delimiter = ',')]
        flags: Vec<String>,
    },
    /// Proxy passthrough.
    Proxy {
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
}

/// Parse a `key=value` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn to_map(pairs: Vec<(String, String)>) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_config(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

fn list_rules(cfg: &Config, patterns: &[String]) -> Result<()> {
    let root = &cfg.engine.rules_dir;
    if !root.exists() {
        anyhow::bail!("rules directory does not exist: {}", root.display());
    }
    let include = build_globset(patterns)?;

    let mut found = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if include.is_match(relative) {
            found.push(relative.to_path_buf());
        }
    }
    found.sort();

    if found.is_empty() {
        println!("No rules found under {}", root.display());
    }
    for path in found {
        println!("{}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = read_config(&cli.config)?;
    let env = Env {
        proxy_url: cli.proxy_url,
        request_host: cli.request_host,
        ..Default::default()
    };

    match cli.command {
        Commands::List { glob } => list_rules(&cfg, &glob)?,
        Commands::Check { rule, ext } => {
            let engine = Engine::new(cfg)?;
            let definition = engine.load(&RuleRef::new(rule).with_ext(ext), &env).await?;
            println!("Rule:     {}", definition.title);
            println!("Path:     {}", definition.path().display());
            if !definition.ext().is_empty() {
                println!("Ext:      {}", definition.ext());
            }
            println!("Host:     {}", definition.host);
            println!("Source:   {:?}", definition.decode_stage);
            println!("Load:     {} ms", definition.load_cost.as_millis());
            println!("Operations:");
            for (op, shape) in definition.implementation_kinds() {
                println!("  {:<10} {}", op.to_string(), shape);
            }
        }
        Commands::Run { rule, ext, op } => {
            let engine = Engine::new(cfg)?;
            let rule = RuleRef::new(rule).with_ext(ext);
            match op {
                OperationCmd::Home { filter } => print_json(&engine.home(&rule, &env, filter).await?)?,
                OperationCmd::HomeVod => print_json(&engine.home_featured(&rule, &env).await?)?,
                OperationCmd::Category {
                    tid,
                    page,
                    filter,
                    extend,
                } => print_json(
                    &engine
                        .category(&rule, &env, &tid, page, filter, &to_map(extend))
                        .await?,
                )?,
                OperationCmd::Detail { ids } => print_json(&engine.detail(&rule, &env, &ids).await?)?,
                OperationCmd::Search {
                    keyword,
                    quick,
                    page,
                } => print_json(&engine.search(&rule, &env, &keyword, quick, page).await?)?,
                OperationCmd::Play { flag, id, flags } => {
                    print_json(&engine.play(&rule, &env, &flag, &id, &flags).await?)?
                }
                OperationCmd::Proxy { params } => {
                    print_json(&engine.proxy(&rule, &env, &to_map(params)).await?)?
                }
            }
        }
    }

    Ok(())
}
