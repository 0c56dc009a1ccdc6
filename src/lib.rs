//! # rulex
//!
//! A sandboxed execution engine for site-specific scraper rules.
//!
//! A rule is a small Lua program describing one content site: where its
//! home, category, detail and search pages live, and how to pull listings,
//! episodes and playable links out of them. Each operation may be written
//! as a Lua function, a `lua:` snippet, a declarative selector string, or
//! left out entirely. The engine loads each rule into its own sandbox under
//! a hard time budget and exposes the same operations for every rule
//! regardless of how it implements them.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────────┐
//! │ Rule file  │──▶│  Loader    │──▶│ RuleDefinition│
//! │ (.lua/enc) │   │ decode+run │   │  + Sandbox    │
//! └────────────┘   └────────────┘   └──────┬───────┘
//!                                          │
//!                  ┌───────────────────────┤
//!                  ▼                       ▼
//!            ┌────────────┐         ┌─────────────┐
//!            │ Dispatcher │────────▶│ Interpreter │
//!            │ + Bridge   │         │ (selectors) │
//!            └─────┬──────┘         └─────────────┘
//!                  ▼
//!            ┌────────────┐
//!            │ Page cache │
//!            └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rulex list                              # rules under engine.rules_dir
//! rulex check rules/site.lua              # load and show implementation shapes
//! rulex run rules/site.lua home --filter
//! rulex run rules/site.lua category 1 --page 2
//! rulex run rules/site.lua search "keyword"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Requests, results and rule references |
//! | [`error`] | Typed engine errors |
//! | [`engine`] | Public operation surface |
//! | [`loader`] | Rule loading, templates and normalization |
//! | [`rule`] | Normalized rule definitions |
//! | [`decode`] | Source decoding chain |
//! | [`templates`] | Template registry for rule inheritance |
//! | [`fetch`] | HTTP fetching abstraction |
//! | [`page_cache`] | Bounded page cache and session tracking |
//! | [`query`] | Markup and JSON selection helpers |

pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod models;
pub mod page_cache;
pub mod query;
pub mod rule;
pub mod templates;

mod bridge;
mod dispatcher;
mod interpreter;
mod lua_runtime;
mod sandbox;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
