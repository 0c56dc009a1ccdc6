//! The public operation surface.
//!
//! [`Engine`] owns the rule loader, the page cache and the session tracker,
//! and exposes one async method per content operation. Every method loads
//! (or reuses) the rule, builds the per-call variables and native
//! arguments, dispatches, then post-processes into the operation's result
//! type.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bridge::SandboxBridge;
use crate::config::Config;
use crate::dispatcher::{self, RawOutput};
use crate::error::EngineResult;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::loader::RuleLoader;
use crate::models::{
    Env, FeaturedResult, HomeResult, InvocationRequest, ListResult, PlayResult, ProxyResponse,
    RuleRef,
};
use crate::page_cache::{PageCache, SessionTracker};
use crate::rule::{Operation, RuleDefinition};
use crate::templates::{StaticTemplates, TemplateRegistry};

pub struct Engine {
    loader: RuleLoader,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<PageCache>,
    sessions: SessionTracker,
}

impl Engine {
    /// Build an engine with the HTTP fetcher and the built-in templates,
    /// layered with the configured template file if any.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(
            &config.engine.user_agent,
            Duration::from_millis(config.engine.request_timeout_ms),
        )?);
        let mut templates = StaticTemplates::builtin();
        if let Some(path) = &config.templates.path {
            templates = templates.merged(StaticTemplates::from_toml_file(path)?);
        }
        Ok(Self::with_parts(&config, fetcher, Arc::new(templates)))
    }

    pub fn with_parts(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        templates: Arc<dyn TemplateRegistry>,
    ) -> Self {
        Self {
            loader: RuleLoader::new(config, Arc::clone(&fetcher), templates),
            fetcher,
            cache: Arc::new(PageCache::new(
                config.cache.capacity,
                Duration::from_secs(config.cache.ttl_secs),
            )),
            sessions: SessionTracker::new(Duration::from_secs(config.cache.session_ttl_secs)),
        }
    }

    /// Load `rule`, reusing the cached definition while its file is unchanged.
    pub async fn load(&self, rule: &RuleRef, env: &Env) -> EngineResult<Arc<RuleDefinition>> {
        self.loader.load(rule, env, false).await
    }

    /// Reload `rule` unconditionally.
    pub async fn refresh(&self, rule: &RuleRef, env: &Env) -> EngineResult<Arc<RuleDefinition>> {
        self.loader.load(rule, env, true).await
    }

    /// Categories (and optionally filters). Dispatch failures degrade to
    /// the rule's declared classes.
    pub async fn home(&self, rule: &RuleRef, env: &Env, filter: bool) -> EngineResult<HomeResult> {
        let definition = self.load(rule, env).await?;
        self.touch_session(rule, &definition);

        let request = InvocationRequest::default().var("input", definition.home_url.clone());
        let raw = self
            .dispatch_or_empty(&definition, env, Operation::Classes, request)
            .await;
        Ok(dispatcher::shape_home(&definition, raw, filter))
    }

    /// Featured items for the landing page. Failures degrade to an empty list.
    pub async fn home_featured(&self, rule: &RuleRef, env: &Env) -> EngineResult<FeaturedResult> {
        let definition = self.load(rule, env).await?;
        self.touch_session(rule, &definition);

        let request = InvocationRequest::default().var("input", definition.home_url.clone());
        let raw = self
            .dispatch_or_empty(&definition, env, Operation::HomeVod, request)
            .await;
        Ok(FeaturedResult {
            list: dispatcher::shape_items(raw),
        })
    }

    pub async fn category(
        &self,
        rule: &RuleRef,
        env: &Env,
        tid: &str,
        page: u32,
        filter: bool,
        extend: &serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<ListResult> {
        let definition = self.load(rule, env).await?;
        let page = page.max(1);
        let request = InvocationRequest::default()
            .arg(tid)
            .arg(page)
            .arg(filter)
            .arg(serde_json::Value::Object(extend.clone()))
            .var("input", definition.category_target(tid, page, extend))
            .var("category", tid)
            .var("page", page)
            .var("filters", serde_json::Value::Object(extend.clone()));

        let raw = self
            .dispatch(&definition, env, Operation::Category, request)
            .await?;
        Ok(dispatcher::shape_list(&definition, raw, page))
    }

    /// Detail records, one per id, in the order given.
    pub async fn detail(&self, rule: &RuleRef, env: &Env, ids: &[String]) -> EngineResult<ListResult> {
        let definition = self.load(rule, env).await?;
        let mut list = Vec::with_capacity(ids.len());
        for id in ids {
            let request = InvocationRequest::default()
                .arg(id.as_str())
                .var("input", definition.detail_target(id))
                .var("id", id.as_str());
            let raw = self
                .dispatch(&definition, env, Operation::Detail, request)
                .await?;
            list.extend(dispatcher::shape_detail(raw, id));
        }
        let count = list.len() as u32;
        Ok(ListResult {
            page: 1,
            pagecount: 1,
            limit: count,
            total: count,
            list,
        })
    }

    /// Keyword search. A quick search against a rule that opted out of it
    /// returns an empty page without touching the site.
    pub async fn search(
        &self,
        rule: &RuleRef,
        env: &Env,
        keyword: &str,
        quick: bool,
        page: u32,
    ) -> EngineResult<ListResult> {
        let definition = self.load(rule, env).await?;
        let page = page.max(1);
        if quick && !definition.quick_search {
            debug!(rule = %definition.name(), "quick search disabled for rule");
            return Ok(dispatcher::shape_list(&definition, RawOutput::Items(Vec::new()), page));
        }
        self.touch_session(rule, &definition);

        let request = InvocationRequest::default()
            .arg(keyword)
            .arg(quick)
            .arg(page)
            .var("input", definition.search_target(keyword, page))
            .var("keyword", keyword)
            .var("page", page);

        let raw = self
            .dispatch(&definition, env, Operation::Search, request)
            .await?;
        Ok(dispatcher::shape_list(&definition, raw, page))
    }

    /// Resolve a playable target for episode `id` of source `flag`.
    pub async fn play(
        &self,
        rule: &RuleRef,
        env: &Env,
        flag: &str,
        id: &str,
        flags: &[String],
    ) -> EngineResult<PlayResult> {
        let definition = self.load(rule, env).await?;
        let request = InvocationRequest::default()
            .arg(flag)
            .arg(id)
            .arg(flags.to_vec())
            .var("input", definition.absolute(id))
            .var("flag", flag)
            .var("id", id)
            .var("flags", flags.to_vec());

        let raw = self
            .dispatch(&definition, env, Operation::Play, request)
            .await?;
        Ok(dispatcher::shape_play(&definition, raw, id, flags))
    }

    pub async fn proxy(
        &self,
        rule: &RuleRef,
        env: &Env,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<ProxyResponse> {
        let definition = self.load(rule, env).await?;
        let params = serde_json::Value::Object(params.clone());
        let request = InvocationRequest::default()
            .arg(params.clone())
            .var("input", params);

        let raw = self
            .dispatch(&definition, env, Operation::Proxy, request)
            .await?;
        dispatcher::shape_proxy(&definition, raw)
    }

    /// Drop every cached definition, page and session.
    pub fn clear_all(&self) {
        self.loader.clear();
        self.cache.clear();
        self.sessions.clear();
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.cache
    }

    /// Number of cached rule definitions.
    pub fn loaded_rules(&self) -> usize {
        self.loader.len()
    }

    /// The first home or search call of a session purges the host's cached
    /// pages, so each session starts from fresh pages.
    fn touch_session(&self, rule: &RuleRef, definition: &RuleDefinition) {
        let host = definition.host_key();
        if self.sessions.first_touch(&rule.session_id(), &host) {
            debug!(rule = %definition.name(), host = %host, "new session, purging cached pages");
            self.cache.purge_namespace(&host);
        }
    }

    async fn dispatch(
        &self,
        definition: &Arc<RuleDefinition>,
        env: &Env,
        op: Operation,
        request: InvocationRequest,
    ) -> EngineResult<RawOutput> {
        let bridge = SandboxBridge::new(
            Arc::clone(definition),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.cache),
            env.clone(),
        );
        dispatcher::invoke(&bridge, op, request).await
    }

    async fn dispatch_or_empty(
        &self,
        definition: &Arc<RuleDefinition>,
        env: &Env,
        op: Operation,
        request: InvocationRequest,
    ) -> RawOutput {
        match self.dispatch(definition, env, op, request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(rule = %definition.name(), op = %op, error = %e, "home operation failed");
                RawOutput::Items(Vec::new())
            }
        }
    }
}
