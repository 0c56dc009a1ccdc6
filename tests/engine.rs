use rulex::config::Config;
use rulex::fetch::{FetchRequest, FetchResponse, Fetcher};
use rulex::models::{Env, RuleRef};
use rulex::templates::StaticTemplates;
use rulex::Engine;
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// In-memory fetcher serving fixed bodies by URL and recording every request.
#[derive(Default)]
struct StaticFetcher {
    pages: HashMap<String, String>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl StaticFetcher {
    fn with_page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), body.to_string());
        self
    }

    fn hits(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }

    /// Value of header `name` on the first request made to `url`.
    fn header_sent(&self, url: &str, name: &str) -> Option<String> {
        let requests = self.requests.lock().unwrap();
        let request = requests.iter().find(|r| r.url == url)?;
        request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }
}

#[async_trait::async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<FetchResponse> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(match self.pages.get(&request.url) {
            Some(body) => FetchResponse {
                status: 200,
                headers: Vec::new(),
                body: body.clone(),
            },
            None => FetchResponse {
                status: 404,
                headers: Vec::new(),
                body: String::new(),
            },
        })
    }
}

fn write_rule(dir: &TempDir, name: &str, source: &str) -> RuleRef {
    let path = dir.path().join(name);
    fs::write(&path, source).unwrap();
    RuleRef::new(path)
}

fn engine_with(fetcher: Arc<StaticFetcher>, config: Config) -> Engine {
    Engine::with_parts(&config, fetcher, Arc::new(StaticTemplates::builtin()))
}

fn engine(fetcher: Arc<StaticFetcher>) -> Engine {
    engine_with(fetcher, Config::default())
}

const LISTING: &str = r#"
    <div class="item"><a href="/v/1.html"><span class="title">One</span></a>
        <img class="img" src="/p/1.jpg"><span class="meta">HD</span></div>
    <div class="item"><a href="/v/2.html"><span class="title">Two</span></a>
        <img class="img" src="/p/2.jpg"><span class="meta">SD</span></div>
    <div class="item"><a href="/v/3.html"></a><span class="meta">new</span></div>
"#;

#[tokio::test(flavor = "multi_thread")]
async fn test_load_is_reused_until_file_changes() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(&dir, "site.lua", r#"rule = { title = "Site", host = "https://site.test/" }"#);
    let engine = engine(Arc::new(StaticFetcher::default()));
    let env = Env::default();

    let first = engine.load(&rule, &env).await.unwrap();
    let second = engine.load(&rule, &env).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.host, "https://site.test");
    assert_eq!(first.home_url, "https://site.test");

    let refreshed = engine.refresh(&rule, &env).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &refreshed));

    fs::write(&rule.path, r#"rule = { title = "Changed", host = "https://site.test" }"#).unwrap();
    let changed = engine.load(&rule, &env).await.unwrap();
    assert_eq!(changed.title, "Changed");
    assert_eq!(engine.loaded_rules(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_template_fields_fill_gaps_only() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "tpl.lua",
        r#"rule = { host = "https://site.test", template = "base", b = 3 }"#,
    );
    let templates = StaticTemplates::new().with("base", json!({ "a": 1, "b": 2 }));
    let engine = Engine::with_parts(
        &Config::default(),
        Arc::new(StaticFetcher::default()),
        Arc::new(templates),
    );

    let definition = engine.load(&rule, &Env::default()).await.unwrap();
    assert_eq!(definition.snapshot.get("a"), Some(&json!(1)));
    assert_eq!(definition.snapshot.get("b"), Some(&json!(3)));
    assert!(definition.snapshot.get("template").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_template_modify_adjusts_template_before_merge() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "modify.lua",
        r#"rule = {
    host = "https://site.test",
    template = "base",
    b = 3,
    template_modify = function(self, tpl)
        tpl.a = 10
        tpl.c = "added"
    end,
}"#,
    );
    let templates = StaticTemplates::new().with("base", json!({ "a": 1, "b": 2 }));
    let engine = Engine::with_parts(
        &Config::default(),
        Arc::new(StaticFetcher::default()),
        Arc::new(templates),
    );

    let definition = engine.load(&rule, &Env::default()).await.unwrap();
    assert_eq!(definition.snapshot.get("a"), Some(&json!(10)));
    assert_eq!(definition.snapshot.get("b"), Some(&json!(3)));
    assert_eq!(definition.snapshot.get("c"), Some(&json!("added")));
    assert!(definition.snapshot.get("template_modify").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auto_template_detected_from_homepage() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "auto.lua",
        r#"rule = {
    host = "https://auto.test/",
    template = "auto",
    headers = { Referer = "https://auto.test/" },
}"#,
    );
    let home = r#"<ul class="navbar-items">
        <li><a href="/vodtype/1.html">Movies</a></li>
        <li><a href="/vodtype/2.html">Shows</a></li>
    </ul>"#;
    let fetcher = Arc::new(StaticFetcher::default().with_page("https://auto.test", home));
    let engine = engine(Arc::clone(&fetcher));

    let definition = engine.load(&rule, &Env::default()).await.unwrap();
    assert_eq!(
        definition.category_url,
        "https://auto.test/vodshow/fyclass--------fypage---.html"
    );
    assert_eq!(definition.snapshot.get("double"), Some(&json!(true)));
    assert_eq!(
        fetcher.header_sent("https://auto.test", "Referer").as_deref(),
        Some("https://auto.test/")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auto_template_without_match_keeps_rule() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "plain.lua",
        r#"rule = { host = "https://plain.test", template = "auto", url = "/c/fyclass.html" }"#,
    );
    let fetcher = Arc::new(StaticFetcher::default().with_page("https://plain.test", "<p>nothing</p>"));
    let engine = engine(fetcher);

    let definition = engine.load(&rule, &Env::default()).await.unwrap();
    assert_eq!(definition.category_url, "https://plain.test/c/fyclass.html");
    assert!(definition.snapshot.get("double").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_init_hooks_are_not_fatal() {
    let dir = TempDir::new().unwrap();
    let broken = write_rule(
        &dir,
        "hooks.lua",
        r#"rule = {
    host = "https://site.test",
    url = "/list/fyclass.html",
    host_resolver = function(self) error("resolver down") end,
    init = function(self) error("init failed") end,
}"#,
    );
    let moved = write_rule(
        &dir,
        "mirror.lua",
        r#"rule = {
    host = "https://site.test",
    url = "/list/fyclass.html",
    host_resolver = function(self) return "https://mirror.test/" end,
    init = function(self) self.ready = true end,
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));
    let env = Env::default();

    let definition = engine.load(&broken, &env).await.unwrap();
    assert_eq!(definition.host, "https://site.test");
    assert_eq!(definition.category_url, "https://site.test/list/fyclass.html");

    let definition = engine.load(&moved, &env).await.unwrap();
    assert_eq!(definition.host, "https://mirror.test");
    assert_eq!(definition.category_url, "https://mirror.test/list/fyclass.html");
    assert_eq!(definition.snapshot.get("ready"), Some(&json!(true)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rules_do_not_share_globals() {
    let dir = TempDir::new().unwrap();
    let first = write_rule(
        &dir,
        "a.lua",
        r#"marker = "from-a"
rule = { host = "https://a.test" }"#,
    );
    let second = write_rule(
        &dir,
        "b.lua",
        r#"rule = {
    host = "https://b.test",
    category = function(self, tid, pg)
        return { list = { { vod_id = tostring(marker), vod_name = tid } } }
    end,
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));
    let env = Env::default();

    engine.load(&first, &env).await.unwrap();
    let result = engine
        .category(&second, &env, "7", 1, false, &serde_json::Map::new())
        .await
        .unwrap();
    assert_eq!(result.list.len(), 1);
    assert_eq!(result.list[0].vod_id, "nil");
    assert_eq!(result.list[0].vod_name, "7");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runaway_init_hook_times_out() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "slow.lua",
        r#"rule = {
    host = "https://slow.test",
    init = function(self) while true do end end,
}"#,
    );
    let mut config = Config::default();
    config.engine.load_timeout_ms = 20;
    let engine = engine_with(Arc::new(StaticFetcher::default()), config);

    let started = Instant::now();
    let err = engine.load(&rule, &Env::default()).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {}", err);
    assert!(started.elapsed() < Duration::from_millis(20 + 50));
}

#[test]
fn test_sleeping_init_hook_releases_its_thread() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "sleepy.lua",
        r#"rule = {
    host = "https://sleepy.test",
    init = function(self) sleep(3) end,
}"#,
    );
    let mut config = Config::default();
    config.engine.load_timeout_ms = 50;
    let engine = engine_with(Arc::new(StaticFetcher::default()), config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let started = Instant::now();
    let err = runtime
        .block_on(engine.load(&rule, &Env::default()))
        .unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {}", err);
    // Shutting the runtime down waits for the blocking thread running Lua.
    drop(runtime);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_error_is_a_load_error() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(&dir, "broken.lua", "rule = { host = ");
    let engine = engine(Arc::new(StaticFetcher::default()));

    let err = engine.load(&rule, &Env::default()).await.unwrap_err();
    assert!(!err.is_timeout());
    assert!(err.to_string().contains("failed to load rule"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_declarative_category_listing() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "list.lua",
        r#"rule = {
    host = "https://site.test",
    url = "/list/fyclass/fypage.html",
    category = ".item;.title;.img@src;.meta;a&&href",
}"#,
    );
    let fetcher = Arc::new(StaticFetcher::default().with_page("https://site.test/list/1/2.html", LISTING));
    let engine = engine(Arc::clone(&fetcher));

    let result = engine
        .category(&rule, &Env::default(), "1", 2, false, &serde_json::Map::new())
        .await
        .unwrap();

    assert_eq!(result.page, 2);
    assert_eq!(result.list.len(), 3);
    assert_eq!(result.list[0].vod_name, "One");
    assert_eq!(result.list[0].vod_pic, "https://site.test/p/1.jpg");
    assert_eq!(result.list[1].vod_id, "/v/2.html");
    assert_eq!(result.list[2].vod_name, "Unknown");
    assert_eq!(result.list[2].vod_remarks, "new");
    assert_eq!(result.limit, 3);
    assert_eq!(result.pagecount, 999);
    assert_eq!(fetcher.hits("https://site.test/list/1/2.html"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_declarative_search_inherits_category_selector() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "search.lua",
        r#"rule = {
    host = "https://site.test",
    url = "/list/fyclass/fypage.html",
    searchUrl = "/s/**/fypage.html",
    category = ".item;.title;.img@src;.meta;a&&href",
    search = "*",
}"#,
    );
    let fetcher = Arc::new(StaticFetcher::default().with_page("https://site.test/s/abc/1.html", LISTING));
    let engine = engine(Arc::clone(&fetcher));

    let result = engine.search(&rule, &Env::default(), "abc", false, 1).await.unwrap();
    let names: Vec<&str> = result.list.iter().map(|v| v.vod_name.as_str()).collect();
    assert_eq!(names, vec!["One", "Two", "Unknown"]);
    assert_eq!(result.list[0].vod_id, "/v/1.html");
    assert_eq!(fetcher.hits("https://site.test/s/abc/1.html"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snippet_search_sees_call_variables() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "snippet_search.lua",
        r#"rule = {
    host = "https://site.test",
    searchUrl = "/s/**/fypage.html",
    search = "lua: return { list = { { vod_id = keyword, vod_name = input } } }",
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));

    let result = engine.search(&rule, &Env::default(), "abc", false, 2).await.unwrap();
    assert_eq!(result.page, 2);
    assert_eq!(result.list.len(), 1);
    assert_eq!(result.list[0].vod_id, "abc");
    assert_eq!(result.list[0].vod_name, "https://site.test/s/abc/2.html");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_calls_keep_their_own_input() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "busy.lua",
        r#"rule = {
    host = "https://site.test",
    url = "/list/fyclass.html",
    category = function(self, tid)
        local before = self.input
        for _ = 1, 200000 do end
        return { { vod_id = before .. "|" .. self.input, vod_name = tid } }
    end,
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));
    let env = Env::default();
    let extend = serde_json::Map::new();
    engine.load(&rule, &env).await.unwrap();

    let (first, second) = tokio::join!(
        engine.category(&rule, &env, "1", 1, false, &extend),
        engine.category(&rule, &env, "2", 1, false, &extend),
    );
    assert_eq!(
        first.unwrap().list[0].vod_id,
        "https://site.test/list/1.html|https://site.test/list/1.html"
    );
    assert_eq!(
        second.unwrap().list[0].vod_id,
        "https://site.test/list/2.html|https://site.test/list/2.html"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_category_is_not_implemented() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(&dir, "bare.lua", r#"rule = { host = "https://site.test" }"#);
    let engine = engine(Arc::new(StaticFetcher::default()));
    let env = Env::default();

    let err = engine
        .category(&rule, &env, "1", 1, false, &serde_json::Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, rulex::EngineError::NotImplemented { .. }));

    let search = engine.search(&rule, &env, "x", false, 1).await.unwrap();
    assert!(search.list.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_home_merges_declared_and_parsed_classes() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "home.lua",
        r#"rule = {
    host = "https://site.test",
    class_name = "Movies&Shows",
    class_url = "1&2",
    class_parse = ".nav li;a&&Text;a&&href;/t/(\\d+)",
    filters = { ["1"] = { { key = "year", name = "Year" } } },
}"#,
    );
    let home = r#"<ul class="nav">
        <li><a href="/t/2.html">Shows</a></li>
        <li><a href="/t/3.html">Anime</a></li>
        <li><a href="/t/9.html">APP下载</a></li>
    </ul>"#;
    let fetcher = Arc::new(StaticFetcher::default().with_page("https://site.test", home));
    let engine = engine(fetcher);

    let result = engine.home(&rule, &Env::default(), true).await.unwrap();
    let ids: Vec<&str> = result.class.iter().map(|c| c.type_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert!(result.filters.contains_key("1"));

    let without = engine.home(&rule, &Env::default(), false).await.unwrap();
    assert!(without.filters.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_session_purges_cached_home_page() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cached.lua");
    fs::write(
        &path,
        r#"rule = { host = "https://site.test", class_parse = ".nav li;a&&Text;a&&href" }"#,
    )
    .unwrap();
    let fetcher = Arc::new(
        StaticFetcher::default().with_page("https://site.test", r#"<ul class="nav"><li><a href="/t/1">A</a></li></ul>"#),
    );
    let engine = engine(Arc::clone(&fetcher));
    let env = Env::default();

    let first_session = RuleRef::new(&path);
    engine.home(&first_session, &env, false).await.unwrap();
    engine.home(&first_session, &env, false).await.unwrap();
    assert_eq!(fetcher.hits("https://site.test"), 1);

    let second_session = RuleRef::new(&path).with_ext("alt");
    engine.home(&second_session, &env, false).await.unwrap();
    assert_eq!(fetcher.hits("https://site.test"), 2);
    engine.home(&second_session, &env, false).await.unwrap();
    assert_eq!(fetcher.hits("https://site.test"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_play_classification_and_overrides() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "play.lua",
        r#"rule = {
    host = "https://site.test",
    play_overrides = { ["cdn\\.test"] = { header = { Referer = "https://site.test" } } },
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));
    let env = Env::default();
    let flags = vec!["qq".to_string()];

    let media = engine
        .play(&rule, &env, "Line 1", "https://cdn.test/v/index.m3u8", &flags)
        .await
        .unwrap();
    assert_eq!(media.parse, 0);
    assert_eq!(media.url, "https://cdn.test/v/index.m3u8");
    assert_eq!(media.header.get("Referer").map(String::as_str), Some("https://site.test"));

    let page = engine
        .play(&rule, &env, "qq", "https://v.qq.com/x/1.html", &flags)
        .await
        .unwrap();
    assert_eq!(page.parse, 1);
    assert_eq!(page.jx, 1);
    assert!(page.header.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_play_fields_are_read_leniently() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "loose.lua",
        r#"rule = {
    host = "https://site.test",
    play = function(self, flag, id)
        return { url = "https://cdn.test/real.m3u8", parse = "1", jx = true, header = { ["X-N"] = 1 } }
    end,
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));

    let result = engine.play(&rule, &Env::default(), "f", "ep-7", &[]).await.unwrap();
    assert_eq!(result.url, "https://cdn.test/real.m3u8");
    assert_eq!(result.parse, 1);
    assert_eq!(result.jx, 1);
    assert_eq!(result.header.get("X-N").map(String::as_str), Some("1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_home_keeps_valid_classes_next_to_malformed_ones() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "classes.lua",
        r#"rule = {
    host = "https://site.test",
    class_parse = function(self)
        return { class = { { type_id = "1", type_name = "Movies" }, "junk", { type_id = 2, type_name = "Shows" } } }
    end,
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));

    let home = engine.home(&rule, &Env::default(), false).await.unwrap();
    let ids: Vec<&str> = home.class.iter().map(|c| c.type_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snippet_and_native_play() {
    let dir = TempDir::new().unwrap();
    let snippet = write_rule(
        &dir,
        "snippet.lua",
        r#"rule = { host = "https://site.test", play = "lua: input = 'https://cdn.test/' .. id .. '.mp4'" }"#,
    );
    let native = write_rule(
        &dir,
        "native.lua",
        r#"rule = {
    host = "https://site.test",
    play = function(self, flag, id, flags)
        return { parse = 1, url = self.host .. "/resolve?id=" .. id }
    end,
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));
    let env = Env::default();

    let from_snippet = engine.play(&snippet, &env, "f", "42", &[]).await.unwrap();
    assert_eq!(from_snippet.url, "https://cdn.test/42.mp4");
    assert_eq!(from_snippet.parse, 0);

    let from_native = engine.play(&native, &env, "f", "42", &[]).await.unwrap();
    assert_eq!(from_native.url, "https://site.test/resolve?id=42");
    assert_eq!(from_native.parse, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_structured_detail_with_native_lists() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "detail.lua",
        r#"rule = {
    host = "https://site.test",
    detailUrl = "/v/fyid.html",
    detail = {
        title = "h1&&Text",
        img = ".poster@src",
        content = ".intro&&Text",
        tabs = ".tabs span",
        lists = function(self)
            local first = {}
            for i, ep in ipairs(html.all(self.html, ".ep a")) do
                first[i] = "EP" .. i .. "$" .. html.one(ep, "a&&href")
            end
            return { first, { "x$https://site.test/other" } }
        end,
    },
}"#,
    );
    let page = r#"<h1>Title</h1><img class="poster" src="/p/9.jpg">
        <div class="intro">About</div>
        <div class="tabs"><span>Line A</span><span>猜你喜欢</span></div>
        <div class="ep"><a href="/play/9-1.html">1</a><a href="/play/9-2.html">2</a></div>"#;
    let fetcher = Arc::new(StaticFetcher::default().with_page("https://site.test/v/9.html", page));
    let engine = engine(fetcher);

    let result = engine
        .detail(&rule, &Env::default(), &["9".to_string()])
        .await
        .unwrap();
    assert_eq!(result.list.len(), 1);
    let item = &result.list[0];
    assert_eq!(item.vod_id, "9");
    assert_eq!(item.vod_name, "Title");
    assert_eq!(item.vod_pic, "https://site.test/p/9.jpg");
    assert_eq!(item.vod_content, "About");
    assert_eq!(item.vod_play_from, "Line A");
    assert_eq!(item.vod_play_url, "EP1$/play/9-1.html#EP2$/play/9-2.html");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_passthrough_detail() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(&dir, "pass.lua", r#"rule = { host = "https://site.test", detail = "*" }"#);
    let engine = engine(Arc::new(StaticFetcher::default()));

    let result = engine
        .detail(&rule, &Env::default(), &["https://cdn.test/a.m3u8".to_string()])
        .await
        .unwrap();
    assert_eq!(result.list[0].vod_id, "https://cdn.test/a.m3u8");
    assert_eq!(result.list[0].vod_play_url, "Play$https://cdn.test/a.m3u8");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_native_search_uses_host_http() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "api.lua",
        r#"rule = {
    host = "https://api.test",
    quick_search = false,
    search = function(self, wd, quick, pg)
        local res = http.get(self.host .. "/search?wd=" .. wd)
        local data = json.parse(res.body)
        return { page = pg, pagecount = 1, list = data.items }
    end,
}"#,
    );
    let fetcher = Arc::new(StaticFetcher::default().with_page(
        "https://api.test/search?wd=abc",
        r#"{"items":[{"vod_id":5,"vod_name":"Five"}]}"#,
    ));
    let engine = engine(Arc::clone(&fetcher));
    let env = Env::default();

    let result = engine.search(&rule, &env, "abc", false, 1).await.unwrap();
    assert_eq!(result.pagecount, 1);
    assert_eq!(result.list.len(), 1);
    assert_eq!(result.list[0].vod_id, "5");

    let quick = engine.search(&rule, &env, "abc", true, 1).await.unwrap();
    assert!(quick.list.is_empty());
    assert_eq!(fetcher.hits("https://api.test/search?wd=abc"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_home_swallows_script_errors() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "fail.lua",
        r#"rule = {
    host = "https://site.test",
    class_name = "Movies",
    class_url = "1",
    class_parse = function(self) error("boom") end,
    home_vod = function(self) error("boom") end,
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));
    let env = Env::default();

    let home = engine.home(&rule, &env, false).await.unwrap();
    assert_eq!(home.class.len(), 1);
    let featured = engine.home_featured(&rule, &env).await.unwrap();
    assert!(featured.list.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_written_by_one_call_is_seen_by_the_next() {
    let dir = TempDir::new().unwrap();
    let rule = write_rule(
        &dir,
        "state.lua",
        r#"rule = {
    host = "https://site.test",
    category = function(self, tid)
        self.visits = (self.visits or 0) + 1
        return { { vod_id = tostring(self.visits), vod_name = tid } }
    end,
}"#,
    );
    let engine = engine(Arc::new(StaticFetcher::default()));
    let env = Env::default();
    let extend = serde_json::Map::new();

    engine.category(&rule, &env, "1", 1, false, &extend).await.unwrap();
    let second = engine.category(&rule, &env, "1", 1, false, &extend).await.unwrap();
    assert_eq!(second.list[0].vod_id, "2");
}
