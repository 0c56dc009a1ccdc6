//! Bounded, time-limited cache of fetched page bodies.
//!
//! [`PageCache`] holds at most `capacity` entries. Inserting past capacity
//! evicts the oldest inserted entry (FIFO, reads do not refresh position).
//! Every entry expires `ttl` after insertion regardless of reads; expiry is
//! checked on lookup and swept on insert, so `clear()` leaves nothing
//! pending.
//!
//! [`SessionTracker`] records which (session, host) pairs already purged
//! their cached pages once, turning the cache into "fetch fresh on first
//! touch, then reuse" without making the cache itself session-aware.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::fetch::FetchRequest;

struct CacheEntry {
    body: String,
    created_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest at the front.
    order: VecDeque<String>,
}

pub struct PageCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl PageCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Build the cache key for a request under `namespace`.
    ///
    /// The namespace is kept in clear text as a prefix so that
    /// [`purge_namespace`](Self::purge_namespace) can drop a whole host.
    pub fn key(namespace: &str, request: &FetchRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.method.as_bytes());
        hasher.update(b" ");
        hasher.update(request.url.as_bytes());
        for (k, v) in &request.headers {
            hasher.update(b"\n");
            hasher.update(k.as_bytes());
            hasher.update(b":");
            hasher.update(v.as_bytes());
        }
        if let Some(body) = &request.body {
            hasher.update(b"\n\n");
            hasher.update(body.as_bytes());
        }
        format!("{}:{}", namespace, hex::encode(hasher.finalize()))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => {
                return Some(entry.body.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
        }
        None
    }

    pub fn set(&self, key: &str, body: String) {
        let mut inner = self.lock();
        let ttl = self.ttl;
        inner.entries.retain(|_, e| e.created_at.elapsed() < ttl);

        if inner.entries.remove(key).is_some() {
            inner.order.retain(|k| k != key);
        }
        // Keys of entries already expired may linger in `order`; skip them.
        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.remove(&oldest).is_some() {
                debug!(key = %oldest, "page cache evicted oldest entry");
            }
        }
        let CacheInner { entries, order } = &mut *inner;
        order.retain(|k| entries.contains_key(k));

        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                body,
                created_at: Instant::now(),
            },
        );
        inner.order.push_back(key.to_string());
    }

    /// Drop every entry whose key starts with `namespace`.
    pub fn purge_namespace(&self, namespace: &str) {
        let mut inner = self.lock();
        let prefix = format!("{}:", namespace);
        inner.entries.retain(|k, _| !k.starts_with(&prefix));
        inner.order.retain(|k| !k.starts_with(&prefix));
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner
            .entries
            .values()
            .filter(|e| e.created_at.elapsed() < self.ttl)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Tracks which (session, host) pairs already did their cache-clearing pass.
pub struct SessionTracker {
    seen: Mutex<HashMap<(String, String), Instant>>,
    ttl: Duration,
}

impl SessionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `true` the first time a session touches `host` (or after the
    /// previous touch expired), `false` for later touches.
    pub fn first_touch(&self, session: &str, host: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let ttl = self.ttl;
        seen.retain(|_, at| now.duration_since(*at) < ttl);

        let key = (session.to_string(), host.to_string());
        if seen.contains_key(&key) {
            false
        } else {
            seen.insert(key, now);
            true
        }
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> PageCache {
        PageCache::new(capacity, Duration::from_secs(60))
    }

    #[test]
    fn test_get_after_set() {
        let c = cache(4);
        c.set("ns:a", "body-a".to_string());
        assert_eq!(c.get("ns:a").as_deref(), Some("body-a"));
        assert!(c.get("ns:missing").is_none());
    }

    #[test]
    fn test_capacity_evicts_first_inserted() {
        let c = cache(3);
        for key in ["k1", "k2", "k3", "k4"] {
            c.set(key, key.to_string());
            assert!(c.len() <= 3);
        }
        assert!(c.get("k1").is_none());
        for key in ["k2", "k3", "k4"] {
            assert_eq!(c.get(key).as_deref(), Some(key));
        }
    }

    #[test]
    fn test_reads_do_not_refresh_fifo_position() {
        let c = cache(2);
        c.set("a", "1".to_string());
        c.set("b", "2".to_string());
        assert!(c.get("a").is_some());
        c.set("c", "3".to_string());
        assert!(c.get("a").is_none());
        assert!(c.get("b").is_some());
    }

    #[test]
    fn test_ttl_expiry_without_capacity_pressure() {
        let c = PageCache::new(10, Duration::from_millis(40));
        c.set("a", "1".to_string());
        assert!(c.get("a").is_some());
        std::thread::sleep(Duration::from_millis(70));
        assert!(c.get("a").is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn test_clear_and_purge_namespace() {
        let c = cache(10);
        let request = FetchRequest::get("https://a.com/");
        let home = PageCache::key("a.com:home", &request);
        let search = PageCache::key("a.com:search", &request);
        let other = PageCache::key("b.com:home", &request);
        let lookalike = PageCache::key("a.com.cn:home", &request);
        for key in [&home, &search, &other, &lookalike] {
            c.set(key, "body".to_string());
        }

        c.purge_namespace("a.com");
        assert!(c.get(&home).is_none());
        assert!(c.get(&search).is_none());
        assert!(c.get(&other).is_some());
        assert!(c.get(&lookalike).is_some());
        c.clear();
        assert!(c.is_empty());
    }

    #[test]
    fn test_key_depends_on_request_options() {
        let a = FetchRequest::get("https://a.com/list");
        let mut b = FetchRequest::get("https://a.com/list");
        b.headers.push(("Referer".to_string(), "https://a.com".to_string()));
        let ka = PageCache::key("home", &a);
        assert_eq!(ka, PageCache::key("home", &a));
        assert_ne!(ka, PageCache::key("home", &b));
        assert!(ka.starts_with("home:"));
    }

    #[test]
    fn test_session_first_touch() {
        let s = SessionTracker::new(Duration::from_secs(60));
        assert!(s.first_touch("s1", "a.com"));
        assert!(!s.first_touch("s1", "a.com"));
        assert!(s.first_touch("s1", "b.com"));
        assert!(s.first_touch("s2", "a.com"));
        s.clear();
        assert!(s.first_touch("s1", "a.com"));
    }
}
