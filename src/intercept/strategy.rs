//! Strategy executors: the caching algorithms a classified request runs through.
//!
//! Every executor receives the request, the rule that classified it and an
//! [`ExecContext`] naming the generation to use. Store failures are logged
//! and treated as a miss (reads) or skipped (writes) so the request can
//! still complete through whichever path remains.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::classifier::Rule;
use crate::cache::{CacheEntry, CacheResult, Store};
use crate::http::{CacheKey, Request, Response};
use crate::network::Network;

/// Default bound on a network-first attempt before falling back to cache.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on the body size of a stored response (5 MiB).
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 5 * 1024 * 1024;

/// Page served to navigations when the offline document itself is not cached.
const BUILTIN_OFFLINE_PAGE: &str = "<!doctype html><html><head><meta charset=\"utf-8\">\
<title>Offline</title></head><body><h1>You are offline</h1>\
<p>This page is not available without a network connection.</p></body></html>";

/// Where the designated offline document lives.
#[derive(Debug, Clone)]
pub struct NavigationFallback {
  pub generation: String,
  pub key: CacheKey,
}

/// Everything an executor needs besides the request itself.
#[derive(Clone)]
pub struct ExecContext {
  pub store: Arc<dyn Store>,
  pub generation: String,
  pub network: Arc<dyn Network>,
  pub max_entry_bytes: usize,
  pub navigation_fallback: Option<NavigationFallback>,
}

impl ExecContext {
  /// Read an entry, treating store failures as a miss.
  fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
    match self.store.get(&self.generation, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(generation = %self.generation, key = %key, error = %e, "Cache read failed");
        None
      }
    }
  }

  fn writer(&self) -> EntryWriter {
    EntryWriter {
      store: Arc::clone(&self.store),
      generation: self.generation.clone(),
      max_entry_bytes: self.max_entry_bytes,
    }
  }

  /// Response for a request neither network nor cache could satisfy.
  fn unavailable(&self, request: &Request, reason: &str) -> CacheResult<Response> {
    if !request.navigate {
      return CacheResult::synthesized(Response::offline_error(reason));
    }

    let cached = self.navigation_fallback.as_ref().and_then(|fallback| {
      match self.store.get(&fallback.generation, &fallback.key) {
        Ok(entry) => entry,
        Err(e) => {
          warn!(key = %fallback.key, error = %e, "Offline document read failed");
          None
        }
      }
    });

    let mut page = match cached {
      Some(entry) => entry.response,
      None => Response::new(503, BUILTIN_OFFLINE_PAGE)
        .with_header("content-type", "text/html; charset=utf-8"),
    };
    page.status = 503;
    CacheResult::synthesized(page)
  }
}

/// Owned handle for writing one generation, usable from detached tasks.
struct EntryWriter {
  store: Arc<dyn Store>,
  generation: String,
  max_entry_bytes: usize,
}

impl EntryWriter {
  /// Store a response if it is worth keeping. Failures are logged, not raised.
  fn store(&self, key: &CacheKey, response: &Response) {
    if !response.is_success() {
      debug!(key = %key, status = response.status, "Not caching unsuccessful response");
      return;
    }
    if response.body.len() > self.max_entry_bytes {
      debug!(key = %key, bytes = response.body.len(), "Not caching oversized response");
      return;
    }

    if let Err(e) = self
      .store
      .put(&self.generation, key, &CacheEntry::new(response.clone()))
    {
      warn!(generation = %self.generation, key = %key, error = %e, "Cache write failed");
    }
  }
}

/// A caching algorithm.
#[async_trait]
pub trait Executor: Send + Sync {
  async fn execute(&self, request: &Request, rule: &Rule, ctx: &ExecContext) -> CacheResult<Response>;
}

/// Serve from cache; go to the network only on a miss.
///
/// A hit older than the rule's TTL counts as a miss, but is still served
/// if the refetch fails.
pub struct CacheFirst;

#[async_trait]
impl Executor for CacheFirst {
  async fn execute(&self, request: &Request, rule: &Rule, ctx: &ExecContext) -> CacheResult<Response> {
    let key = request.cache_key();
    let cached = ctx.lookup(&key);

    if let Some(entry) = &cached {
      let expired = rule
        .ttl()
        .map(|ttl| entry.age(chrono::Utc::now()) > ttl)
        .unwrap_or(false);
      if !expired {
        return CacheResult::from_cache(entry.response.clone(), entry.stored_at, false);
      }
    }

    match ctx.network.send(request).await {
      Ok(response) => {
        if rule.allows_caching(request) {
          ctx.writer().store(&key, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => match cached {
        Some(entry) => {
          debug!(key = %key, error = %e, "Serving expired entry while offline");
          CacheResult::from_cache(entry.response, entry.stored_at, true)
        }
        None => ctx.unavailable(request, &format!("Resource not cached and network unavailable: {}", e)),
      },
    }
  }
}

/// Try the network within a timeout; fall back to cache.
pub struct NetworkFirst {
  timeout: Duration,
}

impl NetworkFirst {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }
}

impl Default for NetworkFirst {
  fn default() -> Self {
    Self::new(DEFAULT_NETWORK_TIMEOUT)
  }
}

#[async_trait]
impl Executor for NetworkFirst {
  async fn execute(&self, request: &Request, rule: &Rule, ctx: &ExecContext) -> CacheResult<Response> {
    let key = request.cache_key();

    // Dropping the timed-out future abandons the in-flight call.
    let reason = match tokio::time::timeout(self.timeout, ctx.network.send(request)).await {
      Ok(Ok(response)) => {
        if rule.allows_caching(request) {
          ctx.writer().store(&key, &response);
        }
        return CacheResult::from_network(response);
      }
      Ok(Err(e)) => e.to_string(),
      Err(_) => format!("request timed out after {:?}", self.timeout),
    };

    debug!(key = %key, reason = %reason, "Network failed, trying cache");
    match ctx.lookup(&key) {
      Some(entry) => CacheResult::offline(entry.response, entry.stored_at),
      None => ctx.unavailable(request, &format!("Network unavailable and no cached copy: {}", reason)),
    }
  }
}

/// Generation and key of a background refresh.
type RefreshId = (String, CacheKey);

/// Answer from cache immediately and refresh the entry in the background.
///
/// At most one refresh per generation and key is in flight; hits that
/// arrive while it runs are served from cache without starting another.
#[derive(Default)]
pub struct StaleWhileRevalidate {
  in_flight: Arc<Mutex<HashSet<RefreshId>>>,
}

/// Claim on a refresh; released when the refresh task finishes.
struct RefreshSlot {
  in_flight: Arc<Mutex<HashSet<RefreshId>>>,
  id: RefreshId,
}

impl RefreshSlot {
  fn claim(in_flight: &Arc<Mutex<HashSet<RefreshId>>>, id: RefreshId) -> Option<Self> {
    let mut claimed = match in_flight.lock() {
      Ok(claimed) => claimed,
      Err(e) => {
        warn!(error = %e, "Refresh registry poisoned, skipping revalidation");
        return None;
      }
    };
    if !claimed.insert(id.clone()) {
      return None;
    }

    Some(Self {
      in_flight: Arc::clone(in_flight),
      id,
    })
  }
}

impl Drop for RefreshSlot {
  fn drop(&mut self) {
    if let Ok(mut claimed) = self.in_flight.lock() {
      claimed.remove(&self.id);
    }
  }
}

#[async_trait]
impl Executor for StaleWhileRevalidate {
  async fn execute(&self, request: &Request, rule: &Rule, ctx: &ExecContext) -> CacheResult<Response> {
    let key = request.cache_key();
    let cacheable = rule.allows_caching(request);

    if let Some(entry) = ctx.lookup(&key) {
      match RefreshSlot::claim(&self.in_flight, (ctx.generation.clone(), key.clone())) {
        Some(slot) => {
          let network = Arc::clone(&ctx.network);
          let writer = ctx.writer();
          let request = request.clone();

          // Detached: the caller never waits on, or hears about, the refresh.
          tokio::spawn(async move {
            let _slot = slot;
            match network.send(&request).await {
              Ok(response) => {
                if cacheable {
                  writer.store(&key, &response);
                }
              }
              Err(e) => debug!(key = %key, error = %e, "Background revalidation failed"),
            }
          });
        }
        None => debug!(key = %key, "Revalidation already in flight"),
      }

      return CacheResult::from_cache(entry.response, entry.stored_at, true);
    }

    match ctx.network.send(request).await {
      Ok(response) => {
        if cacheable {
          ctx.writer().store(&key, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => ctx.unavailable(request, &format!("Resource not cached and network unavailable: {}", e)),
    }
  }
}

/// Always go to the network; the cache is neither read nor written.
pub struct NetworkOnly;

#[async_trait]
impl Executor for NetworkOnly {
  async fn execute(&self, request: &Request, _rule: &Rule, ctx: &ExecContext) -> CacheResult<Response> {
    match ctx.network.send(request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => ctx.unavailable(request, &format!("Network unavailable: {}", e)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStore};
  use crate::intercept::classifier::{Pattern, Strategy};
  use crate::network::testing::FakeNetwork;
  use chrono::Utc;
  use std::time::Instant;
  use url::Url;

  const BASE: &str = "https://example.com";

  fn get(path: &str) -> Request {
    Request::get(Url::parse(BASE).unwrap().join(path).unwrap())
  }

  fn context(store: Arc<MemoryStore>, network: Arc<FakeNetwork>) -> ExecContext {
    store.create_generation("test-v1").unwrap();
    ExecContext {
      store,
      generation: "test-v1".to_string(),
      network,
      max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
      navigation_fallback: None,
    }
  }

  fn rule(strategy: Strategy) -> Rule {
    Rule::new(Pattern::Any, "test", strategy)
  }

  #[tokio::test]
  async fn test_cache_first_serves_stored_bytes_offline() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    let body = b"console.log('app');".to_vec();
    network.respond("https://example.com/assets/app.a1b2.js", Response::new(200, body.clone()));
    let ctx = context(store.clone(), network.clone());
    let request = get("/assets/app.a1b2.js");

    let first = CacheFirst.execute(&request, &rule(Strategy::CacheFirst), &ctx).await;
    assert_eq!(first.source, CacheSource::Network);

    network.set_offline(true);
    let second = CacheFirst.execute(&request, &rule(Strategy::CacheFirst), &ctx).await;
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data.body, body);
    assert_eq!(network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_is_structured_error() {
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);
    let ctx = context(Arc::new(MemoryStore::new()), network);

    let result = CacheFirst
      .execute(&get("/assets/missing.js"), &rule(Strategy::CacheFirst), &ctx)
      .await;
    assert_eq!(result.source, CacheSource::Synthesized);
    assert_eq!(result.data.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&result.data.body).unwrap();
    assert_eq!(body["error"], "offline");
  }

  #[tokio::test]
  async fn test_cache_first_expired_entry_is_refetched() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/data.json", Response::new(200, "new"));
    let ctx = context(store.clone(), network.clone());
    let request = get("/data.json");
    store
      .put(
        "test-v1",
        &request.cache_key(),
        &CacheEntry::stored_at(Response::new(200, "old"), Utc::now() - chrono::Duration::hours(2)),
      )
      .unwrap();
    let rule = rule(Strategy::CacheFirst).with_ttl_secs(60);

    let result = CacheFirst.execute(&request, &rule, &ctx).await;
    assert_eq!(result.data.body, b"new");

    // expired copy is still better than nothing when offline
    store
      .put(
        "test-v1",
        &request.cache_key(),
        &CacheEntry::stored_at(Response::new(200, "old"), Utc::now() - chrono::Duration::hours(2)),
      )
      .unwrap();
    network.set_offline(true);
    let result = CacheFirst.execute(&request, &rule, &ctx).await;
    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.body, b"old");
  }

  #[tokio::test]
  async fn test_unsuccessful_responses_are_not_stored() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/broken.js", Response::new(500, "oops"));
    let ctx = context(store.clone(), network);
    let request = get("/broken.js");

    let result = CacheFirst.execute(&request, &rule(Strategy::CacheFirst), &ctx).await;
    assert_eq!(result.data.status, 500);
    assert!(store.get("test-v1", &request.cache_key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_oversized_responses_are_not_stored() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/video.mp4", Response::new(200, vec![7u8; 64]));
    let mut ctx = context(store.clone(), network);
    ctx.max_entry_bytes = 16;
    let request = get("/video.mp4");

    let result = CacheFirst.execute(&request, &rule(Strategy::CacheFirst), &ctx).await;
    assert_eq!(result.data.body.len(), 64);
    assert!(store.get("test-v1", &request.cache_key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    let tiers = r#"{"tiers":["free","pro"]}"#;
    network.respond("https://example.com/api/tiers", Response::new(200, tiers));
    let ctx = context(store.clone(), network.clone());
    let request = get("/api/tiers");
    let rule = rule(Strategy::NetworkFirst).with_allowlist(vec![Pattern::Prefix("/api/tiers".to_string())]);

    let online = NetworkFirst::default().execute(&request, &rule, &ctx).await;
    assert_eq!(online.source, CacheSource::Network);

    network.set_offline(true);
    let offline = NetworkFirst::default().execute(&request, &rule, &ctx).await;
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data.body, tiers.as_bytes());
  }

  #[tokio::test]
  async fn test_network_first_respects_allowlist() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/api/profile", Response::new(200, "me"));
    let ctx = context(store.clone(), network.clone());
    let request = get("/api/profile");
    let rule = rule(Strategy::NetworkFirst).with_allowlist(vec![Pattern::Prefix("/api/tiers".to_string())]);

    NetworkFirst::default().execute(&request, &rule, &ctx).await;
    assert!(store.get("test-v1", &request.cache_key()).unwrap().is_none());

    network.set_offline(true);
    let result = NetworkFirst::default().execute(&request, &rule, &ctx).await;
    assert_eq!(result.data.status, 503);
  }

  #[tokio::test]
  async fn test_network_first_timeout_uses_cache() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/api/tiers", Response::new(200, "fresh"));
    network.set_delay(Some(Duration::from_secs(5)));
    let ctx = context(store.clone(), network);
    let request = get("/api/tiers");
    store
      .put("test-v1", &request.cache_key(), &CacheEntry::new(Response::new(200, "cached")))
      .unwrap();

    let started = Instant::now();
    let result = NetworkFirst::new(Duration::from_millis(50))
      .execute(&request, &rule(Strategy::NetworkFirst), &ctx)
      .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"cached");
  }

  #[tokio::test]
  async fn test_navigation_gets_offline_document() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);
    let offline_url = Url::parse("https://example.com/offline.html").unwrap();
    let offline_key = Request::get(offline_url).cache_key();
    store.create_generation("static-v1").unwrap();
    store
      .put("static-v1", &offline_key, &CacheEntry::new(Response::new(200, "<h1>offline</h1>")))
      .unwrap();

    let mut ctx = context(store.clone(), network);
    ctx.navigation_fallback = Some(NavigationFallback {
      generation: "static-v1".to_string(),
      key: offline_key,
    });

    let result = NetworkFirst::default()
      .execute(&get("/").navigation(), &rule(Strategy::NetworkFirst), &ctx)
      .await;
    assert_eq!(result.data.status, 503);
    assert_eq!(result.data.body, b"<h1>offline</h1>");

    // without a cached document the built-in page is used
    ctx.navigation_fallback = None;
    let result = NetworkFirst::default()
      .execute(&get("/").navigation(), &rule(Strategy::NetworkFirst), &ctx)
      .await;
    assert_eq!(result.data.status, 503);
    assert!(String::from_utf8_lossy(&result.data.body).contains("offline"));
  }

  #[tokio::test]
  async fn test_swr_returns_cached_without_waiting() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/img/hero.webp", Response::new(200, "v1"));
    let ctx = context(store.clone(), network.clone());
    let request = get("/img/hero.webp");

    let first = StaleWhileRevalidate::default()
      .execute(&request, &rule(Strategy::Swr), &ctx)
      .await;
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.data.body, b"v1");

    network.respond("https://example.com/img/hero.webp", Response::new(200, "v2"));
    network.set_delay(Some(Duration::from_millis(300)));

    let started = Instant::now();
    let second = StaleWhileRevalidate::default()
      .execute(&request, &rule(Strategy::Swr), &ctx)
      .await;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(second.source, CacheSource::CacheStale);
    assert_eq!(second.data.body, b"v1");

    // wait for the background refresh to land
    let mut refreshed = false;
    for _ in 0..50 {
      tokio::time::sleep(Duration::from_millis(20)).await;
      let entry = store.get("test-v1", &request.cache_key()).unwrap().unwrap();
      if entry.response.body == b"v2" {
        refreshed = true;
        break;
      }
    }
    assert!(refreshed);

    network.set_delay(None);
    let third = StaleWhileRevalidate::default()
      .execute(&request, &rule(Strategy::Swr), &ctx)
      .await;
    assert_eq!(third.data.body, b"v2");
  }

  #[tokio::test]
  async fn test_swr_background_failure_is_invisible() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    let ctx = context(store.clone(), network.clone());
    let request = get("/img/logo.png");
    store
      .put("test-v1", &request.cache_key(), &CacheEntry::new(Response::new(200, "logo")))
      .unwrap();
    network.set_offline(true);

    let result = StaleWhileRevalidate::default()
      .execute(&request, &rule(Strategy::Swr), &ctx)
      .await;
    assert_eq!(result.data.body, b"logo");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.get("test-v1", &request.cache_key()).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_swr_refreshes_each_key_once_at_a_time() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/img/hero.webp", Response::new(200, "v2"));
    network.set_delay(Some(Duration::from_millis(200)));
    let ctx = context(store.clone(), network.clone());
    let request = get("/img/hero.webp");
    store
      .put("test-v1", &request.cache_key(), &CacheEntry::new(Response::new(200, "v1")))
      .unwrap();

    let swr = StaleWhileRevalidate::default();
    for _ in 0..5 {
      let result = swr.execute(&request, &rule(Strategy::Swr), &ctx).await;
      assert_eq!(result.data.body, b"v1");
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(network.call_count(), 1);

    // the slot is released once the refresh lands
    network.set_delay(None);
    let result = swr.execute(&request, &rule(Strategy::Swr), &ctx).await;
    assert_eq!(result.data.body, b"v2");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(network.call_count(), 2);
  }

  #[tokio::test]
  async fn test_swr_refresh_after_generation_delete_does_not_recreate_it() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/img/logo.png", Response::new(200, "new logo"));
    network.set_delay(Some(Duration::from_millis(100)));
    let ctx = context(store.clone(), network.clone());
    let request = get("/img/logo.png");
    store
      .put("test-v1", &request.cache_key(), &CacheEntry::new(Response::new(200, "logo")))
      .unwrap();

    let result = StaleWhileRevalidate::default()
      .execute(&request, &rule(Strategy::Swr), &ctx)
      .await;
    assert_eq!(result.data.body, b"logo");

    // cutover deletes the generation while the refresh is still in flight
    store.delete_generation("test-v1").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(network.call_count(), 1);
    assert!(store.list_generations().unwrap().is_empty());
    assert!(store.get("test-v1", &request.cache_key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_only_never_touches_cache() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/api/session", Response::new(200, "secret"));
    let ctx = context(store.clone(), network.clone());
    let request = get("/api/session");
    store
      .put("test-v1", &request.cache_key(), &CacheEntry::new(Response::new(200, "stale secret")))
      .unwrap();

    let result = NetworkOnly
      .execute(&request, &rule(Strategy::NetworkOnly), &ctx)
      .await;
    assert_eq!(result.data.body, b"secret");
    assert_eq!(
      store.get("test-v1", &request.cache_key()).unwrap().unwrap().response.body,
      b"stale secret"
    );

    network.set_offline(true);
    let result = NetworkOnly
      .execute(&request, &rule(Strategy::NetworkOnly), &ctx)
      .await;
    assert_eq!(result.data.status, 503);
  }
}
