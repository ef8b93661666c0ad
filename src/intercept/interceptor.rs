//! The explicit interception point every outbound request goes through.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::classifier::{Classifier, Pattern, Rule, Strategy};
use super::strategy::{
  CacheFirst, ExecContext, Executor, NavigationFallback, NetworkFirst, NetworkOnly,
  StaleWhileRevalidate, DEFAULT_MAX_ENTRY_BYTES,
};
use crate::cache::{CacheResult, CacheStoreManager, Role};
use crate::http::{Method, Request, Response};
use crate::network::Network;
use crate::queue::{OfflineAction, OfflineQueue};

/// Classifies requests and dispatches them to strategy executors.
///
/// Applications hold an `Interceptor` and send every request through
/// [`Interceptor::handle`]; nothing is intercepted implicitly.
pub struct Interceptor {
  classifier: Classifier,
  executors: HashMap<Strategy, Arc<dyn Executor>>,
  manager: Arc<CacheStoreManager>,
  network: Arc<dyn Network>,
  queue: Option<Arc<OfflineQueue>>,
  offline_document: Option<Url>,
  max_entry_bytes: usize,
}

impl Interceptor {
  pub fn new(
    classifier: Classifier,
    manager: Arc<CacheStoreManager>,
    network: Arc<dyn Network>,
  ) -> Self {
    let mut executors: HashMap<Strategy, Arc<dyn Executor>> = HashMap::new();
    executors.insert(Strategy::CacheFirst, Arc::new(CacheFirst));
    executors.insert(Strategy::NetworkFirst, Arc::new(NetworkFirst::default()));
    executors.insert(Strategy::Swr, Arc::new(StaleWhileRevalidate::default()));
    executors.insert(Strategy::NetworkOnly, Arc::new(NetworkOnly));

    Self {
      classifier,
      executors,
      manager,
      network,
      queue: None,
      offline_document: None,
      max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
    }
  }

  /// Replace the executor used for a strategy.
  pub fn with_executor(mut self, strategy: Strategy, executor: Arc<dyn Executor>) -> Self {
    self.executors.insert(strategy, executor);
    self
  }

  /// Queue for mutations that fail while offline.
  pub fn with_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
    self.queue = Some(queue);
    self
  }

  /// Document served to navigations when offline, looked up in the static generation.
  pub fn with_offline_document(mut self, url: Url) -> Self {
    self.offline_document = Some(url);
    self
  }

  pub fn with_max_entry_bytes(mut self, bytes: usize) -> Self {
    self.max_entry_bytes = bytes;
    self
  }

  pub async fn handle(&self, request: Request) -> CacheResult<Response> {
    if request.method.is_mutating() {
      return self.handle_mutation(request).await;
    }

    // Only GET responses are cacheable; anything else passes straight through.
    let rule = if request.method == Method::Get {
      self.classifier.classify(&request).clone()
    } else {
      Rule::new(Pattern::Any, "passthrough", Strategy::NetworkOnly)
    };

    let generations = match self.manager.current() {
      Ok(generations) => generations,
      Err(e) => {
        warn!(error = %e, "Generation lookup failed, bypassing cache");
        return self.pass_through(&request).await;
      }
    };

    let ctx = ExecContext {
      store: self.manager.store(),
      generation: generations.name(rule.role()).to_string(),
      network: Arc::clone(&self.network),
      max_entry_bytes: self.max_entry_bytes,
      navigation_fallback: self.offline_document.as_ref().map(|url| NavigationFallback {
        generation: generations.name(Role::Static).to_string(),
        key: Request::get(url.clone()).cache_key(),
      }),
    };

    let executor: Arc<dyn Executor> = match self.executors.get(&rule.strategy) {
      Some(executor) => Arc::clone(executor),
      None => Arc::new(NetworkOnly),
    };

    debug!(
      url = %request.url,
      category = %rule.category,
      strategy = %rule.strategy,
      generation = %ctx.generation,
      "Dispatching request"
    );

    executor.execute(&request, &rule, &ctx).await
  }

  async fn pass_through(&self, request: &Request) -> CacheResult<Response> {
    match self.network.send(request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => CacheResult::synthesized(Response::offline_error(&format!(
        "Network unavailable: {}",
        e
      ))),
    }
  }

  /// Send a mutation, queuing it for replay if the caller opted in and the
  /// network is unreachable.
  ///
  /// An opted-in mutation whose target still has queued actions joins the
  /// tail of the queue instead of overtaking them, and a drain is started
  /// in the background.
  async fn handle_mutation(&self, request: Request) -> CacheResult<Response> {
    let queue = match (&self.queue, request.queue_if_offline) {
      (Some(queue), true) => Some(queue),
      _ => None,
    };

    if let Some(queue) = queue {
      match queue.contains_target(request.url.as_str()) {
        Ok(true) => {
          let queued = Self::enqueue(queue, &request, "Earlier actions for this target are queued");
          let queue = Arc::clone(queue);
          let network = Arc::clone(&self.network);
          tokio::spawn(async move {
            if let Err(e) = queue.drain(network.as_ref()).await {
              warn!(error = %e, "Background drain failed");
            }
          });
          return queued;
        }
        Ok(false) => {}
        Err(e) => warn!(url = %request.url, error = %e, "Queue lookup failed"),
      }
    }

    let error = match self.network.send(&request).await {
      Ok(response) => return CacheResult::from_network(response),
      Err(e) => e,
    };

    match queue {
      Some(queue) => Self::enqueue(queue, &request, &format!("Network unavailable: {}", error)),
      None => CacheResult::synthesized(Response::offline_error(&format!(
        "Network unavailable: {}",
        error
      ))),
    }
  }

  fn enqueue(queue: &OfflineQueue, request: &Request, reason: &str) -> CacheResult<Response> {
    let action = OfflineAction::from_request(request);
    let id = action.id.clone();
    match queue.enqueue(action) {
      Ok(()) => {
        debug!(action_id = %id, url = %request.url, reason, "Queued mutation for replay");
        CacheResult::queued(Response::queued(&id))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Failed to queue mutation");
        CacheResult::synthesized(Response::offline_error(&format!(
          "{} and the request could not be queued",
          reason
        )))
      }
    }
  }
}
