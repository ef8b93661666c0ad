//! Request interception: classification, strategy execution and dispatch.

mod classifier;
mod interceptor;
mod strategy;

pub use classifier::{default_rules, Classifier, Pattern, Rule, Strategy, DEFAULT_SENSITIVE};
pub use interceptor::Interceptor;
pub use strategy::{
  CacheFirst, ExecContext, Executor, NavigationFallback, NetworkFirst, NetworkOnly,
  StaleWhileRevalidate, DEFAULT_MAX_ENTRY_BYTES, DEFAULT_NETWORK_TIMEOUT,
};
