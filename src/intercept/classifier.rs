//! Request classification: ordered rules mapping a request to a caching policy.

use serde::Deserialize;
use std::fmt;

use crate::cache::Role;
use crate::http::Request;

/// Caching algorithm applied to a classified request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  #[serde(alias = "stale_while_revalidate")]
  Swr,
  NetworkOnly,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::CacheFirst => "cache_first",
      Strategy::NetworkFirst => "network_first",
      Strategy::Swr => "swr",
      Strategy::NetworkOnly => "network_only",
    };
    f.write_str(name)
  }
}

/// What part of a request a rule looks at.
///
/// In YAML a pattern is a single-key map (`{ prefix: /api/ }`) or, for
/// `any`, a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
  /// URL path starts with
  Prefix(String),
  /// URL path ends with
  Suffix(String),
  /// URL path contains
  Contains(String),
  /// URL path has one of these file extensions (without the dot)
  Extension(Vec<String>),
  /// Accept / content-type header contains
  ContentType(String),
  /// Matches every request
  Any,
}

impl Pattern {
  pub fn matches(&self, request: &Request) -> bool {
    let path = request.url.path();
    match self {
      Pattern::Prefix(p) => path.starts_with(p.as_str()),
      Pattern::Suffix(s) => path.ends_with(s.as_str()),
      Pattern::Contains(c) => path.contains(c.as_str()),
      Pattern::Extension(exts) => path
        .rsplit_once('.')
        .filter(|(_, ext)| !ext.contains('/'))
        .map(|(_, ext)| exts.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false),
      Pattern::ContentType(hint) => request
        .content_type_hint()
        .map(|ct| ct.to_ascii_lowercase().contains(&hint.to_ascii_lowercase()))
        .unwrap_or(false),
      Pattern::Any => true,
    }
  }
}

/// Ordered pattern to policy mapping. First match wins.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
  #[serde(rename = "match", with = "serde_yaml::with::singleton_map")]
  pub pattern: Pattern,
  pub category: String,
  pub strategy: Strategy,
  /// Generation role; derived from the category when omitted
  #[serde(default)]
  pub role: Option<Role>,
  /// Maximum age of a cache hit before it must be refetched
  #[serde(default)]
  pub ttl_secs: Option<u64>,
  /// Only requests matching one of these are written to the cache.
  /// `None` allows everything, an empty list allows nothing.
  #[serde(
    default,
    rename = "cacheable",
    with = "serde_yaml::with::singleton_map_recursive"
  )]
  pub cacheable_allowlist: Option<Vec<Pattern>>,
}

impl Rule {
  pub fn new(pattern: Pattern, category: &str, strategy: Strategy) -> Self {
    Self {
      pattern,
      category: category.to_string(),
      strategy,
      role: None,
      ttl_secs: None,
      cacheable_allowlist: None,
    }
  }

  pub fn with_role(mut self, role: Role) -> Self {
    self.role = Some(role);
    self
  }

  pub fn with_ttl_secs(mut self, ttl: u64) -> Self {
    self.ttl_secs = Some(ttl);
    self
  }

  pub fn with_allowlist(mut self, allowlist: Vec<Pattern>) -> Self {
    self.cacheable_allowlist = Some(allowlist);
    self
  }

  pub fn role(&self) -> Role {
    self.role.unwrap_or(match self.category.as_str() {
      "static" | "asset" | "font" | "script" | "style" => Role::Static,
      "api" => Role::Api,
      _ => Role::Dynamic,
    })
  }

  pub fn ttl(&self) -> Option<chrono::Duration> {
    self
      .ttl_secs
      .and_then(|secs| i64::try_from(secs).ok())
      .and_then(chrono::Duration::try_seconds)
  }

  /// Whether a response to `request` may be written to the cache.
  pub fn allows_caching(&self, request: &Request) -> bool {
    match &self.cacheable_allowlist {
      None => true,
      Some(allowlist) => allowlist.iter().any(|p| p.matches(request)),
    }
  }
}

/// Maps requests to rules.
///
/// Sensitive requests are caught before any rule is consulted, and a
/// request that matches nothing gets the uncached network-first default.
#[derive(Debug, Clone)]
pub struct Classifier {
  rules: Vec<Rule>,
  sensitive: Vec<String>,
  sensitive_rule: Rule,
  default_rule: Rule,
}

/// Path fragments that mark a request as never cacheable.
pub const DEFAULT_SENSITIVE: &[&str] = &["auth", "session", "payment", "token", "login", "logout"];

impl Classifier {
  pub fn new(rules: Vec<Rule>, sensitive: Vec<String>) -> Self {
    Self {
      rules,
      sensitive: sensitive.into_iter().map(|s| s.to_ascii_lowercase()).collect(),
      sensitive_rule: Rule::new(Pattern::Any, "sensitive", Strategy::NetworkOnly)
        .with_allowlist(Vec::new()),
      default_rule: Rule::new(Pattern::Any, "dynamic", Strategy::NetworkFirst)
        .with_role(Role::Dynamic)
        .with_allowlist(Vec::new()),
    }
  }

  /// Classifier with the built-in rule table.
  pub fn with_defaults() -> Self {
    Self::new(
      default_rules(),
      DEFAULT_SENSITIVE.iter().map(|s| s.to_string()).collect(),
    )
  }

  pub fn is_sensitive(&self, request: &Request) -> bool {
    let path = request.url.path().to_ascii_lowercase();
    let query = request.url.query().unwrap_or_default().to_ascii_lowercase();
    self
      .sensitive
      .iter()
      .any(|s| path.contains(s.as_str()) || query.contains(s.as_str()))
  }

  pub fn classify(&self, request: &Request) -> &Rule {
    if self.is_sensitive(request) {
      return &self.sensitive_rule;
    }

    self
      .rules
      .iter()
      .find(|rule| rule.pattern.matches(request))
      .unwrap_or(&self.default_rule)
  }
}

/// Built-in rule table used when the configuration provides none.
pub fn default_rules() -> Vec<Rule> {
  let exts = |list: &[&str]| Pattern::Extension(list.iter().map(|s| s.to_string()).collect());

  vec![
    Rule::new(
      exts(&["js", "css", "woff", "woff2", "ttf", "otf"]),
      "static",
      Strategy::CacheFirst,
    ),
    Rule::new(
      exts(&["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"]),
      "image",
      Strategy::Swr,
    )
    .with_role(Role::Dynamic),
    Rule::new(Pattern::Prefix("/api/".to_string()), "api", Strategy::NetworkFirst).with_allowlist(
      vec![
        Pattern::Prefix("/api/tiers".to_string()),
        Pattern::Prefix("/api/config".to_string()),
        Pattern::Prefix("/api/exercises".to_string()),
      ],
    ),
    Rule::new(
      Pattern::ContentType("text/html".to_string()),
      "page",
      Strategy::NetworkFirst,
    ),
  ]
}
