//! Request and response descriptors passed through the interceptor.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// HTTP method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn parse(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(eyre!("Unsupported method: {}", other)),
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Methods that change server state and may be queued while offline.
  pub fn is_mutating(&self) -> bool {
    matches!(
      self,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

pub type Headers = BTreeMap<String, String>;

/// An outbound request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
  /// Page navigation (falls back to the offline document instead of JSON)
  pub navigate: bool,
  /// Caller opted into queuing this mutation if the network is unreachable
  pub queue_if_offline: bool,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: None,
      navigate: false,
      queue_if_offline: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn navigation(mut self) -> Self {
    self.navigate = true;
    self
  }

  pub fn queue_if_offline(mut self) -> Self {
    self.queue_if_offline = true;
    self
  }

  /// Content-type hint used by classification rules.
  ///
  /// Prefers an explicit `accept` header over `content-type`; navigations
  /// without either are treated as asking for HTML.
  pub fn content_type_hint(&self) -> Option<&str> {
    self
      .headers
      .get("accept")
      .or_else(|| self.headers.get("content-type"))
      .map(String::as_str)
      .or(if self.navigate { Some("text/html") } else { None })
  }

  pub fn cache_key(&self) -> CacheKey {
    CacheKey::new(self.method, &self.url)
  }
}

/// Normalized (method, URL) pair identifying a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn new(method: Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(format!("{} {}", method, url))
  }

  /// Rebuild a key from its stored text form.
  pub fn from_raw(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Response snapshot returned to callers and stored in caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Structured error returned when neither network nor cache can answer.
  pub fn offline_error(message: &str) -> Self {
    let body = serde_json::json!({
      "error": "offline",
      "message": message,
      "status": 503,
    });
    Self::new(503, body.to_string()).with_header("content-type", "application/json")
  }

  /// Acknowledgement for a mutation that was queued for later replay.
  pub fn queued(action_id: &str) -> Self {
    let body = serde_json::json!({ "queued": true, "id": action_id });
    Self::new(202, body.to_string()).with_header("content-type", "application/json")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_drops_fragment_and_lowercases_host() {
    let url = Url::parse("https://Example.COM/assets/app.js#section").unwrap();
    let key = CacheKey::new(Method::Get, &url);
    assert_eq!(key.as_str(), "GET https://example.com/assets/app.js");
  }

  #[test]
  fn test_cache_key_distinguishes_methods() {
    let url = Url::parse("https://example.com/api/tiers").unwrap();
    assert_ne!(
      CacheKey::new(Method::Get, &url),
      CacheKey::new(Method::Head, &url)
    );
  }

  #[test]
  fn test_offline_error_shape() {
    let response = Response::offline_error("no network");
    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["error"], "offline");
    assert_eq!(body["message"], "no network");
    assert_eq!(body["status"], 503);
  }

  #[test]
  fn test_method_parse() {
    assert_eq!(Method::parse("post").unwrap(), Method::Post);
    assert!(Method::parse("TRACE").is_err());
    assert!(Method::Delete.is_mutating());
    assert!(!Method::Get.is_mutating());
  }
}
