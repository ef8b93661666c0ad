//! Network access behind a trait so executors and the queue can be tested offline.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use thiserror::Error;

use crate::http::{Method, Request, Response};

/// Failure to obtain any response from the network.
///
/// HTTP error statuses are not network failures; they arrive as a `Response`.
#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("transport error: {0}")]
  Transport(String),
}

/// The network collaborator. This is the only place the system suspends.
#[async_trait]
pub trait Network: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Bound on establishing a connection; request timeouts are left to callers.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// reqwest-backed network used outside of tests.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("intercache/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(CONNECT_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

impl From<reqwest::Error> for NetworkError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      NetworkError::Timeout(Duration::ZERO)
    } else if e.is_connect() {
      NetworkError::Connect(e.to_string())
    } else {
      NetworkError::Transport(e.to_string())
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn send(&self, request: &Request) -> Result<Response, NetworkError> {
    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let reply = builder.send().await?;
    let status = reply.status().as_u16();
    let headers = reply
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = reply.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
