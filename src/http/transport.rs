//! The wire underneath the client: one request in, one response out.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::queue::Method;

/// A fully resolved outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
}

/// Any response the server actually sent back, error statuses included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub body: String,
}

impl Response {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Failures where no response was received.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("network error: {0}")]
  Network(String),

  /// The request could not be built (bad header, bad URL). Retrying won't help.
  #[error("invalid request: {0}")]
  Invalid(String),
}

impl TransportError {
  /// Low-level failures worth replaying later.
  pub fn is_network(&self) -> bool {
    matches!(self, TransportError::Timeout(_) | TransportError::Network(_))
  }
}

/// Sends requests. Implemented over reqwest in production and scripted in
/// tests.
pub trait Transport: Send + Sync + 'static {
  fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, TransportError>>;
}

/// Send with a hard deadline. A request never outlives `timeout`.
pub(crate) async fn send_with_timeout(
  transport: &dyn Transport,
  request: &Request,
  timeout: Duration,
) -> Result<Response, TransportError> {
  match tokio::time::timeout(timeout, transport.send(request)).await {
    Ok(result) => result,
    Err(_) => Err(TransportError::Timeout(timeout)),
  }
}

/// Append `endpoint` to `base`, keeping any path prefix on the base URL.
///
/// `Url::join` would drop `/api` from `https://host/api` for an endpoint
/// starting with `/`, so the two are concatenated instead.
pub fn resolve(base: &Url, endpoint: &str) -> Result<Url, url::ParseError> {
  let base = base.as_str().trim_end_matches('/');
  let endpoint = endpoint.trim_start_matches('/');
  Url::parse(&format!("{}/{}", base, endpoint))
}

/// Transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
  timeout: Duration,
}

impl ReqwestTransport {
  pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .connect_timeout(timeout)
      .build()?;
    Ok(Self { client, timeout })
  }

  fn classify(&self, e: reqwest::Error) -> TransportError {
    if e.is_builder() {
      TransportError::Invalid(e.to_string())
    } else if e.is_timeout() {
      TransportError::Timeout(self.timeout)
    } else {
      TransportError::Network(e.to_string())
    }
  }
}

impl Transport for ReqwestTransport {
  fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, TransportError>> {
    Box::pin(async move {
      let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
      };

      let mut builder = self.client.request(method, request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder.send().await.map_err(|e| self.classify(e))?;
      let status = response.status().as_u16();
      // The server has answered; losing the body must not turn that into a
      // network failure
      let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
          warn!(status, url = %request.url, error = %e, "response body could not be read");
          String::new()
        }
      };

      Ok(Response { status, body })
    })
  }
}
