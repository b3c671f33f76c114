use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info};
use url::Url;

use super::transport::{resolve, send_with_timeout, Request, Response, TransportError};
use crate::connectivity::Connectivity;
use crate::queue::{Method, NewAction, QueueError};
use crate::store::ActionStore;
use crate::sync::SyncEngine;

/// Outcome of a request that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
  /// The request never reached the server and was saved for replay. Callers
  /// should treat this as an optimistic success, not as a failure.
  #[error("offline: request queued for later sync ({id})")]
  Queued { id: String },

  /// The server answered with an error status. Never queued.
  #[error("server rejected request ({status}): {message}")]
  Status { status: u16, message: String },

  /// A request that can't be queued (reads, malformed requests) failed
  /// before a response arrived.
  #[error(transparent)]
  Network(TransportError),

  /// The request failed and could not be saved either, so it is lost.
  #[error("request failed ({failure}) and could not be queued: {source}")]
  Durability {
    failure: TransportError,
    #[source]
    source: QueueError,
  },

  #[error("invalid endpoint {endpoint}: {source}")]
  InvalidEndpoint {
    endpoint: String,
    #[source]
    source: url::ParseError,
  },

  #[error("failed to encode request body: {0}")]
  Encode(#[from] serde_json::Error),
}

impl HttpError {
  pub fn is_queued(&self) -> bool {
    matches!(self, HttpError::Queued { .. })
  }
}

/// Client every state-changing call goes through.
///
/// Failed mutations that never got a response are written to the queue and
/// reported as [`HttpError::Queued`]. Error responses from the server are
/// returned as-is.
pub struct HttpClient<S: ActionStore> {
  base_url: Url,
  default_headers: BTreeMap<String, String>,
  token: Arc<RwLock<Option<String>>>,
  engine: SyncEngine<S>,
  connectivity: Arc<dyn Connectivity>,
}

impl<S: ActionStore> HttpClient<S> {
  /// Build a client and point the engine's replays at the same origin.
  pub fn new(base_url: Url, engine: SyncEngine<S>, connectivity: Arc<dyn Connectivity>) -> Self {
    engine.configure(base_url.clone());

    let mut default_headers = BTreeMap::new();
    default_headers.insert("Accept".to_string(), "application/json".to_string());

    Self {
      base_url,
      default_headers,
      token: Arc::new(RwLock::new(None)),
      engine,
      connectivity,
    }
  }

  /// Add a header sent with every request.
  pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.default_headers.insert(name.into(), value.into());
    self
  }

  pub fn set_token(&self, token: impl Into<String>) {
    *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(token.into());
  }

  pub fn clear_token(&self) {
    *self.token.write().unwrap_or_else(|e| e.into_inner()) = None;
  }

  /// Forget the credentials and every pending action.
  pub async fn logout(&self) -> Result<(), QueueError> {
    self.clear_token();
    self.engine.queue().clear().await
  }

  pub fn engine(&self) -> &SyncEngine<S> {
    &self.engine
  }

  pub async fn get(&self, endpoint: &str) -> Result<Response, HttpError> {
    self.request(Method::Get, endpoint, None).await
  }

  pub async fn delete(&self, endpoint: &str) -> Result<Response, HttpError> {
    self.request(Method::Delete, endpoint, None).await
  }

  pub async fn post<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<Response, HttpError> {
    self.send_json(Method::Post, endpoint, body).await
  }

  pub async fn put<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<Response, HttpError> {
    self.send_json(Method::Put, endpoint, body).await
  }

  pub async fn patch<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<Response, HttpError> {
    self.send_json(Method::Patch, endpoint, body).await
  }

  async fn send_json<T: Serialize + ?Sized>(
    &self,
    method: Method,
    endpoint: &str,
    body: &T,
  ) -> Result<Response, HttpError> {
    let body = serde_json::to_string(body)?;
    self.request(method, endpoint, Some(body)).await
  }

  /// Send one request and classify any failure exactly once: queue it, or
  /// hand it back to the caller.
  pub async fn request(
    &self,
    method: Method,
    endpoint: &str,
    body: Option<String>,
  ) -> Result<Response, HttpError> {
    let url = resolve(&self.base_url, endpoint).map_err(|source| HttpError::InvalidEndpoint {
      endpoint: endpoint.to_string(),
      source,
    })?;

    let online = self.connectivity.is_online();
    if online {
      // Give earlier queued writes a chance to land first
      self.engine.trigger();
    }

    let request = Request {
      method,
      url,
      headers: self.headers_for(body.is_some()),
      body,
    };

    debug!(%method, endpoint, online, "sending request");
    match send_with_timeout(self.engine.transport(), &request, self.engine.timeout()).await {
      Ok(response) if response.is_success() => Ok(response),
      Ok(response) => Err(HttpError::Status {
        status: response.status,
        message: server_message(&response.body),
      }),
      Err(failure) if is_queueable(method, online, &failure) => {
        self.defer(request, endpoint, failure).await
      }
      Err(failure) => Err(HttpError::Network(failure)),
    }
  }

  /// Save a failed mutation for replay.
  async fn defer(
    &self,
    request: Request,
    endpoint: &str,
    failure: TransportError,
  ) -> Result<Response, HttpError> {
    let action = NewAction {
      method: request.method,
      endpoint: endpoint.to_string(),
      body: request.body,
      headers: request.headers,
    };

    match self.engine.queue().enqueue(action).await {
      Ok(queued) => {
        info!(id = %queued.id, reason = %failure, "request deferred until back online");
        Err(HttpError::Queued { id: queued.id })
      }
      Err(source) => {
        error!(endpoint, reason = %failure, error = %source, "request failed and could not be queued");
        Err(HttpError::Durability { failure, source })
      }
    }
  }

  fn headers_for(&self, has_body: bool) -> BTreeMap<String, String> {
    let mut headers = self.default_headers.clone();

    if let Some(token) = self
      .token
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .as_deref()
    {
      headers.insert("Authorization".to_string(), format!("Bearer {}", token));
    }

    let has_content_type = headers
      .keys()
      .any(|name| name.eq_ignore_ascii_case("content-type"));
    if has_body && !has_content_type {
      headers.insert("Content-Type".to_string(), "application/json".to_string());
    }

    headers
  }
}

impl<S: ActionStore> Clone for HttpClient<S> {
  fn clone(&self) -> Self {
    Self {
      base_url: self.base_url.clone(),
      default_headers: self.default_headers.clone(),
      token: Arc::clone(&self.token),
      engine: self.engine.clone(),
      connectivity: Arc::clone(&self.connectivity),
    }
  }
}

/// Mutations that never got a response are queued when the device is offline
/// or the failure was at the network level. Requests that could not even be
/// built would fail the same way on replay, so they are never queued.
fn is_queueable(method: Method, online: bool, failure: &TransportError) -> bool {
  if !method.is_mutation() || matches!(failure, TransportError::Invalid(_)) {
    return false;
  }
  !online || failure.is_network()
}

/// Pull a human-readable message out of an error body.
fn server_message(body: &str) -> String {
  if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
    for key in ["message", "error", "detail"] {
      if let Some(message) = value.get(key).and_then(|v| v.as_str()) {
        return message.to_string();
      }
    }
  }

  let trimmed = body.trim();
  if trimmed.is_empty() {
    "no message".to_string()
  } else {
    trimmed.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::ManualConnectivity;
  use crate::queue::QueueManager;
  use crate::store::SqliteStore;
  use crate::sync::SyncOptions;
  use crate::http::ReqwestTransport;
  use crate::testing::{temp_store, truncating_server, FailingStore, Recorder, ScriptedTransport};
  use serde_json::json;
  use std::time::Duration;
  use tempfile::TempDir;

  struct Fixture {
    _dir: TempDir,
    client: HttpClient<SqliteStore>,
    transport: ScriptedTransport,
    probe: Arc<ManualConnectivity>,
  }

  fn fixture(online: bool) -> Fixture {
    let (dir, store) = temp_store();
    let transport = ScriptedTransport::new();
    let engine = SyncEngine::new(
      QueueManager::new(store),
      Arc::new(transport.clone()),
      SyncOptions {
        timeout: Duration::from_millis(200),
        ..SyncOptions::default()
      },
    );
    let probe = Arc::new(ManualConnectivity::new(online));
    let client = HttpClient::new(
      Url::parse("https://clinic.example.com/api").unwrap(),
      engine,
      probe.clone(),
    );
    Fixture {
      _dir: dir,
      client,
      transport,
      probe,
    }
  }

  async fn pending_len(client: &HttpClient<SqliteStore>) -> usize {
    client.engine().queue().pending().await.unwrap().len()
  }

  /// Let background drains spawned by the client settle.
  async fn settle(client: &HttpClient<SqliteStore>) {
    tokio::time::sleep(Duration::from_millis(20)).await;
    while client.engine().is_draining() {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  }

  #[tokio::test]
  async fn test_offline_patch_is_queued() {
    let f = fixture(false);
    let recorder = Recorder::default();
    let _sub = f
      .client
      .engine()
      .queue()
      .subscribe(recorder.listener())
      .await
      .unwrap();
    f.transport.refuse("/api/patients/3");

    let err = f
      .client
      .patch("/patients/3", &json!({"phone": "555-0100"}))
      .await
      .unwrap_err();

    assert!(err.is_queued());
    let pending = recorder.last().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].method, Method::Patch);
    assert_eq!(pending[0].endpoint, "/patients/3");
    assert_eq!(pending[0].body.as_deref(), Some(r#"{"phone":"555-0100"}"#));
  }

  #[tokio::test]
  async fn test_queued_action_is_replayed_after_reconnect() {
    let f = fixture(false);
    let recorder = Recorder::default();
    let _sub = f
      .client
      .engine()
      .queue()
      .subscribe(recorder.listener())
      .await
      .unwrap();
    f.transport.refuse("/api/patients/3");
    let err = f
      .client
      .patch("/patients/3", &json!({"phone": "555-0100"}))
      .await
      .unwrap_err();
    assert!(err.is_queued());

    f.probe.set_online(true);
    f.transport.respond("/api/patients/3", 200, "{}");
    let report = f.client.engine().process_queue().await.unwrap();

    assert_eq!(report.replayed, 1);
    assert_eq!(pending_len(&f.client).await, 0);
    assert_eq!(recorder.last(), Some(vec![]));
  }

  #[tokio::test]
  async fn test_partial_drain_then_resume() {
    let f = fixture(false);
    f.transport.refuse("/api/x");
    f.transport.refuse("/api/y");
    assert!(f.client.post("/x", &json!({"a": 1})).await.unwrap_err().is_queued());
    assert!(f.client.post("/y", &json!({"b": 2})).await.unwrap_err().is_queued());

    // A goes through, B's connection drops
    f.transport.refuse("/api/y");
    let report = f.client.engine().process_queue().await.unwrap();
    assert_eq!(report.replayed, 1);
    let pending = f.client.engine().queue().pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].endpoint, "/y");

    let report = f.client.engine().process_queue().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(pending_len(&f.client).await, 0);
  }

  #[tokio::test]
  async fn test_validation_error_is_not_queued() {
    let f = fixture(true);
    f.transport
      .respond("/api/bookings", 422, r#"{"message":"slot already taken"}"#);

    let err = f
      .client
      .post("/bookings", &json!({"slot": "09:30"}))
      .await
      .unwrap_err();

    match err {
      HttpError::Status { status, message } => {
        assert_eq!(status, 422);
        assert_eq!(message, "slot already taken");
      }
      other => panic!("expected a status error, got {:?}", other),
    }
    settle(&f.client).await;
    assert_eq!(pending_len(&f.client).await, 0);
  }

  #[tokio::test]
  async fn test_unauthorized_is_not_queued_even_offline() {
    let f = fixture(false);
    f.transport.respond("/api/settings", 401, "");

    let err = f.client.put("/settings", &json!({})).await.unwrap_err();

    assert!(matches!(err, HttpError::Status { status: 401, ref message } if message == "no message"));
    assert_eq!(pending_len(&f.client).await, 0);
  }

  #[tokio::test]
  async fn test_failed_get_is_surfaced_not_queued() {
    let f = fixture(false);
    f.transport.refuse("/api/patients");

    let err = f.client.get("/patients").await.unwrap_err();

    assert!(matches!(err, HttpError::Network(TransportError::Network(_))));
    assert_eq!(pending_len(&f.client).await, 0);
  }

  #[tokio::test]
  async fn test_timeout_is_queued_as_network_failure() {
    let f = fixture(true);
    f.transport.hang("/api/slow");

    let err = f.client.delete("/slow").await.unwrap_err();

    assert!(err.is_queued());
    settle(&f.client).await;
    let pending = f.client.engine().queue().pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].method, Method::Delete);
  }

  #[tokio::test]
  async fn test_durability_failure_is_reported_as_lost() {
    let transport = ScriptedTransport::new();
    transport.refuse("/api/patients/1");
    let engine = SyncEngine::new(
      QueueManager::new(FailingStore),
      Arc::new(transport.clone()),
      SyncOptions::default(),
    );
    let client = HttpClient::new(
      Url::parse("https://clinic.example.com/api").unwrap(),
      engine,
      Arc::new(ManualConnectivity::new(false)),
    );

    let err = client
      .patch("/patients/1", &json!({"name": "x"}))
      .await
      .unwrap_err();

    assert!(matches!(err, HttpError::Durability { .. }));
    assert!(!err.is_queued());
  }

  #[tokio::test]
  async fn test_captured_headers_include_token_and_defaults() {
    let f = fixture(false);
    let client = f.client.clone().with_default_header("X-Client", "front-desk");
    client.set_token("secret");
    f.transport.refuse("/api/notes");

    client.post("/notes", &json!({"text": "hi"})).await.unwrap_err();

    let pending = client.engine().queue().pending().await.unwrap();
    let headers = &pending[0].headers;
    assert_eq!(headers["Authorization"], "Bearer secret");
    assert_eq!(headers["X-Client"], "front-desk");
    assert_eq!(headers["Content-Type"], "application/json");
    assert_eq!(headers["Accept"], "application/json");
  }

  #[tokio::test]
  async fn test_success_triggers_background_drain() {
    let f = fixture(false);
    f.transport.refuse("/api/a");
    assert!(f.client.post("/a", &json!({})).await.unwrap_err().is_queued());

    f.probe.set_online(true);
    let response = f.client.get("/patients").await.unwrap();
    assert_eq!(response.status, 200);

    settle(&f.client).await;
    assert_eq!(pending_len(&f.client).await, 0);
    assert!(f.transport.paths().contains(&"/api/a".to_string()));
  }

  #[tokio::test]
  async fn test_logout_clears_queue_and_token() {
    let f = fixture(false);
    f.client.set_token("secret");
    f.transport.refuse("/api/a");
    assert!(f.client.post("/a", &json!({})).await.unwrap_err().is_queued());

    f.client.logout().await.unwrap();

    assert_eq!(pending_len(&f.client).await, 0);
    assert!(!f.client.headers_for(false).contains_key("Authorization"));
  }

  fn reqwest_client(base_url: Url, online: bool) -> (TempDir, HttpClient<SqliteStore>) {
    let (dir, store) = temp_store();
    let engine = SyncEngine::new(
      QueueManager::new(store),
      Arc::new(ReqwestTransport::new(Duration::from_secs(2)).unwrap()),
      SyncOptions::default(),
    );
    let client = HttpClient::new(base_url, engine, Arc::new(ManualConnectivity::new(online)));
    (dir, client)
  }

  #[tokio::test]
  async fn test_error_status_with_cut_off_body_is_not_queued() {
    let base = truncating_server(
      "HTTP/1.1 422 Unprocessable Entity\r\nContent-Type: application/json\r\nContent-Length: 200\r\n\r\n{\"message\":",
    )
    .await;
    let (_dir, client) = reqwest_client(base, true);

    let err = client
      .post("/bookings", &json!({"slot": "09:30"}))
      .await
      .unwrap_err();

    assert!(matches!(err, HttpError::Status { status: 422, .. }), "got {:?}", err);
    settle(&client).await;
    assert_eq!(pending_len(&client).await, 0);
  }

  #[tokio::test]
  async fn test_success_with_cut_off_body_is_not_replayed() {
    let base = truncating_server("HTTP/1.1 201 Created\r\nContent-Length: 200\r\n\r\n{").await;
    let (_dir, client) = reqwest_client(base, false);

    let response = client.post("/notes", &json!({"text": "hi"})).await.unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(pending_len(&client).await, 0);
  }

  #[test]
  fn test_server_message_extraction() {
    assert_eq!(server_message(r#"{"message":"bad date"}"#), "bad date");
    assert_eq!(server_message(r#"{"error":"forbidden"}"#), "forbidden");
    assert_eq!(server_message("  plain text  "), "plain text");
    assert_eq!(server_message(""), "no message");
  }

  #[test]
  fn test_queueable_classification() {
    let refused = TransportError::Network("refused".into());
    let invalid = TransportError::Invalid("bad header".into());

    assert!(is_queueable(Method::Post, true, &refused));
    assert!(is_queueable(Method::Patch, false, &refused));
    assert!(!is_queueable(Method::Get, false, &refused));
    assert!(!is_queueable(Method::Post, false, &invalid));
  }
}
