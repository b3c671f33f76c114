//! The persisted record of a deferred mutation.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// HTTP verbs the client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Whether this verb changes server state. Only mutations are ever queued.
  pub fn is_mutation(self) -> bool {
    !matches!(self, Method::Get)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unsupported HTTP method: {}", other)),
    }
  }
}

/// A mutation waiting to be replayed. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedAction {
  pub id: String,
  pub method: Method,
  /// Path relative to the configured base URL
  pub endpoint: String,
  /// Serialized request payload
  pub body: Option<String>,
  /// Headers in effect when the request was captured (auth included)
  pub headers: BTreeMap<String, String>,
  pub created_at: DateTime<Utc>,
}

/// The caller-supplied part of a [`QueuedAction`]; id and timestamp are
/// filled in at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAction {
  pub method: Method,
  pub endpoint: String,
  pub body: Option<String>,
  pub headers: BTreeMap<String, String>,
}

impl NewAction {
  pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
    Self {
      method,
      endpoint: endpoint.into(),
      body: None,
      headers: BTreeMap::new(),
    }
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  /// Stamp the action with a fresh id and capture time.
  pub(crate) fn into_queued(self, now: DateTime<Utc>) -> QueuedAction {
    QueuedAction {
      id: generate_id(now),
      method: self.method,
      endpoint: self.endpoint,
      body: self.body,
      headers: self.headers,
      created_at: now,
    }
  }
}

/// Timestamp plus random suffix. The millisecond prefix is zero-padded so ids
/// sort lexically in creation order.
fn generate_id(now: DateTime<Utc>) -> String {
  let suffix: u32 = rand::thread_rng().gen();
  format!("{:013}-{:08x}", now.timestamp_millis().max(0), suffix)
}
