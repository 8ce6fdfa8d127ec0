//! Contract between cached endpoints and the network transport.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ApiError;

/// Request methods understood by the Toggl API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Whether a JSON body is sent with this method.
  pub fn has_body(&self) -> bool {
    !matches!(self, Method::Get | Method::Delete)
  }
}

/// A request relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
}

impl Request {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      body: None,
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
  Entity(Value),
  Collection(Vec<Value>),
  /// Side-effect only (no body, or a body that is not an entity).
  Empty,
}

impl Response {
  /// Classify a decoded JSON body.
  pub fn from_json(value: Value) -> Self {
    match value {
      Value::Array(items) => Response::Collection(items),
      Value::Object(_) => Response::Entity(value),
      _ => Response::Empty,
    }
  }
}

/// Blocking transport. Implementations apply their own retry policy and
/// return only the final outcome.
pub trait Remote: Send + Sync {
  fn send(&self, request: &Request) -> Result<Response, ApiError>;
}

/// Asynchronous transport.
#[async_trait]
pub trait AsyncRemote: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response, ApiError>;
}
