//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::toggl::{AsyncRemote, Remote, Request, Response};

/// Scripted remote that records every request it receives.
///
/// Responses are returned in the order they were queued; once the script
/// runs out every request fails with a transport error.
#[derive(Default)]
pub(crate) struct FakeRemote {
  script: Mutex<VecDeque<Result<Response, ApiError>>>,
  requests: Mutex<Vec<Request>>,
}

impl FakeRemote {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn respond(self, outcome: Result<Response, ApiError>) -> Self {
    self.script.lock().unwrap().push_back(outcome);
    self
  }

  pub(crate) fn entity(self, value: Value) -> Self {
    self.respond(Ok(Response::Entity(value)))
  }

  pub(crate) fn collection(self, values: Vec<Value>) -> Self {
    self.respond(Ok(Response::Collection(values)))
  }

  pub(crate) fn fail(self, error: ApiError) -> Self {
    self.respond(Err(error))
  }

  pub(crate) fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub(crate) fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  fn next(&self, request: &Request) -> Result<Response, ApiError> {
    self.requests.lock().unwrap().push(request.clone());
    self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Err(ApiError::Transport("no scripted response".into())))
  }
}

impl Remote for FakeRemote {
  fn send(&self, request: &Request) -> Result<Response, ApiError> {
    self.next(request)
  }
}

#[async_trait]
impl AsyncRemote for FakeRemote {
  async fn send(&self, request: &Request) -> Result<Response, ApiError> {
    self.next(request)
  }
}

pub(crate) fn tag_payload(id: i64, name: &str) -> Value {
  json!({
    "id": id,
    "name": name,
    "workspace_id": 1,
    "at": "2024-05-01T09:00:00+00:00"
  })
}

pub(crate) fn server_down() -> ApiError {
  ApiError::Server {
    status: 503,
    message: "unavailable".into(),
  }
}
