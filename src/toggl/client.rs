use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde_json::Value;
use url::Url;

use super::remote::{AsyncRemote, Method, Remote, Request, Response};
use crate::config::{ApiConfig, Config};
use crate::error::ApiError;

/// Map a non-success status to the error taxonomy.
pub fn classify_status(status: u16, path: &str, message: String) -> ApiError {
  match status {
    404 => ApiError::NotFound {
      path: path.to_string(),
    },
    401 | 403 => ApiError::Auth { status, message },
    500..=599 => ApiError::Server { status, message },
    _ => ApiError::Client { status, message },
  }
}

fn to_reqwest(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

fn decode_body(bytes: &[u8]) -> Result<Response, ApiError> {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Ok(Response::Empty);
  }
  serde_json::from_slice::<Value>(bytes)
    .map(Response::from_json)
    .map_err(|e| ApiError::Decode(e.to_string()))
}

/// Connection settings shared by the blocking and async transports.
#[derive(Debug, Clone)]
struct Endpoint {
  base: Url,
  token: String,
  timeout: Duration,
  retries: u32,
  retry_delay: Duration,
}

impl Endpoint {
  fn new(api: &ApiConfig, token: String) -> Result<Self> {
    let mut base = api.base_url.clone();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base =
      Url::parse(&base).map_err(|e| eyre!("Invalid API base URL {}: {}", api.base_url, e))?;

    Ok(Self {
      base,
      token,
      timeout: Duration::from_secs(api.timeout),
      retries: api.retries,
      retry_delay: Duration::from_millis(api.retry_delay_ms),
    })
  }

  fn url(&self, path: &str) -> Result<Url, ApiError> {
    self
      .base
      .join(path.trim_start_matches('/'))
      .map_err(|e| ApiError::Transport(format!("invalid request path {}: {}", path, e)))
  }
}

/// Blocking Toggl API transport.
///
/// Server errors are retried up to `retries` times; everything else is
/// returned after the first attempt.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::blocking::Client,
  endpoint: Endpoint,
}

impl HttpRemote {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_token(&config.api, token)
  }

  pub fn with_token(api: &ApiConfig, token: String) -> Result<Self> {
    let endpoint = Endpoint::new(api, token)?;
    let client = reqwest::blocking::Client::builder()
      .timeout(endpoint.timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, endpoint })
  }

  fn attempt(&self, request: &Request) -> Result<Response, ApiError> {
    let url = self.endpoint.url(&request.path)?;
    let mut builder = self
      .client
      .request(to_reqwest(request.method), url)
      .basic_auth(&self.endpoint.token, Some("api_token"));
    if let (true, Some(body)) = (request.method.has_body(), &request.body) {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .map_err(|e| ApiError::Transport(e.to_string()))?;
    let status = response.status();
    let bytes = response
      .bytes()
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    if status.is_success() {
      decode_body(&bytes)
    } else {
      Err(failure(status, &request.path, &bytes))
    }
  }
}

impl Remote for HttpRemote {
  fn send(&self, request: &Request) -> Result<Response, ApiError> {
    let mut retries = self.endpoint.retries;
    loop {
      match self.attempt(request) {
        Err(err @ ApiError::Server { .. }) if retries > 0 => {
          retries -= 1;
          tracing::warn!(
            error = %err,
            retries,
            "{} {} failed, retrying",
            request.method.as_str(),
            request.path
          );
          std::thread::sleep(self.endpoint.retry_delay);
        }
        other => return other,
      }
    }
  }
}

/// Async Toggl API transport with the same retry policy as [`HttpRemote`].
#[derive(Clone)]
pub struct AsyncHttpRemote {
  client: reqwest::Client,
  endpoint: Endpoint,
}

impl AsyncHttpRemote {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_token(&config.api, token)
  }

  pub fn with_token(api: &ApiConfig, token: String) -> Result<Self> {
    let endpoint = Endpoint::new(api, token)?;
    let client = reqwest::Client::builder()
      .timeout(endpoint.timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, endpoint })
  }

  async fn attempt(&self, request: &Request) -> Result<Response, ApiError> {
    let url = self.endpoint.url(&request.path)?;
    let mut builder = self
      .client
      .request(to_reqwest(request.method), url)
      .basic_auth(&self.endpoint.token, Some("api_token"));
    if let (true, Some(body)) = (request.method.has_body(), &request.body) {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;
    let status = response.status();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    if status.is_success() {
      decode_body(&bytes)
    } else {
      Err(failure(status, &request.path, &bytes))
    }
  }
}

#[async_trait]
impl AsyncRemote for AsyncHttpRemote {
  async fn send(&self, request: &Request) -> Result<Response, ApiError> {
    let mut retries = self.endpoint.retries;
    loop {
      match self.attempt(request).await {
        Err(err @ ApiError::Server { .. }) if retries > 0 => {
          retries -= 1;
          tracing::warn!(
            error = %err,
            retries,
            "{} {} failed, retrying",
            request.method.as_str(),
            request.path
          );
          tokio::time::sleep(self.endpoint.retry_delay).await;
        }
        other => return other,
      }
    }
  }
}

fn failure(status: StatusCode, path: &str, body: &[u8]) -> ApiError {
  let message = String::from_utf8_lossy(body).trim().to_string();
  tracing::error!(status = status.as_u16(), %message, "Request to {} failed", path);
  classify_status(status.as_u16(), path, message)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classify_status() {
    assert!(classify_status(404, "tags/1", String::new()).is_not_found());
    assert!(classify_status(403, "me", String::new()).is_auth());
    assert!(matches!(
      classify_status(400, "tags", "name taken".into()),
      ApiError::Client { status: 400, .. }
    ));
    assert!(classify_status(502, "tags", String::new()).is_transient());
  }

  #[test]
  fn test_decode_body() {
    assert_eq!(decode_body(b"").unwrap(), Response::Empty);
    assert_eq!(decode_body(b"  \n").unwrap(), Response::Empty);
    assert!(matches!(decode_body(br#"[{"id":1}]"#).unwrap(), Response::Collection(v) if v.len() == 1));
    assert!(matches!(decode_body(b"{oops"), Err(ApiError::Decode(_))));
  }

  #[test]
  fn test_url_join() {
    let api = ApiConfig {
      base_url: "https://api.track.toggl.com/api/v9".to_string(),
      ..ApiConfig::default()
    };
    let endpoint = Endpoint::new(&api, "token".into()).unwrap();
    assert_eq!(
      endpoint.url("/workspaces/1/tags").unwrap().as_str(),
      "https://api.track.toggl.com/api/v9/workspaces/1/tags"
    );
  }
}
