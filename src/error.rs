//! Error taxonomy shared by the cache backends, the remote transport and the
//! cached endpoints.
//!
//! Backend-specific failures are wrapped here so that no `rusqlite` or
//! `reqwest` error type crosses the public API unclassified.

use std::path::PathBuf;

/// Failures raised by a cache backend.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The cache file or directory could not be read or written.
  #[error("cache I/O failed for {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The relational store rejected a statement or is unreachable.
  #[error("cache database error: {0}")]
  Database(#[from] rusqlite::Error),

  /// A record could not be serialized for storage.
  #[error("failed to encode cache record: {0}")]
  Encode(#[from] serde_json::Error),

  /// Persisted data could not be decoded.
  #[error("corrupt cache data: {0}")]
  Corrupt(String),

  /// A child record was written before the record it references.
  #[error("{table} {id} references missing {parent} {parent_id}")]
  MissingParent {
    table: &'static str,
    id: i64,
    parent: &'static str,
    parent_id: i64,
  },

  /// A query predicate is malformed or does not fit the entity schema.
  #[error("invalid query: {0}")]
  InvalidQuery(String),

  #[error("cache lock poisoned")]
  Poisoned,

  /// A blocking cache task panicked or was aborted.
  #[error("cache task failed: {0}")]
  Task(String),
}

impl CacheError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }

  /// Whether retrying the same operation later could succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::Io { .. } | Self::Database(_) | Self::Poisoned | Self::Task(_)
    )
  }

  /// Errors with no safe fallback. These always reach the caller.
  pub fn is_fatal(&self) -> bool {
    matches!(self, Self::MissingParent { .. } | Self::InvalidQuery(_))
  }
}

/// Terminal outcome of a remote request, after the transport gave up retrying.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  /// The resource does not exist. Cached endpoints turn this into an absent
  /// result rather than an error.
  #[error("{path} not found")]
  NotFound { path: String },

  #[error("authentication rejected ({status}): {message}")]
  Auth { status: u16, message: String },

  #[error("request rejected ({status}): {message}")]
  Client { status: u16, message: String },

  #[error("server error ({status}): {message}")]
  Server { status: u16, message: String },

  /// The request never produced a response.
  #[error("transport failure: {0}")]
  Transport(String),

  /// The response body was not the JSON shape expected.
  #[error("malformed response: {0}")]
  Decode(String),
}

impl ApiError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, Self::Auth { .. })
  }

  /// Whether the transport may retry the request.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Server { .. } | Self::Transport(_))
  }
}

/// A raw payload could not be turned into a typed entity.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode {entity}: {source}")]
pub struct ModelError {
  pub entity: &'static str,
  #[source]
  pub source: serde_json::Error,
}

/// Everything a cached endpoint can surface to its caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error(transparent)]
  Api(#[from] ApiError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Model(#[from] ModelError),

  #[error("no cache attached to this endpoint")]
  NoCache,
}
