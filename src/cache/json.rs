//! File-backed caches: one JSON document per entity type.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;

use super::query::Query;
use super::session::Session;
use super::traits::{AsyncCache, Cache, Expiration};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::toggl::Model;

const DEFAULT_MAX_LENGTH: usize = 10_000;

/// Location of the document for `T` inside `dir`.
pub fn document_path<T: Model>(dir: &Path) -> PathBuf {
  dir.join(format!("cache_{}.json", T::entity_type()))
}

/// Read the document, treating a missing file as empty.
fn read_document(path: &Path) -> Result<Vec<u8>, CacheError> {
  match std::fs::read(path) {
    Ok(bytes) => Ok(bytes),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
    Err(e) => Err(CacheError::io(path, e)),
  }
}

/// Write `bytes` to a temporary file next to `path`, flushed to disk but not
/// yet visible at `path`.
pub(crate) fn stage(path: &Path, bytes: &[u8]) -> Result<NamedTempFile, CacheError> {
  let dir = path.parent().unwrap_or_else(|| Path::new("."));
  std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;

  let mut file = NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
  file
    .write_all(bytes)
    .and_then(|_| file.as_file().sync_all())
    .map_err(|e| CacheError::io(file.path(), e))?;
  Ok(file)
}

/// Replace the document at `path` atomically: either the old or the new
/// contents are visible, never a partial write.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
  stage(path, bytes)?
    .persist(path)
    .map_err(|e| CacheError::io(path, e.error))?;
  Ok(())
}

/// Blocking file-backed cache.
///
/// The document is read lazily on first access and rewritten by
/// [`Cache::commit`] only when the records changed.
pub struct JsonCache<T: Model> {
  path: PathBuf,
  expiration: Expiration,
  max_length: usize,
  session: Mutex<Option<Session<T>>>,
}

impl<T: Model> JsonCache<T> {
  /// Cache stored in `dir/cache_<entity>.json`.
  pub fn new(dir: impl AsRef<Path>, expiration: Expiration) -> Self {
    Self {
      path: document_path::<T>(dir.as_ref()),
      expiration,
      max_length: DEFAULT_MAX_LENGTH,
      session: Mutex::new(None),
    }
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(&config.path, config.expiration()).with_max_length(config.max_length)
  }

  pub fn with_max_length(mut self, max_length: usize) -> Self {
    self.max_length = max_length;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Run `f` on the session, loading it from disk first if needed.
  fn with_session<R>(&self, f: impl FnOnce(&mut Session<T>) -> R) -> Result<R, CacheError> {
    let mut guard = self.session.lock().map_err(|_| CacheError::Poisoned)?;
    if guard.is_none() {
      let bytes = read_document(&self.path)?;
      *guard = Some(Session::decode(&bytes, self.max_length, &self.path));
    }
    Ok(f(guard.get_or_insert_with(|| Session::new(self.max_length))))
  }
}

impl<T: Model> Cache<T> for JsonCache<T> {
  fn expiration(&self) -> Expiration {
    self.expiration
  }

  fn find_within(&self, id: i64, window: Expiration) -> Result<Option<T>, CacheError> {
    self.with_session(|s| s.find(id, window, Utc::now()).cloned())
  }

  fn query_within(
    &self,
    queries: &[Query],
    distinct: bool,
    window: Expiration,
  ) -> Result<Vec<T>, CacheError> {
    tracing::debug!(path = %self.path.display(), predicates = queries.len(), "Querying file cache");
    self.with_session(|s| s.query(queries, distinct, window, Utc::now()))?
  }

  fn add(&self, records: &[T]) -> Result<(), CacheError> {
    self.with_session(|s| s.upsert(records))
  }

  fn remove(&self, ids: &[i64]) -> Result<(), CacheError> {
    self.with_session(|s| s.remove(ids))
  }

  fn ids(&self) -> Result<Vec<i64>, CacheError> {
    self.with_session(|s| s.ids())
  }

  fn replace(&self, scope: &[Query], records: &[T]) -> Result<(), CacheError> {
    self.with_session(|s| s.replace(scope, records))?
  }

  fn commit(&self) -> Result<(), CacheError> {
    self.with_session(|session| {
      if !session.is_dirty() {
        tracing::debug!(path = %self.path.display(), "Cache unchanged, skipping write");
        return Ok(());
      }
      let bytes = session.encode()?;
      write_atomic(&self.path, &bytes)?;
      session.mark_persisted();
      tracing::debug!(
        path = %self.path.display(),
        records = session.records().len(),
        "Saved cache to disk"
      );
      Ok(())
    })?
  }
}

/// Async file-backed cache.
///
/// Same document and session as [`JsonCache`]; reads go through `tokio::fs`
/// and the atomic replace runs on the blocking pool. The persisted snapshot
/// is only updated once the rename has completed, so a cancelled commit is
/// simply retried by the next one.
pub struct AsyncJsonCache<T: Model> {
  path: PathBuf,
  expiration: Expiration,
  max_length: usize,
  session: tokio::sync::Mutex<Option<Session<T>>>,
}

impl<T: Model> AsyncJsonCache<T> {
  pub fn new(dir: impl AsRef<Path>, expiration: Expiration) -> Self {
    Self {
      path: document_path::<T>(dir.as_ref()),
      expiration,
      max_length: DEFAULT_MAX_LENGTH,
      session: tokio::sync::Mutex::new(None),
    }
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(&config.path, config.expiration()).with_max_length(config.max_length)
  }

  pub fn with_max_length(mut self, max_length: usize) -> Self {
    self.max_length = max_length;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Lock the session slot, loading the document on first use.
  async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, Option<Session<T>>>, CacheError> {
    let mut guard = self.session.lock().await;
    if guard.is_none() {
      let bytes = match tokio::fs::read(&self.path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(CacheError::io(&self.path, e)),
      };
      *guard = Some(Session::decode(&bytes, self.max_length, &self.path));
    }
    Ok(guard)
  }

  async fn with_session<R>(&self, f: impl FnOnce(&mut Session<T>) -> R) -> Result<R, CacheError> {
    let mut guard = self.lock().await?;
    Ok(f(guard.get_or_insert_with(|| Session::new(self.max_length))))
  }
}

#[async_trait]
impl<T: Model> AsyncCache<T> for AsyncJsonCache<T> {
  fn expiration(&self) -> Expiration {
    self.expiration
  }

  async fn find_within(&self, id: i64, window: Expiration) -> Result<Option<T>, CacheError> {
    self
      .with_session(|s| s.find(id, window, Utc::now()).cloned())
      .await
  }

  async fn query_within(
    &self,
    queries: &[Query],
    distinct: bool,
    window: Expiration,
  ) -> Result<Vec<T>, CacheError> {
    self
      .with_session(|s| s.query(queries, distinct, window, Utc::now()))
      .await?
  }

  async fn add(&self, records: &[T]) -> Result<(), CacheError> {
    self.with_session(|s| s.upsert(records)).await
  }

  async fn remove(&self, ids: &[i64]) -> Result<(), CacheError> {
    self.with_session(|s| s.remove(ids)).await
  }

  async fn ids(&self) -> Result<Vec<i64>, CacheError> {
    self.with_session(|s| s.ids()).await
  }

  async fn replace(&self, scope: &[Query], records: &[T]) -> Result<(), CacheError> {
    self.with_session(|s| s.replace(scope, records)).await?
  }

  async fn commit(&self) -> Result<(), CacheError> {
    let mut guard = self.lock().await?;
    let session = guard.get_or_insert_with(|| Session::new(self.max_length));
    if !session.is_dirty() {
      tracing::debug!(path = %self.path.display(), "Cache unchanged, skipping write");
      return Ok(());
    }

    let bytes = session.encode()?;
    let path = self.path.clone();
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
      .await
      .map_err(|e| CacheError::Task(e.to_string()))??;

    session.mark_persisted();
    tracing::debug!(
      path = %self.path.display(),
      records = session.records().len(),
      "Saved cache to disk"
    );
    Ok(())
  }
}
