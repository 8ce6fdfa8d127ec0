//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::query::Query;
use crate::error::CacheError;
use crate::toggl::Model;

/// How long a cached record stays fresh.
///
/// `None` or a zero window means records never expire. A record is fresh when
/// `now - record.timestamp <= window`; stale records stay on disk but reads
/// treat them as misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expiration(Option<Duration>);

impl Expiration {
  pub const NEVER: Expiration = Expiration(None);

  pub fn after(window: Duration) -> Self {
    if window <= Duration::zero() {
      Self::NEVER
    } else {
      Self(Some(window))
    }
  }

  pub fn window(&self) -> Option<Duration> {
    self.0
  }

  /// Oldest timestamp still considered fresh at `now`. A window reaching
  /// past the earliest representable instant has no cutoff.
  pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self.0.and_then(|window| now.checked_sub_signed(window))
  }

  pub fn is_fresh(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    self.cutoff(now).map_or(true, |cutoff| timestamp >= cutoff)
  }

  /// A longer window used when the remote side is unreachable.
  pub fn widened(&self, grace: Duration) -> Self {
    match self.0 {
      Some(window) => window.checked_add(&grace).map_or(Self::NEVER, Self::after),
      None => Self::NEVER,
    }
  }
}

impl From<Option<std::time::Duration>> for Expiration {
  fn from(value: Option<std::time::Duration>) -> Self {
    value
      .and_then(|d| Duration::from_std(d).ok())
      .map(Self::after)
      .unwrap_or(Self::NEVER)
  }
}

/// Storage backend for one entity type.
///
/// Mutations accept a slice so a single record (`std::slice::from_ref`) and a
/// collection go through the same path. Re-adding an existing id replaces
/// the stored record.
pub trait Cache<T: Model>: Send + Sync {
  fn expiration(&self) -> Expiration;

  /// Look up a record by id, ignoring records outside `window`.
  fn find_within(&self, id: i64, window: Expiration) -> Result<Option<T>, CacheError>;

  /// Records matching every predicate and fresh within `window`.
  fn query_within(
    &self,
    queries: &[Query],
    distinct: bool,
    window: Expiration,
  ) -> Result<Vec<T>, CacheError>;

  /// Insert or replace by id.
  fn add(&self, records: &[T]) -> Result<(), CacheError>;

  /// Delete by id. Ids that are not cached are ignored.
  fn remove(&self, ids: &[i64]) -> Result<(), CacheError>;

  /// Flush pending writes.
  fn commit(&self) -> Result<(), CacheError>;

  /// Every id currently stored, fresh or not.
  fn ids(&self) -> Result<Vec<i64>, CacheError>;

  fn update(&self, records: &[T]) -> Result<(), CacheError> {
    self.add(records)
  }

  fn delete(&self, records: &[T]) -> Result<(), CacheError> {
    let ids: Vec<i64> = records.iter().map(Model::id).collect();
    self.remove(&ids)
  }

  fn find(&self, id: i64) -> Result<Option<T>, CacheError> {
    self.find_within(id, self.expiration())
  }

  fn find_record(&self, record: &T) -> Result<Option<T>, CacheError> {
    self.find(record.id())
  }

  /// First fresh record matching every predicate, oldest first.
  fn find_by(&self, queries: &[Query]) -> Result<Option<T>, CacheError> {
    Ok(self.query(queries, false)?.into_iter().next())
  }

  fn query(&self, queries: &[Query], distinct: bool) -> Result<Vec<T>, CacheError> {
    self.query_within(queries, distinct, self.expiration())
  }

  /// Every fresh record.
  fn load(&self) -> Result<Vec<T>, CacheError> {
    self.query(&[], false)
  }

  /// Make `records` the complete set of cached records matching `scope`.
  ///
  /// Stored records inside `scope` (fresh or not) that are missing from
  /// `records` are dropped and the rest upserted, all in one step: on error
  /// the cache is left as it was. Records outside `scope` are untouched.
  fn replace(&self, scope: &[Query], records: &[T]) -> Result<(), CacheError>;
}

/// Asynchronous counterpart of [`Cache`]: same operations, suspending at I/O.
#[async_trait]
pub trait AsyncCache<T: Model>: Send + Sync {
  fn expiration(&self) -> Expiration;

  async fn find_within(&self, id: i64, window: Expiration) -> Result<Option<T>, CacheError>;

  async fn query_within(
    &self,
    queries: &[Query],
    distinct: bool,
    window: Expiration,
  ) -> Result<Vec<T>, CacheError>;

  async fn add(&self, records: &[T]) -> Result<(), CacheError>;

  async fn remove(&self, ids: &[i64]) -> Result<(), CacheError>;

  async fn commit(&self) -> Result<(), CacheError>;

  async fn ids(&self) -> Result<Vec<i64>, CacheError>;

  async fn update(&self, records: &[T]) -> Result<(), CacheError> {
    self.add(records).await
  }

  async fn delete(&self, records: &[T]) -> Result<(), CacheError> {
    let ids: Vec<i64> = records.iter().map(Model::id).collect();
    self.remove(&ids).await
  }

  async fn find(&self, id: i64) -> Result<Option<T>, CacheError> {
    self.find_within(id, self.expiration()).await
  }

  async fn query(&self, queries: &[Query], distinct: bool) -> Result<Vec<T>, CacheError> {
    self.query_within(queries, distinct, self.expiration()).await
  }

  async fn load(&self) -> Result<Vec<T>, CacheError> {
    self.query(&[], false).await
  }

  async fn find_by(&self, queries: &[Query]) -> Result<Option<T>, CacheError> {
    Ok(self.query(queries, false).await?.into_iter().next())
  }

  /// See [`Cache::replace`]. Cancelling the returned future leaves the cache
  /// either untouched or fully replaced.
  async fn replace(&self, scope: &[Query], records: &[T]) -> Result<(), CacheError>;
}

/// Result from a cached read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the freshest cached record was written (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn into_inner(self) -> T {
    self.data
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, within the expiration window
  CacheFresh,
  /// Remote request failed, serving cached data past its window
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expiration_boundary() {
    let now = Utc::now();
    let exp = Expiration::after(Duration::hours(24));

    assert!(!exp.is_fresh(now - Duration::hours(24) - Duration::seconds(1), now));
    assert!(exp.is_fresh(now - Duration::hours(24) + Duration::seconds(1), now));
  }

  #[test]
  fn test_zero_window_never_expires() {
    let now = Utc::now();
    assert_eq!(Expiration::after(Duration::zero()), Expiration::NEVER);
    assert!(Expiration::NEVER.is_fresh(now - Duration::days(3650), now));
    assert_eq!(Expiration::from(None), Expiration::NEVER);
  }

  #[test]
  fn test_oversized_window_never_expires() {
    let now = Utc::now();
    let exp = Expiration::from(Some(std::time::Duration::from_secs(100_000_000_000_000)));
    assert_eq!(exp.cutoff(now), None);
    assert!(exp.is_fresh(now - Duration::days(36_500), now));

    let huge = Expiration::after(Duration::MAX).widened(Duration::days(7));
    assert_eq!(huge, Expiration::NEVER);
  }

  #[test]
  fn test_widened() {
    let exp = Expiration::after(Duration::hours(1)).widened(Duration::hours(2));
    assert_eq!(exp.window(), Some(Duration::hours(3)));
    assert_eq!(Expiration::NEVER.widened(Duration::hours(2)), Expiration::NEVER);
  }
}
