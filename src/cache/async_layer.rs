//! Async cached endpoint.
//!
//! Follows the same protocol as [`CachedEndpoint`](super::layer::CachedEndpoint),
//! step for step, with each cache and remote call awaited. Dropping a call
//! at any await point leaves the cache as it was before the pending step.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use super::layer::{
  absorb, decode_response, empty_response, filter, path_scope, DEFAULT_OFFLINE_GRACE_DAYS,
};
use super::query::{self, Query};
use super::store::Store;
use super::traits::{AsyncCache, CacheResult};
use crate::error::{ApiError, Error};
use crate::toggl::{AsyncRemote, Method, Model, Request};

pub struct AsyncCachedEndpoint<T: Model, R: AsyncRemote> {
  remote: R,
  base_path: String,
  scope: Vec<Query>,
  cache: Option<Arc<dyn AsyncCache<T>>>,
  offline_grace: Duration,
}

impl<T: Model, R: AsyncRemote> AsyncCachedEndpoint<T, R> {
  pub fn new(
    remote: R,
    base_path: impl Into<String>,
    cache: Option<Arc<dyn AsyncCache<T>>>,
  ) -> Self {
    let base_path = base_path.into().trim_end_matches('/').to_string();
    Self {
      remote,
      scope: path_scope::<T>(&base_path),
      base_path,
      cache,
      offline_grace: Duration::days(DEFAULT_OFFLINE_GRACE_DAYS),
    }
  }

  pub fn from_store(remote: R, base_path: impl Into<String>, store: &Store) -> Self {
    Self::new(remote, base_path, Some(store.async_cache())).with_offline_grace(store.offline_grace())
  }

  pub fn with_offline_grace(mut self, grace: Duration) -> Self {
    self.offline_grace = grace;
    self
  }

  pub fn with_scope(mut self, scope: Vec<Query>) -> Self {
    self.scope = scope;
    self
  }

  pub fn scope(&self) -> &[Query] {
    &self.scope
  }

  pub fn remote(&self) -> &R {
    &self.remote
  }

  pub fn cache(&self) -> Option<&Arc<dyn AsyncCache<T>>> {
    self.cache.as_ref()
  }

  fn item_path(&self, id: i64) -> String {
    format!("{}/{}", self.base_path, id)
  }

  pub async fn get(&self, id: i64, refresh: bool) -> Result<CacheResult<Option<T>>, Error> {
    if let (Some(cache), false) = (&self.cache, refresh) {
      if let Some(Some(record)) = absorb(cache.find(id).await, &self.base_path)? {
        tracing::debug!(path = %self.base_path, id, "Cache hit");
        let cached_at = record.timestamp();
        return Ok(CacheResult::from_cache(Some(record), Some(cached_at)));
      }
    }

    let request = Request::new(Method::Get, self.item_path(id));
    tracing::info!(path = %request.path, "Fetching from API");
    match self.remote.send(&request).await {
      Ok(response) => {
        let records = decode_response::<T>(response)?;
        self.reconcile(request.method, &records).await?;
        Ok(CacheResult::from_network(records.into_iter().next()))
      }
      Err(e) if e.is_not_found() => {
        tracing::debug!(path = %request.path, "Not found, dropping cached copy");
        self.forget(id).await?;
        Ok(CacheResult::from_network(None))
      }
      Err(e) => match self.offline_find(id, &e).await? {
        Some(record) => {
          let cached_at = record.timestamp();
          Ok(CacheResult::offline(Some(record), Some(cached_at)))
        }
        None => Err(e.into()),
      },
    }
  }

  pub async fn collect(
    &self,
    queries: &[Query],
    refresh: bool,
  ) -> Result<CacheResult<Vec<T>>, Error> {
    query::validate_all(queries, T::table())?;

    if let (Some(cache), false) = (&self.cache, refresh) {
      if let Some(found) = absorb(cache.query(queries, false).await, &self.base_path)? {
        let populated = !found.is_empty()
          || absorb(cache.load().await, &self.base_path)?.is_some_and(|all| !all.is_empty());
        if populated {
          tracing::debug!(path = %self.base_path, count = found.len(), "Serving list from cache");
          let cached_at = found.iter().map(Model::timestamp).max();
          return Ok(CacheResult::from_cache(found, cached_at));
        }
      }
    }

    let request = Request::new(Method::Get, self.base_path.clone());
    tracing::info!(path = %request.path, "Fetching collection from API");
    let records = match self.remote.send(&request).await {
      Ok(response) => decode_response::<T>(response)?,
      Err(e) => {
        return match self.offline_query(queries, &e).await? {
          Some(found) => {
            let cached_at = found.iter().map(Model::timestamp).max();
            Ok(CacheResult::offline(found, cached_at))
          }
          None => Err(e.into()),
        };
      }
    };

    if let Some(cache) = &self.cache {
      let outcome = match cache.replace(&self.scope, &records).await {
        Ok(()) => cache.commit().await,
        Err(e) => Err(e),
      };
      absorb(outcome, &self.base_path)?;
    }
    Ok(CacheResult::from_network(filter(records, queries)?))
  }

  pub async fn add(&self, body: Value) -> Result<T, Error> {
    let request = Request::new(Method::Post, self.base_path.clone()).with_body(body);
    self.single(&request).await
  }

  pub async fn edit(&self, id: i64, body: Value) -> Result<T, Error> {
    let request = Request::new(Method::Put, self.item_path(id)).with_body(body);
    self.single(&request).await
  }

  pub async fn delete(&self, id: i64) -> Result<(), Error> {
    let request = Request::new(Method::Delete, self.item_path(id));
    match self.remote.send(&request).await {
      Ok(_) => {}
      Err(e) if e.is_not_found() => {
        tracing::debug!(path = %request.path, "Already deleted remotely");
      }
      Err(e) => return Err(e.into()),
    }
    self.forget(id).await
  }

  pub async fn query(&self, queries: &[Query], distinct: bool) -> Result<Vec<T>, Error> {
    let cache = self.cache.as_ref().ok_or(Error::NoCache)?;
    Ok(cache.query(queries, distinct).await?)
  }

  pub async fn request(&self, request: &Request) -> Result<Vec<T>, Error> {
    let records = decode_response::<T>(self.remote.send(request).await?)?;
    self.reconcile(request.method, &records).await?;
    Ok(records)
  }

  async fn single(&self, request: &Request) -> Result<T, Error> {
    self
      .request(request)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| empty_response(request))
  }

  async fn reconcile(&self, method: Method, records: &[T]) -> Result<(), Error> {
    let Some(cache) = &self.cache else {
      return Ok(());
    };
    let outcome = match method {
      Method::Get | Method::Post | Method::Put | Method::Patch => cache.update(records).await,
      Method::Delete => cache.delete(records).await,
    };
    let outcome = match outcome {
      Ok(()) => cache.commit().await,
      Err(e) => Err(e),
    };
    absorb(outcome, &self.base_path)?;
    Ok(())
  }

  async fn forget(&self, id: i64) -> Result<(), Error> {
    if let Some(cache) = &self.cache {
      let outcome = match cache.remove(&[id]).await {
        Ok(()) => cache.commit().await,
        Err(e) => Err(e),
      };
      absorb(outcome, &self.base_path)?;
    }
    Ok(())
  }

  async fn offline_find(&self, id: i64, error: &ApiError) -> Result<Option<T>, Error> {
    let Some(cache) = self.cache.as_ref().filter(|_| !error.is_auth()) else {
      return Ok(None);
    };
    let window = cache.expiration().widened(self.offline_grace);
    let found = absorb(cache.find_within(id, window).await, &self.base_path)?.flatten();
    if found.is_some() {
      tracing::warn!(error = %error, path = %self.base_path, id, "API unreachable, serving cached record");
    }
    Ok(found)
  }

  async fn offline_query(
    &self,
    queries: &[Query],
    error: &ApiError,
  ) -> Result<Option<Vec<T>>, Error> {
    let Some(cache) = self.cache.as_ref().filter(|_| !error.is_auth()) else {
      return Ok(None);
    };
    let window = cache.expiration().widened(self.offline_grace);
    let found = absorb(cache.query_within(queries, false, window).await, &self.base_path)?
      .filter(|found| !found.is_empty());
    if found.is_some() {
      tracing::warn!(error = %error, path = %self.base_path, "API unreachable, serving cached list");
    }
    Ok(found)
  }
}
