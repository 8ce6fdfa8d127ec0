//! Cached endpoint that orchestrates cache lookups with remote requests.
//!
//! Reads are cache-first: a fresh cached record is returned without touching
//! the network. Writes are remote-first: the API response is the canonical
//! record and is written into the cache afterwards. Without a cache every
//! call is a plain remote passthrough.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use super::query::{self, Query};
use super::store::Store;
use super::traits::{Cache, CacheResult};
use crate::error::{ApiError, CacheError, Error};
use crate::toggl::{Method, Model, Remote, Request, Response};

/// Default extra age, in days, tolerated for cached data while the API is
/// unreachable.
pub const DEFAULT_OFFLINE_GRACE_DAYS: i64 = 7;

/// Decode a response body into models.
pub(crate) fn decode_response<T: Model>(response: Response) -> Result<Vec<T>, Error> {
  let raw = match response {
    Response::Entity(value) => vec![value],
    Response::Collection(values) => values,
    Response::Empty => Vec::new(),
  };
  Ok(raw.into_iter().map(T::from_raw).collect::<Result<_, _>>()?)
}

/// Apply predicates to records that did not come out of a cache.
pub(crate) fn filter<T: Model>(records: Vec<T>, queries: &[Query]) -> Result<Vec<T>, Error> {
  if queries.is_empty() {
    return Ok(records);
  }
  query::validate_all(queries, T::table())?;

  let mut matched = Vec::new();
  for record in records {
    if let Value::Object(fields) = serde_json::to_value(&record).map_err(CacheError::from)? {
      if query::matches_all(queries, &fields) {
        matched.push(record);
      }
    }
  }
  Ok(matched)
}

/// Keep going after a cache failure unless it has no safe fallback.
pub(crate) fn absorb<R>(outcome: Result<R, CacheError>, path: &str) -> Result<Option<R>, Error> {
  match outcome {
    Ok(value) => Ok(Some(value)),
    Err(e) if e.is_fatal() => Err(e.into()),
    Err(e) => {
      tracing::warn!(error = %e, path, "Cache unavailable, continuing without it");
      Ok(None)
    }
  }
}

/// Records a collection path lists: below `workspaces/<id>` only that
/// workspace's records, when the entity belongs to a workspace.
pub(crate) fn path_scope<T: Model>(path: &str) -> Vec<Query> {
  let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
  let workspace = segments
    .windows(2)
    .find(|pair| pair[0] == "workspaces")
    .and_then(|pair| pair[1].parse::<i64>().ok());
  match workspace {
    Some(id) if T::table().column("workspace").is_some() => vec![Query::eq("workspace", id)],
    _ => Vec::new(),
  }
}

/// Expected single entity missing from a response.
pub(crate) fn empty_response(request: &Request) -> Error {
  Error::Api(ApiError::Decode(format!(
    "{} {} returned no entity",
    request.method.as_str(),
    request.path
  )))
}

/// Blocking cached endpoint for one entity type.
pub struct CachedEndpoint<T: Model, R: Remote> {
  remote: R,
  base_path: String,
  scope: Vec<Query>,
  cache: Option<Arc<dyn Cache<T>>>,
  offline_grace: Duration,
}

impl<T: Model, R: Remote> CachedEndpoint<T, R> {
  /// `base_path` is the collection path relative to the API root, for
  /// example `workspaces/1/tags`; single records live at `base_path/<id>`.
  pub fn new(remote: R, base_path: impl Into<String>, cache: Option<Arc<dyn Cache<T>>>) -> Self {
    let base_path = base_path.into().trim_end_matches('/').to_string();
    Self {
      remote,
      scope: path_scope::<T>(&base_path),
      base_path,
      cache,
      offline_grace: Duration::days(DEFAULT_OFFLINE_GRACE_DAYS),
    }
  }

  /// Endpoint caching into `store`, with the store's offline grace.
  pub fn from_store(remote: R, base_path: impl Into<String>, store: &Store) -> Self {
    Self::new(remote, base_path, Some(store.cache())).with_offline_grace(store.offline_grace())
  }

  pub fn with_offline_grace(mut self, grace: Duration) -> Self {
    self.offline_grace = grace;
    self
  }

  /// Predicates selecting the cached records the collection covers; a
  /// refresh only replaces those.
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

  pub fn cache(&self) -> Option<&Arc<dyn Cache<T>>> {
    self.cache.as_ref()
  }

  fn item_path(&self, id: i64) -> String {
    format!("{}/{}", self.base_path, id)
  }

  /// Fetch one record, serving a fresh cached copy when there is one.
  ///
  /// A record the API no longer knows is dropped from the cache and reported
  /// as absent.
  pub fn get(&self, id: i64, refresh: bool) -> Result<CacheResult<Option<T>>, Error> {
    if let (Some(cache), false) = (&self.cache, refresh) {
      if let Some(Some(record)) = absorb(cache.find(id), &self.base_path)? {
        tracing::debug!(path = %self.base_path, id, "Cache hit");
        let cached_at = record.timestamp();
        return Ok(CacheResult::from_cache(Some(record), Some(cached_at)));
      }
    }

    let request = Request::new(Method::Get, self.item_path(id));
    tracing::info!(path = %request.path, "Fetching from API");
    match self.remote.send(&request) {
      Ok(response) => {
        let records = decode_response::<T>(response)?;
        self.reconcile(request.method, &records)?;
        Ok(CacheResult::from_network(records.into_iter().next()))
      }
      Err(e) if e.is_not_found() => {
        tracing::debug!(path = %request.path, "Not found, dropping cached copy");
        self.forget(id)?;
        Ok(CacheResult::from_network(None))
      }
      Err(e) => match self.offline_find(id, &e)? {
        Some(record) => {
          let cached_at = record.timestamp();
          Ok(CacheResult::offline(Some(record), Some(cached_at)))
        }
        None => Err(e.into()),
      },
    }
  }

  /// List records matching `queries`.
  ///
  /// With a cache attached the cache is the source of truth: its matches are
  /// returned as is, and the API is only asked when the cache holds nothing
  /// fresh at all. `refresh` always fetches the full collection and makes it
  /// the new cached set within the endpoint's scope.
  pub fn collect(&self, queries: &[Query], refresh: bool) -> Result<CacheResult<Vec<T>>, Error> {
    query::validate_all(queries, T::table())?;

    if let (Some(cache), false) = (&self.cache, refresh) {
      if let Some(found) = absorb(cache.query(queries, false), &self.base_path)? {
        let populated = !found.is_empty()
          || absorb(cache.load(), &self.base_path)?.is_some_and(|all| !all.is_empty());
        if populated {
          tracing::debug!(path = %self.base_path, count = found.len(), "Serving list from cache");
          let cached_at = found.iter().map(Model::timestamp).max();
          return Ok(CacheResult::from_cache(found, cached_at));
        }
      }
    }

    let request = Request::new(Method::Get, self.base_path.clone());
    tracing::info!(path = %request.path, "Fetching collection from API");
    let records = match self.remote.send(&request) {
      Ok(response) => decode_response::<T>(response)?,
      Err(e) => {
        return match self.offline_query(queries, &e)? {
          Some(found) => {
            let cached_at = found.iter().map(Model::timestamp).max();
            Ok(CacheResult::offline(found, cached_at))
          }
          None => Err(e.into()),
        };
      }
    };

    if let Some(cache) = &self.cache {
      absorb(
        cache
          .replace(&self.scope, &records)
          .and_then(|_| cache.commit()),
        &self.base_path,
      )?;
    }
    Ok(CacheResult::from_network(filter(records, queries)?))
  }

  /// Create a record remotely and cache the canonical result.
  pub fn add(&self, body: Value) -> Result<T, Error> {
    let request = Request::new(Method::Post, self.base_path.clone()).with_body(body);
    self.single(&request)
  }

  /// Replace a record remotely and cache the canonical result.
  pub fn edit(&self, id: i64, body: Value) -> Result<T, Error> {
    let request = Request::new(Method::Put, self.item_path(id)).with_body(body);
    self.single(&request)
  }

  /// Delete remotely, then drop the cached copy. A record that is already
  /// gone counts as deleted.
  pub fn delete(&self, id: i64) -> Result<(), Error> {
    let request = Request::new(Method::Delete, self.item_path(id));
    match self.remote.send(&request) {
      Ok(_) => {}
      Err(e) if e.is_not_found() => {
        tracing::debug!(path = %request.path, "Already deleted remotely");
      }
      Err(e) => return Err(e.into()),
    }
    self.forget(id)
  }

  /// Cache-only lookup.
  pub fn query(&self, queries: &[Query], distinct: bool) -> Result<Vec<T>, Error> {
    let cache = self.cache.as_ref().ok_or(Error::NoCache)?;
    Ok(cache.query(queries, distinct)?)
  }

  /// Send an arbitrary request and fold the decoded result into the cache
  /// according to its method.
  pub fn request(&self, request: &Request) -> Result<Vec<T>, Error> {
    let records = decode_response::<T>(self.remote.send(request)?)?;
    self.reconcile(request.method, &records)?;
    Ok(records)
  }

  fn single(&self, request: &Request) -> Result<T, Error> {
    self
      .request(request)?
      .into_iter()
      .next()
      .ok_or_else(|| empty_response(request))
  }

  fn reconcile(&self, method: Method, records: &[T]) -> Result<(), Error> {
    let Some(cache) = &self.cache else {
      return Ok(());
    };
    let outcome = match method {
      Method::Get | Method::Post | Method::Put | Method::Patch => cache.update(records),
      Method::Delete => cache.delete(records),
    };
    absorb(outcome.and_then(|_| cache.commit()), &self.base_path)?;
    Ok(())
  }

  fn forget(&self, id: i64) -> Result<(), Error> {
    if let Some(cache) = &self.cache {
      absorb(
        cache.remove(&[id]).and_then(|_| cache.commit()),
        &self.base_path,
      )?;
    }
    Ok(())
  }

  fn offline_find(&self, id: i64, error: &ApiError) -> Result<Option<T>, Error> {
    let Some(cache) = self.cache.as_ref().filter(|_| !error.is_auth()) else {
      return Ok(None);
    };
    let window = cache.expiration().widened(self.offline_grace);
    let found = absorb(cache.find_within(id, window), &self.base_path)?.flatten();
    if found.is_some() {
      tracing::warn!(error = %error, path = %self.base_path, id, "API unreachable, serving cached record");
    }
    Ok(found)
  }

  fn offline_query(&self, queries: &[Query], error: &ApiError) -> Result<Option<Vec<T>>, Error> {
    let Some(cache) = self.cache.as_ref().filter(|_| !error.is_auth()) else {
      return Ok(None);
    };
    let window = cache.expiration().widened(self.offline_grace);
    let found = absorb(cache.query_within(queries, false, window), &self.base_path)?
      .filter(|found| !found.is_empty());
    if found.is_some() {
      tracing::warn!(error = %error, path = %self.base_path, "API unreachable, serving cached list");
    }
    Ok(found)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::json::JsonCache;
  use crate::cache::traits::{CacheSource, Expiration};
  use crate::testing::{server_down, tag_payload, FakeRemote};
  use crate::toggl::Tag;
  use chrono::Utc;
  use serde_json::json;

  fn tag(id: i64, name: &str, age: Duration) -> Tag {
    Tag {
      id,
      name: name.into(),
      timestamp: Utc::now() - age,
      workspace: 1,
    }
  }

  fn cache(dir: &tempfile::TempDir, expiration: Expiration) -> Arc<JsonCache<Tag>> {
    Arc::new(JsonCache::new(dir.path(), expiration))
  }

  fn endpoint(remote: FakeRemote, cache: Arc<JsonCache<Tag>>) -> CachedEndpoint<Tag, FakeRemote> {
    CachedEndpoint::new(remote, "workspaces/1/tags", Some(cache as Arc<dyn Cache<Tag>>))
  }

  #[test]
  fn test_get_fresh_hit_skips_remote() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::after(Duration::hours(24)));
    cache.add(&[tag(5, "billable", Duration::zero())]).unwrap();

    let endpoint = endpoint(FakeRemote::new(), cache);
    let result = endpoint.get(5, false).unwrap();
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(result.data.unwrap().name, "billable");
    assert_eq!(endpoint.remote().calls(), 0);
  }

  #[test]
  fn test_get_stale_fetches_and_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::after(Duration::hours(24)));
    cache.add(&[tag(5, "old name", Duration::hours(25))]).unwrap();

    let remote = FakeRemote::new().entity(tag_payload(5, "new name"));
    let endpoint = endpoint(remote, Arc::clone(&cache));
    let result = endpoint.get(5, false).unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.unwrap().name, "new name");
    assert_eq!(endpoint.remote().requests()[0].path, "workspaces/1/tags/5");
    assert_eq!(cache.find(5).unwrap().unwrap().name, "new name");
    assert!(cache.path().exists());
  }

  #[test]
  fn test_get_not_found_drops_cached_copy() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::NEVER);
    cache.add(&[tag(5, "gone", Duration::zero())]).unwrap();

    let remote = FakeRemote::new().fail(ApiError::NotFound {
      path: "workspaces/1/tags/5".into(),
    });
    let endpoint = endpoint(remote, Arc::clone(&cache));
    let result = endpoint.get(5, true).unwrap();

    assert!(result.data.is_none());
    assert!(cache.find(5).unwrap().is_none());
  }

  #[test]
  fn test_get_offline_serves_stale_copy() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::after(Duration::hours(1)));
    cache.add(&[tag(5, "stale", Duration::hours(3))]).unwrap();

    let endpoint = endpoint(FakeRemote::new().fail(server_down()), cache);
    let result = endpoint.get(5, false).unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.unwrap().name, "stale");
  }

  #[test]
  fn test_get_offline_respects_grace() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::after(Duration::hours(1)));
    cache.add(&[tag(5, "ancient", Duration::days(30))]).unwrap();

    let endpoint = endpoint(FakeRemote::new().fail(server_down()), cache);
    assert!(matches!(endpoint.get(5, false), Err(Error::Api(ApiError::Server { .. }))));
  }

  #[test]
  fn test_auth_failure_always_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::after(Duration::hours(1)));
    cache.add(&[tag(5, "stale", Duration::hours(2))]).unwrap();

    let remote = FakeRemote::new().fail(ApiError::Auth {
      status: 403,
      message: "bad token".into(),
    });
    let endpoint = endpoint(remote, cache);
    assert!(matches!(endpoint.get(5, false), Err(Error::Api(ApiError::Auth { .. }))));
  }

  #[test]
  fn test_no_cache_passthrough() {
    let remote = FakeRemote::new()
      .entity(tag_payload(1, "a"))
      .entity(tag_payload(2, "b"))
      .entity(tag_payload(2, "c"))
      .respond(Ok(Response::Empty))
      .entity(tag_payload(1, "a"));
    let endpoint: CachedEndpoint<Tag, _> = CachedEndpoint::new(remote, "workspaces/1/tags", None);

    assert_eq!(endpoint.get(1, false).unwrap().data.unwrap().name, "a");
    assert_eq!(endpoint.add(json!({"name": "b"})).unwrap().id, 2);
    assert_eq!(endpoint.edit(2, json!({"name": "c"})).unwrap().name, "c");
    endpoint.delete(2).unwrap();
    assert_eq!(endpoint.get(1, false).unwrap().source, CacheSource::Network);

    let methods: Vec<Method> = endpoint.remote().requests().iter().map(|r| r.method).collect();
    assert_eq!(
      methods,
      vec![Method::Get, Method::Post, Method::Put, Method::Delete, Method::Get]
    );
    assert!(matches!(endpoint.query(&[], false), Err(Error::NoCache)));
  }

  #[test]
  fn test_add_and_edit_write_canonical_record() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::NEVER);
    let remote = FakeRemote::new()
      .entity(tag_payload(8, "Billable"))
      .entity(tag_payload(8, "Billable hours"));
    let endpoint = endpoint(remote, Arc::clone(&cache));

    endpoint.add(json!({"name": "billable"})).unwrap();
    assert_eq!(cache.find(8).unwrap().unwrap().name, "Billable");

    endpoint.edit(8, json!({"name": "billable hours"})).unwrap();
    assert_eq!(cache.find(8).unwrap().unwrap().name, "Billable hours");

    let request = &endpoint.remote().requests()[1];
    assert_eq!(request.method, Method::Put);
    assert_eq!(request.body, Some(json!({"name": "billable hours"})));
  }

  #[test]
  fn test_delete_treats_not_found_as_success() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::NEVER);
    cache.add(&[tag(3, "doomed", Duration::zero())]).unwrap();

    let remote = FakeRemote::new().fail(ApiError::NotFound {
      path: "workspaces/1/tags/3".into(),
    });
    let endpoint = endpoint(remote, Arc::clone(&cache));
    endpoint.delete(3).unwrap();
    assert!(cache.find(3).unwrap().is_none());
  }

  #[test]
  fn test_delete_failure_keeps_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::NEVER);
    cache.add(&[tag(3, "kept", Duration::zero())]).unwrap();

    let endpoint = endpoint(FakeRemote::new().fail(server_down()), Arc::clone(&cache));
    assert!(endpoint.delete(3).is_err());
    assert!(cache.find(3).unwrap().is_some());
  }

  #[test]
  fn test_collect_empty_cache_fetches() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::NEVER);
    let remote = FakeRemote::new().collection(vec![tag_payload(1, "a"), tag_payload(2, "b")]);
    let endpoint = endpoint(remote, Arc::clone(&cache));

    let result = endpoint.collect(&[Query::eq("name", "b")], false).unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.len(), 1);
    assert_eq!(cache.ids().unwrap(), vec![1, 2]);

    // Populated now, so the next listing stays local.
    let again = endpoint.collect(&[Query::eq("name", "zzz")], false).unwrap();
    assert_eq!(again.source, CacheSource::CacheFresh);
    assert!(again.data.is_empty());
    assert_eq!(endpoint.remote().calls(), 1);
  }

  #[test]
  fn test_collect_refresh_replaces_contents() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::NEVER);
    cache
      .add(&[tag(1, "a", Duration::zero()), tag(9, "removed upstream", Duration::zero())])
      .unwrap();

    let remote = FakeRemote::new().collection(vec![tag_payload(1, "a"), tag_payload(2, "b")]);
    let endpoint = endpoint(remote, Arc::clone(&cache));
    let result = endpoint.collect(&[], true).unwrap();

    assert_eq!(result.data.len(), 2);
    assert_eq!(cache.ids().unwrap(), vec![1, 2]);
  }

  #[test]
  fn test_collect_refresh_keeps_other_workspaces() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::NEVER);
    let mut foreign = tag(20, "other workspace", Duration::zero());
    foreign.workspace = 2;
    cache.add(&[tag(10, "a", Duration::zero()), foreign]).unwrap();

    let remote = FakeRemote::new().collection(vec![tag_payload(11, "b")]);
    let endpoint = endpoint(remote, Arc::clone(&cache));
    assert_eq!(endpoint.scope(), &[Query::eq("workspace", 1)]);
    endpoint.collect(&[], true).unwrap();

    let mut ids = cache.ids().unwrap();
    ids.sort();
    assert_eq!(ids, vec![11, 20]);
  }

  #[test]
  fn test_path_scope() {
    assert_eq!(
      path_scope::<Tag>("workspaces/7/tags"),
      vec![Query::eq("workspace", 7)]
    );
    assert!(path_scope::<Tag>("me/tags").is_empty());
    assert!(path_scope::<crate::toggl::Workspace>("workspaces/7/workspaces").is_empty());
    assert!(path_scope::<crate::toggl::Organization>("organizations/3/workspaces").is_empty());
  }

  #[test]
  fn test_from_store_applies_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = crate::config::CacheConfig {
      path: dir.path().to_path_buf(),
      expire_after: Some(3600),
      offline_grace: 0,
      ..Default::default()
    };
    let store = Store::open(&config).unwrap();
    let seeded = store.cache::<Tag>();
    seeded.add(&[tag(5, "two hours old", Duration::hours(2))]).unwrap();
    seeded.commit().unwrap();

    let endpoint = CachedEndpoint::<Tag, _>::from_store(
      FakeRemote::new().fail(server_down()),
      "workspaces/1/tags",
      &store,
    );
    assert!(matches!(endpoint.get(5, false), Err(Error::Api(ApiError::Server { .. }))));
  }

  #[test]
  fn test_collect_offline_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir, Expiration::after(Duration::hours(1)));
    cache.add(&[tag(1, "a", Duration::hours(2))]).unwrap();

    let endpoint = endpoint(FakeRemote::new().fail(server_down()), cache);
    let result = endpoint.collect(&[], false).unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.len(), 1);
  }

  #[test]
  fn test_collect_invalid_query_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = endpoint(FakeRemote::new(), cache(&dir, Expiration::NEVER));
    assert!(matches!(
      endpoint.collect(&[Query::eq("colour", "red")], false),
      Err(Error::Cache(CacheError::InvalidQuery(_)))
    ));
    assert_eq!(endpoint.remote().calls(), 0);
  }
}
