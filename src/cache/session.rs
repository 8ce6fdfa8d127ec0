//! In-memory working set behind the file-backed caches.
//!
//! A session holds the records of one entity type together with the
//! snapshot last written to disk, so a commit can tell whether anything
//! actually changed.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::query::{self, Query};
use super::traits::Expiration;
use crate::error::CacheError;
use crate::toggl::Model;

/// Version of the persisted document layout. Documents written with any
/// other version are discarded on load.
pub const FORMAT_VERSION: &str = "1";

/// Field carrying the entity type of each persisted record.
pub const TYPE_TAG: &str = "class";

/// Persisted document.
#[derive(Debug, Serialize, Deserialize)]
struct Document {
  version: String,
  timestamp: DateTime<Utc>,
  data: Vec<Json>,
}

#[derive(Debug, Clone)]
pub struct Session<T> {
  max_length: usize,
  version: String,
  data: Vec<T>,
  modified: u64,
  persisted: Vec<T>,
}

impl<T: Model> Session<T> {
  pub fn new(max_length: usize) -> Self {
    Self {
      max_length,
      version: FORMAT_VERSION.to_string(),
      data: Vec::new(),
      modified: 0,
      persisted: Vec::new(),
    }
  }

  /// Rebuild a session from a persisted document.
  ///
  /// Never fails: an unreadable document or version mismatch yields an empty
  /// session, and records that do not decode are dropped individually.
  pub fn decode(bytes: &[u8], max_length: usize, source: &Path) -> Self {
    let mut session = Self::new(max_length);
    if bytes.iter().all(u8::is_ascii_whitespace) {
      return session;
    }

    let document: Document = match serde_json::from_slice(bytes) {
      Ok(document) => document,
      Err(e) => {
        tracing::warn!(path = %source.display(), error = %e, "Discarding unreadable cache document");
        return session;
      }
    };

    if document.version != FORMAT_VERSION {
      tracing::info!(
        path = %source.display(),
        found = %document.version,
        expected = FORMAT_VERSION,
        "Discarding cache document with unsupported version"
      );
      return session;
    }

    let total = document.data.len();
    for (index, raw) in document.data.into_iter().enumerate() {
      match decode_record::<T>(raw) {
        Ok(record) => session.data.push(record),
        Err(reason) => {
          tracing::warn!(path = %source.display(), index, %reason, "Dropping undecodable cache record")
        }
      }
    }
    tracing::debug!(
      path = %source.display(),
      loaded = session.data.len(),
      total,
      "Loaded cache document"
    );

    session.evict();
    session.persisted = session.data.clone();
    session
  }

  /// Serialize the session into a document.
  pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
    let data = self
      .data
      .iter()
      .map(encode_record)
      .collect::<Result<Vec<_>, _>>()?;
    let document = Document {
      version: self.version.clone(),
      timestamp: Utc::now(),
      data,
    };
    Ok(serde_json::to_vec(&document)?)
  }

  /// Whether the records differ from what was last persisted.
  pub fn is_dirty(&self) -> bool {
    self.data != self.persisted
  }

  pub fn mark_persisted(&mut self) {
    self.persisted = self.data.clone();
  }

  pub fn records(&self) -> &[T] {
    &self.data
  }

  /// Number of mutations applied since the session was created.
  pub fn modified(&self) -> u64 {
    self.modified
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn max_length(&self) -> usize {
    self.max_length
  }

  pub fn ids(&self) -> Vec<i64> {
    self.data.iter().map(Model::id).collect()
  }

  pub fn find(&self, id: i64, window: Expiration, now: DateTime<Utc>) -> Option<&T> {
    self
      .data
      .iter()
      .find(|r| r.id() == id)
      .filter(|r| window.is_fresh(r.timestamp(), now))
  }

  /// Insert or replace each record by id, then enforce the length bound.
  pub fn upsert(&mut self, records: &[T]) {
    for record in records {
      match self.data.iter_mut().find(|r| r.id() == record.id()) {
        Some(existing) => *existing = record.clone(),
        None => self.data.push(record.clone()),
      }
    }
    self.modified += 1;
    self.evict();
  }

  pub fn remove(&mut self, ids: &[i64]) {
    let before = self.data.len();
    self.data.retain(|r| !ids.contains(&r.id()));
    if self.data.len() != before {
      self.modified += 1;
    }
  }

  /// Swap the records matching `scope` for `records`.
  ///
  /// The scope is checked before anything changes, so a rejected call
  /// leaves the session untouched.
  pub fn replace(&mut self, scope: &[Query], records: &[T]) -> Result<(), CacheError> {
    let stale: Vec<i64> = {
      let keep: HashSet<i64> = records.iter().map(Model::id).collect();
      self
        .query(scope, false, Expiration::NEVER, Utc::now())?
        .iter()
        .map(Model::id)
        .filter(|id| !keep.contains(id))
        .collect()
    };
    self.remove(&stale);
    self.upsert(records);
    Ok(())
  }

  /// Linear scan applying every predicate.
  pub fn query(
    &self,
    queries: &[Query],
    distinct: bool,
    window: Expiration,
    now: DateTime<Utc>,
  ) -> Result<Vec<T>, CacheError> {
    query::validate_all(queries, T::table())?;

    let mut seen = HashSet::new();
    let mut matched = Vec::new();
    for record in &self.data {
      if !window.is_fresh(record.timestamp(), now) {
        continue;
      }
      if !queries.is_empty() {
        let Json::Object(fields) = serde_json::to_value(record)? else {
          continue;
        };
        if !query::matches_all(queries, &fields) {
          continue;
        }
      }
      if distinct && !seen.insert(record.id()) {
        continue;
      }
      matched.push(record.clone());
    }
    Ok(matched)
  }

  // Drop the oldest records (by timestamp) beyond `max_length`.
  fn evict(&mut self) {
    if self.data.len() <= self.max_length {
      return;
    }
    self.data.sort_by_key(|r| r.timestamp());
    let excess = self.data.len() - self.max_length;
    self.data.drain(..excess);
  }
}

fn encode_record<T: Model>(record: &T) -> Result<Json, CacheError> {
  let mut value = serde_json::to_value(record)?;
  if let Json::Object(fields) = &mut value {
    fields.insert(TYPE_TAG.to_string(), Json::String(T::entity_type().to_string()));
  }
  Ok(value)
}

fn decode_record<T: Model>(raw: Json) -> Result<T, String> {
  let Json::Object(mut fields) = raw else {
    return Err("record is not an object".to_string());
  };
  match fields.remove(TYPE_TAG) {
    Some(Json::String(tag)) if tag == T::entity_type() => {}
    Some(other) => return Err(format!("unexpected type tag {}", other)),
    None => return Err("missing type tag".to_string()),
  }
  serde_json::from_value(Json::Object(fields)).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::toggl::Tag;
  use chrono::Duration;
  use serde_json::json;

  fn tag(id: i64, name: &str, age: Duration) -> Tag {
    Tag {
      id,
      name: name.to_string(),
      timestamp: Utc::now() - age,
      workspace: 1,
    }
  }

  #[test]
  fn test_upsert_is_idempotent() {
    let mut session = Session::new(100);
    session.upsert(&[tag(1, "first", Duration::zero())]);
    session.upsert(&[tag(1, "second", Duration::zero())]);

    assert_eq!(session.records().len(), 1);
    assert_eq!(session.records()[0].name, "second");
    assert_eq!(session.modified(), 2);
  }

  #[test]
  fn test_evicts_oldest() {
    let mut session = Session::new(2);
    session.upsert(&[
      tag(1, "old", Duration::hours(3)),
      tag(2, "new", Duration::hours(1)),
      tag(3, "mid", Duration::hours(2)),
    ]);

    let mut ids = session.ids();
    ids.sort();
    assert_eq!(ids, vec![2, 3]);
  }

  #[test]
  fn test_dirty_tracking() {
    let mut session = Session::new(10);
    assert!(!session.is_dirty());
    session.upsert(&[tag(1, "a", Duration::zero())]);
    assert!(session.is_dirty());
    session.mark_persisted();
    assert!(!session.is_dirty());
    session.remove(&[99]);
    assert!(!session.is_dirty());
  }

  #[test]
  fn test_skips_malformed_records() {
    let now = Utc::now().to_rfc3339();
    let doc = json!({
      "version": FORMAT_VERSION,
      "timestamp": now,
      "data": [
        {"class": "tag", "id": 1, "name": "a", "timestamp": now, "workspace": 1},
        {"class": "tag", "id": "two", "name": "b", "workspace": 1},
        {"class": "tag", "id": 3, "name": "c", "timestamp": now, "workspace": 1},
        {"class": "project", "id": 4, "name": "d", "workspace": 1},
        {"class": "tag", "id": 5, "name": "e", "timestamp": now, "workspace": 1}
      ]
    });

    let bytes = serde_json::to_vec(&doc).unwrap();
    let session = Session::<Tag>::decode(&bytes, 100, Path::new("test.json"));
    assert_eq!(session.ids(), vec![1, 3, 5]);
    assert!(!session.is_dirty());
  }

  #[test]
  fn test_version_mismatch_discards() {
    let doc = json!({"version": "0", "timestamp": Utc::now(), "data": []});
    let bytes = serde_json::to_vec(&doc).unwrap();
    let session = Session::<Tag>::decode(&bytes, 100, Path::new("test.json"));
    assert!(session.records().is_empty());
    assert_eq!(session.version(), FORMAT_VERSION);
  }

  #[test]
  fn test_garbage_document_is_empty_session() {
    let session = Session::<Tag>::decode(b"{not json", 100, Path::new("test.json"));
    assert!(session.records().is_empty());
  }

  #[test]
  fn test_encode_tags_records() {
    let mut session = Session::new(10);
    session.upsert(&[tag(1, "a", Duration::zero())]);
    let bytes = session.encode().unwrap();
    let doc: Json = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(doc["version"], FORMAT_VERSION);
    assert_eq!(doc["data"][0][TYPE_TAG], "tag");

    let reloaded = Session::<Tag>::decode(&bytes, 10, Path::new("test.json"));
    assert_eq!(reloaded.records(), session.records());
  }

  #[test]
  fn test_replace_is_scoped() {
    let mut session = Session::new(10);
    let mut other = tag(20, "elsewhere", Duration::zero());
    other.workspace = 2;
    session.upsert(&[
      tag(10, "kept", Duration::zero()),
      tag(11, "gone upstream", Duration::days(40)),
      other,
    ]);

    let scope = [Query::eq("workspace", 1)];
    session
      .replace(&scope, &[tag(10, "renamed", Duration::zero()), tag(12, "new", Duration::zero())])
      .unwrap();

    let mut ids = session.ids();
    ids.sort();
    assert_eq!(ids, vec![10, 12, 20]);

    let before = session.records().to_vec();
    assert!(session.replace(&[Query::eq("colour", 1)], &[]).is_err());
    assert_eq!(session.records(), before.as_slice());
  }

  #[test]
  fn test_query_respects_window() {
    let mut session = Session::new(10);
    session.upsert(&[
      tag(1, "fresh", Duration::hours(1)),
      tag(2, "stale", Duration::hours(30)),
    ]);
    let window = Expiration::after(Duration::hours(24));
    let found = session.query(&[], false, window, Utc::now()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "fresh");
    assert!(session.find(2, window, Utc::now()).is_none());
    assert!(session.find(2, Expiration::NEVER, Utc::now()).is_some());
  }
}
