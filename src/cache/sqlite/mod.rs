//! Relational cache backed by SQLite.
//!
//! Every entity type has its own table (see [`crate::cache::schema`]) in a
//! single database file. Foreign keys are enforced, so children can only be
//! cached after their parents; a violation is reported as
//! [`CacheError::MissingParent`] and the whole call is rolled back.

mod sql;

use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value as Json;

use super::query::Query;
use super::schema::schema_sql;
use super::traits::{AsyncCache, Cache, Expiration};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::toggl::Model;

pub use sql::format_instant;

/// Shared handle to the cache database.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
  path: Option<PathBuf>,
}

impl Database {
  /// Open or create the database at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }

    let conn = Connection::open(path)?;
    let mut db = Self::from_connection(conn)?;
    db.path = Some(path.to_path_buf());
    tracing::debug!(path = %path.display(), "Opened cache database");
    Ok(db)
  }

  /// Database file `cache.sqlite` inside the configured cache directory.
  pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
    Self::open(config.path.join("cache.sqlite"))
  }

  pub fn in_memory() -> Result<Self, CacheError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Take over an open connection and register the schema on it.
  pub fn from_connection(conn: Connection) -> Result<Self, CacheError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(&schema_sql())?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      path: None,
    })
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  fn with_conn<R>(
    &self,
    f: impl FnOnce(&mut Connection) -> Result<R, CacheError>,
  ) -> Result<R, CacheError> {
    let mut conn = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
    f(&mut conn)
  }
}

/// Blocking relational cache for one entity type.
///
/// Each call runs in its own transaction and is durable when it returns, so
/// [`Cache::commit`] has nothing left to do.
pub struct SqliteCache<T: Model> {
  db: Database,
  expiration: Expiration,
  _marker: PhantomData<fn() -> T>,
}

impl<T: Model> SqliteCache<T> {
  pub fn new(db: Database, expiration: Expiration) -> Self {
    Self {
      db,
      expiration,
      _marker: PhantomData,
    }
  }

  pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
    Ok(Self::new(Database::from_config(config)?, config.expiration()))
  }

  pub fn database(&self) -> &Database {
    &self.db
  }
}

fn decode<T: Model>(record: sql::Record) -> Result<T, CacheError> {
  Ok(serde_json::from_value(Json::Object(record))?)
}

fn encode<T: Model>(record: &T) -> Result<sql::Record, CacheError> {
  match serde_json::to_value(record)? {
    Json::Object(fields) => Ok(fields),
    _ => Err(CacheError::Corrupt(format!(
      "{} did not serialize to a record",
      T::entity_type()
    ))),
  }
}

impl<T: Model> Cache<T> for SqliteCache<T> {
  fn expiration(&self) -> Expiration {
    self.expiration
  }

  fn find_within(&self, id: i64, window: Expiration) -> Result<Option<T>, CacheError> {
    Ok(self.query_within(&[Query::eq("id", id)], false, window)?.into_iter().next())
  }

  fn query_within(
    &self,
    queries: &[Query],
    distinct: bool,
    window: Expiration,
  ) -> Result<Vec<T>, CacheError> {
    let cutoff = window.cutoff(Utc::now());
    let records = self
      .db
      .with_conn(|conn| sql::select(conn, T::table(), queries, distinct, cutoff))?;
    records.into_iter().map(decode).collect()
  }

  fn add(&self, records: &[T]) -> Result<(), CacheError> {
    let rows = records.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
    self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      for row in &rows {
        sql::upsert(&tx, T::table(), row)?;
      }
      tx.commit()?;
      Ok(())
    })?;
    tracing::debug!(table = T::entity_type(), count = records.len(), "Upserted rows");
    Ok(())
  }

  fn remove(&self, ids: &[i64]) -> Result<(), CacheError> {
    let removed = self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      let mut removed = 0;
      for id in ids {
        removed += sql::delete(&tx, T::table(), *id)?;
      }
      tx.commit()?;
      Ok(removed)
    })?;
    tracing::debug!(table = T::entity_type(), removed, "Deleted rows");
    Ok(())
  }

  fn commit(&self) -> Result<(), CacheError> {
    Ok(())
  }

  fn ids(&self) -> Result<Vec<i64>, CacheError> {
    self.db.with_conn(|conn| sql::ids(conn, T::table(), &[]))
  }

  fn replace(&self, scope: &[Query], records: &[T]) -> Result<(), CacheError> {
    let rows = records.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
    let keep: HashSet<i64> = records.iter().map(Model::id).collect();
    let removed = self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      let mut removed = 0;
      for id in sql::ids(&tx, T::table(), scope)? {
        if !keep.contains(&id) {
          removed += sql::delete(&tx, T::table(), id)?;
        }
      }
      for row in &rows {
        sql::upsert(&tx, T::table(), row)?;
      }
      tx.commit()?;
      Ok(removed)
    })?;
    tracing::debug!(
      table = T::entity_type(),
      removed,
      upserted = records.len(),
      "Replaced rows"
    );
    Ok(())
  }
}

/// Async relational cache. Statements run on the blocking thread pool.
pub struct AsyncSqliteCache<T: Model> {
  inner: Arc<SqliteCache<T>>,
}

impl<T: Model> AsyncSqliteCache<T> {
  pub fn new(db: Database, expiration: Expiration) -> Self {
    Self {
      inner: Arc::new(SqliteCache::new(db, expiration)),
    }
  }

  pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
    Ok(Self {
      inner: Arc::new(SqliteCache::from_config(config)?),
    })
  }

  async fn run<R, F>(&self, f: F) -> Result<R, CacheError>
  where
    R: Send + 'static,
    F: FnOnce(&SqliteCache<T>) -> Result<R, CacheError> + Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    tokio::task::spawn_blocking(move || f(&inner))
      .await
      .map_err(|e| CacheError::Task(e.to_string()))?
  }
}

#[async_trait]
impl<T: Model> AsyncCache<T> for AsyncSqliteCache<T> {
  fn expiration(&self) -> Expiration {
    self.inner.expiration
  }

  async fn find_within(&self, id: i64, window: Expiration) -> Result<Option<T>, CacheError> {
    self.run(move |cache| cache.find_within(id, window)).await
  }

  async fn query_within(
    &self,
    queries: &[Query],
    distinct: bool,
    window: Expiration,
  ) -> Result<Vec<T>, CacheError> {
    let queries = queries.to_vec();
    self
      .run(move |cache| cache.query_within(&queries, distinct, window))
      .await
  }

  async fn add(&self, records: &[T]) -> Result<(), CacheError> {
    let records = records.to_vec();
    self.run(move |cache| cache.add(&records)).await
  }

  async fn remove(&self, ids: &[i64]) -> Result<(), CacheError> {
    let ids = ids.to_vec();
    self.run(move |cache| cache.remove(&ids)).await
  }

  async fn commit(&self) -> Result<(), CacheError> {
    Ok(())
  }

  async fn ids(&self) -> Result<Vec<i64>, CacheError> {
    self.run(|cache| cache.ids()).await
  }

  /// Runs as one blocking task, so dropping the future cannot split the
  /// transaction.
  async fn replace(&self, scope: &[Query], records: &[T]) -> Result<(), CacheError> {
    let scope = scope.to_vec();
    let records = records.to_vec();
    self.run(move |cache| cache.replace(&scope, &records)).await
  }
}
