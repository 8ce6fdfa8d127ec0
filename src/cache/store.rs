//! Cache backends opened from configuration.

use std::sync::Arc;

use chrono::Duration;

use super::json::{AsyncJsonCache, JsonCache};
use super::sqlite::{AsyncSqliteCache, Database, SqliteCache};
use super::traits::{AsyncCache, Cache};
use crate::config::{Backend, CacheConfig};
use crate::error::CacheError;
use crate::toggl::Model;

/// The configured backend, ready to hand out a cache per entity type.
///
/// Every SQLite cache opened from one store shares the same connection.
#[derive(Clone)]
pub struct Store {
  config: CacheConfig,
  db: Option<Database>,
}

impl Store {
  pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
    let db = match config.backend {
      Backend::Json => None,
      Backend::Sqlite => Some(Database::from_config(config)?),
    };
    tracing::debug!(backend = ?config.backend, path = %config.path.display(), "Opened cache store");
    Ok(Self {
      config: config.clone(),
      db,
    })
  }

  pub fn backend(&self) -> Backend {
    self.config.backend
  }

  pub fn offline_grace(&self) -> Duration {
    self.config.offline_grace()
  }

  pub fn cache<T: Model>(&self) -> Arc<dyn Cache<T>> {
    match &self.db {
      Some(db) => Arc::new(SqliteCache::<T>::new(db.clone(), self.config.expiration())),
      None => Arc::new(JsonCache::<T>::from_config(&self.config)),
    }
  }

  pub fn async_cache<T: Model>(&self) -> Arc<dyn AsyncCache<T>> {
    match &self.db {
      Some(db) => Arc::new(AsyncSqliteCache::<T>::new(db.clone(), self.config.expiration())),
      None => Arc::new(AsyncJsonCache::<T>::from_config(&self.config)),
    }
  }
}
