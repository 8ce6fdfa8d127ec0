//! Cache-first client library for the Toggl Track API.
//!
//! ```ignore
//! let config = Config::load(None)?;
//! let remote = HttpRemote::new(&config)?;
//! let store = Store::open(&config.cache)?;
//! let tags = CachedEndpoint::<Tag, _>::from_store(remote, "workspaces/1/tags", &store);
//!
//! let billable = tags.collect(&[Query::eq("name", "billable")], false)?;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod toggl;

#[cfg(test)]
mod testing;

pub use cache::{
  AsyncCache, AsyncCachedEndpoint, AsyncJsonCache, AsyncSqliteCache, Cache, CacheResult,
  CacheSource, CachedEndpoint, Comparison, Database, Expiration, JsonCache, Query, SqliteCache,
  Store, Value,
};
pub use config::{Backend, CacheConfig, Config};
pub use error::{ApiError, CacheError, Error, ModelError};
pub use toggl::{AsyncHttpRemote, HttpRemote, Model};
