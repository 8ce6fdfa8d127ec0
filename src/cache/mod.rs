//! Caching layer for Toggl entities.
//!
//! Two interchangeable backends implement the [`Cache`] contract:
//! - [`JsonCache`] keeps one JSON document per entity type and rewrites it
//!   atomically, only when its contents changed
//! - [`SqliteCache`] keeps every entity type in its own table of one SQLite
//!   database and enforces parent references
//!
//! [`CachedEndpoint`] sits between a resource endpoint and the remote API,
//! serving fresh cached data, writing API responses back into the cache, and
//! falling back to cached data when the API is unreachable. Every type has
//! an async counterpart. [`Store`] opens whichever backend the configuration
//! names.

mod async_layer;
mod json;
mod layer;
pub mod query;
pub mod schema;
mod session;
mod sqlite;
mod store;
mod traits;

pub use async_layer::AsyncCachedEndpoint;
pub use json::{document_path, AsyncJsonCache, JsonCache};
pub use layer::{CachedEndpoint, DEFAULT_OFFLINE_GRACE_DAYS};
pub use query::{Comparison, Operand, Query, Value};
pub use session::{Session, FORMAT_VERSION, TYPE_TAG};
pub use sqlite::{format_instant, AsyncSqliteCache, Database, SqliteCache};
pub use store::Store;
pub use traits::{AsyncCache, Cache, CacheResult, CacheSource, Expiration};
