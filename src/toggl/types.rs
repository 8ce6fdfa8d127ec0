use std::fmt::Debug;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::cache::schema::{self, Table};
use crate::error::ModelError;

/// A typed entity with stable identity that can be cached.
///
/// `timestamp` is the local modification instant the cache uses to judge
/// freshness; it is not part of the remote representation.
pub trait Model:
  Debug + Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
  fn id(&self) -> i64;

  fn timestamp(&self) -> DateTime<Utc>;

  /// Schema of the entity's table.
  fn table() -> &'static Table;

  /// Type tag used in persisted documents and as the table name.
  fn entity_type() -> &'static str {
    Self::table().name
  }

  /// Decode a payload returned by the remote API.
  fn from_raw(raw: serde_json::Value) -> Result<Self, ModelError>;
}

fn now() -> DateTime<Utc> {
  Utc::now()
}

fn today() -> NaiveDate {
  Utc::now().date_naive()
}

fn default_color() -> String {
  "#0b83d9".to_string()
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
  pub id: i64,
  pub name: String,
  #[serde(default = "now")]
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
  pub id: i64,
  pub name: String,
  #[serde(default = "now")]
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub organization: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
  pub id: i64,
  pub name: String,
  #[serde(default = "now")]
  pub timestamp: DateTime<Utc>,
  pub workspace: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
  Upcoming,
  Active,
  Ended,
  Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: i64,
  pub name: String,
  #[serde(default = "now")]
  pub timestamp: DateTime<Utc>,
  pub workspace: i64,
  #[serde(default = "default_color")]
  pub color: String,
  #[serde(default)]
  pub client: Option<i64>,
  #[serde(default = "default_true")]
  pub active: bool,
  #[serde(default = "today")]
  pub start_date: NaiveDate,
  #[serde(default)]
  pub end_date: Option<NaiveDate>,
}

impl Project {
  /// Derive the project status from its dates and archive flag.
  pub fn status(&self) -> ProjectStatus {
    if !self.active {
      return ProjectStatus::Archived;
    }
    let today = today();
    if today < self.start_date {
      return ProjectStatus::Upcoming;
    }
    match self.end_date {
      Some(end) if today >= end => ProjectStatus::Ended,
      _ => ProjectStatus::Active,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
  pub id: i64,
  pub name: String,
  #[serde(default = "now")]
  pub timestamp: DateTime<Utc>,
  pub workspace: i64,
}

/// A time entry. `name` is the entry's description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracker {
  pub id: i64,
  pub name: String,
  #[serde(default = "now")]
  pub timestamp: DateTime<Utc>,
  pub workspace: i64,
  pub start: DateTime<Utc>,
  /// Seconds; `None` while running.
  #[serde(default)]
  pub duration: Option<i64>,
  #[serde(default)]
  pub stop: Option<DateTime<Utc>>,
  #[serde(default)]
  pub project: Option<i64>,
  #[serde(default)]
  pub tags: Vec<Tag>,
}

impl Tracker {
  pub fn running(&self) -> bool {
    self.stop.is_none()
  }

  /// Elapsed time, computed from `start` while the tracker runs.
  pub fn running_duration(&self) -> Duration {
    match self.duration {
      Some(secs) => Duration::seconds(secs),
      None => Utc::now() - self.start,
    }
  }
}

macro_rules! impl_model {
  ($ty:ty, $table:expr) => {
    impl Model for $ty {
      fn id(&self) -> i64 {
        self.id
      }

      fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
      }

      fn table() -> &'static Table {
        &$table
      }

      fn from_raw(raw: serde_json::Value) -> Result<Self, ModelError> {
        super::api_types::decode(raw)
      }
    }
  };
}

impl_model!(Organization, schema::ORGANIZATION);
impl_model!(Workspace, schema::WORKSPACE);
impl_model!(Client, schema::CLIENT);
impl_model!(Project, schema::PROJECT);
impl_model!(Tag, schema::TAG);
impl_model!(Tracker, schema::TRACKER);
