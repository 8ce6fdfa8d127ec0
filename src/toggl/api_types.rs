//! Toggl API response types and their conversion into cached models.
//!
//! The API uses several spellings for the same relation (`workspace_id` and
//! `wid`, `project_id` and `pid`) and often sends both, so payloads are read
//! into loose structs first and then normalized.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::Deserialize;
use serde_json::Value;

use super::types::{Client, Organization, Project, Tag, Tracker, Workspace};
use crate::error::ModelError;

/// A model that can be built from its API representation.
pub(crate) trait FromApi: Sized {
  type Api: DeserializeOwned;
  const ENTITY: &'static str;

  fn from_api(api: Self::Api) -> Result<Self, serde_json::Error>;
}

/// Decode a raw payload into a model.
pub(crate) fn decode<T: FromApi>(raw: Value) -> Result<T, ModelError> {
  serde_json::from_value::<T::Api>(raw)
    .and_then(T::from_api)
    .map_err(|source| ModelError {
      entity: T::ENTITY,
      source,
    })
}

fn first_of(candidates: &[Option<i64>]) -> Option<i64> {
  candidates.iter().flatten().next().copied()
}

/// Longest organization name the API accepts.
const MAX_ORGANIZATION_NAME: usize = 140;

#[derive(Debug, Deserialize)]
pub(crate) struct ApiOrganization {
  id: i64,
  name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiWorkspace {
  id: i64,
  name: String,
  organization_id: Option<i64>,
  organization: Option<i64>,
}

/// Shape shared by every workspace child.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiChild {
  id: i64,
  name: String,
  workspace_id: Option<i64>,
  wid: Option<i64>,
  workspace: Option<i64>,
}

impl ApiChild {
  fn workspace(&self) -> Result<i64, serde_json::Error> {
    first_of(&[self.workspace_id, self.wid, self.workspace])
      .ok_or_else(|| serde_json::Error::missing_field("workspace_id"))
  }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiProject {
  #[serde(flatten)]
  base: ApiChild,
  color: Option<String>,
  client_id: Option<i64>,
  cid: Option<i64>,
  client: Option<i64>,
  active: Option<bool>,
  start_date: Option<NaiveDate>,
  end_date: Option<NaiveDate>,
}

/// Tags arrive either as names (paired with `tag_ids`) or as objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ApiTagRef {
  Name(String),
  Tag(ApiChild),
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiTracker {
  id: i64,
  description: Option<String>,
  name: Option<String>,
  workspace_id: Option<i64>,
  wid: Option<i64>,
  workspace: Option<i64>,
  start: Option<DateTime<Utc>>,
  duration: Option<i64>,
  stop: Option<DateTime<Utc>>,
  project_id: Option<i64>,
  pid: Option<i64>,
  project: Option<i64>,
  #[serde(default)]
  tags: Vec<ApiTagRef>,
  #[serde(default)]
  tag_ids: Vec<i64>,
}

impl FromApi for Organization {
  type Api = ApiOrganization;
  const ENTITY: &'static str = "organization";

  fn from_api(api: ApiOrganization) -> Result<Self, serde_json::Error> {
    let length = api.name.chars().count();
    if length == 0 || length > MAX_ORGANIZATION_NAME {
      return Err(serde_json::Error::custom(format!(
        "organization name must be 1 to {} characters, got {}",
        MAX_ORGANIZATION_NAME, length
      )));
    }
    Ok(Self {
      id: api.id,
      name: api.name,
      timestamp: Utc::now(),
    })
  }
}

impl FromApi for Workspace {
  type Api = ApiWorkspace;
  const ENTITY: &'static str = "workspace";

  fn from_api(api: ApiWorkspace) -> Result<Self, serde_json::Error> {
    Ok(Self {
      id: api.id,
      name: api.name,
      timestamp: Utc::now(),
      organization: first_of(&[api.organization_id, api.organization]).unwrap_or_default(),
    })
  }
}

impl FromApi for Client {
  type Api = ApiChild;
  const ENTITY: &'static str = "client";

  fn from_api(api: ApiChild) -> Result<Self, serde_json::Error> {
    Ok(Self {
      workspace: api.workspace()?,
      id: api.id,
      name: api.name,
      timestamp: Utc::now(),
    })
  }
}

impl FromApi for Tag {
  type Api = ApiChild;
  const ENTITY: &'static str = "tag";

  fn from_api(api: ApiChild) -> Result<Self, serde_json::Error> {
    Ok(Self {
      workspace: api.workspace()?,
      id: api.id,
      name: api.name,
      timestamp: Utc::now(),
    })
  }
}

impl FromApi for Project {
  type Api = ApiProject;
  const ENTITY: &'static str = "project";

  fn from_api(api: ApiProject) -> Result<Self, serde_json::Error> {
    Ok(Self {
      workspace: api.base.workspace()?,
      id: api.base.id,
      name: api.base.name,
      timestamp: Utc::now(),
      color: api.color.unwrap_or_else(|| "#0b83d9".to_string()),
      client: first_of(&[api.client_id, api.cid, api.client]),
      active: api.active.unwrap_or(true),
      start_date: api.start_date.unwrap_or_else(|| Utc::now().date_naive()),
      end_date: api.end_date,
    })
  }
}

impl FromApi for Tracker {
  type Api = ApiTracker;
  const ENTITY: &'static str = "tracker";

  fn from_api(api: ApiTracker) -> Result<Self, serde_json::Error> {
    let workspace = first_of(&[api.workspace_id, api.wid, api.workspace])
      .ok_or_else(|| serde_json::Error::missing_field("workspace_id"))?;

    let mut tags = Vec::with_capacity(api.tags.len());
    for (index, tag) in api.tags.into_iter().enumerate() {
      match tag {
        ApiTagRef::Tag(child) => tags.push(Tag::from_api(child)?),
        ApiTagRef::Name(name) => {
          let Some(id) = api.tag_ids.get(index).copied() else {
            tracing::warn!(id = api.id, index, tag = %name, "Dropping tag name without a tag id");
            continue;
          };
          tags.push(Tag {
            id,
            name,
            timestamp: Utc::now(),
            workspace,
          });
        }
      }
    }

    let start = api.start.unwrap_or_else(|| {
      tracing::info!(id = api.id, "Tracker without start time, using current time");
      Utc::now()
    });

    Ok(Self {
      id: api.id,
      name: api.description.or(api.name).unwrap_or_default(),
      timestamp: Utc::now(),
      workspace,
      start,
      // Running entries report a negative duration.
      duration: api.duration.filter(|d| *d >= 0),
      stop: api.stop,
      project: first_of(&[api.project_id, api.pid, api.project]),
      tags,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::toggl::Model;
  use serde_json::json;

  #[test]
  fn test_tracker_from_api_payload() {
    let raw = json!({
      "id": 42,
      "workspace_id": 7,
      "wid": 7,
      "project_id": 3,
      "pid": 3,
      "description": "Review",
      "start": "2024-03-01T09:00:00+00:00",
      "stop": null,
      "duration": -1709283600,
      "tags": ["billable", "meeting"],
      "tag_ids": [10, 11],
      "at": "2024-03-01T09:00:00+00:00"
    });

    let tracker = Tracker::from_raw(raw).unwrap();
    assert_eq!(tracker.id, 42);
    assert_eq!(tracker.name, "Review");
    assert_eq!(tracker.workspace, 7);
    assert_eq!(tracker.project, Some(3));
    assert_eq!(tracker.duration, None);
    assert!(tracker.running());
    assert_eq!(tracker.tags.len(), 2);
    assert_eq!(tracker.tags[1].id, 11);
    assert_eq!(tracker.tags[1].name, "meeting");
    assert_eq!(tracker.tags[1].workspace, 7);
  }

  #[test]
  fn test_tracker_with_tag_objects() {
    let raw = json!({
      "id": 1,
      "workspace": 2,
      "name": "Plan",
      "start": "2024-03-01T09:00:00Z",
      "duration": 60,
      "stop": "2024-03-01T09:01:00Z",
      "tags": [{"id": 5, "name": "ops", "workspace": 2}]
    });

    let tracker = Tracker::from_raw(raw).unwrap();
    assert_eq!(tracker.duration, Some(60));
    assert_eq!(tracker.tags[0].name, "ops");
  }

  #[test]
  fn test_project_defaults() {
    let raw = json!({"id": 3, "name": "Site", "wid": 1, "cid": 4, "active": false});
    let project = Project::from_raw(raw).unwrap();
    assert_eq!(project.workspace, 1);
    assert_eq!(project.client, Some(4));
    assert!(!project.active);
    assert_eq!(project.color, "#0b83d9");
  }

  #[test]
  fn test_missing_workspace_is_error() {
    let err = Tag::from_raw(json!({"id": 1, "name": "x"})).unwrap_err();
    assert_eq!(err.entity, "tag");
  }

  #[test]
  fn test_organization_name_bounds() {
    let org = Organization::from_raw(json!({"id": 2, "name": "Acme", "pricing_plan_id": 0})).unwrap();
    assert_eq!(org.id, 2);
    assert_eq!(org.name, "Acme");

    assert!(Organization::from_raw(json!({"id": 2, "name": ""})).is_err());
    let long = "x".repeat(141);
    let err = Organization::from_raw(json!({"id": 2, "name": long})).unwrap_err();
    assert_eq!(err.entity, "organization");
  }

  #[test]
  fn test_tag_name_without_id_is_dropped() {
    let raw = json!({
      "id": 3,
      "workspace_id": 1,
      "start": "2024-03-01T09:00:00Z",
      "tags": ["billable", "orphan"],
      "tag_ids": [10]
    });
    let tracker = Tracker::from_raw(raw).unwrap();
    assert_eq!(tracker.tags.len(), 1);
    assert_eq!(tracker.tags[0].name, "billable");
  }

  #[test]
  fn test_workspace_organization() {
    let ws = Workspace::from_raw(json!({"id": 9, "name": "Acme", "organization_id": 2})).unwrap();
    assert_eq!(ws.organization, 2);
  }
}
