//! Backend-agnostic query predicates.
//!
//! A [`Query`] names a field, a [`Comparison`] and an [`Operand`]. The file
//! backend evaluates predicates against records in memory; the relational
//! backend translates them into SQL. Both follow the rules implemented here:
//!
//! - equality is null-safe (`Null` only equals a null field)
//! - a sequence operand means membership (`Equal`) or non-membership
//!   (`NotEqual`)
//! - ordering comparisons never match a null field
//! - association fields (tracker tags) match when any linked record matches
//!   by id or by name, and `NotEqual` matches when none does

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde_json::{Map, Value as Json};

use super::schema::{Column, ColumnKind, Table};
use crate::error::CacheError;

/// How a field is compared against the operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
  Equal,
  NotEqual,
  LessThan,
  LessThanOrEqual,
  GreaterThan,
  GreaterThanOrEqual,
}

impl Comparison {
  pub fn is_ordering(self) -> bool {
    !matches!(self, Self::Equal | Self::NotEqual)
  }

  fn holds(self, ordering: Ordering) -> bool {
    match self {
      Self::Equal => ordering == Ordering::Equal,
      Self::NotEqual => ordering != Ordering::Equal,
      Self::LessThan => ordering == Ordering::Less,
      Self::LessThanOrEqual => ordering != Ordering::Greater,
      Self::GreaterThan => ordering == Ordering::Greater,
      Self::GreaterThanOrEqual => ordering != Ordering::Less,
    }
  }
}

/// A scalar value a field can be compared against.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Text(String),
  Date(NaiveDate),
  /// Held at microsecond precision, the resolution the relational backend
  /// stores.
  Instant(DateTime<Utc>),
}

impl Value {
  /// Values that support ordering comparisons.
  pub fn is_ordered(&self) -> bool {
    matches!(self, Self::Int(_) | Self::Date(_) | Self::Instant(_))
  }

  fn compare(&self, other: &Value) -> Option<Ordering> {
    match (self, other) {
      (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
      (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
      (Self::Instant(a), Self::Instant(b)) => Some(a.cmp(b)),
      _ => None,
    }
  }

  fn type_name(&self) -> &'static str {
    match self {
      Self::Null => "null",
      Self::Bool(_) => "bool",
      Self::Int(_) => "integer",
      Self::Text(_) => "text",
      Self::Date(_) => "date",
      Self::Instant(_) => "instant",
    }
  }

  fn fits(&self, kind: ColumnKind) -> bool {
    match (self, kind) {
      (_, ColumnKind::Association { .. }) => matches!(self, Self::Int(_) | Self::Text(_)),
      (Self::Null, _) => true,
      (Self::Int(_), ColumnKind::Integer)
      | (Self::Text(_), ColumnKind::Text)
      | (Self::Bool(_), ColumnKind::Bool)
      | (Self::Date(_), ColumnKind::Date)
      | (Self::Instant(_), ColumnKind::Instant) => true,
      _ => false,
    }
  }

  /// Reads a stored JSON field as the same kind of value as `self`.
  fn coerce(&self, field: &Json) -> Value {
    match field {
      Json::Null => Value::Null,
      Json::Bool(b) => Value::Bool(*b),
      Json::Number(n) => n.as_i64().map(Value::Int).unwrap_or(Value::Null),
      Json::String(s) => match self {
        Self::Instant(_) => DateTime::parse_from_rfc3339(s)
          .map(|dt| Value::from(dt.with_timezone(&Utc)))
          .unwrap_or_else(|_| Value::Text(s.clone())),
        Self::Date(_) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
          .map(Value::Date)
          .unwrap_or_else(|_| Value::Text(s.clone())),
        _ => Value::Text(s.clone()),
      },
      Json::Object(obj) => {
        let key = match self {
          Self::Int(_) => "id",
          _ => "name",
        };
        obj
          .get(key)
          .map(|v| self.coerce(v))
          .unwrap_or(Value::Null)
      }
      Json::Array(_) => Value::Null,
    }
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Self::Bool(v)
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Self::Int(v)
  }
}

impl From<i32> for Value {
  fn from(v: i32) -> Self {
    Self::Int(v.into())
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Self::Text(v.to_string())
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Self::Text(v)
  }
}

impl From<NaiveDate> for Value {
  fn from(v: NaiveDate) -> Self {
    Self::Date(v)
  }
}

impl From<DateTime<Utc>> for Value {
  fn from(v: DateTime<Utc>) -> Self {
    Self::Instant(v.trunc_subsecs(6))
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(Self::Null)
  }
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
  Single(Value),
  Many(Vec<Value>),
}

impl From<Value> for Operand {
  fn from(v: Value) -> Self {
    Self::Single(v)
  }
}

impl From<Vec<Value>> for Operand {
  fn from(v: Vec<Value>) -> Self {
    Self::Many(v)
  }
}

/// A filter over one field of a cached entity.
///
/// ```ignore
/// let running = Query::eq("stop", Value::Null);
/// let recent = Query::gt("start", Utc::now() - Duration::days(7))?;
/// let tagged = Query::any_of("tags", ["billable", "client"]);
/// let trackers = cache.query(&[running, recent, tagged], false)?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
  key: String,
  comparison: Comparison,
  operand: Operand,
}

impl Query {
  /// Build a predicate, rejecting ordering comparisons on sequences or on
  /// values without an order.
  pub fn new(
    key: impl Into<String>,
    comparison: Comparison,
    operand: impl Into<Operand>,
  ) -> Result<Self, CacheError> {
    let key = key.into();
    let operand = operand.into();

    if key.is_empty() {
      return Err(CacheError::InvalidQuery("empty field name".to_string()));
    }

    if comparison.is_ordering() {
      match &operand {
        Operand::Many(_) => {
          return Err(CacheError::InvalidQuery(format!(
            "{:?} on '{}' needs a single value, not a sequence",
            comparison, key
          )))
        }
        Operand::Single(value) if !value.is_ordered() => {
          return Err(CacheError::InvalidQuery(format!(
            "{:?} on '{}' is only available for numeric or time values, got {}",
            comparison,
            key,
            value.type_name()
          )))
        }
        Operand::Single(_) => {}
      }
    }

    Ok(Self {
      key,
      comparison,
      operand,
    })
  }

  pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::unchecked(key, Comparison::Equal, Operand::Single(value.into()))
  }

  pub fn ne(key: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::unchecked(key, Comparison::NotEqual, Operand::Single(value.into()))
  }

  /// Field equals any of `values`.
  pub fn any_of<V: Into<Value>>(key: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
    let values = values.into_iter().map(Into::into).collect();
    Self::unchecked(key, Comparison::Equal, Operand::Many(values))
  }

  /// Field equals none of `values`.
  pub fn none_of<V: Into<Value>>(key: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
    let values = values.into_iter().map(Into::into).collect();
    Self::unchecked(key, Comparison::NotEqual, Operand::Many(values))
  }

  pub fn lt(key: impl Into<String>, value: impl Into<Value>) -> Result<Self, CacheError> {
    Self::new(key, Comparison::LessThan, value.into())
  }

  pub fn le(key: impl Into<String>, value: impl Into<Value>) -> Result<Self, CacheError> {
    Self::new(key, Comparison::LessThanOrEqual, value.into())
  }

  pub fn gt(key: impl Into<String>, value: impl Into<Value>) -> Result<Self, CacheError> {
    Self::new(key, Comparison::GreaterThan, value.into())
  }

  pub fn ge(key: impl Into<String>, value: impl Into<Value>) -> Result<Self, CacheError> {
    Self::new(key, Comparison::GreaterThanOrEqual, value.into())
  }

  // Equality never fails construction; an empty key is caught by `validate`.
  fn unchecked(key: impl Into<String>, comparison: Comparison, operand: Operand) -> Self {
    Self {
      key: key.into(),
      comparison,
      operand,
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn comparison(&self) -> Comparison {
    self.comparison
  }

  pub fn operand(&self) -> &Operand {
    &self.operand
  }

  /// Check the predicate against an entity table and return the column it
  /// targets.
  pub(crate) fn validate<'t>(&self, table: &'t Table) -> Result<&'t Column, CacheError> {
    let column = table.column(&self.key).ok_or_else(|| {
      CacheError::InvalidQuery(format!("{} has no field '{}'", table.name, self.key))
    })?;

    if column.is_association() && self.comparison.is_ordering() {
      return Err(CacheError::InvalidQuery(format!(
        "'{}' only supports equality comparisons",
        self.key
      )));
    }

    let values: &[Value] = match &self.operand {
      Operand::Single(v) => std::slice::from_ref(v),
      Operand::Many(vs) => vs,
    };
    if let Some(bad) = values.iter().find(|v| !v.fits(column.kind)) {
      return Err(CacheError::InvalidQuery(format!(
        "{} value cannot be compared with {}.{}",
        bad.type_name(),
        table.name,
        self.key
      )));
    }

    Ok(column)
  }

  /// Evaluate the predicate against a record serialized as a JSON object.
  pub(crate) fn matches(&self, record: &Map<String, Json>) -> bool {
    let field = record.get(&self.key).unwrap_or(&Json::Null);

    if let Json::Array(items) = field {
      let hit = items.iter().any(|item| self.equals_operand(item));
      return match self.comparison {
        Comparison::Equal => hit,
        Comparison::NotEqual => !hit,
        _ => false,
      };
    }

    match self.comparison {
      Comparison::Equal => self.equals_operand(field),
      Comparison::NotEqual => !self.equals_operand(field),
      ordering => match &self.operand {
        Operand::Single(expected) => expected
          .coerce(field)
          .compare(expected)
          .is_some_and(|o| ordering.holds(o)),
        Operand::Many(_) => false,
      },
    }
  }

  fn equals_operand(&self, field: &Json) -> bool {
    match &self.operand {
      Operand::Single(expected) => expected.coerce(field) == *expected,
      Operand::Many(values) => values.iter().any(|v| v.coerce(field) == *v),
    }
  }
}

/// Validate every predicate against `table`.
pub(crate) fn validate_all(queries: &[Query], table: &Table) -> Result<(), CacheError> {
  queries.iter().try_for_each(|q| q.validate(table).map(|_| ()))
}

/// All predicates hold for `record` (logical AND).
pub(crate) fn matches_all(queries: &[Query], record: &Map<String, Json>) -> bool {
  queries.iter().all(|q| q.matches(record))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::schema::{PROJECT, TRACKER};
  use chrono::TimeZone;
  use serde_json::json;

  fn record(value: Json) -> Map<String, Json> {
    match value {
      Json::Object(map) => map,
      _ => panic!("not an object"),
    }
  }

  #[test]
  fn test_ordering_requires_ordered_value() {
    assert!(Query::gt("name", "abc").is_err());
    assert!(Query::lt("id", Value::Null).is_err());
    assert!(Query::new("id", Comparison::LessThan, vec![Value::Int(1)]).is_err());
    assert!(Query::ge("id", 5).is_ok());
  }

  #[test]
  fn test_empty_key_rejected() {
    assert!(Query::new("", Comparison::Equal, Value::Int(1)).is_err());
    assert!(Query::eq("", 1).validate(&TRACKER).is_err());
  }

  #[test]
  fn test_validate_against_table() {
    assert!(Query::eq("missing", 1).validate(&TRACKER).is_err());
    assert!(Query::eq("name", 1).validate(&TRACKER).is_err());
    assert!(Query::eq("stop", Value::Null).validate(&TRACKER).is_ok());
    assert!(Query::eq("tags", "billable").validate(&TRACKER).is_ok());
    assert!(Query::eq("active", true).validate(&PROJECT).is_ok());

    let on_tags = Query::gt("tags", 3).unwrap();
    assert!(on_tags.validate(&TRACKER).is_err());
  }

  #[test]
  fn test_null_safe_equality() {
    let running = record(json!({"id": 1, "stop": null}));
    let stopped = record(json!({"id": 2, "stop": "2024-01-01T10:00:00Z"}));

    let q = Query::eq("stop", Value::Null);
    assert!(q.matches(&running));
    assert!(!q.matches(&stopped));

    let q = Query::ne("project", 5);
    assert!(q.matches(&record(json!({"project": null}))));
    assert!(!q.matches(&record(json!({"project": 5}))));
  }

  #[test]
  fn test_membership() {
    let r = record(json!({"id": 3}));
    assert!(Query::any_of("id", [1, 2, 3]).matches(&r));
    assert!(!Query::none_of("id", [1, 2, 3]).matches(&r));
    assert!(!Query::any_of("id", Vec::<i64>::new()).matches(&r));
    assert!(Query::none_of("id", Vec::<i64>::new()).matches(&r));
  }

  #[test]
  fn test_instant_ordering() {
    let r = record(json!({"start": "2024-03-01T12:00:00.123456789Z"}));
    let noon = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    assert!(Query::gt("start", noon).unwrap().matches(&r));
    assert!(!Query::lt("start", noon).unwrap().matches(&r));
    assert!(Query::le("start", noon + chrono::Duration::seconds(1)).unwrap().matches(&r));
  }

  #[test]
  fn test_ordering_never_matches_null() {
    let r = record(json!({"duration": null}));
    assert!(!Query::gt("duration", 0).unwrap().matches(&r));
    assert!(!Query::le("duration", 0).unwrap().matches(&r));
  }

  #[test]
  fn test_association_by_id_and_name() {
    let r = record(json!({
      "tags": [
        {"id": 10, "name": "billable", "workspace": 1},
        {"id": 11, "name": "meeting", "workspace": 1}
      ]
    }));

    assert!(Query::eq("tags", 10).matches(&r));
    assert!(Query::eq("tags", "meeting").matches(&r));
    assert!(!Query::eq("tags", "travel").matches(&r));
    assert!(Query::any_of("tags", ["travel", "billable"]).matches(&r));
    assert!(!Query::ne("tags", "billable").matches(&r));
    assert!(Query::ne("tags", "travel").matches(&r));
  }

  #[test]
  fn test_dates() {
    let r = record(json!({"start_date": "2024-05-02"}));
    let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    assert!(Query::gt("start_date", day).unwrap().matches(&r));
    assert!(!Query::eq("start_date", day).matches(&r));
  }
}
