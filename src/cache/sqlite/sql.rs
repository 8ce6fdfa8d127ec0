//! Row and predicate translation for the relational backend.
//!
//! Records travel as their serde JSON form: a stored column maps to a field of
//! the same name, and an association column maps to an array of child
//! records kept in the link table.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Value as Json};

use crate::cache::query::{Comparison, Operand, Query, Value};
use crate::cache::schema::{self, Column, ColumnKind, Table};
use crate::error::CacheError;

pub(crate) type Record = Map<String, Json>;

/// Fixed-width UTC text, so lexical order is chronological order.
pub fn format_instant(instant: DateTime<Utc>) -> String {
  instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn bind(value: &Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Int(i) => SqlValue::Integer(*i),
    Value::Text(s) => SqlValue::Text(s.clone()),
    Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
    Value::Instant(dt) => SqlValue::Text(format_instant(*dt)),
  }
}

fn operator(comparison: Comparison) -> &'static str {
  match comparison {
    Comparison::Equal => "IS",
    Comparison::NotEqual => "IS NOT",
    Comparison::LessThan => "<",
    Comparison::LessThanOrEqual => "<=",
    Comparison::GreaterThan => ">",
    Comparison::GreaterThanOrEqual => ">=",
  }
}

fn values(operand: &Operand) -> &[Value] {
  match operand {
    Operand::Single(v) => std::slice::from_ref(v),
    Operand::Many(vs) => vs,
  }
}

/// `(a OR b ...)`, or the constant for an empty set.
fn any(terms: Vec<String>) -> String {
  if terms.is_empty() {
    "0".to_string()
  } else {
    format!("({})", terms.join(" OR "))
  }
}

fn negate(clause: String) -> String {
  match clause.as_str() {
    "0" => "1".to_string(),
    _ => format!("NOT {}", clause),
  }
}

fn predicate(
  table: &Table,
  column: &Column,
  query: &Query,
  params: &mut Vec<SqlValue>,
) -> String {
  if let ColumnKind::Association { target } = column.kind {
    let terms = values(query.operand())
      .iter()
      .map(|value| {
        params.push(bind(value));
        match value {
          Value::Int(_) => "t.id IS ?".to_string(),
          _ => "t.name IS ?".to_string(),
        }
      })
      .collect();
    let matched = match any(terms) {
      inner if inner == "0" => inner,
      inner => format!(
        "EXISTS (SELECT 1 FROM {link} l JOIN {target} t ON t.id = l.{target} \
         WHERE l.{owner} = {owner}.id AND {inner})",
        link = table.link_table(target),
        target = target,
        owner = table.name,
        inner = inner,
      ),
    };
    return match query.comparison() {
      Comparison::NotEqual => negate(matched),
      _ => matched,
    };
  }

  match (query.comparison(), query.operand()) {
    (comparison, Operand::Single(value)) => {
      params.push(bind(value));
      format!("{} {} ?", column.name, operator(comparison))
    }
    (comparison, Operand::Many(vs)) => {
      let terms = vs
        .iter()
        .map(|value| {
          params.push(bind(value));
          format!("{} IS ?", column.name)
        })
        .collect();
      match comparison {
        Comparison::NotEqual => negate(any(terms)),
        _ => any(terms),
      }
    }
  }
}

/// WHERE clause (possibly empty) and its parameters.
pub(crate) fn filter(
  table: &Table,
  queries: &[Query],
  cutoff: Option<DateTime<Utc>>,
) -> Result<(String, Vec<SqlValue>), CacheError> {
  let mut clauses = Vec::new();
  let mut params = Vec::new();

  for query in queries {
    let column = query.validate(table)?;
    clauses.push(predicate(table, column, query, &mut params));
  }
  if let Some(cutoff) = cutoff {
    clauses.push("timestamp >= ?".to_string());
    params.push(SqlValue::Text(format_instant(cutoff)));
  }

  if clauses.is_empty() {
    Ok((String::new(), params))
  } else {
    Ok((format!(" WHERE {}", clauses.join(" AND ")), params))
  }
}

fn column_names(table: &Table, alias: Option<&str>) -> String {
  table
    .stored_columns()
    .map(|c| match alias {
      Some(alias) => format!("{}.{}", alias, c.name),
      None => c.name.to_string(),
    })
    .collect::<Vec<_>>()
    .join(", ")
}

fn read_row(table: &Table, row: &Row<'_>) -> rusqlite::Result<Record> {
  let mut record = Map::new();
  for (index, column) in table.stored_columns().enumerate() {
    let value = match row.get_ref(index)? {
      ValueRef::Null => Json::Null,
      ValueRef::Integer(i) if column.kind == ColumnKind::Bool => Json::Bool(i != 0),
      ValueRef::Integer(i) => Json::from(i),
      ValueRef::Real(f) => Json::from(f),
      ValueRef::Text(bytes) => Json::String(String::from_utf8_lossy(bytes).into_owned()),
      ValueRef::Blob(_) => Json::Null,
    };
    record.insert(column.name.to_string(), value);
  }
  Ok(record)
}

/// Records matching `queries`, oldest first, with associations attached.
pub(crate) fn select(
  conn: &Connection,
  table: &Table,
  queries: &[Query],
  distinct: bool,
  cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<Record>, CacheError> {
  let (clause, params) = filter(table, queries, cutoff)?;
  let sql = format!(
    "SELECT {}{} FROM {}{} ORDER BY timestamp, id",
    if distinct { "DISTINCT " } else { "" },
    column_names(table, None),
    table.name,
    clause
  );
  tracing::trace!(%sql, "Querying relational cache");

  let mut stmt = conn.prepare(&sql)?;
  let mut records = stmt
    .query_map(params_from_iter(params.iter()), |row| read_row(table, row))?
    .collect::<Result<Vec<_>, _>>()?;

  for column in table.associations() {
    let ColumnKind::Association { target } = column.kind else {
      continue;
    };
    let target_table = lookup(target)?;
    let sql = format!(
      "SELECT {cols} FROM {link} l JOIN {target} t ON t.id = l.{target} \
       WHERE l.{owner} = ?1 ORDER BY t.id",
      cols = column_names(target_table, Some("t")),
      link = table.link_table(target),
      target = target,
      owner = table.name,
    );
    let mut stmt = conn.prepare(&sql)?;
    for record in &mut records {
      let id = record.get("id").and_then(Json::as_i64).unwrap_or_default();
      let children = stmt
        .query_map([id], |row| read_row(target_table, row))?
        .map(|child| child.map(Json::Object))
        .collect::<Result<Vec<_>, _>>()?;
      record.insert(column.name.to_string(), Json::Array(children));
    }
  }

  Ok(records)
}

fn lookup(name: &str) -> Result<&'static Table, CacheError> {
  schema::find_table(name).ok_or_else(|| CacheError::Corrupt(format!("unknown table {}", name)))
}

fn record_id(table: &Table, record: &Record) -> Result<i64, CacheError> {
  record
    .get("id")
    .and_then(Json::as_i64)
    .ok_or_else(|| CacheError::Corrupt(format!("{} record without an integer id", table.name)))
}

fn stored_value(table: &Table, column: &Column, field: &Json) -> Result<SqlValue, CacheError> {
  let value = match field {
    Json::Null => SqlValue::Null,
    Json::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Json::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    },
    Json::String(s) if column.kind == ColumnKind::Instant => {
      let instant = DateTime::parse_from_rfc3339(s).map_err(|e| {
        CacheError::Corrupt(format!("{}.{}: {}", table.name, column.name, e))
      })?;
      SqlValue::Text(format_instant(instant.with_timezone(&Utc)))
    }
    Json::String(s) => SqlValue::Text(s.clone()),
    Json::Array(_) | Json::Object(_) => {
      return Err(CacheError::Corrupt(format!(
        "{}.{} holds a nested value",
        table.name, column.name
      )))
    }
  };
  Ok(value)
}

fn check_parents(
  conn: &Connection,
  table: &Table,
  id: i64,
  record: &Record,
) -> Result<(), CacheError> {
  for column in table.stored_columns() {
    let Some(reference) = column.references else {
      continue;
    };
    let Some(parent_id) = record.get(column.name).and_then(Json::as_i64) else {
      continue;
    };
    let exists = conn
      .query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?1", reference.table),
        [parent_id],
        |_| Ok(()),
      )
      .optional()?
      .is_some();
    if !exists {
      return Err(CacheError::MissingParent {
        table: table.name,
        id,
        parent: reference.table,
        parent_id,
      });
    }
  }
  Ok(())
}

/// Insert or update one record and its associated children.
///
/// Runs inside the caller's transaction; any error leaves the transaction to
/// be rolled back.
pub(crate) fn upsert(conn: &Connection, table: &Table, record: &Record) -> Result<(), CacheError> {
  let id = record_id(table, record)?;
  check_parents(conn, table, id, record)?;

  let columns: Vec<&str> = table.stored_columns().map(|c| c.name).collect();
  let values = table
    .stored_columns()
    .map(|c| stored_value(table, c, record.get(c.name).unwrap_or(&Json::Null)))
    .collect::<Result<Vec<_>, _>>()?;
  let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
  let updates: Vec<String> = columns
    .iter()
    .filter(|c| **c != "id")
    .map(|c| format!("{0} = excluded.{0}", c))
    .collect();

  conn.execute(
    &format!(
      "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
      table.name,
      columns.join(", "),
      placeholders.join(", "),
      updates.join(", ")
    ),
    params_from_iter(values),
  )?;

  for column in table.associations() {
    let ColumnKind::Association { target } = column.kind else {
      continue;
    };
    let target_table = lookup(target)?;
    let link = table.link_table(target);
    conn.execute(&format!("DELETE FROM {} WHERE {} = ?1", link, table.name), [id])?;

    let children = match record.get(column.name) {
      Some(Json::Array(items)) => items.as_slice(),
      _ => &[],
    };
    for child in children {
      let Json::Object(child) = child else {
        return Err(CacheError::Corrupt(format!(
          "{}.{} holds a non-record entry",
          table.name, column.name
        )));
      };
      upsert(conn, target_table, child)?;
      let child_id = record_id(target_table, child)?;
      conn.execute(
        &format!(
          "INSERT OR IGNORE INTO {} ({}, {}) VALUES (?1, ?2)",
          link, table.name, target
        ),
        [id, child_id],
      )?;
    }
  }

  Ok(())
}

pub(crate) fn delete(conn: &Connection, table: &Table, id: i64) -> Result<usize, CacheError> {
  Ok(conn.execute(&format!("DELETE FROM {} WHERE id = ?1", table.name), [id])?)
}

/// Ids of every row matching `scope`, regardless of age.
pub(crate) fn ids(conn: &Connection, table: &Table, scope: &[Query]) -> Result<Vec<i64>, CacheError> {
  let (clause, params) = filter(table, scope, None)?;
  let mut stmt = conn.prepare(&format!("SELECT id FROM {}{} ORDER BY id", table.name, clause))?;
  let ids = stmt
    .query_map(params_from_iter(params.iter()), |row| row.get(0))?
    .collect::<Result<Vec<i64>, _>>()?;
  Ok(ids)
}
