//! Table definitions for the cached entity types.
//!
//! The relational backend creates its tables from these definitions, and both
//! backends use them to validate query predicates, so a query that is legal
//! against one backend is legal against the other.

/// Storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
  Integer,
  Text,
  Bool,
  /// Calendar date stored as `YYYY-MM-DD`.
  Date,
  /// Instant normalized to UTC, stored as fixed-width RFC 3339 text.
  Instant,
  /// Many-to-many link to another table through a link table named
  /// `<owner>_<target>` with columns `<owner>` and `<target>`.
  Association { target: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
  Cascade,
  SetNull,
}

/// Foreign key from a column to another table's `id`.
#[derive(Debug, Clone, Copy)]
pub struct Reference {
  pub table: &'static str,
  pub on_delete: OnDelete,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
  pub name: &'static str,
  pub kind: ColumnKind,
  pub nullable: bool,
  pub references: Option<Reference>,
}

impl Column {
  const fn new(name: &'static str, kind: ColumnKind) -> Self {
    Self {
      name,
      kind,
      nullable: false,
      references: None,
    }
  }

  const fn nullable(mut self) -> Self {
    self.nullable = true;
    self
  }

  const fn references(mut self, table: &'static str, on_delete: OnDelete) -> Self {
    self.references = Some(Reference { table, on_delete });
    self
  }

  pub fn is_association(&self) -> bool {
    matches!(self.kind, ColumnKind::Association { .. })
  }

  fn sql_type(&self) -> &'static str {
    match self.kind {
      ColumnKind::Integer | ColumnKind::Bool => "INTEGER",
      ColumnKind::Text | ColumnKind::Date | ColumnKind::Instant => "TEXT",
      ColumnKind::Association { .. } => unreachable!("associations are not stored inline"),
    }
  }
}

/// One table per entity type. `id` is always the primary key.
#[derive(Debug)]
pub struct Table {
  pub name: &'static str,
  pub columns: &'static [Column],
}

impl Table {
  pub fn column(&self, name: &str) -> Option<&Column> {
    self.columns.iter().find(|c| c.name == name)
  }

  /// Columns stored directly in the table's own rows.
  pub fn stored_columns(&self) -> impl Iterator<Item = &Column> {
    self.columns.iter().filter(|c| !c.is_association())
  }

  pub fn associations(&self) -> impl Iterator<Item = &Column> {
    self.columns.iter().filter(|c| c.is_association())
  }

  /// Name of the link table backing an association column.
  pub fn link_table(&self, target: &str) -> String {
    format!("{}_{}", self.name, target)
  }

  pub(crate) fn create_sql(&self) -> String {
    let mut defs = Vec::new();
    for column in self.stored_columns() {
      let mut def = format!("{} {}", column.name, column.sql_type());
      if column.name == "id" {
        def.push_str(" PRIMARY KEY");
      } else if !column.nullable {
        def.push_str(" NOT NULL");
      }
      if let Some(reference) = column.references {
        let action = match reference.on_delete {
          OnDelete::Cascade => "CASCADE",
          OnDelete::SetNull => "SET NULL",
        };
        def.push_str(&format!(
          " REFERENCES {}(id) ON DELETE {}",
          reference.table, action
        ));
      }
      defs.push(def);
    }

    let mut sql = format!(
      "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);\n",
      self.name,
      defs.join(",\n    ")
    );
    sql.push_str(&format!(
      "CREATE INDEX IF NOT EXISTS idx_{0}_timestamp ON {0}(timestamp);\n",
      self.name
    ));

    for column in self.associations() {
      if let ColumnKind::Association { target } = column.kind {
        sql.push_str(&format!(
          "CREATE TABLE IF NOT EXISTS {link} (\n    \
           {owner} INTEGER NOT NULL REFERENCES {owner}(id) ON DELETE CASCADE,\n    \
           {target} INTEGER NOT NULL REFERENCES {target}(id) ON DELETE CASCADE,\n    \
           PRIMARY KEY ({owner}, {target})\n);\n",
          link = self.link_table(target),
          owner = self.name,
          target = target,
        ));
      }
    }

    sql
  }
}

const ID: Column = Column::new("id", ColumnKind::Integer);
const NAME: Column = Column::new("name", ColumnKind::Text);
const TIMESTAMP: Column = Column::new("timestamp", ColumnKind::Instant);
const WORKSPACE_REF: Column = Column::new("workspace", ColumnKind::Integer)
  .references("workspace", OnDelete::Cascade);

pub static ORGANIZATION: Table = Table {
  name: "organization",
  columns: &[ID, NAME, TIMESTAMP],
};

/// `organization` carries no foreign key, so a workspace can be cached
/// before its organization.
pub static WORKSPACE: Table = Table {
  name: "workspace",
  columns: &[
    ID,
    NAME,
    TIMESTAMP,
    Column::new("organization", ColumnKind::Integer),
  ],
};

pub static CLIENT: Table = Table {
  name: "client",
  columns: &[ID, NAME, TIMESTAMP, WORKSPACE_REF],
};

pub static PROJECT: Table = Table {
  name: "project",
  columns: &[
    ID,
    NAME,
    TIMESTAMP,
    WORKSPACE_REF,
    Column::new("color", ColumnKind::Text),
    Column::new("client", ColumnKind::Integer)
      .nullable()
      .references("client", OnDelete::SetNull),
    Column::new("active", ColumnKind::Bool),
    Column::new("start_date", ColumnKind::Date),
    Column::new("end_date", ColumnKind::Date).nullable(),
  ],
};

pub static TAG: Table = Table {
  name: "tag",
  columns: &[ID, NAME, TIMESTAMP, WORKSPACE_REF],
};

pub static TRACKER: Table = Table {
  name: "tracker",
  columns: &[
    ID,
    NAME,
    TIMESTAMP,
    WORKSPACE_REF,
    Column::new("start", ColumnKind::Instant),
    Column::new("duration", ColumnKind::Integer).nullable(),
    Column::new("stop", ColumnKind::Instant).nullable(),
    Column::new("project", ColumnKind::Integer)
      .nullable()
      .references("project", OnDelete::SetNull),
    Column::new("tags", ColumnKind::Association { target: "tag" }),
  ],
};

/// Every table, parents before children.
pub static TABLES: [&Table; 6] = [&ORGANIZATION, &WORKSPACE, &CLIENT, &PROJECT, &TAG, &TRACKER];

pub fn find_table(name: &str) -> Option<&'static Table> {
  TABLES.iter().copied().find(|t| t.name == name)
}

/// DDL registering every table.
pub fn schema_sql() -> String {
  TABLES.iter().map(|t| t.create_sql()).collect()
}
