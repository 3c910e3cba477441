//! Schema snapshot types for pgsync.
//!
//! This crate contains the value types shared by the extractor, renderer,
//! differ and orchestrator in `pgsync`. A [`Table`] is a pure snapshot: it is
//! built fresh from a live database (or deserialized from a stored snapshot),
//! compared by name, and discarded once a diff has been computed.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Broad classification of a raw Postgres data type name.
///
/// Only the families whose rendering depends on length, precision or scale
/// are distinguished; everything else is [`TypeFamily::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    /// `CHARACTER VARYING` / `VARCHAR`
    Varchar,
    /// `CHARACTER` / `CHAR` / `BPCHAR`
    Char,
    /// `NUMERIC` / `DECIMAL`
    Numeric,
    /// Anything else, rendered uppercased verbatim.
    Other,
}

impl TypeFamily {
    /// Classify a raw data type name (case-insensitive).
    pub fn of(data_type: &str) -> Self {
        match data_type.trim().to_uppercase().as_str() {
            "CHARACTER VARYING" | "VARCHAR" => TypeFamily::Varchar,
            "CHARACTER" | "CHAR" | "BPCHAR" => TypeFamily::Char,
            "NUMERIC" | "DECIMAL" => TypeFamily::Numeric,
            _ => TypeFamily::Other,
        }
    }

    /// Whether a character-length bound is meaningful for this family.
    pub fn has_length(&self) -> bool {
        matches!(self, TypeFamily::Varchar | TypeFamily::Char)
    }

    /// Whether precision and scale are meaningful for this family.
    pub fn has_precision(&self) -> bool {
        matches!(self, TypeFamily::Numeric)
    }
}

/// The canonical spelling of a data type, as `information_schema` reports it.
///
/// Aliases map to their canonical name (`int4` and `int` to `integer`,
/// `timestamptz` to `timestamp with time zone`, `serial` to `integer`), and
/// array types are canonicalized element-wise. Unknown names, such as enum
/// types, are returned trimmed but otherwise unchanged.
///
/// ```
/// use pgsync_schema::canonical_type;
/// assert_eq!(canonical_type("TIMESTAMP"), "timestamp without time zone");
/// assert_eq!(canonical_type("int4[]"), "integer[]");
/// assert_eq!(canonical_type("Mood"), "Mood");
/// ```
pub fn canonical_type(data_type: &str) -> String {
    let trimmed = data_type.trim();
    if let Some(element) = trimmed.strip_suffix("[]") {
        return format!("{}[]", canonical_type(element));
    }
    let lowered = trimmed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let canonical = match lowered.as_str() {
        "int" | "int4" | "integer" | "serial" | "serial4" => "integer",
        "int8" | "bigint" | "bigserial" | "serial8" => "bigint",
        "int2" | "smallint" | "smallserial" | "serial2" => "smallint",
        "bool" | "boolean" => "boolean",
        "float" | "float8" | "double precision" => "double precision",
        "float4" | "real" => "real",
        "varchar" | "character varying" => "character varying",
        "char" | "bpchar" | "character" => "character",
        "decimal" | "numeric" => "numeric",
        "varbit" | "bit varying" => "bit varying",
        "timestamp" | "timestamp without time zone" => "timestamp without time zone",
        "timestamptz" | "timestamp with time zone" => "timestamp with time zone",
        "time" | "time without time zone" => "time without time zone",
        "timetz" | "time with time zone" => "time with time zone",
        _ => return trimmed.to_string(),
    };
    canonical.to_string()
}

/// Whether a data type is one of the `serial` pseudo-types, which create an
/// integer column backed by a sequence.
pub fn is_serial_type(data_type: &str) -> bool {
    matches!(
        data_type.trim().to_lowercase().as_str(),
        "serial" | "serial4" | "bigserial" | "serial8" | "smallserial" | "serial2"
    )
}

/// Format a raw data type name into the DDL spelling.
///
/// ```
/// use pgsync_schema::format_type;
/// assert_eq!(format_type("character varying", Some(50), None, None), "VARCHAR(50)");
/// assert_eq!(format_type("numeric", None, Some(10), Some(2)), "NUMERIC(10,2)");
/// assert_eq!(format_type("numeric", None, Some(10), None), "NUMERIC(10)");
/// assert_eq!(format_type("timestamp with time zone", None, None, None), "TIMESTAMP WITH TIME ZONE");
/// ```
pub fn format_type(
    data_type: &str,
    max_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> String {
    match TypeFamily::of(data_type) {
        TypeFamily::Varchar => match max_length {
            Some(n) => format!("VARCHAR({n})"),
            None => "VARCHAR".to_string(),
        },
        TypeFamily::Char => match max_length {
            Some(n) => format!("CHAR({n})"),
            None => "CHAR".to_string(),
        },
        TypeFamily::Numeric => match (precision, scale) {
            (Some(p), Some(s)) => format!("NUMERIC({p},{s})"),
            (Some(p), None) => format!("NUMERIC({p})"),
            _ => "NUMERIC".to_string(),
        },
        TypeFamily::Other => data_type.trim().to_uppercase(),
    }
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Raw Postgres data type, e.g. `character varying`
    pub data_type: String,
    /// Whether the column allows NULL
    pub nullable: bool,
    /// Default expression, raw SQL text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Character length bound (character types only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i32>,
    /// Numeric precision (numeric types only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_precision: Option<i32>,
    /// Numeric scale (numeric types only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_scale: Option<i32>,
    /// 1-based ordinal position
    pub position: i32,
}

impl Column {
    /// Create a nullable column with no default.
    ///
    /// The position is left at 0; [`Table::new`] renumbers columns in order.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            max_length: None,
            numeric_precision: None,
            numeric_scale: None,
            position: 0,
        }
    }

    /// Mark the column `NOT NULL`.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set the default expression.
    pub fn with_default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Set the character length bound.
    pub fn with_max_length(mut self, n: i32) -> Self {
        self.max_length = Some(n);
        self
    }

    /// Set numeric precision and optional scale.
    pub fn with_precision(mut self, precision: i32, scale: Option<i32>) -> Self {
        self.numeric_precision = Some(precision);
        self.numeric_scale = scale;
        self
    }

    /// The data type as it appears in DDL, e.g. `VARCHAR(50)`.
    pub fn formatted_type(&self) -> String {
        format_type(
            &self.data_type,
            self.max_length,
            self.numeric_precision,
            self.numeric_scale,
        )
    }

    /// Whether the column is declared with a `serial` pseudo-type.
    pub fn is_serial(&self) -> bool {
        is_serial_type(&self.data_type)
    }

    /// Canonicalize the data type spelling and drop size attributes that do
    /// not apply to its type family.
    ///
    /// `information_schema` reports a precision for integer and float
    /// columns too; keeping those would make a rendered table differ from
    /// the same table read back from the database.
    pub fn normalized(mut self) -> Self {
        self.data_type = canonical_type(&self.data_type);
        let family = TypeFamily::of(&self.data_type);
        if !family.has_length() {
            self.max_length = None;
        }
        if !family.has_precision() {
            self.numeric_precision = None;
            self.numeric_scale = None;
        }
        self
    }
}

/// Kind of a table constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConstraintKind {
    #[serde(rename = "PRIMARY KEY")]
    PrimaryKey,
    #[serde(rename = "FOREIGN KEY")]
    ForeignKey,
    #[serde(rename = "UNIQUE")]
    Unique,
    #[serde(rename = "CHECK")]
    Check,
    /// A `NOT NULL` check reclassified during extraction. Informational only.
    #[serde(rename = "NOT NULL")]
    NotNull,
}

impl ConstraintKind {
    /// The SQL keyword for this kind.
    pub fn as_sql(&self) -> &'static str {
        match self {
            ConstraintKind::PrimaryKey => "PRIMARY KEY",
            ConstraintKind::ForeignKey => "FOREIGN KEY",
            ConstraintKind::Unique => "UNIQUE",
            ConstraintKind::Check => "CHECK",
            ConstraintKind::NotNull => "NOT NULL",
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Error returned when a constraint kind string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown constraint kind: {0}")]
pub struct UnknownConstraintKind(pub String);

impl FromStr for ConstraintKind {
    type Err = UnknownConstraintKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PRIMARY KEY" => Ok(ConstraintKind::PrimaryKey),
            "FOREIGN KEY" => Ok(ConstraintKind::ForeignKey),
            "UNIQUE" => Ok(ConstraintKind::Unique),
            "CHECK" => Ok(ConstraintKind::Check),
            "NOT NULL" => Ok(ConstraintKind::NotNull),
            _ => Err(UnknownConstraintKind(s.to_string())),
        }
    }
}

/// A table constraint, grouped by name.
///
/// Multi-column primary keys, unique constraints and foreign keys are a
/// single value with an ordered column list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Constraint name
    pub name: String,
    /// Constraint kind
    pub kind: ConstraintKind,
    /// Constrained columns, in key order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    /// Referenced table (foreign keys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_table: Option<String>,
    /// Referenced columns, parallel to `columns` (foreign keys)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_columns: Vec<String>,
    /// `ON DELETE` action, absent for `NO ACTION` (foreign keys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
    /// `ON UPDATE` action, absent for `NO ACTION` (foreign keys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,
    /// Raw check clause (CHECK and NOT NULL)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_clause: Option<String>,
}

impl Constraint {
    fn bare(name: impl Into<String>, kind: ConstraintKind, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            columns,
            foreign_table: None,
            foreign_columns: Vec::new(),
            on_delete: None,
            on_update: None,
            check_clause: None,
        }
    }

    /// A primary key over `columns`.
    pub fn primary_key(name: impl Into<String>, columns: &[&str]) -> Self {
        Self::bare(name, ConstraintKind::PrimaryKey, to_strings(columns))
    }

    /// A unique constraint over `columns`.
    pub fn unique(name: impl Into<String>, columns: &[&str]) -> Self {
        Self::bare(name, ConstraintKind::Unique, to_strings(columns))
    }

    /// A foreign key from `columns` to `foreign_table(foreign_columns)`.
    pub fn foreign_key(
        name: impl Into<String>,
        columns: &[&str],
        foreign_table: impl Into<String>,
        foreign_columns: &[&str],
    ) -> Self {
        let mut c = Self::bare(name, ConstraintKind::ForeignKey, to_strings(columns));
        c.foreign_table = Some(foreign_table.into());
        c.foreign_columns = to_strings(foreign_columns);
        c
    }

    /// A check constraint with a raw clause.
    pub fn check(name: impl Into<String>, clause: impl Into<String>) -> Self {
        let mut c = Self::bare(name, ConstraintKind::Check, Vec::new());
        c.check_clause = Some(clause.into());
        c
    }

    /// Set the `ON DELETE` action of a foreign key.
    pub fn on_delete(mut self, action: impl Into<String>) -> Self {
        self.on_delete = Some(action.into());
        self
    }

    /// Whether this constraint is rendered into DDL at all.
    pub fn is_structural(&self) -> bool {
        self.kind != ConstraintKind::NotNull
    }
}

/// A table index, grouped by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Table the index belongs to
    pub table: String,
    /// Index name
    pub name: String,
    /// Indexed columns, in key order
    pub columns: Vec<String>,
    /// Whether this is a unique index
    #[serde(default)]
    pub unique: bool,
    /// Access method, e.g. `btree`, `gin`
    pub method: String,
    /// Whether the index backs a primary key
    #[serde(default)]
    pub primary: bool,
}

impl Index {
    /// A non-unique btree index.
    pub fn new(table: impl Into<String>, name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
            columns: to_strings(columns),
            unique: false,
            method: "btree".to_string(),
            primary: false,
        }
    }

    /// Make the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set the access method.
    pub fn using(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }
}

/// A table snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name
    pub name: String,
    /// Columns in ordinal order
    pub columns: Vec<Column>,
    /// Constraints
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Indexes (primary and constraint-backed indexes excluded)
    #[serde(default)]
    pub indexes: Vec<Index>,
}

impl Table {
    /// Create a table, numbering the columns 1..=n in the given order.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(i, mut c)| {
                c.position = i as i32 + 1;
                c
            })
            .collect();
        Self {
            name: name.into(),
            columns,
            constraints: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Add an index. The index's table name is set to this table.
    pub fn with_index(mut self, mut index: Index) -> Self {
        index.table = self.name.clone();
        self.indexes.push(index);
        self
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a constraint by name.
    pub fn constraint(&self, name: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.name == name)
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Primary key columns, in key order.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::PrimaryKey)
            .flat_map(|c| c.columns.iter().map(String::as_str))
            .collect()
    }

    /// Serialize this table snapshot to JSON.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a table snapshot from JSON.
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A caller-supplied column rename: `old` in the old snapshot is `new` in the
/// new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenameRelation {
    pub old: String,
    pub new: String,
}

impl RenameRelation {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// All tables of one database schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Tables, indexed by name
    pub tables: IndexMap<String, Table>,
}

impl Schema {
    /// Create a new empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from a list of tables.
    pub fn from_tables(tables: impl IntoIterator<Item = Table>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Get a table by name.
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Iterate over all tables.
    pub fn iter_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Tables sorted by name.
    pub fn sorted_tables(&self) -> Vec<&Table> {
        let mut tables: Vec<&Table> = self.tables.values().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    /// Serialize the snapshot to JSON.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a snapshot from JSON.
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Error reading or writing a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("invalid snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
