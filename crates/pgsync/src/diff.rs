//! Snapshot diffing: compute the DDL that turns one table into another.
//!
//! Renames cannot be told apart from a drop plus an add by looking at the
//! structure alone, so column renames are supplied by the caller as
//! [`RenameRelation`]s. A table rename is inferred from differing names.
//!
//! Statements come out in a fixed order so they can run top to bottom:
//!
//! 1. table rename
//! 2. column drops and renames (old ordinal order), then adds and alters
//!    (new ordinal order)
//! 3. constraint drops, then constraint adds (sorted by name)
//! 4. index drops, then index creates (sorted by name)
//!
//! Every `DROP` carries `IF EXISTS`, so a partially applied diff can be
//! applied again.
//!
//! ```
//! use pgsync::{Column, Table, diff_tables};
//!
//! let old = Table::new("users", vec![Column::new("id", "integer").not_null()]);
//! let new = Table::new("users", vec![
//!     Column::new("id", "integer").not_null(),
//!     Column::new("bio", "text"),
//! ]);
//!
//! let diff = diff_tables(&old, &new, &[]).unwrap();
//! assert_eq!(diff.to_sql(), "ALTER TABLE \"users\" ADD COLUMN \"bio\" TEXT;");
//! assert!(diff_tables(&new, &new, &[]).unwrap_err().is_no_changes());
//! ```

use crate::render::{column_definition, constraint_clause, create_index_sql, create_table_sql};
use crate::{Error, Result, quote_ident};
use indexmap::IndexMap;
use pgsync_schema::{Column, Constraint, ConstraintKind, Index, RenameRelation, Schema, Table};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// A diff between two schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    /// Changes organized by table, sorted by table name.
    pub table_diffs: Vec<TableDiff>,
}

impl SchemaDiff {
    /// Returns true if there are no differences.
    pub fn is_empty(&self) -> bool {
        self.table_diffs.is_empty()
    }

    /// Count total number of changes.
    pub fn change_count(&self) -> usize {
        self.table_diffs.iter().map(|t| t.changes.len()).sum()
    }

    /// All statements, table by table.
    pub fn statements(&self) -> Vec<String> {
        self.table_diffs
            .iter()
            .flat_map(|t| t.statements())
            .collect()
    }

    /// Generate SQL for all changes, with a comment header per table.
    pub fn to_sql(&self) -> String {
        let mut sql = String::new();
        for table_diff in &self.table_diffs {
            sql.push_str(&format!("-- Table: {}\n", table_diff.table));
            sql.push_str(&table_diff.to_sql());
            sql.push_str("\n\n");
        }
        sql
    }
}

/// Changes for a single table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDiff {
    /// Table name (the new name, when the table is renamed).
    pub table: String,
    /// Changes, in execution order.
    pub changes: Vec<Change>,
}

impl TableDiff {
    /// One SQL statement per change, in execution order.
    pub fn statements(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.to_sql(&self.table)).collect()
    }

    /// The statements joined by newlines.
    pub fn to_sql(&self) -> String {
        self.statements().join("\n")
    }
}

/// A single schema change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create a table; `sql` holds the full rendered DDL.
    CreateTable { name: String, sql: String },
    /// Drop a table.
    DropTable(String),
    /// Rename a table.
    RenameTable { from: String, to: String },
    /// Add a new column.
    AddColumn(Column),
    /// Drop an existing column.
    DropColumn(String),
    /// Rename a column.
    RenameColumn { from: String, to: String },
    /// Change a column's type. With `using`, the statement carries a
    /// `USING "col"::TYPE` conversion.
    AlterColumnType {
        name: String,
        from: String,
        to: String,
        using: bool,
    },
    /// Change a column's nullability.
    AlterColumnNullable { name: String, from: bool, to: bool },
    /// Change a column's default value.
    AlterColumnDefault {
        name: String,
        from: Option<String>,
        to: Option<String>,
    },
    /// Add a constraint; `clause` is the rendered constraint clause.
    AddConstraint {
        name: String,
        kind: ConstraintKind,
        clause: String,
    },
    /// Drop a constraint.
    DropConstraint { name: String, kind: ConstraintKind },
    /// Create an index.
    AddIndex(Index),
    /// Drop an index.
    DropIndex(String),
}

impl Change {
    /// Generate the SQL statement for this change.
    ///
    /// `table_name` is the table the statement addresses.
    pub fn to_sql(&self, table_name: &str) -> String {
        let table = quote_ident(table_name);
        match self {
            Change::CreateTable { sql, .. } => sql.clone(),
            Change::DropTable(name) => format!("DROP TABLE IF EXISTS {};", quote_ident(name)),
            Change::RenameTable { from, to } => format!(
                "ALTER TABLE {} RENAME TO {};",
                quote_ident(from),
                quote_ident(to)
            ),
            Change::AddColumn(col) => {
                format!("ALTER TABLE {} ADD COLUMN {};", table, column_definition(col))
            }
            Change::DropColumn(name) => format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {};",
                table,
                quote_ident(name)
            ),
            Change::RenameColumn { from, to } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {};",
                table,
                quote_ident(from),
                quote_ident(to)
            ),
            Change::AlterColumnType { name, to, using, .. } => {
                let col = quote_ident(name);
                if *using {
                    format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{};",
                        table, col, to, col, to
                    )
                } else {
                    format!("ALTER TABLE {} ALTER COLUMN {} TYPE {};", table, col, to)
                }
            }
            Change::AlterColumnNullable { name, to, .. } => {
                let action = if *to { "DROP NOT NULL" } else { "SET NOT NULL" };
                format!(
                    "ALTER TABLE {} ALTER COLUMN {} {};",
                    table,
                    quote_ident(name),
                    action
                )
            }
            Change::AlterColumnDefault { name, to, .. } => match to {
                Some(default) => format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {};",
                    table,
                    quote_ident(name),
                    default
                ),
                None => format!(
                    "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT;",
                    table,
                    quote_ident(name)
                ),
            },
            Change::AddConstraint { clause, .. } => {
                format!("ALTER TABLE {} ADD {};", table, clause)
            }
            Change::DropConstraint { name, .. } => format!(
                "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
                table,
                quote_ident(name)
            ),
            Change::AddIndex(idx) => create_index_sql(&Index {
                table: table_name.to_string(),
                ..idx.clone()
            }),
            Change::DropIndex(name) => format!("DROP INDEX IF EXISTS {};", quote_ident(name)),
        }
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Change::CreateTable { name, .. } => write!(f, "+ table {}", name),
            Change::DropTable(name) => write!(f, "- table {}", name),
            Change::RenameTable { from, to } => write!(f, "~ rename {} -> {}", from, to),
            Change::AddColumn(col) => {
                let nullable = if col.nullable { " (nullable)" } else { "" };
                write!(f, "+ {}: {}{}", col.name, col.formatted_type(), nullable)
            }
            Change::DropColumn(name) => write!(f, "- {}", name),
            Change::RenameColumn { from, to } => write!(f, "~ rename {} -> {}", from, to),
            Change::AlterColumnType { name, from, to, .. } => {
                write!(f, "~ {}: {} -> {}", name, from, to)
            }
            Change::AlterColumnNullable { name, from, to } => {
                let from_str = if *from { "nullable" } else { "not null" };
                let to_str = if *to { "nullable" } else { "not null" };
                write!(f, "~ {}: {} -> {}", name, from_str, to_str)
            }
            Change::AlterColumnDefault { name, from, to } => {
                let from_str = from.as_deref().unwrap_or("(none)");
                let to_str = to.as_deref().unwrap_or("(none)");
                write!(f, "~ {} default: {} -> {}", name, from_str, to_str)
            }
            Change::AddConstraint { name, kind, .. } => write!(f, "+ {} {}", kind, name),
            Change::DropConstraint { name, kind } => write!(f, "- {} {}", kind, name),
            Change::AddIndex(idx) => {
                let unique = if idx.unique { "UNIQUE " } else { "" };
                write!(
                    f,
                    "+ {}INDEX {} ({})",
                    unique,
                    idx.name,
                    idx.columns.join(", ")
                )
            }
            Change::DropIndex(name) => write!(f, "- INDEX {}", name),
        }
    }
}

impl std::fmt::Display for TableDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}:", self.table)?;
        for change in &self.changes {
            writeln!(f, "  {}", change)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes.");
        }
        for table_diff in &self.table_diffs {
            write!(f, "{}", table_diff)?;
        }
        Ok(())
    }
}

/// Compute the changes that turn `old` into `new`.
///
/// `renames` lists column renames (`old` name in `old`, `new` name in
/// `new`). Returns [`Error::NoChanges`] when the tables are equivalent, and
/// [`Error::InvalidRename`] when the rename list contradicts the snapshots.
pub fn diff_tables(old: &Table, new: &Table, renames: &[RenameRelation]) -> Result<TableDiff> {
    let renames = Renames::resolve(old, new, renames)?;
    let mut changes = Vec::new();

    if old.name != new.name {
        changes.push(Change::RenameTable {
            from: old.name.clone(),
            to: new.name.clone(),
        });
    }

    diff_columns(old, new, &renames, &mut changes);
    diff_constraints(old, new, &renames, &mut changes)?;
    diff_indexes(old, new, &renames, &mut changes);

    if changes.is_empty() {
        return Err(Error::NoChanges);
    }
    Ok(TableDiff {
        table: new.name.clone(),
        changes,
    })
}

/// Diff every table of two schemas.
///
/// Tables present on both sides (by name) are diffed with the renames listed
/// for them in `renames`; tables only in `new` are created and tables only
/// in `old` are dropped. Table diffs are sorted by table name.
pub fn diff_schemas(
    old: &Schema,
    new: &Schema,
    renames: &IndexMap<String, Vec<RenameRelation>>,
) -> Result<SchemaDiff> {
    let names: BTreeSet<&str> = old
        .tables
        .keys()
        .chain(new.tables.keys())
        .map(String::as_str)
        .collect();

    let mut table_diffs = Vec::new();
    for name in names {
        let changes = match (old.get_table(name), new.get_table(name)) {
            (Some(old_table), Some(new_table)) => {
                let table_renames = renames.get(name).map(Vec::as_slice).unwrap_or_default();
                match diff_tables(old_table, new_table, table_renames) {
                    Ok(diff) => diff.changes,
                    Err(Error::NoChanges) => continue,
                    Err(e) => return Err(e),
                }
            }
            (None, Some(new_table)) => vec![Change::CreateTable {
                name: name.to_string(),
                sql: create_table_sql(new_table)?,
            }],
            (Some(_), None) => vec![Change::DropTable(name.to_string())],
            (None, None) => continue,
        };
        table_diffs.push(TableDiff {
            table: name.to_string(),
            changes,
        });
    }

    Ok(SchemaDiff { table_diffs })
}

/// Validated column renames, restricted to sources present in the old table.
struct Renames<'a> {
    /// old name -> new name
    forward: HashMap<&'a str, &'a str>,
    /// new name -> old name
    reverse: HashMap<&'a str, &'a str>,
}

impl<'a> Renames<'a> {
    fn resolve(old: &Table, new: &Table, renames: &'a [RenameRelation]) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidRename {
            table: new.name.clone(),
            reason,
        };

        let mut sources = HashSet::new();
        let mut targets = HashSet::new();
        for r in renames {
            if !sources.insert(r.old.as_str()) {
                return Err(invalid(format!("column {:?} is renamed twice", r.old)));
            }
            if !targets.insert(r.new.as_str()) {
                return Err(invalid(format!(
                    "column {:?} is the target of two renames",
                    r.new
                )));
            }
        }

        let mut forward = HashMap::new();
        let mut reverse = HashMap::new();
        for r in renames {
            if r.old == r.new {
                continue;
            }
            if new.column(&r.new).is_none() {
                return Err(invalid(format!(
                    "rename target {:?} is not a column of the new table",
                    r.new
                )));
            }
            if new.column(&r.old).is_some() && !targets.contains(r.old.as_str()) {
                return Err(invalid(format!(
                    "rename source {:?} is still a column of the new table",
                    r.old
                )));
            }
            if old.column(&r.old).is_none() {
                tracing::debug!(
                    table = %new.name,
                    from = %r.old,
                    to = %r.new,
                    "rename source not in old table, skipping"
                );
                continue;
            }
            if old.column(&r.new).is_some() {
                return Err(invalid(format!(
                    "rename target {:?} already exists in the old table",
                    r.new
                )));
            }
            forward.insert(r.old.as_str(), r.new.as_str());
            reverse.insert(r.new.as_str(), r.old.as_str());
        }

        Ok(Self { forward, reverse })
    }

    /// The name a column of the old table has after the renames.
    fn apply<'n>(&self, name: &'n str) -> &'n str
    where
        'a: 'n,
    {
        self.forward.get(name).copied().unwrap_or(name)
    }
}

fn diff_columns(old: &Table, new: &Table, renames: &Renames<'_>, changes: &mut Vec<Change>) {
    for col in by_position(&old.columns) {
        if let Some(target) = renames.forward.get(col.name.as_str()) {
            changes.push(Change::RenameColumn {
                from: col.name.clone(),
                to: target.to_string(),
            });
        } else if new.column(&col.name).is_none() {
            changes.push(Change::DropColumn(col.name.clone()));
        }
    }

    for col in by_position(&new.columns) {
        let source = renames
            .reverse
            .get(col.name.as_str())
            .copied()
            .unwrap_or(col.name.as_str());
        match old.column(source) {
            Some(prev) => diff_column(prev, col, changes),
            None => changes.push(Change::AddColumn(col.clone())),
        }
    }
}

fn diff_column(prev: &Column, col: &Column, changes: &mut Vec<Change>) {
    let serial = col.is_serial();
    let prev = prev.clone().normalized();
    let mut col = col.clone().normalized();
    // A serial column reads back as NOT NULL with a sequence default.
    if serial {
        col.nullable = false;
        if col.default.is_none() && prev.default.as_deref().is_some_and(is_sequence_default) {
            col.default = prev.default.clone();
        }
    }
    let name = &col.name;

    let retype = |using: bool| Change::AlterColumnType {
        name: name.clone(),
        from: prev.formatted_type(),
        to: col.formatted_type(),
        using,
    };

    if base_type(&prev) != base_type(&col) {
        changes.push(retype(true));
    }
    if prev.nullable != col.nullable {
        changes.push(Change::AlterColumnNullable {
            name: name.clone(),
            from: prev.nullable,
            to: col.nullable,
        });
    }
    if prev.default != col.default {
        changes.push(Change::AlterColumnDefault {
            name: name.clone(),
            from: prev.default.clone(),
            to: col.default.clone(),
        });
    }
    if prev.max_length != col.max_length {
        changes.push(retype(false));
    }
    if prev.numeric_precision != col.numeric_precision {
        changes.push(retype(false));
    }
    if prev.numeric_scale != col.numeric_scale {
        changes.push(retype(false));
    }
}

/// The type without size attributes, in DDL spelling (`VARCHAR`, `NUMERIC`).
fn base_type(col: &Column) -> String {
    pgsync_schema::format_type(&col.data_type, None, None, None)
}

fn is_sequence_default(expr: &str) -> bool {
    expr.trim_start().starts_with("nextval(")
}

fn by_position(columns: &[Column]) -> Vec<&Column> {
    let mut sorted: Vec<&Column> = columns.iter().collect();
    sorted.sort_by_key(|c| c.position);
    sorted
}

fn diff_constraints(
    old: &Table,
    new: &Table,
    renames: &Renames<'_>,
    changes: &mut Vec<Change>,
) -> Result<()> {
    // Old constraints as they read after the column renames.
    let old_map: BTreeMap<&str, Constraint> = old
        .constraints
        .iter()
        .filter(|c| c.is_structural())
        .map(|c| {
            let mut renamed = c.clone();
            for column in &mut renamed.columns {
                *column = renames.apply(column).to_string();
            }
            (c.name.as_str(), renamed)
        })
        .collect();
    let new_map: BTreeMap<&str, &Constraint> = new
        .constraints
        .iter()
        .filter(|c| c.is_structural())
        .map(|c| (c.name.as_str(), c))
        .collect();

    for (name, constraint) in &old_map {
        let unchanged = new_map
            .get(name)
            .is_some_and(|c| same_constraint(constraint, c));
        if !unchanged {
            changes.push(Change::DropConstraint {
                name: name.to_string(),
                kind: constraint.kind,
            });
        }
    }

    for (name, constraint) in &new_map {
        let unchanged = old_map
            .get(name)
            .is_some_and(|c| same_constraint(c, constraint));
        if unchanged {
            continue;
        }
        if let Some(clause) = constraint_clause(new, constraint)? {
            changes.push(Change::AddConstraint {
                name: name.to_string(),
                kind: constraint.kind,
                clause,
            });
        }
    }
    Ok(())
}

/// Keys are compared structurally. CHECK constraints match by name alone:
/// Postgres stores the clause in its own canonical form, so changing a check
/// means giving it a new name.
fn same_constraint(a: &Constraint, b: &Constraint) -> bool {
    if a.kind != b.kind {
        return false;
    }
    if a.kind == ConstraintKind::Check {
        return true;
    }
    a.columns == b.columns
        && a.foreign_table == b.foreign_table
        && a.foreign_columns == b.foreign_columns
        && a.on_delete == b.on_delete
        && a.on_update == b.on_update
}

fn diff_indexes(old: &Table, new: &Table, renames: &Renames<'_>, changes: &mut Vec<Change>) {
    let old_map: BTreeMap<&str, Index> = old
        .indexes
        .iter()
        .map(|i| {
            let mut renamed = i.clone();
            for column in &mut renamed.columns {
                *column = renames.apply(column).to_string();
            }
            (i.name.as_str(), renamed)
        })
        .collect();
    let new_map: BTreeMap<&str, &Index> = new.indexes.iter().map(|i| (i.name.as_str(), i)).collect();

    for (name, index) in &old_map {
        if !new_map.get(name).is_some_and(|i| same_index(index, i)) {
            changes.push(Change::DropIndex(name.to_string()));
        }
    }
    for (name, index) in &new_map {
        if !old_map.get(name).is_some_and(|i| same_index(i, index)) {
            changes.push(Change::AddIndex((*index).clone()));
        }
    }
}

fn same_index(a: &Index, b: &Index) -> bool {
    a.columns == b.columns && a.unique == b.unique && a.method.eq_ignore_ascii_case(&b.method)
}
