//! DDL rendering: `CREATE TABLE` and `CREATE INDEX` statements from snapshots.
//!
//! Output is deterministic: columns are emitted in ordinal order, and
//! constraints and indexes are sorted by name.

use crate::{Error, Result, quote_ident, quote_idents};
use pgsync_schema::{Column, Constraint, ConstraintKind, Index, Schema, Table};

/// Whether foreign keys are rendered inside `CREATE TABLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForeignKeys {
    Inline,
    /// Left out, to be added with `ALTER TABLE` once every table exists.
    Deferred,
}

/// Generate the DDL for one table: the `CREATE TABLE` statement followed by
/// one `CREATE INDEX` statement per index.
pub fn create_table_sql(table: &Table) -> Result<String> {
    let mut statements = vec![create_table_statement(table, ForeignKeys::Inline)?];
    statements.extend(index_statements(table));
    Ok(statements.join("\n"))
}

/// Generate the `CREATE TABLE` statement alone.
pub(crate) fn create_table_statement(table: &Table, fks: ForeignKeys) -> Result<String> {
    if table.name.is_empty() {
        return Err(render_error(table, "table name is empty"));
    }

    let mut columns: Vec<&Column> = table.columns.iter().collect();
    columns.sort_by_key(|c| c.position);

    let mut parts = Vec::with_capacity(columns.len() + table.constraints.len());
    for col in columns {
        if col.name.is_empty() {
            return Err(render_error(table, "column name is empty"));
        }
        parts.push(format!("    {}", column_definition(col)));
    }

    // Primary key rows are collected into one clause, named after the first.
    let pk: Vec<&Constraint> = table
        .constraints
        .iter()
        .filter(|c| c.kind == ConstraintKind::PrimaryKey)
        .collect();
    if let Some(first) = pk.first() {
        let pk_columns: Vec<&str> = pk
            .iter()
            .flat_map(|c| c.columns.iter().map(String::as_str))
            .collect();
        if pk_columns.is_empty() {
            return Err(render_error(table, "primary key has no columns"));
        }
        let prefix = if first.name.is_empty() {
            String::new()
        } else {
            format!("CONSTRAINT {} ", quote_ident(&first.name))
        };
        parts.push(format!("    {}PRIMARY KEY ({})", prefix, quote_idents(&pk_columns)));
    }

    for kind in [
        ConstraintKind::Unique,
        ConstraintKind::ForeignKey,
        ConstraintKind::Check,
    ] {
        if kind == ConstraintKind::ForeignKey && fks == ForeignKeys::Deferred {
            continue;
        }
        for constraint in sorted_constraints(table, kind) {
            if let Some(clause) = constraint_clause(table, constraint)? {
                parts.push(format!("    {}", clause));
            }
        }
    }

    Ok(format!(
        "CREATE TABLE {} (\n{}\n);",
        quote_ident(&table.name),
        parts.join(",\n")
    ))
}

/// The definition of a column as used by `CREATE TABLE` and `ADD COLUMN`:
/// `"name" TYPE [NOT NULL] [DEFAULT expr]`.
pub fn column_definition(col: &Column) -> String {
    let mut def = format!("{} {}", quote_ident(&col.name), col.formatted_type());
    if !col.nullable {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        def.push_str(&format!(" DEFAULT {}", default));
    }
    def
}

/// Render a single constraint clause, e.g.
/// `CONSTRAINT "users_email_key" UNIQUE ("email")`.
///
/// Returns `Ok(None)` for constraints that are not rendered: `NOT NULL`
/// annotations, and foreign keys missing their referenced table or with a
/// column count mismatch (skipped with a warning).
pub fn constraint_clause(table: &Table, constraint: &Constraint) -> Result<Option<String>> {
    let name = quote_ident(&constraint.name);
    let clause = match constraint.kind {
        ConstraintKind::NotNull => return Ok(None),
        ConstraintKind::PrimaryKey | ConstraintKind::Unique => {
            if constraint.columns.is_empty() {
                return Err(render_error(
                    table,
                    format!("{} constraint {} has no columns", constraint.kind, name),
                ));
            }
            format!(
                "CONSTRAINT {} {} ({})",
                name,
                constraint.kind,
                quote_idents(&constraint.columns)
            )
        }
        ConstraintKind::ForeignKey => {
            if constraint.columns.is_empty() {
                return Err(render_error(
                    table,
                    format!("foreign key {} has no columns", name),
                ));
            }
            let Some(foreign_table) = constraint.foreign_table.as_deref() else {
                tracing::warn!(
                    table = %table.name,
                    constraint = %constraint.name,
                    "skipping foreign key without a referenced table"
                );
                return Ok(None);
            };
            if constraint.foreign_columns.len() != constraint.columns.len() {
                tracing::warn!(
                    table = %table.name,
                    constraint = %constraint.name,
                    "skipping foreign key with mismatched referenced columns"
                );
                return Ok(None);
            }
            let mut clause = format!(
                "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                name,
                quote_idents(&constraint.columns),
                quote_ident(foreign_table),
                quote_idents(&constraint.foreign_columns)
            );
            if let Some(action) = &constraint.on_delete {
                clause.push_str(&format!(" ON DELETE {}", action));
            }
            if let Some(action) = &constraint.on_update {
                clause.push_str(&format!(" ON UPDATE {}", action));
            }
            clause
        }
        ConstraintKind::Check => {
            let Some(expr) = constraint.check_clause.as_deref() else {
                return Err(render_error(
                    table,
                    format!("check constraint {} has no clause", name),
                ));
            };
            format!("CONSTRAINT {} CHECK ({})", name, expr)
        }
    };
    Ok(Some(clause))
}

/// Generate the `CREATE INDEX` statement for an index.
pub fn create_index_sql(index: &Index) -> String {
    let unique = if index.unique { "UNIQUE " } else { "" };
    format!(
        "CREATE {}INDEX {} ON {} USING {} ({});",
        unique,
        quote_ident(&index.name),
        quote_ident(&index.table),
        index.method,
        quote_idents(&index.columns)
    )
}

/// `CREATE INDEX` statements for a table, sorted by index name.
pub(crate) fn index_statements(table: &Table) -> Vec<String> {
    let mut indexes: Vec<&Index> = table.indexes.iter().collect();
    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    indexes.into_iter().map(create_index_sql).collect()
}

/// `ALTER TABLE ... ADD CONSTRAINT ... FOREIGN KEY` statements for a table,
/// sorted by constraint name.
pub(crate) fn foreign_key_statements(table: &Table) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    for constraint in sorted_constraints(table, ConstraintKind::ForeignKey) {
        if let Some(clause) = constraint_clause(table, constraint)? {
            statements.push(format!(
                "ALTER TABLE {} ADD {};",
                quote_ident(&table.name),
                clause
            ));
        }
    }
    Ok(statements)
}

/// Generate SQL to create every table of a schema.
///
/// Tables are created first (sorted by name, without foreign keys), then
/// foreign keys are added with `ALTER TABLE`, then indexes are created, so
/// the script runs regardless of references between tables.
pub fn schema_to_sql(schema: &Schema) -> Result<String> {
    let tables = schema.sorted_tables();
    let mut sql = String::new();

    for table in &tables {
        sql.push_str(&create_table_statement(table, ForeignKeys::Deferred)?);
        sql.push_str("\n\n");
    }

    let mut any_fk = false;
    for table in &tables {
        for statement in foreign_key_statements(table)? {
            sql.push_str(&statement);
            sql.push('\n');
            any_fk = true;
        }
    }
    if any_fk {
        sql.push('\n');
    }

    for table in &tables {
        for statement in index_statements(table) {
            sql.push_str(&statement);
            sql.push('\n');
        }
    }

    Ok(sql.trim_end().to_string())
}

fn sorted_constraints(table: &Table, kind: ConstraintKind) -> Vec<&Constraint> {
    let mut constraints: Vec<&Constraint> = table
        .constraints
        .iter()
        .filter(|c| c.kind == kind)
        .collect();
    constraints.sort_by(|a, b| a.name.cmp(&b.name));
    constraints
}

fn render_error(table: &Table, reason: impl Into<String>) -> Error {
    Error::Render {
        table: table.name.clone(),
        reason: reason.into(),
    }
}
