//! Schema introspection: read the live `public` schema into snapshots.
//!
//! Three queries cover the whole database (columns, constraints, indexes);
//! their rows are grouped by table name in memory, so extracting N tables
//! costs three round trips rather than 3N.

use crate::{Error, Querier, QuerierExt, Result};
use indexmap::IndexMap;
use std::collections::HashSet;
use pgsync_schema::{Column, Constraint, ConstraintKind, Index, Schema, Table};
use tokio_postgres::Row;
use tokio_postgres::types::{FromSql, ToSql};

const TABLES_SQL: &str = r#"
SELECT t.table_name::text AS table_name
FROM information_schema.tables t
WHERE t.table_schema = 'public'
  AND t.table_type = 'BASE TABLE'
ORDER BY t.table_name
"#;

const COLUMNS_SQL: &str = r#"
SELECT
    c.table_name::text AS table_name,
    c.column_name::text AS column_name,
    CASE
        WHEN c.data_type = 'USER-DEFINED' THEN c.udt_name::text
        WHEN c.data_type = 'ARRAY' THEN substring(c.udt_name from 2) || '[]'
        ELSE c.data_type::text
    END AS data_type,
    c.is_nullable = 'YES' AS nullable,
    c.column_default::text AS column_default,
    c.character_maximum_length::int4 AS max_length,
    c.numeric_precision::int4 AS numeric_precision,
    c.numeric_scale::int4 AS numeric_scale,
    c.ordinal_position::int4 AS position
FROM information_schema.columns c
JOIN information_schema.tables t
  ON t.table_schema = c.table_schema
 AND t.table_name = c.table_name
WHERE c.table_schema = 'public'
  AND t.table_type = 'BASE TABLE'
  AND ($1::text IS NULL OR c.table_name = $1)
ORDER BY c.table_name, c.ordinal_position
"#;

// Keyed by the owning relation: FK and CHECK names are only unique per table.
const CONSTRAINTS_SQL: &str = r#"
SELECT
    t.relname::text AS table_name,
    con.conname::text AS constraint_name,
    CASE con.contype
        WHEN 'p' THEN 'PRIMARY KEY'
        WHEN 'u' THEN 'UNIQUE'
        WHEN 'f' THEN 'FOREIGN KEY'
        WHEN 'c' THEN 'CHECK'
        WHEN 'n' THEN 'NOT NULL'
    END AS constraint_type,
    a.attname::text AS column_name,
    ft.relname::text AS foreign_table,
    fa.attname::text AS foreign_column,
    CASE WHEN con.contype = 'f' THEN
        CASE con.confdeltype
            WHEN 'r' THEN 'RESTRICT'
            WHEN 'c' THEN 'CASCADE'
            WHEN 'n' THEN 'SET NULL'
            WHEN 'd' THEN 'SET DEFAULT'
        END
    END AS on_delete,
    CASE WHEN con.contype = 'f' THEN
        CASE con.confupdtype
            WHEN 'r' THEN 'RESTRICT'
            WHEN 'c' THEN 'CASCADE'
            WHEN 'n' THEN 'SET NULL'
            WHEN 'd' THEN 'SET DEFAULT'
        END
    END AS on_update,
    CASE WHEN con.contype = 'c' THEN pg_get_expr(con.conbin, con.conrelid) END AS check_clause
FROM pg_constraint con
JOIN pg_class t ON t.oid = con.conrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
LEFT JOIN pg_class ft ON ft.oid = con.confrelid
LEFT JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
  ON con.contype <> 'c'
LEFT JOIN pg_attribute a
  ON a.attrelid = con.conrelid
 AND a.attnum = k.attnum
LEFT JOIN pg_attribute fa
  ON fa.attrelid = con.confrelid
 AND fa.attnum = con.confkey[k.ord::int]
WHERE n.nspname = 'public'
  AND t.relkind = 'r'
  AND con.contype IN ('p', 'u', 'f', 'c', 'n')
  AND ($1::text IS NULL OR t.relname = $1)
ORDER BY t.relname, con.conname, k.ord
"#;

// Primary keys and indexes backing a UNIQUE or EXCLUDE constraint are
// represented by the constraint. Expression keys have attnum 0.
const INDEXES_SQL: &str = r#"
SELECT
    t.relname::text AS table_name,
    i.relname::text AS index_name,
    a.attname::text AS column_name,
    k.attnum = 0 AS is_expression,
    ix.indisunique AS is_unique,
    ix.indisprimary AS is_primary,
    am.amname::text AS method
FROM pg_index ix
JOIN pg_class t ON t.oid = ix.indrelid
JOIN pg_class i ON i.oid = ix.indexrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
JOIN pg_am am ON am.oid = i.relam
JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) ON true
LEFT JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
WHERE n.nspname = 'public'
  AND t.relkind = 'r'
  AND NOT ix.indisprimary
  AND NOT EXISTS (
      SELECT 1 FROM pg_constraint con
      WHERE con.conindid = ix.indexrelid
        AND con.conrelid = ix.indrelid
        AND con.contype IN ('p', 'u', 'x')
  )
  AND ($1::text IS NULL OR t.relname = $1)
ORDER BY t.relname, i.relname, k.ord
"#;

/// A constraint together with the table it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConstraint {
    pub table: String,
    pub constraint: Constraint,
}

/// Extract every base table of the `public` schema.
pub async fn get_tables<Q: Querier + ?Sized>(conn: &Q) -> Result<Schema> {
    let columns = query_columns(conn, None).await?;
    let constraints = get_constraints_filtered(conn, None).await?;
    let indexes = get_indexes_filtered(conn, None).await?;

    let schema = assemble(group_columns(columns), constraints, indexes);
    tracing::debug!(
        tables = schema.tables.len(),
        columns = schema.iter_tables().map(|t| t.columns.len()).sum::<usize>(),
        constraints = schema.iter_tables().map(|t| t.constraints.len()).sum::<usize>(),
        indexes = schema.iter_tables().map(|t| t.indexes.len()).sum::<usize>(),
        "extracted schema"
    );
    Ok(schema)
}

/// Extract a single table.
///
/// Fails with [`Error::TableNotFound`] when the table has no visible columns.
pub async fn get_table<Q: Querier + ?Sized>(conn: &Q, name: &str) -> Result<Table> {
    let columns = query_columns(conn, Some(name)).await?;
    if columns.is_empty() {
        return Err(Error::TableNotFound(name.to_string()));
    }
    let constraints = get_constraints_filtered(conn, Some(name)).await?;
    let indexes = get_indexes_filtered(conn, Some(name)).await?;

    let mut schema = assemble(group_columns(columns), constraints, indexes);
    schema
        .tables
        .shift_remove(name)
        .ok_or_else(|| Error::TableNotFound(name.to_string()))
}

/// Extract the columns of a single table, in ordinal order.
pub async fn get_table_schema<Q: Querier + ?Sized>(conn: &Q, name: &str) -> Result<Vec<Column>> {
    let rows = query_columns(conn, Some(name)).await?;
    if rows.is_empty() {
        return Err(Error::TableNotFound(name.to_string()));
    }
    Ok(rows.into_iter().map(|r| r.column).collect())
}

/// All constraints of the `public` schema, grouped by name.
pub async fn get_constraints<Q: Querier + ?Sized>(conn: &Q) -> Result<Vec<TableConstraint>> {
    get_constraints_filtered(conn, None).await
}

/// All indexes of the `public` schema, grouped by name.
pub async fn get_indexes<Q: Querier + ?Sized>(conn: &Q) -> Result<Vec<Index>> {
    get_indexes_filtered(conn, None).await
}

/// Names of the base tables in `public`, sorted.
pub async fn list_tables<Q: Querier + ?Sized>(conn: &Q) -> Result<Vec<String>> {
    let rows = run(conn, "tables", TABLES_SQL, &[]).await?;
    rows.iter()
        .map(|row| decode(row, "table_name", "tables"))
        .collect()
}

async fn get_constraints_filtered<Q: Querier + ?Sized>(
    conn: &Q,
    table: Option<&str>,
) -> Result<Vec<TableConstraint>> {
    let rows = run(conn, "constraints", CONSTRAINTS_SQL, &[&table]).await?;
    let rows = rows
        .iter()
        .map(ConstraintRow::from_row)
        .collect::<Result<Vec<_>>>()?;
    Ok(group_constraints(rows))
}

async fn get_indexes_filtered<Q: Querier + ?Sized>(
    conn: &Q,
    table: Option<&str>,
) -> Result<Vec<Index>> {
    let rows = run(conn, "indexes", INDEXES_SQL, &[&table]).await?;
    let rows = rows
        .iter()
        .map(IndexRow::from_row)
        .collect::<Result<Vec<_>>>()?;
    Ok(group_indexes(rows))
}

async fn query_columns<Q: Querier + ?Sized>(
    conn: &Q,
    table: Option<&str>,
) -> Result<Vec<ColumnRow>> {
    let rows = run(conn, "columns", COLUMNS_SQL, &[&table]).await?;
    rows.iter().map(ColumnRow::from_row).collect()
}

async fn run<Q: Querier + ?Sized>(
    conn: &Q,
    query: &'static str,
    sql: &str,
    params: &[&(dyn ToSql + Sync)],
) -> Result<Vec<Row>> {
    conn.traced()
        .query(sql, params)
        .await
        .map_err(|source| Error::ExtractionFailed { query, source })
}

fn decode<'a, T: FromSql<'a>>(row: &'a Row, column: &str, query: &'static str) -> Result<T> {
    row.try_get::<_, T>(column)
        .map_err(|source| Error::ExtractionFailed { query, source })
}

#[derive(Debug, Clone)]
struct ColumnRow {
    table: String,
    column: Column,
}

impl ColumnRow {
    fn from_row(row: &Row) -> Result<Self> {
        const Q: &str = "columns";
        let column = Column {
            name: decode(row, "column_name", Q)?,
            data_type: decode(row, "data_type", Q)?,
            nullable: decode(row, "nullable", Q)?,
            default: decode(row, "column_default", Q)?,
            max_length: decode(row, "max_length", Q)?,
            numeric_precision: decode(row, "numeric_precision", Q)?,
            numeric_scale: decode(row, "numeric_scale", Q)?,
            position: decode(row, "position", Q)?,
        };
        Ok(Self {
            table: decode(row, "table_name", Q)?,
            column: column.normalized(),
        })
    }
}

#[derive(Debug, Clone, Default)]
struct ConstraintRow {
    table: String,
    name: String,
    kind: String,
    column: Option<String>,
    foreign_table: Option<String>,
    foreign_column: Option<String>,
    on_delete: Option<String>,
    on_update: Option<String>,
    check_clause: Option<String>,
}

impl ConstraintRow {
    fn from_row(row: &Row) -> Result<Self> {
        const Q: &str = "constraints";
        Ok(Self {
            table: decode(row, "table_name", Q)?,
            name: decode(row, "constraint_name", Q)?,
            kind: decode(row, "constraint_type", Q)?,
            column: decode(row, "column_name", Q)?,
            foreign_table: decode(row, "foreign_table", Q)?,
            foreign_column: decode(row, "foreign_column", Q)?,
            on_delete: decode(row, "on_delete", Q)?,
            on_update: decode(row, "on_update", Q)?,
            check_clause: decode(row, "check_clause", Q)?,
        })
    }
}

#[derive(Debug, Clone)]
struct IndexRow {
    table: String,
    name: String,
    /// `None` for an expression key.
    column: Option<String>,
    unique: bool,
    primary: bool,
    method: String,
}

impl IndexRow {
    fn from_row(row: &Row) -> Result<Self> {
        const Q: &str = "indexes";
        Ok(Self {
            table: decode(row, "table_name", Q)?,
            name: decode(row, "index_name", Q)?,
            column: if decode(row, "is_expression", Q)? {
                None
            } else {
                decode(row, "column_name", Q)?
            },
            unique: decode(row, "is_unique", Q)?,
            primary: decode(row, "is_primary", Q)?,
            method: decode(row, "method", Q)?,
        })
    }
}

fn group_columns(rows: Vec<ColumnRow>) -> IndexMap<String, Vec<Column>> {
    let mut tables: IndexMap<String, Vec<Column>> = IndexMap::new();
    for row in rows {
        tables.entry(row.table).or_default().push(row.column);
    }
    tables
}

/// Group per-column constraint rows into one value per (table, name).
fn group_constraints(rows: Vec<ConstraintRow>) -> Vec<TableConstraint> {
    let mut grouped: IndexMap<(String, String), Constraint> = IndexMap::new();

    for row in rows {
        let kind = match row.kind.parse::<ConstraintKind>() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::debug!(constraint = %row.name, "skipping constraint: {}", e);
                continue;
            }
        };

        let constraint = grouped
            .entry((row.table, row.name.clone()))
            .or_insert_with(|| Constraint {
                name: row.name,
                kind,
                columns: Vec::new(),
                foreign_table: None,
                foreign_columns: Vec::new(),
                on_delete: row.on_delete,
                on_update: row.on_update,
                check_clause: row.check_clause,
            });

        if let Some(column) = row.column
            && !constraint.columns.contains(&column)
        {
            constraint.columns.push(column);
            if let Some(foreign_column) = row.foreign_column {
                constraint.foreign_columns.push(foreign_column);
            }
        }
        if constraint.foreign_table.is_none() {
            constraint.foreign_table = row.foreign_table;
        }
    }

    grouped
        .into_iter()
        .map(|((table, _), constraint)| TableConstraint {
            table,
            constraint: classify_not_null(constraint),
        })
        .collect()
}

/// Group per-column index rows into one value per (table, name).
///
/// Indexes with an expression key cannot be represented as column lists and
/// are left out of the snapshot.
fn group_indexes(rows: Vec<IndexRow>) -> Vec<Index> {
    let mut grouped: IndexMap<(String, String), Index> = IndexMap::new();
    let mut expressions: HashSet<(String, String)> = HashSet::new();
    for row in rows {
        let key = (row.table.clone(), row.name.clone());
        let Some(column) = row.column else {
            tracing::debug!(
                table = %row.table,
                index = %row.name,
                "skipping expression index"
            );
            expressions.insert(key);
            continue;
        };
        let index = grouped.entry(key).or_insert_with(|| Index {
            table: row.table,
            name: row.name,
            columns: Vec::new(),
            unique: row.unique,
            method: row.method,
            primary: row.primary,
        });
        index.columns.push(column);
    }
    grouped
        .into_iter()
        .filter(|(key, _)| !expressions.contains(key))
        .map(|(_, index)| index)
        .collect()
}

/// Reclassify a `NOT NULL` check as a [`ConstraintKind::NotNull`] annotation.
///
/// Heuristic: only checks named `*_not_null` whose clause is exactly
/// `<column> IS NOT NULL` qualify. The result is a display hint; nullability
/// itself comes from the column.
fn classify_not_null(mut constraint: Constraint) -> Constraint {
    if constraint.kind != ConstraintKind::Check || !constraint.name.ends_with("_not_null") {
        return constraint;
    }
    let Some(column) = constraint.check_clause.as_deref().and_then(not_null_column) else {
        return constraint;
    };
    constraint.kind = ConstraintKind::NotNull;
    constraint.columns = vec![column];
    constraint
}

fn not_null_column(clause: &str) -> Option<String> {
    let mut clause = clause.trim();
    while let Some(inner) = clause.strip_prefix('(').and_then(|c| c.strip_suffix(')')) {
        clause = inner.trim();
    }

    let mut tokens = clause.split_whitespace();
    let column = tokens.next()?;
    let rest: Vec<&str> = tokens.collect();
    if rest.len() != 3 || !rest.iter().zip(["IS", "NOT", "NULL"]).all(|(a, b)| a.eq_ignore_ascii_case(b)) {
        return None;
    }

    let column = match column.strip_prefix('"').and_then(|c| c.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => column.to_string(),
    };
    Some(column)
}

/// Build tables from grouped columns, attaching constraints and indexes.
///
/// Constraints and indexes whose table has no columns are dropped.
fn assemble(
    columns: IndexMap<String, Vec<Column>>,
    constraints: Vec<TableConstraint>,
    indexes: Vec<Index>,
) -> Schema {
    let mut schema = Schema::new();
    for (name, columns) in columns {
        schema.tables.insert(
            name.clone(),
            Table {
                name,
                columns,
                constraints: Vec::new(),
                indexes: Vec::new(),
            },
        );
    }

    for TableConstraint { table, constraint } in constraints {
        if let Some(t) = schema.tables.get_mut(&table) {
            t.constraints.push(constraint);
        }
    }
    for index in indexes {
        if let Some(t) = schema.tables.get_mut(&index.table) {
            t.indexes.push(index);
        }
    }

    for table in schema.tables.values_mut() {
        table.constraints.sort_by(|a, b| a.name.cmp(&b.name));
        table.indexes.sort_by(|a, b| a.name.cmp(&b.name));
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_row(table: &str, name: &str, kind: &str, column: &str) -> ConstraintRow {
        ConstraintRow {
            table: table.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            column: Some(column.to_string()),
            ..Default::default()
        }
    }

    fn fk_row(name: &str, column: &str, ftable: &str, fcolumn: &str) -> ConstraintRow {
        ConstraintRow {
            foreign_table: Some(ftable.to_string()),
            foreign_column: Some(fcolumn.to_string()),
            ..key_row("line_items", name, "FOREIGN KEY", column)
        }
    }

    fn index_row(table: &str, name: &str, column: &str) -> IndexRow {
        IndexRow {
            table: table.to_string(),
            name: name.to_string(),
            column: Some(column.to_string()),
            unique: false,
            primary: false,
            method: "btree".to_string(),
        }
    }

    #[test]
    fn test_not_null_column() {
        assert_eq!(not_null_column("id IS NOT NULL"), Some("id".to_string()));
        assert_eq!(not_null_column("((id IS NOT NULL))"), Some("id".to_string()));
        assert_eq!(
            not_null_column("\"Full Name\" is not null"),
            Some("Full Name".to_string())
        );
        assert_eq!(not_null_column("price > 0"), None);
        assert_eq!(not_null_column("a IS NOT NULL AND b IS NOT NULL"), None);
        assert_eq!(not_null_column("(a IS NOT NULL) OR (b > 0)"), None);
    }

    #[test]
    fn test_not_null_checks_are_reclassified() {
        let rows = vec![
            ConstraintRow {
                check_clause: Some("id IS NOT NULL".to_string()),
                column: None,
                ..key_row("users", "2200_16385_1_not_null", "CHECK", "")
            },
            ConstraintRow {
                check_clause: Some("balance IS NOT NULL".to_string()),
                column: None,
                ..key_row("users", "users_balance_check", "CHECK", "")
            },
        ];

        let grouped = group_constraints(rows);
        assert_eq!(grouped[0].constraint.kind, ConstraintKind::NotNull);
        assert_eq!(grouped[0].constraint.columns, vec!["id"]);
        // Name does not follow the pattern: stays a real CHECK.
        assert_eq!(grouped[1].constraint.kind, ConstraintKind::Check);
        assert!(grouped[1].constraint.columns.is_empty());
    }

    #[test]
    fn test_composite_constraints_are_grouped() {
        let rows = vec![
            key_row("line_items", "line_items_pkey", "PRIMARY KEY", "order_id"),
            key_row("line_items", "line_items_pkey", "PRIMARY KEY", "line_no"),
            fk_row("line_items_order_fkey", "order_id", "orders", "id"),
            fk_row("line_items_sku_fkey", "warehouse_id", "stock", "warehouse_id"),
            fk_row("line_items_sku_fkey", "sku", "stock", "sku"),
        ];

        let grouped = group_constraints(rows);
        assert_eq!(grouped.len(), 3);

        let pk = &grouped[0].constraint;
        assert_eq!(pk.kind, ConstraintKind::PrimaryKey);
        assert_eq!(pk.columns, vec!["order_id", "line_no"]);

        let fk = &grouped[2].constraint;
        assert_eq!(fk.kind, ConstraintKind::ForeignKey);
        assert_eq!(fk.columns, vec!["warehouse_id", "sku"]);
        assert_eq!(fk.foreign_table.as_deref(), Some("stock"));
        assert_eq!(fk.foreign_columns, vec!["warehouse_id", "sku"]);
    }

    #[test]
    fn test_duplicate_rows_do_not_duplicate_columns() {
        let rows = vec![
            key_row("t", "t_a_key", "UNIQUE", "a"),
            key_row("t", "t_a_key", "UNIQUE", "a"),
        ];
        let grouped = group_constraints(rows);
        assert_eq!(grouped[0].constraint.columns, vec!["a"]);
    }

    #[test]
    fn test_unknown_constraint_kinds_are_skipped() {
        let rows = vec![key_row("t", "t_excl", "EXCLUDE", "a")];
        assert!(group_constraints(rows).is_empty());
    }

    #[test]
    fn test_same_constraint_name_on_two_tables() {
        let rows = vec![
            key_row("a", "shared_key", "UNIQUE", "x"),
            key_row("b", "shared_key", "UNIQUE", "y"),
        ];
        let grouped = group_constraints(rows);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[1].table, "b");
        assert_eq!(grouped[1].constraint.columns, vec!["y"]);
    }

    #[test]
    fn test_composite_indexes_are_grouped() {
        let mut gin = index_row("posts", "idx_posts_tags", "tags");
        gin.method = "gin".to_string();
        let rows = vec![
            index_row("posts", "idx_posts_author_created", "author_id"),
            index_row("posts", "idx_posts_author_created", "created_at"),
            gin,
        ];

        let indexes = group_indexes(rows);
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[0].columns, vec!["author_id", "created_at"]);
        assert_eq!(indexes[1].method, "gin");
    }

    #[test]
    fn test_expression_indexes_are_skipped() {
        let rows = vec![
            index_row("users", "idx_users_lower_email", "tenant_id"),
            IndexRow {
                column: None,
                ..index_row("users", "idx_users_lower_email", "")
            },
            index_row("users", "idx_users_tenant", "tenant_id"),
        ];

        let indexes = group_indexes(rows);
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "idx_users_tenant");
    }

    #[test]
    fn test_assemble_groups_by_table() {
        let column = |table: &str, name: &str, position: i32| ColumnRow {
            table: table.to_string(),
            column: Column {
                position,
                ..Column::new(name, "integer")
            },
        };
        let columns = group_columns(vec![
            column("orders", "id", 1),
            column("orders", "total", 2),
            column("users", "id", 1),
        ]);
        let constraints = group_constraints(vec![
            key_row("users", "users_pkey", "PRIMARY KEY", "id"),
            key_row("orders", "orders_pkey", "PRIMARY KEY", "id"),
            key_row("gone", "gone_pkey", "PRIMARY KEY", "id"),
        ]);
        let indexes = group_indexes(vec![
            index_row("orders", "orders_total_idx", "total"),
            index_row("orders", "orders_a_idx", "id"),
        ]);

        let schema = assemble(columns, constraints, indexes);
        assert_eq!(schema.tables.len(), 2);

        let orders = schema.get_table("orders").unwrap();
        assert_eq!(orders.columns.len(), 2);
        assert_eq!(orders.primary_key_columns(), vec!["id"]);
        let names: Vec<&str> = orders.indexes.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["orders_a_idx", "orders_total_idx"]);

        assert_eq!(schema.get_table("users").unwrap().constraints.len(), 1);
    }
}
