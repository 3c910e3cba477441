//! Reconcile a tenant database with its desired schema.
//!
//! [`sync_schema`] runs inside one transaction:
//!
//! 1. `BEGIN`
//! 2. take the per-project advisory lock (`pg_advisory_xact_lock`)
//! 3. extract the current schema
//! 4. plan the changes against the desired schema ([`plan_sync`])
//! 5. execute each statement, then `COMMIT`
//!
//! Any failure rolls the whole transaction back, so a sync either applies
//! completely or not at all. Because the current schema is extracted inside
//! the transaction, a retried sync re-diffs against the real state instead
//! of replaying statements.

use crate::diff::{Change, TableDiff, diff_tables};
use crate::render::{ForeignKeys, create_table_statement, foreign_key_statements, index_statements};
use crate::{Error, Querier, QuerierExt, Result, introspect};
use pgsync_schema::{RenameRelation, Schema, Table};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

/// Identifier of a tenant project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Advisory lock key for this project: the first 8 bytes of the blake3
    /// hash of the id.
    pub fn lock_key(&self) -> i64 {
        let hash = blake3::hash(self.0.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        i64::from_be_bytes(bytes)
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ProjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The desired state of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTarget {
    /// The table as it should be.
    pub table: Table,
    /// The name the table had before, when it was renamed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_name: Option<String>,
    /// Column renames since the previous sync.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub renames: Vec<RenameRelation>,
}

impl TableTarget {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            previous_name: None,
            renames: Vec::new(),
        }
    }

    /// Mark the table as renamed from `name`.
    pub fn renamed_from(mut self, name: impl Into<String>) -> Self {
        self.previous_name = Some(name.into());
        self
    }

    /// Record a column rename.
    pub fn with_rename(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.renames.push(RenameRelation::new(old, new));
        self
    }
}

/// The authoritative desired schema of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSchema {
    pub tables: Vec<TableTarget>,
}

impl DesiredSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, target: TableTarget) -> Self {
        self.tables.push(target);
        self
    }
}

impl From<Schema> for DesiredSchema {
    fn from(schema: Schema) -> Self {
        Self {
            tables: schema.tables.into_values().map(TableTarget::new).collect(),
        }
    }
}

/// Boxed future returned by [`SchemaSource`].
pub type SourceFuture<'a> = Pin<Box<dyn Future<Output = Result<DesiredSchema>> + Send + 'a>>;

/// Supplies the desired schema of a project, typically from the
/// table-management metadata.
pub trait SchemaSource: Send + Sync {
    fn desired_schema<'a>(&'a self, project: &'a ProjectId) -> SourceFuture<'a>;
}

/// A fixed desired schema, whatever the project.
impl SchemaSource for DesiredSchema {
    fn desired_schema<'a>(&'a self, _project: &'a ProjectId) -> SourceFuture<'a> {
        Box::pin(async move { Ok(self.clone()) })
    }
}

/// Options for [`sync_schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Serialize syncs of the same project with a transaction-scoped
    /// advisory lock.
    pub lock: bool,
    /// Plan, then roll back without executing anything.
    pub dry_run: bool,
    /// Drop tables that no target names.
    pub drop_unknown_tables: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            lock: true,
            dry_run: false,
            drop_unknown_tables: false,
        }
    }
}

/// The statements a sync will execute, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    /// Per-table changes, for display.
    pub diffs: Vec<TableDiff>,
    /// Statements in execution order.
    pub statements: Vec<String>,
    /// Names of the tables touched, sorted.
    pub tables_changed: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Plan the statements that bring `current` to `desired`.
///
/// Each target is matched to the current table of the same name, or else to
/// its `previous_name`. Matched tables are diffed; unmatched targets are
/// created. Statements run in this order: new tables (without foreign keys),
/// changes to existing tables, foreign keys of new tables, indexes of new
/// tables, then drops of unknown tables when enabled.
pub fn plan_sync(current: &Schema, desired: &DesiredSchema, options: &SyncOptions) -> Result<SyncPlan> {
    let mut targets: Vec<&TableTarget> = Vec::new();
    let mut seen = HashSet::new();
    for target in &desired.tables {
        if seen.insert(target.table.name.as_str()) {
            targets.push(target);
        } else {
            tracing::warn!(table = %target.table.name, "duplicate table target, ignoring");
        }
    }
    targets.sort_by(|a, b| a.table.name.cmp(&b.table.name));

    let mut claimed: HashSet<&str> = HashSet::new();
    let mut diffs = Vec::new();
    let mut created: Vec<&Table> = Vec::new();

    for target in targets {
        let existing = current.get_table(&target.table.name).or_else(|| {
            target
                .previous_name
                .as_deref()
                .and_then(|name| current.get_table(name))
        });

        let Some(table) = existing.filter(|t| claimed.insert(t.name.as_str())) else {
            created.push(&target.table);
            continue;
        };
        match diff_tables(table, &target.table, &target.renames) {
            Ok(diff) => diffs.push(diff),
            Err(Error::NoChanges) => {}
            Err(e) => return Err(e),
        }
    }

    let mut statements = Vec::new();
    let mut create_diffs = Vec::new();
    for table in &created {
        let sql = create_table_statement(table, ForeignKeys::Deferred)?;
        statements.push(sql.clone());
        create_diffs.push(TableDiff {
            table: table.name.clone(),
            changes: vec![Change::CreateTable {
                name: table.name.clone(),
                sql,
            }],
        });
    }
    for diff in &diffs {
        statements.extend(diff.statements());
    }
    for table in &created {
        statements.extend(foreign_key_statements(table)?);
    }
    for table in &created {
        statements.extend(index_statements(table));
    }

    let mut drop_diffs = Vec::new();
    if options.drop_unknown_tables {
        for table in current.sorted_tables() {
            if claimed.contains(table.name.as_str()) {
                continue;
            }
            let change = Change::DropTable(table.name.clone());
            statements.push(change.to_sql(&table.name));
            drop_diffs.push(TableDiff {
                table: table.name.clone(),
                changes: vec![change],
            });
        }
    }

    let mut diffs: Vec<TableDiff> = create_diffs.into_iter().chain(diffs).chain(drop_diffs).collect();
    diffs.sort_by(|a, b| a.table.cmp(&b.table));
    let tables_changed = diffs.iter().map(|d| d.table.clone()).collect();

    Ok(SyncPlan {
        diffs,
        statements,
        tables_changed,
    })
}

/// Outcome of a sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub project: ProjectId,
    /// Statements planned (and executed, unless `applied` is false).
    pub statements: Vec<String>,
    /// Names of the tables touched, sorted.
    pub tables_changed: Vec<String>,
    /// Whether the statements were committed.
    pub applied: bool,
}

impl SyncReport {
    /// True when the database already matched the desired schema.
    pub fn is_noop(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Bring the database behind `conn` to `desired`, in one transaction.
///
/// An already up-to-date database is a successful no-op. A failing statement
/// rolls everything back and returns [`Error::SyncFailed`].
pub async fn sync_schema<Q: Querier + ?Sized>(
    conn: &Q,
    project: &ProjectId,
    desired: &DesiredSchema,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let db = conn.traced();
    db.batch_execute("BEGIN").await?;

    match sync_in_transaction(conn, project, desired, options).await {
        Ok(report) if report.applied => {
            db.batch_execute("COMMIT")
                .await
                .map_err(|source| Error::SyncFailed {
                    project: project.to_string(),
                    statement: None,
                    source,
                })?;
            tracing::info!(
                project = %project,
                statements = report.statements.len(),
                tables = ?report.tables_changed,
                "applied schema changes"
            );
            Ok(report)
        }
        Ok(report) => {
            // Nothing to commit: dry run or already up to date.
            let end = if report.is_noop() { "COMMIT" } else { "ROLLBACK" };
            db.batch_execute(end).await?;
            tracing::debug!(
                project = %project,
                statements = report.statements.len(),
                "schema sync made no changes"
            );
            Ok(report)
        }
        Err(e) => {
            tracing::warn!(project = %project, error = %e, "schema sync failed, rolling back");
            if let Err(rollback) = db.batch_execute("ROLLBACK").await {
                tracing::warn!(project = %project, error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

async fn sync_in_transaction<Q: Querier + ?Sized>(
    conn: &Q,
    project: &ProjectId,
    desired: &DesiredSchema,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let db = conn.traced();
    let failed = |statement: Option<String>| {
        let project = project.to_string();
        move |source: tokio_postgres::Error| Error::SyncFailed {
            project,
            statement,
            source,
        }
    };

    if options.lock {
        let key = project.lock_key();
        db.execute("SELECT pg_advisory_xact_lock($1)", &[&key])
            .await
            .map_err(failed(None))?;
    }

    let current = introspect::get_tables(conn).await?;
    let plan = plan_sync(&current, desired, options)?;

    let mut report = SyncReport {
        project: project.clone(),
        statements: plan.statements,
        tables_changed: plan.tables_changed,
        applied: false,
    };
    if report.is_noop() || options.dry_run {
        return Ok(report);
    }

    for statement in &report.statements {
        db.execute(statement.as_str(), &[])
            .await
            .map_err(failed(Some(statement.clone())))?;
    }
    report.applied = true;
    Ok(report)
}

/// Syncs projects against the desired schemas of a [`SchemaSource`].
pub struct Synchronizer<S> {
    source: S,
    options: SyncOptions,
}

impl<S: SchemaSource> Synchronizer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Fetch the desired schema of `project` and sync `conn` to it.
    pub async fn sync<Q: Querier + ?Sized>(&self, conn: &Q, project: &ProjectId) -> Result<SyncReport> {
        let desired = self.source.desired_schema(project).await?;
        sync_schema(conn, project, &desired, &self.options).await
    }
}
