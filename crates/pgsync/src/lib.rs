//! Introspect, render and diff per-tenant Postgres schemas.
//!
//! This crate provides:
//! - Schema introspection of a live database into [`Table`] snapshots ([`introspect`])
//! - `CREATE TABLE` / `CREATE INDEX` rendering ([`render`])
//! - Snapshot diffing into ordered, re-runnable DDL ([`diff`])
//! - A transactional sync that reconciles a tenant database with its desired schema ([`sync`])
//!
//! Everything goes through the [`Querier`] trait, so any `tokio_postgres::Client`
//! or pooled `deadpool_postgres::Object` works.
//!
//! # Diffing two snapshots
//!
//! ```
//! use pgsync::{Column, RenameRelation, Table, diff_tables};
//!
//! let old = Table::new("users", vec![
//!     Column::new("id", "integer").not_null(),
//!     Column::new("name", "character varying").not_null().with_max_length(50),
//! ]);
//! let new = Table::new("users", vec![
//!     Column::new("id", "integer").not_null(),
//!     Column::new("full_name", "character varying").not_null().with_max_length(100),
//! ]);
//!
//! let diff = diff_tables(&old, &new, &[RenameRelation::new("name", "full_name")]).unwrap();
//! assert_eq!(
//!     diff.to_sql(),
//!     "ALTER TABLE \"users\" RENAME COLUMN \"name\" TO \"full_name\";\n\
//!      ALTER TABLE \"users\" ALTER COLUMN \"full_name\" TYPE VARCHAR(100);"
//! );
//! ```
//!
//! # Syncing a tenant
//!
//! ```ignore
//! let report = pgsync::sync_schema(&client, &project, &desired, &SyncOptions::default()).await?;
//! if report.is_noop() {
//!     tracing::debug!("schema already up to date");
//! }
//! ```

pub mod diff;
mod error;
mod ident;
pub mod introspect;
pub mod render;
pub mod sync;
mod traced;

pub use diff::{Change, SchemaDiff, TableDiff, diff_schemas, diff_tables};
pub use error::Error;
pub use ident::{Ident, quote_ident, quote_idents};
pub use introspect::{get_table, get_table_schema, get_tables};
pub use render::{create_index_sql, create_table_sql, schema_to_sql};
pub use sync::{
    DesiredSchema, ProjectId, SchemaSource, SyncOptions, SyncPlan, SyncReport, Synchronizer,
    TableTarget, plan_sync, sync_schema,
};
pub use traced::{Querier, QuerierExt, QueryFuture, TracedConn};

pub use pgsync_schema::{
    Column, Constraint, ConstraintKind, Index, RenameRelation, Schema, SnapshotError, Table,
    TypeFamily, canonical_type, format_type, is_serial_type,
};

/// Result type for pgsync operations.
pub type Result<T> = std::result::Result<T, Error>;
