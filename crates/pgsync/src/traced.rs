//! The `Querier` seam and a tracing wrapper around it.
//!
//! Everything in this crate talks to Postgres through [`Querier`]. It is
//! implemented for `tokio_postgres::Client` and `deadpool_postgres::Object`,
//! and [`TracedConn`] wraps any querier so every call is logged via tracing.

use std::future::Future;
use std::pin::Pin;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Error, Row};
use tracing::Instrument;

/// Boxed future returned by [`Querier`] methods.
pub type QueryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// A connection (or connection-like handle) that can run SQL.
pub trait Querier: Send + Sync {
    /// Execute a statement, returning the number of rows affected.
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, u64>;

    /// Execute a query, returning all rows.
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, Vec<Row>>;

    /// Execute one or more parameterless statements (transaction control).
    fn batch_execute<'a>(&'a self, sql: &'a str) -> QueryFuture<'a, ()>;
}

impl<Q: Querier + ?Sized> Querier for &Q {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, u64> {
        (**self).execute(sql, params)
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, Vec<Row>> {
        (**self).query(sql, params)
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> QueryFuture<'a, ()> {
        (**self).batch_execute(sql)
    }
}

impl Querier for tokio_postgres::Client {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, u64> {
        Box::pin(tokio_postgres::Client::execute(self, sql, params))
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, Vec<Row>> {
        Box::pin(tokio_postgres::Client::query(self, sql, params))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> QueryFuture<'a, ()> {
        Box::pin(tokio_postgres::Client::batch_execute(self, sql))
    }
}

impl Querier for deadpool_postgres::Object {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, u64> {
        // Deref to the underlying Client to avoid recursion
        use std::ops::Deref;
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(client.execute(sql, params))
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, Vec<Row>> {
        use std::ops::Deref;
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(client.query(sql, params))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> QueryFuture<'a, ()> {
        use std::ops::Deref;
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(client.batch_execute(sql))
    }
}

/// A wrapper around a [`Querier`] that logs all calls via tracing.
///
/// Each call runs inside a `db.execute` or `db.query` debug span carrying the
/// SQL, the parameter count, and the affected/returned row count.
///
/// ```ignore
/// use pgsync::QuerierExt;
///
/// let traced = client.traced();
/// let rows = traced.query("SELECT 1", &[]).await?;
/// ```
pub struct TracedConn<'c, Q: Querier + ?Sized> {
    conn: &'c Q,
}

impl<'c, Q: Querier + ?Sized> TracedConn<'c, Q> {
    /// Create a new traced wrapper.
    pub fn new(conn: &'c Q) -> Self {
        Self { conn }
    }
}

impl<Q: Querier + ?Sized> Querier for TracedConn<'_, Q> {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, u64> {
        let span = tracing::debug_span!(
            "db.execute",
            sql = %sql,
            params = params.len(),
            affected = tracing::field::Empty,
        );
        Box::pin(async move {
            let affected = self
                .conn
                .execute(sql, params)
                .instrument(span.clone())
                .await?;
            span.record("affected", affected);
            Ok(affected)
        })
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> QueryFuture<'a, Vec<Row>> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = tracing::field::Empty,
        );
        Box::pin(async move {
            let rows = self
                .conn
                .query(sql, params)
                .instrument(span.clone())
                .await?;
            span.record("rows", rows.len());
            Ok(rows)
        })
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> QueryFuture<'a, ()> {
        let span = tracing::debug_span!("db.batch_execute", sql = %sql);
        Box::pin(self.conn.batch_execute(sql).instrument(span))
    }
}

/// Extension trait to get a traced wrapper from a querier.
pub trait QuerierExt: Querier {
    /// Wrap this querier in a [`TracedConn`].
    fn traced(&self) -> TracedConn<'_, Self> {
        TracedConn::new(self)
    }
}

impl<Q: Querier + ?Sized> QuerierExt for Q {}
