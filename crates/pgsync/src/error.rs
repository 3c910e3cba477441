use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("schema extraction failed ({query}): {source}")]
    ExtractionFailed {
        query: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("table {0:?} not found")]
    TableNotFound(String),

    /// The diff is empty. Callers treat this as success.
    #[error("no changes")]
    NoChanges,

    #[error("cannot render table {table:?}: {reason}")]
    Render { table: String, reason: String },

    #[error("invalid rename for table {table:?}: {reason}")]
    InvalidRename { table: String, reason: String },

    #[error("sync of project {project} failed{}: {source}", at_statement(.statement))]
    SyncFailed {
        project: String,
        statement: Option<String>,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("desired schema for project {project} unavailable: {reason}")]
    Source { project: String, reason: String },

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

fn at_statement(statement: &Option<String>) -> String {
    statement
        .as_deref()
        .map(|s| format!(" at `{s}`"))
        .unwrap_or_default()
}

impl Error {
    /// True for [`Error::NoChanges`], which signals "nothing to synchronize".
    pub fn is_no_changes(&self) -> bool {
        matches!(self, Error::NoChanges)
    }
}
