//! Desired schemas read from JSON files.

use std::path::PathBuf;

use pgsync::sync::SourceFuture;
use pgsync::{DesiredSchema, Error, ProjectId, Schema, SchemaSource};

/// A [`SchemaSource`] backed by one JSON file, read on every sync.
///
/// The file holds either a desired schema (`{"tables": [{"table": ..,
/// "renames": ..}]}`) or a plain schema snapshot.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SchemaSource for FileSource {
    fn desired_schema<'a>(&'a self, project: &'a ProjectId) -> SourceFuture<'a> {
        Box::pin(async move {
            let unavailable = |reason: String| Error::Source {
                project: project.to_string(),
                reason: format!("{}: {reason}", self.path.display()),
            };
            let content = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| unavailable(e.to_string()))?;
            let desired = parse_desired(&content).map_err(|e| unavailable(e.to_string()))?;
            tracing::debug!(
                project = %project,
                path = %self.path.display(),
                tables = desired.tables.len(),
                "loaded desired schema"
            );
            Ok(desired)
        })
    }
}

fn parse_desired(content: &str) -> Result<DesiredSchema, serde_json::Error> {
    match serde_json::from_str::<DesiredSchema>(content) {
        Ok(desired) => Ok(desired),
        Err(first) => Schema::from_json(content)
            .map(DesiredSchema::from)
            .map_err(|_| first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsync::{Column, Table, TableTarget};

    #[tokio::test]
    async fn test_reads_desired_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desired.json");
        let desired = DesiredSchema::new().with_table(
            TableTarget::new(Table::new("users", vec![Column::new("full_name", "text")]))
                .with_rename("name", "full_name"),
        );
        std::fs::write(&path, serde_json::to_string(&desired).unwrap()).unwrap();

        let loaded = FileSource::new(&path)
            .desired_schema(&ProjectId::new("acme"))
            .await
            .unwrap();
        assert_eq!(loaded, desired);
    }

    #[tokio::test]
    async fn test_reads_plain_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        let schema = Schema::from_tables([Table::new("users", vec![Column::new("id", "bigint")])]);
        std::fs::write(&path, schema.to_json().unwrap()).unwrap();

        let loaded = FileSource::new(&path)
            .desired_schema(&ProjectId::new("acme"))
            .await
            .unwrap();
        assert_eq!(loaded.tables.len(), 1);
        assert_eq!(loaded.tables[0].table.name, "users");
    }

    #[tokio::test]
    async fn test_unreadable_files_are_source_errors() {
        let dir = tempfile::tempdir().unwrap();
        let project = ProjectId::new("acme");

        let missing = FileSource::new(dir.path().join("missing.json"));
        assert!(matches!(
            missing.desired_schema(&project).await,
            Err(Error::Source { project, .. }) if project == "acme"
        ));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FileSource::new(&path).desired_schema(&project).await.unwrap_err();
        assert!(matches!(err, Error::Source { ref reason, .. } if reason.contains("broken.json")));
    }
}
