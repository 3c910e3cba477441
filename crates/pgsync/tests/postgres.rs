//! Integration tests against real PostgreSQL.
//!
//! These tests verify that:
//! 1. Rendered DDL executes, and extracting it back yields the same tables
//! 2. Diffs apply cleanly, and drop-only diffs can be applied twice
//! 3. Syncs are transactional: a failing statement leaves nothing behind
//!
//! Run with: cargo test -p pgsync --features test-postgres --test postgres
//!
//! Note: Requires Docker, unless POSTGRES_HOST / POSTGRES_PORT point at a
//! running server.
#![cfg(feature = "test-postgres")]

use pgsync::introspect::{get_constraints, get_indexes, list_tables};
use pgsync::{
    Column, Constraint, ConstraintKind, DesiredSchema, Error, Index, ProjectId, RenameRelation,
    Schema, SyncOptions, Table, TableTarget, diff_tables, get_table, get_table_schema, get_tables,
    schema_to_sql, sync_schema,
};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls};

/// Keeps the container alive for as long as the client is in use.
struct TestDb {
    client: Client,
    _container: Option<ContainerAsync<Postgres>>,
}

async fn setup_postgres() -> TestDb {
    let (host, port, container) = match (
        std::env::var("POSTGRES_HOST"),
        std::env::var("POSTGRES_PORT"),
    ) {
        (Ok(host), Ok(port)) => (host, port.parse::<u16>().unwrap(), None),
        _ => {
            let container = Postgres::default()
                .start()
                .await
                .expect("failed to start postgres container");
            let host = container.get_host().await.unwrap().to_string();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            (host, port, Some(container))
        }
    };

    let conn_str = format!("host={host} port={port} user=postgres password=postgres dbname=postgres");

    let mut attempts = 0;
    let (client, connection) = loop {
        attempts += 1;
        match tokio_postgres::connect(&conn_str, NoTls).await {
            Ok(result) => break result,
            Err(e) if attempts < 10 => {
                eprintln!("connection attempt {attempts} failed: {e}, retrying...");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => panic!("failed to connect to postgres after {attempts} attempts: {e}"),
        }
    };

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {}", e);
        }
    });

    // A shared server may hold tables from a previous run.
    client
        .batch_execute("DROP SCHEMA public CASCADE; CREATE SCHEMA public;")
        .await
        .unwrap();

    TestDb {
        client,
        _container: container,
    }
}

fn authors() -> Table {
    Table::new(
        "authors",
        vec![
            Column::new("id", "bigint").not_null(),
            Column::new("email", "character varying")
                .not_null()
                .with_max_length(255),
            Column::new("name", "character varying").with_max_length(50),
            Column::new("country", "character").with_max_length(2),
            Column::new("created_at", "timestamp with time zone")
                .not_null()
                .with_default("now()"),
        ],
    )
    .with_constraint(Constraint::primary_key("authors_pkey", &["id"]))
    .with_constraint(Constraint::unique("authors_email_key", &["email"]))
}

fn books() -> Table {
    Table::new(
        "books",
        vec![
            Column::new("author_id", "bigint").not_null(),
            Column::new("edition", "integer").not_null(),
            Column::new("title", "text").not_null(),
            Column::new("price", "numeric").with_precision(10, Some(2)),
            Column::new("stock", "integer").not_null(),
            Column::new("meta", "jsonb"),
            Column::new("published", "boolean"),
        ],
    )
    .with_constraint(Constraint::primary_key("books_pkey", &["author_id", "edition"]))
    .with_constraint(
        Constraint::foreign_key("books_author_id_fkey", &["author_id"], "authors", &["id"])
            .on_delete("CASCADE"),
    )
    .with_constraint(Constraint::check("books_stock_check", "stock >= 0"))
    .with_index(Index::new("", "idx_books_title_edition", &["title", "edition"]))
    .with_index(Index::new("", "idx_books_meta", &["meta"]).using("gin"))
}

fn reviews() -> Table {
    Table::new(
        "reviews",
        vec![
            Column::new("id", "bigint").not_null(),
            Column::new("author_id", "bigint").not_null(),
            Column::new("edition", "integer").not_null(),
        ],
    )
    .with_constraint(Constraint::primary_key("reviews_pkey", &["id"]))
    .with_constraint(Constraint::foreign_key(
        "reviews_book_fkey",
        &["edition", "author_id"],
        "books",
        &["edition", "author_id"],
    ))
}

#[tokio::test]
async fn test_render_then_extract_round_trip() {
    let db = setup_postgres().await;
    // Composite foreign keys need a matching key, so add a unique one.
    let books = books().with_constraint(Constraint::unique(
        "books_edition_author_key",
        &["edition", "author_id"],
    ));
    let schema = Schema::from_tables([authors(), books, reviews()]);

    db.client
        .batch_execute(&schema_to_sql(&schema).unwrap())
        .await
        .unwrap();

    let extracted = get_tables(&db.client).await.unwrap();
    assert_eq!(extracted.tables.len(), 3);

    for table in schema.iter_tables() {
        let actual = extracted.get_table(&table.name).unwrap();
        assert_eq!(actual.columns, table.columns, "columns of {}", table.name);
        assert!(
            diff_tables(table, actual, &[]).unwrap_err().is_no_changes(),
            "{} changed on round trip",
            table.name
        );
    }

    let reviews = extracted.get_table("reviews").unwrap();
    let fk = reviews.constraint("reviews_book_fkey").unwrap();
    assert_eq!(fk.columns, vec!["edition", "author_id"]);
    assert_eq!(fk.foreign_columns, vec!["edition", "author_id"]);

    let books = extracted.get_table("books").unwrap();
    assert_eq!(books.primary_key_columns(), vec!["author_id", "edition"]);
    assert_eq!(
        books.constraint("books_author_id_fkey").unwrap().on_delete.as_deref(),
        Some("CASCADE")
    );
    // The unique constraint's backing index is not listed as an index.
    let index_names: Vec<&str> = books.indexes.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(index_names, vec!["idx_books_meta", "idx_books_title_edition"]);
    assert_eq!(books.index("idx_books_meta").unwrap().method, "gin");
    // NOT NULL bookkeeping, when reported, is a hint only.
    assert!(
        books
            .constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::NotNull)
            .all(|c| c.columns.len() == 1)
    );
}

#[tokio::test]
async fn test_single_table_variants() {
    let db = setup_postgres().await;
    let schema = Schema::from_tables([authors(), books()]);
    db.client
        .batch_execute(&schema_to_sql(&schema).unwrap())
        .await
        .unwrap();

    assert_eq!(list_tables(&db.client).await.unwrap(), vec!["authors", "books"]);

    let table = get_table(&db.client, "authors").await.unwrap();
    assert_eq!(table.columns.len(), 5);

    let columns = get_table_schema(&db.client, "books").await.unwrap();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["author_id", "edition", "title", "price", "stock", "meta", "published"]
    );

    assert!(matches!(
        get_table(&db.client, "missing").await,
        Err(Error::TableNotFound(name)) if name == "missing"
    ));
    assert!(matches!(
        get_table_schema(&db.client, "missing").await,
        Err(Error::TableNotFound(_))
    ));

    let constraints = get_constraints(&db.client).await.unwrap();
    assert!(
        constraints
            .iter()
            .any(|c| c.table == "books" && c.constraint.name == "books_stock_check")
    );
    let indexes = get_indexes(&db.client).await.unwrap();
    assert_eq!(indexes.len(), 2);
    assert!(indexes.iter().all(|i| i.table == "books"));
}

#[tokio::test]
async fn test_rename_scenario_applies() {
    let db = setup_postgres().await;
    let project = ProjectId::new("rename-scenario");

    let v1 = Table::new(
        "users",
        vec![
            Column::new("id", "integer").not_null(),
            Column::new("name", "character varying")
                .not_null()
                .with_max_length(50),
        ],
    )
    .with_constraint(Constraint::primary_key("users_pkey", &["id"]));
    let v2 = Table::new(
        "users",
        vec![
            Column::new("id", "integer").not_null(),
            Column::new("full_name", "character varying")
                .not_null()
                .with_max_length(100),
            Column::new("created_at", "timestamp without time zone").not_null(),
        ],
    )
    .with_constraint(Constraint::primary_key("users_pkey", &["id"]));

    let options = SyncOptions::default();
    let desired = DesiredSchema::new().with_table(TableTarget::new(v1));
    sync_schema(&db.client, &project, &desired, &options).await.unwrap();
    db.client
        .execute("INSERT INTO users (id, name) VALUES (1, 'Ada')", &[])
        .await
        .unwrap();
    db.client.execute("DELETE FROM users", &[]).await.unwrap();

    let desired = DesiredSchema::new()
        .with_table(TableTarget::new(v2.clone()).with_rename("name", "full_name"));
    let report = sync_schema(&db.client, &project, &desired, &options).await.unwrap();
    assert!(report.applied);
    assert!(!report.statements.iter().any(|s| s.contains("DROP COLUMN")));

    let users = get_table(&db.client, "users").await.unwrap();
    assert_eq!(users.columns, v2.columns);

    // Re-running the same sync is a no-op, even with the rename still listed.
    let report = sync_schema(&db.client, &project, &desired, &options).await.unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn test_drop_diff_applies_twice() {
    let db = setup_postgres().await;
    let old = books().with_index(Index::new("", "idx_books_stock", &["stock"]));
    db.client
        .batch_execute(&schema_to_sql(&Schema::from_tables([authors(), old.clone()])).unwrap())
        .await
        .unwrap();

    let mut new = old.clone();
    new.columns.retain(|c| c.name != "published");
    new.constraints.retain(|c| c.name != "books_stock_check");
    new.indexes.retain(|i| i.name != "idx_books_stock");

    let diff = diff_tables(&old, &new, &[]).unwrap();
    assert_eq!(diff.changes.len(), 3);
    for _ in 0..2 {
        for statement in diff.statements() {
            db.client.batch_execute(&statement).await.unwrap();
        }
    }

    let extracted = get_table(&db.client, "books").await.unwrap();
    assert!(diff_tables(&new, &extracted, &[]).unwrap_err().is_no_changes());
}

#[tokio::test]
async fn test_failed_sync_rolls_back() {
    let db = setup_postgres().await;
    let project = ProjectId::new("rollback");
    let options = SyncOptions::default();

    let desired = DesiredSchema::new().with_table(TableTarget::new(authors()));
    sync_schema(&db.client, &project, &desired, &options).await.unwrap();
    db.client
        .execute("INSERT INTO authors (id, email) VALUES (1, 'ada@example.com')", &[])
        .await
        .unwrap();

    // A new NOT NULL column without a default cannot be added to a table
    // with rows. The new "audit" table is created first and must vanish too.
    let mut authors_v2 = authors();
    authors_v2.columns.push(Column {
        position: 6,
        ..Column::new("rank", "integer").not_null()
    });
    let audit = Table::new("audit", vec![Column::new("at", "timestamp with time zone")]);
    let desired = DesiredSchema::new()
        .with_table(TableTarget::new(authors_v2))
        .with_table(TableTarget::new(audit));

    let err = sync_schema(&db.client, &project, &desired, &options)
        .await
        .unwrap_err();
    match err {
        Error::SyncFailed {
            project: failed_project,
            statement,
            ..
        } => {
            assert_eq!(failed_project, "rollback");
            assert!(statement.unwrap().contains("ADD COLUMN \"rank\""));
        }
        other => panic!("expected SyncFailed, got {other:?}"),
    }

    assert_eq!(list_tables(&db.client).await.unwrap(), vec!["authors"]);
    let authors = get_table(&db.client, "authors").await.unwrap();
    assert!(authors.column("rank").is_none());
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let db = setup_postgres().await;
    let options = SyncOptions {
        dry_run: true,
        ..SyncOptions::default()
    };
    let desired = DesiredSchema::from(Schema::from_tables([authors()]));

    let report = sync_schema(&db.client, &ProjectId::new("dry"), &desired, &options)
        .await
        .unwrap();
    assert!(!report.applied);
    assert_eq!(report.tables_changed, vec!["authors"]);
    assert!(list_tables(&db.client).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_table_rename_by_previous_name() {
    let db = setup_postgres().await;
    let project = ProjectId::new("table-rename");
    let options = SyncOptions::default();

    let writers = Table {
        name: "writers".to_string(),
        ..authors()
    };
    let desired = DesiredSchema::new().with_table(TableTarget::new(writers));
    sync_schema(&db.client, &project, &desired, &options).await.unwrap();

    let desired = DesiredSchema::new().with_table(
        TableTarget::new(authors())
            .renamed_from("writers")
            .with_rename("name", "display_name"),
    );
    // "display_name" is not a column of the new table.
    assert!(matches!(
        sync_schema(&db.client, &project, &desired, &options).await,
        Err(Error::InvalidRename { .. })
    ));

    let desired = DesiredSchema::new().with_table(TableTarget::new(authors()).renamed_from("writers"));
    let report = sync_schema(&db.client, &project, &desired, &options).await.unwrap();
    assert_eq!(report.statements, vec!["ALTER TABLE \"writers\" RENAME TO \"authors\";"]);
    assert_eq!(list_tables(&db.client).await.unwrap(), vec!["authors"]);

    // Same constraint names: the renamed table keeps them.
    let extracted = get_table(&db.client, "authors").await.unwrap();
    let renames: [RenameRelation; 0] = [];
    assert!(diff_tables(&authors(), &extracted, &renames).unwrap_err().is_no_changes());
}

#[tokio::test]
async fn test_same_constraint_names_on_two_tables() {
    let db = setup_postgres().await;
    db.client
        .batch_execute(
            r#"
            CREATE TABLE users (id bigint PRIMARY KEY);
            CREATE TABLE orgs (id bigint PRIMARY KEY);
            CREATE TABLE a (
                owner bigint,
                qty integer,
                CONSTRAINT fk_owner FOREIGN KEY (owner) REFERENCES users (id),
                CONSTRAINT qty_check CHECK (qty > 0)
            );
            CREATE TABLE b (
                owner bigint,
                qty integer,
                CONSTRAINT fk_owner FOREIGN KEY (owner) REFERENCES orgs (id) ON DELETE CASCADE,
                CONSTRAINT qty_check CHECK (qty < 100)
            );
            "#,
        )
        .await
        .unwrap();

    let schema = get_tables(&db.client).await.unwrap();
    for (table, target, on_delete, check) in [
        ("a", "users", None, "qty > 0"),
        ("b", "orgs", Some("CASCADE"), "qty < 100"),
    ] {
        let t = schema.get_table(table).unwrap();
        let fk = t.constraint("fk_owner").unwrap();
        assert_eq!(fk.foreign_table.as_deref(), Some(target), "fk of {table}");
        assert_eq!(fk.columns, vec!["owner"]);
        assert_eq!(fk.foreign_columns, vec!["id"]);
        assert_eq!(fk.on_delete.as_deref(), on_delete);

        let clause = t.constraint("qty_check").unwrap().check_clause.clone().unwrap();
        assert!(clause.contains(check), "check of {table}: {clause}");
    }

    // Single-table extraction sees the same thing.
    let b = get_table(&db.client, "b").await.unwrap();
    assert_eq!(
        b.constraint("fk_owner").unwrap().foreign_table.as_deref(),
        Some("orgs")
    );
}

#[tokio::test]
async fn test_repeated_sync_settles() {
    let db = setup_postgres().await;
    let project = ProjectId::new("settle");
    let options = SyncOptions::default();

    // Type aliases, a serial key and a check Postgres rewrites on a numeric column.
    let items = Table::new(
        "items",
        vec![
            Column::new("id", "serial"),
            Column::new("price", "numeric").with_precision(10, Some(2)),
            Column::new("created_at", "timestamp")
                .not_null()
                .with_default("now()"),
            Column::new("updated_at", "timestamptz"),
            Column::new("in_stock", "bool"),
            Column::new("quantity", "int4"),
            Column::new("weight", "float8"),
            Column::new("sku", "varchar").with_max_length(32),
            Column::new("tags", "text[]"),
        ],
    )
    .with_constraint(Constraint::primary_key("items_pkey", &["id"]))
    .with_constraint(Constraint::check("items_price_check", "price > 0"))
    .with_index(Index::new("", "idx_items_sku", &["sku"]));
    let desired = DesiredSchema::new().with_table(TableTarget::new(items));

    let first = sync_schema(&db.client, &project, &desired, &options).await.unwrap();
    assert!(first.applied);

    let extracted = get_table(&db.client, "items").await.unwrap();
    let clause = extracted
        .constraint("items_price_check")
        .unwrap()
        .check_clause
        .clone()
        .unwrap();
    assert_ne!(clause, "price > 0", "stored in canonical form");

    for _ in 0..2 {
        let again = sync_schema(&db.client, &project, &desired, &options).await.unwrap();
        assert!(again.is_noop(), "unexpected statements: {:?}", again.statements);
        assert!(!again.applied);
    }
}
