//! pgsync CLI
//!
//! Dump, diff and synchronize Postgres schemas.

mod config;
mod source;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use owo_colors::OwoColorize;
use pgsync::introspect::list_tables;
use pgsync::{
    ProjectId, RenameRelation, Schema, SnapshotError, SyncOptions, SyncReport, Synchronizer,
    create_table_sql, diff_schemas, get_table, get_tables, schema_to_sql,
};
use tokio_postgres::{Client, NoTls};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ConfigError};
use crate::source::FileSource;

const DEFAULT_PROJECT: &str = "default";

/// Introspect, diff and synchronize Postgres schemas.
#[derive(Parser, Debug)]
#[command(name = "pgsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database connection URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract the live schema and print it as DDL
    Dump {
        /// Only this table
        #[arg(short, long)]
        table: Option<String>,

        /// Print a JSON snapshot instead of DDL
        #[arg(long)]
        json: bool,

        /// Only list table names
        #[arg(long, conflicts_with_all = ["table", "json"])]
        list: bool,
    },

    /// Diff two JSON snapshots offline
    Diff {
        /// Snapshot of the current schema
        old: PathBuf,

        /// Snapshot of the desired schema
        new: PathBuf,

        /// Column rename hint, as `table.old=new` (repeatable)
        #[arg(long = "rename", value_parser = parse_rename)]
        renames: Vec<TableRename>,
    },

    /// Show the statements a sync would run, without applying them
    Plan {
        /// Desired schema (JSON)
        desired: PathBuf,

        /// Project to plan for
        #[arg(short, long)]
        project: Option<String>,

        /// Also drop tables the desired schema does not name
        #[arg(long)]
        drop_unknown_tables: bool,
    },

    /// Bring the database to the desired schema in one transaction
    Sync {
        /// Desired schema (JSON)
        desired: PathBuf,

        /// Project to synchronize
        #[arg(short, long)]
        project: Option<String>,

        /// Skip the per-project advisory lock
        #[arg(long)]
        no_lock: bool,

        /// Also drop tables the desired schema does not name
        #[arg(long)]
        drop_unknown_tables: bool,
    },
}

/// A `--rename table.old=new` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableRename {
    table: String,
    rename: RenameRelation,
}

fn parse_rename(arg: &str) -> Result<TableRename, String> {
    let invalid = || format!("expected `table.old=new`, got {arg:?}");
    let (column, new) = arg.split_once('=').ok_or_else(invalid)?;
    let (table, old) = column.split_once('.').ok_or_else(invalid)?;
    if table.is_empty() || old.is_empty() || new.is_empty() {
        return Err(invalid());
    }
    Ok(TableRename {
        table: table.to_string(),
        rename: RenameRelation::new(old, new),
    })
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no database URL: pass --database-url, set DATABASE_URL, or add it to .config/pgsync.json")]
    MissingDatabaseUrl,

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },

    #[error(transparent)]
    Pgsync(#[from] pgsync::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before parsing so DATABASE_URL can come from it.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = config::load_or_default()?;

    match cli.command {
        Commands::Dump { table, json, list } => {
            let client = connect(cli.database_url, &config).await?;
            if list {
                for name in list_tables(&client).await? {
                    println!("{name}");
                }
                return Ok(());
            }
            match (table, json) {
                (Some(name), false) => println!("{}", create_table_sql(&get_table(&client, &name).await?)?),
                (Some(name), true) => println!("{}", snapshot_json(get_table(&client, &name).await?.to_json())?),
                (None, false) => println!("{}", schema_to_sql(&get_tables(&client).await?)?),
                (None, true) => println!("{}", snapshot_json(get_tables(&client).await?.to_json())?),
            }
        }
        Commands::Diff { old, new, renames } => {
            let old_schema = read_schema(&old)?;
            let new_schema = read_schema(&new)?;

            let mut by_table: IndexMap<String, Vec<RenameRelation>> = IndexMap::new();
            for TableRename { table, rename } in renames {
                by_table.entry(table).or_default().push(rename);
            }

            let diff = diff_schemas(&old_schema, &new_schema, &by_table)?;
            if diff.is_empty() {
                println!("{}", "No changes.".green());
            } else {
                println!("{}", diff.to_sql());
                eprintln!("{} change(s)", diff.change_count().to_string().yellow());
            }
        }
        Commands::Plan {
            desired,
            project,
            drop_unknown_tables,
        } => {
            let project = project_id(project, &config);
            let options = SyncOptions {
                dry_run: true,
                drop_unknown_tables: drop_unknown_tables || config.drop_unknown_tables,
                ..sync_options(&config)
            };
            let client = connect(cli.database_url, &config).await?;
            let report = Synchronizer::new(FileSource::new(desired))
                .with_options(options)
                .sync(&client, &project)
                .await?;
            print_report(&report);
        }
        Commands::Sync {
            desired,
            project,
            no_lock,
            drop_unknown_tables,
        } => {
            let project = project_id(project, &config);
            let defaults = sync_options(&config);
            let options = SyncOptions {
                lock: defaults.lock && !no_lock,
                drop_unknown_tables: drop_unknown_tables || defaults.drop_unknown_tables,
                ..defaults
            };
            let client = connect(cli.database_url, &config).await?;
            let report = Synchronizer::new(FileSource::new(desired))
                .with_options(options)
                .sync(&client, &project)
                .await?;
            print_report(&report);
        }
    }

    Ok(())
}

fn sync_options(config: &Config) -> SyncOptions {
    SyncOptions {
        lock: config.lock.unwrap_or(true),
        drop_unknown_tables: config.drop_unknown_tables,
        ..SyncOptions::default()
    }
}

fn project_id(flag: Option<String>, config: &Config) -> ProjectId {
    flag.or_else(|| config.project.clone())
        .map(ProjectId::from)
        .unwrap_or_else(|| ProjectId::new(DEFAULT_PROJECT))
}

async fn connect(flag: Option<String>, config: &Config) -> Result<Client, CliError> {
    let url = flag
        .or_else(|| config.database_url.clone())
        .ok_or(CliError::MissingDatabaseUrl)?;
    eprintln!("{} {}", "database:".dimmed(), mask_password(&url));

    let (client, connection) =
        tokio_postgres::connect(&url, NoTls)
            .await
            .map_err(|source| CliError::Connect {
                url: mask_password(&url),
                source,
            })?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("connection error: {e}");
        }
    });
    Ok(client)
}

fn snapshot_json(json: Result<String, SnapshotError>) -> Result<String, CliError> {
    json.map_err(|source| CliError::Snapshot {
        path: PathBuf::from("<stdout>"),
        source,
    })
}

fn read_file(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn read_schema(path: &Path) -> Result<Schema, CliError> {
    Schema::from_json(&read_file(path)?).map_err(|source| CliError::Snapshot {
        path: path.to_path_buf(),
        source,
    })
}

fn print_report(report: &SyncReport) {
    if report.is_noop() {
        println!(
            "{} project {} is up to date",
            "✓".green(),
            report.project.bold()
        );
        return;
    }

    for statement in &report.statements {
        println!("{statement}");
    }

    let verb = if report.applied { "applied" } else { "planned" };
    eprintln!(
        "{} {} statement(s) {} for project {}: {}",
        "✓".green(),
        report.statements.len().to_string().yellow(),
        verb,
        report.project.bold(),
        report.tables_changed.join(", ").cyan()
    );
}

/// Mask password in database URL for display
fn mask_password(url: &str) -> String {
    // Replace the password between :// and @
    if let Some(start) = url.find("://")
        && let Some(at) = url.rfind('@')
        && at > start
        && let Some(colon) = url[start + 3..at].find(':')
    {
        let prefix = &url[..start + 3];
        let user = &url[start + 3..start + 3 + colon];
        let suffix = &url[at..];
        return format!("{prefix}{user}:***{suffix}");
    }
    url.to_string()
}
