use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use recipe_sync::config::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_LIST_ATTEMPTS, DEFAULT_LOG_DIRECTIVE, DEFAULT_PAGE_SIZE,
    DEFAULT_QUERY, DEFAULT_STORE_ATTEMPTS, DEFAULT_WORKERS,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "recipe-sync",
    version,
    about = "Pull recipe emails from Gmail, show their links and keep a local copy"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// SQLite database path (default: ~/.recipe-sync/recipes.db)
    #[arg(long, global = true, env = "RECIPE_SYNC_DB")]
    db: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch matching messages and print them
    List {
        #[command(flatten)]
        run: RunArgs,
        /// Also upsert every message into the database
        #[arg(long, default_value_t = false)]
        store: bool,
    },
    /// Fetch matching messages, print them and upsert them into the database
    Sync {
        #[command(flatten)]
        run: RunArgs,
        /// Print only, leave the database untouched
        #[arg(long, default_value_t = false)]
        no_store: bool,
    },
    /// Show one stored message by ID
    Show { id: String },
    /// List the most recently received stored messages
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show database stats
    Stats,
    /// Run the OAuth consent flow and save token.json
    Authorize {
        #[command(flatten)]
        auth: AuthArgs,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Gmail search query
    #[arg(long, env = "RECIPE_SYNC_QUERY", default_value = DEFAULT_QUERY)]
    query: String,

    /// Handles requested per listing page
    #[arg(long, env = "RECIPE_SYNC_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,

    /// Fetch one message at a time, in listing order (overrides --workers)
    #[arg(long, default_value_t = false)]
    serial: bool,

    /// Concurrent fetch limit (0 = unbounded)
    #[arg(long, env = "RECIPE_SYNC_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Handoff buffer between fetchers and the consumer (0 behaves as 1)
    #[arg(long, env = "RECIPE_SYNC_CHANNEL_CAPACITY", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Attempts per listing page before the run fails
    #[arg(long, default_value_t = DEFAULT_LIST_ATTEMPTS)]
    list_attempts: u32,

    /// Attempts per database write before the run fails
    #[arg(long, default_value_t = DEFAULT_STORE_ATTEMPTS)]
    store_attempts: u32,

    /// Read messages from a directory of Gmail JSON files instead of the API
    #[arg(long, env = "RECIPE_SYNC_ARCHIVE")]
    archive: Option<PathBuf>,

    #[command(flatten)]
    auth: AuthArgs,
}

#[derive(Debug, Args)]
struct AuthArgs {
    /// OAuth client secrets (default: ~/.recipe-sync/credentials.json)
    #[arg(long, env = "RECIPE_SYNC_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Saved user token (default: ~/.recipe-sync/token.json)
    #[arg(long, env = "RECIPE_SYNC_TOKEN")]
    token: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match commands::dispatch(cli).await {
        Ok(status) => status.exit_code(),
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::from(1)
        }
    }
}

mod commands {
    use std::path::PathBuf;
    use std::process::ExitCode;
    use std::sync::Arc;

    use anyhow::{anyhow, Context, Result};
    use chrono::Utc;
    use serde::Serialize;
    use tokio::io::BufReader;
    use tokio_util::sync::CancellationToken;
    use tracing::warn;

    use recipe_sync::auth::{self, AuthPaths, GmailCredentials};
    use recipe_sync::config;
    use recipe_sync::connectors::{GmailApiConnector, JsonArchiveSource, MessageSource};
    use recipe_sync::db::{Database, LAST_SYNC_KEY};
    use recipe_sync::output::{self, OutputFormat};
    use recipe_sync::pipeline::{run_pipeline, FetchMode, PipelineOptions, RunReport};
    use recipe_sync::retry::RetryPolicy;
    use recipe_sync::sink::Sink;

    use super::{AuthArgs, Cli, Commands, RunArgs};

    /// How a successful command ended; failures are `Err`.
    pub enum Status {
        Clean,
        ItemFailures,
        Cancelled,
    }

    impl Status {
        pub fn exit_code(&self) -> ExitCode {
            match self {
                Self::Clean => ExitCode::SUCCESS,
                Self::ItemFailures => ExitCode::from(2),
                Self::Cancelled => ExitCode::from(130),
            }
        }

        fn from_report(report: &RunReport) -> Self {
            if report.cancelled {
                Self::Cancelled
            } else if report.has_item_failures() {
                Self::ItemFailures
            } else {
                Self::Clean
            }
        }
    }

    pub async fn dispatch(cli: Cli) -> Result<Status> {
        let json = cli.json;
        match cli.command {
            Commands::List { run, store } => handle_run(run, store, cli.db, json).await,
            Commands::Sync { run, no_store } => handle_run(run, !no_store, cli.db, json).await,
            Commands::Show { id } => handle_show(&id, cli.db, json),
            Commands::Recent { limit } => handle_recent(limit, cli.db, json),
            Commands::Stats => handle_stats(cli.db, json),
            Commands::Authorize { auth } => handle_authorize(auth).await,
        }
    }

    async fn handle_run(
        args: RunArgs,
        store: bool,
        db_override: Option<PathBuf>,
        json: bool,
    ) -> Result<Status> {
        let format = OutputFormat::from_json_flag(json);
        let source = open_source(&args)?;

        let mut sink = Sink::stdout(format)
            .with_store_retry(RetryPolicy::with_attempts(args.store_attempts));
        let db_path = store_path(store, db_override)?;
        if let Some(path) = &db_path {
            sink = sink.with_store(open_db(path)?);
        }
        let stores = sink.stores();

        let options = PipelineOptions {
            query: args.query,
            page_size: args.page_size,
            mode: if args.serial {
                FetchMode::Serial
            } else {
                FetchMode::concurrent(args.workers)
            },
            channel_capacity: args.channel_capacity,
            list_retry: RetryPolicy::with_attempts(args.list_attempts),
            ..PipelineOptions::default()
        };

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    cancel.cancel();
                }
            })
        };

        let result = run_pipeline(source, sink, &options, cancel).await;
        interrupt.abort();
        let report = result.context("sync run failed")?;

        eprintln!("{}", output::format_report(format, &report)?);
        if let Some(path) = db_path.filter(|_| stores && !report.cancelled) {
            open_db(&path)?
                .set_sync_state(LAST_SYNC_KEY, &Utc::now().to_rfc3339())
                .context("record last sync time")?;
        }

        Ok(Status::from_report(&report))
    }

    fn handle_show(id: &str, db_override: Option<PathBuf>, json: bool) -> Result<Status> {
        let db = open_db(&resolve_db_path(db_override)?)?;
        let message = db
            .get_message(id)?
            .ok_or_else(|| anyhow!("message not found for id '{id}'"))?;

        let formatted = output::format_stored_message(OutputFormat::from_json_flag(json), &message)?;
        println!("{formatted}");
        Ok(Status::Clean)
    }

    fn handle_recent(limit: usize, db_override: Option<PathBuf>, json: bool) -> Result<Status> {
        let db = open_db(&resolve_db_path(db_override)?)?;
        let messages = db.list_messages(limit)?;

        let formatted = output::format_stored_messages(OutputFormat::from_json_flag(json), &messages)?;
        println!("{formatted}");
        Ok(Status::Clean)
    }

    fn handle_stats(db_override: Option<PathBuf>, json: bool) -> Result<Status> {
        let db = open_db(&resolve_db_path(db_override)?)?;
        let stats = db.get_stats()?;

        if json {
            #[derive(Serialize)]
            struct StatsPayload {
                database_path: String,
                #[serde(flatten)]
                stats: recipe_sync::db::DatabaseStats,
            }
            let payload = StatsPayload {
                database_path: db.path().display().to_string(),
                stats,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        } else {
            println!("{}", output::format_stats(OutputFormat::Table, &stats)?);
            println!("Database: {}", db.path().display());
        }
        Ok(Status::Clean)
    }

    async fn handle_authorize(args: AuthArgs) -> Result<Status> {
        let paths = auth_paths(&args)?;
        let client = reqwest::Client::new();
        auth::authorize_interactively(&client, &paths, BufReader::new(tokio::io::stdin()))
            .await
            .context("authorize gmail access")?;

        eprintln!("Saved token to {}", paths.token.display());
        Ok(Status::Clean)
    }

    fn open_source(args: &RunArgs) -> Result<Arc<dyn MessageSource>> {
        if let Some(archive) = &args.archive {
            let source = JsonArchiveSource::open(archive)
                .with_context(|| format!("open json archive at {}", archive.display()))?;
            return Ok(Arc::new(source));
        }

        let paths = auth_paths(&args.auth)?;
        let credentials =
            GmailCredentials::resolve(&paths).context("resolve gmail credentials")?;
        let connector = GmailApiConnector::new(credentials).context("build gmail api client")?;
        Ok(Arc::new(connector))
    }

    fn auth_paths(args: &AuthArgs) -> Result<AuthPaths> {
        let credentials = match &args.credentials {
            Some(path) => path.clone(),
            None => config::default_credentials_path()?,
        };
        let token = match &args.token {
            Some(path) => path.clone(),
            None => config::default_token_path()?,
        };
        Ok(AuthPaths::new(credentials, token))
    }

    /// Database path for a run, or `None` when nothing is stored.
    pub(super) fn store_path(store: bool, db_override: Option<PathBuf>) -> Result<Option<PathBuf>> {
        if !store {
            return Ok(None);
        }
        resolve_db_path(db_override).map(Some)
    }

    fn resolve_db_path(db_override: Option<PathBuf>) -> Result<PathBuf> {
        match db_override {
            Some(path) => Ok(path),
            None => Database::default_db_path().context("resolve default database path"),
        }
    }

    fn open_db(path: &std::path::Path) -> Result<Database> {
        Database::open(path).with_context(|| format!("open database at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::commands::store_path;
    use super::{Cli, Commands};

    #[test]
    fn display_only_runs_never_resolve_a_database() {
        let path = store_path(false, None).expect("no lookup needed");
        assert_eq!(path, None);

        let explicit = PathBuf::from("/tmp/recipes-explicit.db");
        let path = store_path(true, Some(explicit.clone())).expect("explicit path");
        assert_eq!(path, Some(explicit));
    }

    #[test]
    fn list_opts_in_and_sync_opts_out_of_storage() {
        let cli = Cli::try_parse_from(["recipe-sync", "list", "--archive", "mail"]).expect("parse list");
        assert!(matches!(cli.command, Commands::List { store: false, .. }));

        let cli = Cli::try_parse_from(["recipe-sync", "sync", "--no-store", "--workers", "0"])
            .expect("parse sync");
        match cli.command {
            Commands::Sync { run, no_store } => {
                assert!(no_store);
                assert_eq!(run.workers, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
