//! glint CLI - query result buffers over the media library.

mod error;

use crate::error::{ErrorKind, ExitCode, Result, buffer};
use clap::{Parser, Subcommand};
use exn::ResultExt;
use glint_buffer::source::SqliteSource;
use glint_buffer::{BufferService, Database, FilterCriteria, FilterHash, ServiceOptions};
use glint_config::Config;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "glint")]
#[command(about = "Materialized, paginated buffers over filtered media queries", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "GLINT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Make sure a buffer exists for the criteria, building it if needed
    Refresh {
        /// Filter criteria as a JSON object
        #[arg(default_value = "{}")]
        criteria: String,
    },

    /// Rebuild the buffer for the criteria, replacing any existing one
    Rebuild {
        /// Filter criteria as a JSON object
        #[arg(default_value = "{}")]
        criteria: String,
    },

    /// Read one page of a buffer
    Page {
        /// Filter hash returned by `refresh`
        hash: String,

        /// Cursor returned by the previous page
        #[arg(long)]
        cursor: Option<String>,

        /// Number of records per page
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Show buffer counts, sizes and source health
    Stats,

    /// Drop the buffer for a filter hash
    Clear {
        hash: String,
    },

    /// Drop every buffer
    ClearAll,

    /// Read or replace the active filter
    Active {
        #[command(subcommand)]
        action: ActiveAction,
    },
}

#[derive(Subcommand)]
enum ActiveAction {
    /// Show the active filter
    Get {
        #[arg(long, default_value = glint_buffer::DEFAULT_SESSION)]
        session: String,
    },
    /// Replace the active filter (does not build its buffer)
    Set {
        /// Filter criteria as a JSON object
        criteria: String,

        #[arg(long, default_value = glint_buffer::DEFAULT_SESSION)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli).await {
        Ok(()) => ExitCode::Success.into(),
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(&*err).into()
        },
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let service = open(&config).await?;
    let result = dispatch(&service, cli.command).await;
    service.close().await;
    result
}

#[instrument(skip_all, fields(path = %config.database.path.display()))]
async fn open(config: &Config) -> Result<BufferService> {
    if let Some(parent) = config.database.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io(parent.to_path_buf()))?;
    }
    let db = buffer(Database::connect(&config.database.path).await)?;
    let source = SqliteSource::from(&db);
    source.create_schema().await.or_raise(|| ErrorKind::Source)?;
    debug!("database ready");
    buffer(BufferService::open(db, Arc::new(source), ServiceOptions::from(&config.buffer)).await)
}

async fn dispatch(service: &BufferService, command: Commands) -> Result<()> {
    match command {
        Commands::Refresh { criteria } => print(&buffer(service.refresh(&parse_criteria(&criteria)?).await)?),
        Commands::Rebuild { criteria } => print(&buffer(service.rebuild(&parse_criteria(&criteria)?).await)?),
        Commands::Page { hash, cursor, limit } => {
            let hash = parse_hash(&hash)?;
            print(&buffer(service.get_page(&hash, cursor.as_deref(), limit).await)?)
        },
        Commands::Stats => print(&buffer(service.get_stats().await)?),
        Commands::Clear { hash } => {
            let cleared = buffer(service.clear(&parse_hash(&hash)?).await)?;
            print(&serde_json::json!({ "cleared": cleared }))
        },
        Commands::ClearAll => {
            let cleared = buffer(service.clear_all().await)?;
            print(&serde_json::json!({ "cleared": cleared }))
        },
        Commands::Active { action: ActiveAction::Get { session } } => {
            let active = buffer(service.get_active_filter_for(&session).await)?;
            print(&active.as_ref().map(|active| active.view()))
        },
        Commands::Active { action: ActiveAction::Set { criteria, session } } => {
            let criteria = parse_criteria(&criteria)?;
            let active = buffer(service.set_active_filter_for(&session, &criteria).await)?;
            print(&active.view())
        },
    }
}

fn parse_criteria(json: &str) -> Result<FilterCriteria> {
    buffer(FilterCriteria::from_str(json))
}

fn parse_hash(hash: &str) -> Result<FilterHash> {
    buffer(FilterHash::from_str(hash))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).or_raise(|| ErrorKind::Output)?;
    println!("{json}");
    Ok(())
}
