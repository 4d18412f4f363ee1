//! mailship CLI
//!
//! Reads a Postfix maillog in batches and keeps one document per mail
//! transaction up to date in Elasticsearch.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mailship_core::config::{Config, LogFormat, prepare_spool_dir};
use mailship_core::controller::{Shipper, ShipperOptions};
use mailship_core::logging::init_logging;
use mailship_core::parser::PostfixLogParser;
use mailship_core::reader::{FileLineSource, VecLineSource};
use mailship_core::retry::{RetryPolicy, with_retry};
use mailship_core::store::{DocumentStore, ElasticStore, MemoryStore};
use mailship_core::error::ConfigError;
use mailship_core::{Error as CoreError, VERSION};

#[derive(Parser)]
#[command(name = "mailship", author, version, about = "Postfix maillog to per-message documents")]
struct Cli {
    /// Directory searched for mailship.toml before /etc
    #[arg(long, global = true, env = "MAILSHIP_ETC_DIR")]
    etc_dir: Option<PathBuf>,

    /// Explicit config file; overrides --etc-dir lookup
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level filter (overrides [log] level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format: pretty or json (overrides [log] format)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ship the configured log file to the document store
    Run {
        /// Stop at end of file instead of following the log
        #[arg(long)]
        once: bool,
    },
    /// Assemble a log file in memory and print the documents as JSON lines
    Replay {
        /// Log file to replay
        file: PathBuf,
    },
    /// Validate the configuration and print it with defaults filled in
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<CoreError>()
                .and_then(CoreError::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { once } => {
            let config = load_config(&cli)?;
            setup_logging(&config, &cli)?;
            run(config, once).await
        }
        Commands::Replay { ref file } => {
            let config = load_replay_config(&cli)?;
            setup_logging(&config, &cli)?;
            replay(&config, file).await
        }
        Commands::CheckConfig => {
            let config = load_config(&cli)?;
            let text = toml::to_string_pretty(&config).context("serializing config")?;
            print!("{text}");
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(cli.etc_dir.as_deref()),
    };
    config.map_err(|e| CoreError::from(e).into())
}

/// Replays run without any config file; one that exists must still be valid.
fn load_replay_config(cli: &Cli) -> Result<Config> {
    if cli.config.is_some() {
        return load_config(cli);
    }
    match Config::load(cli.etc_dir.as_deref()) {
        Err(ConfigError::NotFound { .. }) => Ok(Config::default()),
        other => other.map_err(|e| CoreError::from(e).into()),
    }
}

fn setup_logging(config: &Config, cli: &Cli) -> Result<()> {
    let mut log = config.log.clone();
    if let Some(level) = &cli.log_level {
        log.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        log.format = format;
    }
    init_logging(&log).map_err(CoreError::from)?;
    Ok(())
}

async fn run(config: Config, once: bool) -> Result<()> {
    info!(version = VERSION, file = %config.reader.file.display(), "mailship starting");

    prepare_spool_dir(&config.general.spool).map_err(CoreError::from)?;

    let store = ElasticStore::new(&config.store).map_err(CoreError::from)?;
    with_retry(&RetryPolicy::store_startup(), || store.ping())
        .await
        .map_err(CoreError::from)?;
    info!(index = store.index(), "Document store reachable");
    store.ensure_index().await.map_err(CoreError::from)?;

    let mut reader_config = config.reader.clone();
    reader_config.follow = reader_config.follow && !once;
    let mut reader = FileLineSource::open(&reader_config, &config.general.bookmark_dir())
        .map_err(CoreError::from)?;

    let mut shipper = Shipper::new(store, PostfixLogParser, ShipperOptions::from_config(&config));
    tokio::select! {
        result = shipper.run(&mut reader) => {
            let stats = result?;
            info!(
                lines = stats.lines_read,
                events = stats.events_queued,
                docs = stats.documents_written,
                "mailship stopped"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; unacknowledged lines will be re-read on next start");
        }
    }
    Ok(())
}

async fn replay(config: &Config, file: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let mut source = VecLineSource::from_text(file, &text, config.reader.batch_limit);

    let options = ShipperOptions::from_config(config).immediate();
    let mut shipper = Shipper::new(MemoryStore::new(), PostfixLogParser, options);
    let stats = shipper.run(&mut source).await?;
    info!(
        lines = stats.lines_read,
        events = stats.events_queued,
        rejected = stats.lines_rejected,
        "Replay complete"
    );

    for doc in shipper.store().documents() {
        let mut body = serde_json::to_value(&doc)?;
        if let (Some(map), Some(id)) = (body.as_object_mut(), doc.id) {
            map.insert("_id".to_string(), id.into());
        }
        println!("{body}");
    }
    Ok(())
}
