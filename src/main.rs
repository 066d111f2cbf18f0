use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use quantis_core::config::Config;
use quantis_engine::dispatch::{FileSink, Sink, StdoutSink};
use quantis_engine::orchestrator::Orchestrator;
use quantis_engine::tick::{VenueFeed, WebSocketVenueFeed};
use quantis_engine::venues::parse_binance_book_ticker;

#[derive(Parser)]
#[command(name = "quantis", version, about = "Real-time regime-aware trading signal engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live engine against the configured venues.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "config.toml")]
        config: String,
        /// Directory for per-instrument HMM checkpoints.
        #[arg(long, default_value = "checkpoints")]
        checkpoint_dir: String,
        /// Also append dispatched signals to this newline-delimited JSON file.
        #[arg(long)]
        signal_log: Option<String>,
    },
    /// Parse and validate a configuration file without starting the engine.
    Validate {
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Replay a captured tick log through the pipeline for offline evaluation.
    Replay {
        /// Path to the newline-delimited JSON tick log.
        #[arg(long)]
        log: String,
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            checkpoint_dir,
            signal_log,
        } => cmd_run(&config, &checkpoint_dir, signal_log.as_deref()).await,
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Replay { log, config } => cmd_replay(&log, &config).await,
    };

    match result {
        Ok(()) => 0,
        Err(CliError::Interrupted) => 130,
        Err(CliError::Config(e)) => {
            tracing::error!("configuration error: {e}");
            1
        }
        Err(CliError::Runtime(e)) => {
            tracing::error!("fatal error: {e}");
            2
        }
    }
}

enum CliError {
    Config(String),
    Runtime(String),
    Interrupted,
}

impl From<quantis_core::QuantisError> for CliError {
    fn from(e: quantis_core::QuantisError) -> Self {
        match e {
            quantis_core::QuantisError::Config(_) | quantis_core::QuantisError::Parse(_) => {
                CliError::Config(e.to_string())
            }
            other => CliError::Runtime(other.to_string()),
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn cmd_validate(config_path: &str) -> Result<(), CliError> {
    let config = Config::load(config_path)?;
    config.validate()?;
    println!(
        "{config_path}: ok ({} instrument(s), {} venue(s))",
        config.instruments.len(),
        config.venues.len()
    );
    Ok(())
}

async fn cmd_run(config_path: &str, checkpoint_dir: &str, signal_log: Option<&str>) -> Result<(), CliError> {
    let config = Config::load(config_path)?;
    config.validate()?;

    let mut sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(StdoutSink)];
    if let Some(path) = signal_log {
        sinks.push(Arc::new(
            FileSink::open(path).map_err(|e| CliError::Runtime(e.to_string()))?,
        ));
    }

    let mut orchestrator = Orchestrator::new(config.clone(), sinks, checkpoint_dir);

    let mut feeds: HashMap<quantis_core::Instrument, Vec<Arc<dyn VenueFeed>>> = HashMap::new();
    for instrument in &config.instruments {
        let instrument_feeds: Vec<Arc<dyn VenueFeed>> = config
            .venues
            .iter()
            .map(|venue| {
                let endpoint = venue.endpoint.replace("{symbol}", &instrument.as_str().to_lowercase());
                Arc::new(WebSocketVenueFeed {
                    name: venue.name.clone(),
                    endpoint,
                    parse: parse_binance_book_ticker,
                }) as Arc<dyn VenueFeed>
            })
            .collect();
        feeds.insert(instrument.clone(), instrument_feeds);
    }

    orchestrator
        .start(feeds)
        .map_err(|e| CliError::Runtime(e.to_string()))?;

    tracing::info!("quantis: running, press ctrl-c to stop");
    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("quantis: shutdown signal received");
            true
        }
    };

    let grace = std::time::Duration::from_secs(config.limits.shutdown_grace_secs);
    orchestrator.stop(grace).await;
    tracing::info!("quantis: shutdown complete");
    if interrupted {
        return Err(CliError::Interrupted);
    }
    Ok(())
}

/// Feed a captured tick log through the pipeline for offline evaluation.
/// Signals go to stdout regardless of the config's own sink settings (spec
/// §6): replay is for evaluating the pipeline's behavior against a known
/// input, not for exercising the configured production sinks.
async fn cmd_replay(log_path: &str, config_path: &str) -> Result<(), CliError> {
    let config = Config::load(config_path)?;
    config.validate()?;

    let feed = quantis_engine::replay::load_replay_feed("replay", log_path)
        .map_err(|e| CliError::Runtime(e.to_string()))?;
    let per_instrument = quantis_engine::replay::split_by_instrument(feed);

    if per_instrument.is_empty() {
        tracing::warn!("quantis: {log_path} contained no ticks");
        return Ok(());
    }

    let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(StdoutSink)];
    let checkpoint_dir = std::env::temp_dir().join(format!("quantis-replay-{}", std::process::id()));
    let mut orchestrator = Orchestrator::new(config, sinks, checkpoint_dir);

    let mut feeds: HashMap<quantis_core::Instrument, Vec<Arc<dyn VenueFeed>>> = HashMap::new();
    for (instrument, replay_feed) in per_instrument {
        feeds.insert(instrument, vec![Arc::new(replay_feed) as Arc<dyn VenueFeed>]);
    }

    orchestrator
        .start(feeds)
        .map_err(|e| CliError::Runtime(e.to_string()))?;
    orchestrator.join_all().await;
    Ok(())
}
