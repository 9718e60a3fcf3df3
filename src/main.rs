use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use retrigger::bot::cooldown::CooldownLedger;
use retrigger::bot::pattern::PatternCompiler;
use retrigger::bot::registry::TriggerRegistry;
use retrigger::bot::shutdown::{self, GracefulShutdown};
use retrigger::bot::worker::run_worker;
use retrigger::bot::{EngineParts, TriggerEngine};
use retrigger::config::EngineConfig;
use retrigger::platforms::console::{read_events, DryRunSurface, PassthroughImages};
use retrigger::bot::matcher::WorkerPool;
use retrigger::store::FileStore;

/// Regex chat triggers with isolated, time-bounded matching
#[derive(Parser, Debug)]
#[command(name = "retrigger", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate JSON events from stdin against stored triggers (default)
    Run,

    /// Check a pattern's syntax without running it
    Validate {
        pattern: String,

        /// Show the pattern with `{prefix}` replaced by this prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Print the triggers stored for a guild
    List {
        #[arg(long)]
        guild: u64,
    },

    /// Serve match requests on stdin/stdout (spawned by the engine)
    #[command(hide = true)]
    MatchWorker,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if let Some(Command::MatchWorker) = cli.command {
        // stdout carries the protocol; logs go to stderr and stay quiet
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Warn)
            .target(env_logger::Target::Stderr)
            .init();
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        return run_worker(stdin.lock(), stdout.lock());
    }

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async move {
        match cli.command.unwrap_or(Command::Run) {
            Command::Run => run().await,
            Command::Validate { pattern, prefix } => validate(&pattern, prefix.as_deref()),
            Command::List { guild } => list(guild).await,
            Command::MatchWorker => Ok(()),
        }
    })
}

async fn load_config() -> Result<EngineConfig> {
    let path = EngineConfig::config_path();
    let mut config = EngineConfig::load_or_create(&path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn validate(pattern: &str, prefix: Option<&str>) -> Result<()> {
    PatternCompiler::validate(pattern)?;
    match prefix {
        Some(prefix) => println!("ok: {}", PatternCompiler::render(pattern, prefix)),
        None => println!("ok: {}", pattern),
    }
    Ok(())
}

async fn list(guild_id: u64) -> Result<()> {
    let config = load_config().await?;
    let store = Arc::new(FileStore::open(&config.data_dir).await?);
    let registry = TriggerRegistry::new(store, Arc::new(CooldownLedger::new()), config.pattern_compiler());
    registry.load_guild(guild_id).await?;

    for trigger in registry.list(guild_id).await {
        let count = registry
            .ledger()
            .snapshot(guild_id, &trigger.name)
            .await
            .map_or(0, |s| s.count);
        println!(
            "{:<24} {:<12} {:<8} fired {:<6} by {:<20} {}",
            trigger.name,
            trigger.kind().to_string(),
            if trigger.enabled { "enabled" } else { "disabled" },
            count,
            trigger.author_id,
            PatternCompiler::render(trigger.pattern.source(), &config.command_prefix),
        );
    }
    for record in registry.quarantined(guild_id).await {
        println!("{:<24} QUARANTINED: {}", record.key, record.reason);
    }
    Ok(())
}

async fn run() -> Result<()> {
    info!("Starting ReTrigger v{}", retrigger::VERSION);

    let config = load_config().await?;
    let store = Arc::new(FileStore::open(&config.data_dir).await?);

    let pool = Arc::new(WorkerPool::new(config.worker_pool_config()?));
    if let Err(e) = pool.warm_up(1).await {
        // Matching would fail for every event; refuse to start
        return Err(anyhow::anyhow!("Match workers cannot be started: {}", e));
    }

    let shutdown_manager = Arc::new(GracefulShutdown::new(config.shutdown_config()));
    let engine = Arc::new(TriggerEngine::new(EngineParts {
        store: store.clone(),
        matcher: pool.clone(),
        surface: Arc::new(DryRunSurface::new()),
        images: Arc::new(PassthroughImages),
        compiler: config.pattern_compiler(),
        shutdown: Arc::clone(&shutdown_manager),
    }));

    let loaded = engine.start().await?;
    if loaded.quarantined > 0 {
        warn!("{} trigger records are quarantined; fix or remove them in {}", loaded.quarantined, config.data_dir.display());
    }
    if !loaded.failed_guilds.is_empty() {
        warn!(
            "Guild documents {:?} could not be read and were left untouched in {}",
            loaded.failed_guilds,
            config.data_dir.display()
        );
    }

    shutdown::register_engine_components(&shutdown_manager, Arc::clone(&engine), Some(store)).await;
    let save_loop = engine.spawn_save_loop(Duration::from_secs(config.save_interval_seconds));

    let (event_tx, mut event_rx) = mpsc::channel(256);
    tokio::spawn(async move {
        match read_events(BufReader::new(tokio::io::stdin()), event_tx).await {
            Ok(count) => info!("Event stream closed after {} events", count),
            Err(e) => error!("Event stream failed: {:#}", e),
        }
    });

    info!("ReTrigger is running; reading events from stdin");
    let mut phases = shutdown_manager.subscribe_to_shutdown();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    // End of input: finish what was read, then stop
                    while in_flight.join_next().await.is_some() {}
                    shutdown_manager.trigger_shutdown().await;
                    break;
                };
                let engine = Arc::clone(&engine);
                in_flight.spawn(async move {
                    match engine.handle_event(&event).await {
                        Ok(reports) => {
                            for report in reports.iter().filter(|r| !r.all_succeeded()) {
                                warn!("Trigger '{}' had {} failed actions", report.trigger, report.failures().count());
                            }
                        }
                        Err(e) => warn!("Event {} not handled: {}", event.message_id, e),
                    }
                });
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            _ = phases.recv() => break,
        }
    }

    shutdown_manager.wait_for_shutdown().await?;
    save_loop.abort();

    let stats = engine.stats();
    let pool_stats = pool.stats().await;
    info!(
        "Handled {} events, {} triggers fired, {} actions failed; {} matches timed out",
        stats.events, stats.fired, stats.failed_actions, pool_stats.timeouts
    );
    Ok(())
}
