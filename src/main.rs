//! Redflag Hedge - Main Entry Point
//!
//! Runs the hedge cycle against the paper venue, and inspects or edits the
//! state journal.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use redflag_hedge::config::Config;
use redflag_hedge::exchange::{MockVenue, PaperWorld, VenueAdapter};
use redflag_hedge::persistence::StateStore;
use redflag_hedge::strategy::HedgeOrchestrator;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Redflag Hedge CLI
#[derive(Parser)]
#[command(name = "redflag-hedge")]
#[command(
    version,
    about = "Cross-venue premium hedging: long local spot, short derivative perpetual",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Comma-separated base symbols, e.g. XRP,ETH
    #[arg(short, long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Trade against the built-in paper venue
    #[arg(long)]
    paper: bool,

    /// Paper scenario file (JSON), re-read every cycle for fresh quotes
    #[arg(long, default_value = "demos/paper_scenario.json")]
    scenario: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hedge cycle (default)
    Run(RunArgs),

    /// Show journaled positions, stage timers and failure counters
    Status {
        /// Path to the SQLite journal
        #[arg(short, long, default_value = "data/hedge_state.db")]
        db: String,

        /// Number of recent executions to show
        #[arg(short, long, default_value = "10")]
        executions: usize,
    },

    /// Clear a symbol's quarantine in the journal
    ResetFailures {
        /// Path to the SQLite journal
        #[arg(short, long, default_value = "data/hedge_state.db")]
        db: String,

        /// Base symbol, e.g. XRP
        symbol: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    init_logging(&config.runtime.log_dir)?;

    match cli.command {
        Some(Commands::Status { db, executions }) => show_status(&db, executions, &config),
        Some(Commands::ResetFailures { db, symbol }) => reset_failures(&db, &symbol),
        Some(Commands::Run(args)) => run(config, args).await,
        None => run(config, cli.run).await,
    }
}

async fn run(config: Config, args: RunArgs) -> Result<()> {
    config.validate()?;
    anyhow::ensure!(
        args.paper,
        "only the paper venue is built in; pass --paper (live venues implement VenueAdapter)"
    );
    anyhow::ensure!(!args.symbols.is_empty(), "no symbols given; use --symbols XRP,ETH");

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          Redflag Hedge v{} - Paper Trading               ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    let world = PaperWorld::from_file(&args.scenario)?;
    let local = Arc::new(MockVenue::new(&config.venues.local_venue));
    let derivative = Arc::new(MockVenue::new(&config.venues.derivative_venue));
    local.load_scenario(&world.local).await;
    derivative.load_scenario(&world.derivative).await;
    info!(
        scenario = %args.scenario,
        local = local.name(),
        derivative = derivative.name(),
        "📝 Paper venues loaded"
    );

    let mut orchestrator = HedgeOrchestrator::new(&config, local.clone(), derivative.clone());
    if let Some(path) = &config.runtime.state_db {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        orchestrator = orchestrator.with_state_store(StateStore::open(path)?);
    }

    for symbol in &args.symbols {
        if let Err(e) = orchestrator.add_symbol(symbol).await {
            error!(%symbol, error = %e, "Could not add symbol");
        }
    }
    anyhow::ensure!(
        !orchestrator.active_symbols().is_empty(),
        "none of the requested symbols could be added"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(config.runtime.loop_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(symbols = ?orchestrator.active_symbols(), "🚀 Starting hedge loop");

    let mut cycles: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("🛑 Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {}
        }

        match PaperWorld::from_file(&args.scenario) {
            Ok(world) => {
                local.refresh_tickers(&world.local).await;
                derivative.refresh_tickers(&world.derivative).await;
            }
            Err(e) => warn!(error = %e, "Keeping previous quotes"),
        }

        let started = Instant::now();
        let active = orchestrator.run_cycle().await;
        cycles += 1;
        debug!(cycle = cycles, elapsed_ms = started.elapsed().as_millis() as u64, "Cycle completed");

        if !active {
            info!("No active symbols left");
            break;
        }

        for (symbol, balance) in orchestrator
            .balancer()
            .check_all(orchestrator.active_symbols())
            .await
        {
            if let Ok(balance) = balance {
                debug!(
                    %symbol,
                    spot = %balance.spot_quantity,
                    derivative = %balance.derivative_quantity,
                    gap_pct = %balance.gap_pct,
                    "Leg balance"
                );
            }
        }
    }

    info!(
        cycles,
        fees_local = %local.fees_paid().await,
        fees_derivative = %derivative.fees_paid().await,
        "👋 Redflag Hedge shutdown complete"
    );
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(log_dir: &str) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::hourly(log_dir, "redflag-hedge.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("redflag_hedge=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Max Position:       ${}", config.hedge.max_position_usd);
    info!("   Increment:          ${}", config.hedge.position_increment_usd);
    info!("   Build Premium:      ≤ {}%", config.hedge.build_premium_pct);
    for stage in &config.profit.stages {
        info!(
            "   Profit Stage:       {}% premium → close {}%",
            stage.threshold_pct, stage.close_pct
        );
    }
    info!("   Stage Cooldown:     {} min", config.profit.cooldown_minutes);
    info!("   Leg Timeout:        {}s", config.execution.leg_timeout_secs);
    info!("   Max Failures:       {}", config.execution.max_failed_attempts);
    info!(
        "   Balance Gap:        ≤ {}% balanced, ≥ {}% rebalance",
        config.balance.balanced_gap_pct, config.balance.rebalance_gap_pct
    );
    info!("   Loop Interval:      {}s", config.runtime.loop_interval_secs);
    match &config.runtime.state_db {
        Some(path) => info!("   State Journal:      {}", path),
        None => info!("   State Journal:      disabled"),
    }
}

fn open_journal(db_path: &str) -> Result<Option<StateStore>> {
    if !Path::new(db_path).exists() {
        println!("\n❌ Journal not found: {}", db_path);
        println!("   Set RFH_RUNTIME__STATE_DB and run the hedge loop first.");
        return Ok(None);
    }
    StateStore::open(db_path)
        .map(Some)
        .with_context(|| format!("opening journal {db_path}"))
}

/// Print journaled state.
fn show_status(db_path: &str, executions: usize, config: &Config) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              REDFLAG HEDGE STATUS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let Some(store) = open_journal(db_path)? else {
        return Ok(());
    };

    let positions = store.load_positions()?;
    println!("\n📊 Positions");
    if positions.is_empty() {
        println!("   └─ none");
    }
    for pos in &positions {
        println!("   ┌─ {}", pos.symbol);
        println!("   ├─ Value:      ${:.2}", pos.value_usd);
        println!("   ├─ Spot:       {}", pos.spot_quantity);
        println!("   ├─ Contracts:  {}", pos.derivative_contracts);
        println!("   └─ Updated:    {}", pos.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    let cooldown = chrono::Duration::minutes(i64::from(config.profit.cooldown_minutes));
    let now = Utc::now();
    let timers = store.load_timers()?;
    println!("\n⏱️  Stage Timers");
    if timers.is_empty() {
        println!("   └─ none armed");
    }
    for (symbol, threshold, armed_at) in &timers {
        let remaining = (*armed_at + cooldown) - now;
        let state = if remaining > chrono::Duration::zero() {
            format!("cooling down, {}m {}s left", remaining.num_minutes(), remaining.num_seconds() % 60)
        } else {
            "ready".to_string()
        };
        println!(
            "   ├─ {} @ {}%: armed {} ({})",
            symbol,
            threshold,
            armed_at.format("%H:%M:%S UTC"),
            state
        );
    }

    let max_failures = config.execution.max_failed_attempts;
    let mut failures: Vec<_> = store.load_failures()?.into_iter().collect();
    failures.sort();
    println!("\n🚨 Failure Counters");
    for (symbol, count) in &failures {
        let flag = if *count >= max_failures { " QUARANTINED" } else { "" };
        println!("   ├─ {}: {}/{}{}", symbol, count, max_failures, flag);
    }

    let records = store.recent_executions(executions)?;
    println!("\n📜 Recent Executions");
    for record in &records {
        println!(
            "   ├─ {} {} {} ${:.2} spot {} contracts {} {}{}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.symbol,
            record.action,
            record.notional_usd,
            record.spot_quantity,
            record.contracts,
            if record.success { "✅" } else { "❌" },
            record
                .detail
                .as_deref()
                .map(|d| format!(" {d}"))
                .unwrap_or_default()
        );
    }

    Ok(())
}

fn reset_failures(db_path: &str, symbol: &str) -> Result<()> {
    let Some(store) = open_journal(db_path)? else {
        return Ok(());
    };
    let symbol = symbol.trim().to_uppercase();
    if store.reset_failures(&symbol)? {
        println!("✅ Failure counter cleared for {}", symbol);
    } else {
        println!("❌ No failure counter journaled for {}", symbol);
    }
    Ok(())
}
