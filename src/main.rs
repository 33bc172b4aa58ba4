//! Watch Monitor: binary entrypoint.
//! Loads configuration, wires fetchers and notifiers, then runs one cycle or
//! the continuous loop. Maintenance commands work on the state files only.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use watch_monitor::config::MonitorConfig;
use watch_monitor::fetch::FetcherRegistry;
use watch_monitor::memory::ProcessProbe;
use watch_monitor::monitor::Monitor;
use watch_monitor::notify;
use watch_monitor::status::{self, StatusState};
use watch_monitor::store::PersistenceStore;
use watch_monitor::{telemetry, validate};

#[derive(Parser, Debug)]
#[command(author, version, about = "Polls listing sources and reports new items", long_about = None)]
struct Cli {
    /// Config file (defaults to $MONITOR_CONFIG_PATH, then config/monitor.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll continuously until SIGINT/SIGTERM (default).
    Run,
    /// Run a single cycle and exit.
    Once,
    /// Forget seen items for the given source tags, or all sources.
    ResetSeen { tags: Vec<String> },
    /// Print history statistics for the last N days.
    Stats {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Check configuration, webhooks and state directories.
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_level, cli.log_json);

    let cfg = Arc::new(MonitorConfig::load(cli.config.as_deref()).context("loading configuration")?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Validate => cmd_validate(&cfg),
        Command::Stats { days } => cmd_stats(&cfg, days),
        Command::ResetSeen { tags } => cmd_reset(&cfg, &tags),
        Command::Once => {
            let mut monitor = build_monitor(&cfg)?;
            let summary = monitor.run_cycle().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Run => cmd_run(cfg).await,
    }
}

fn build_monitor(cfg: &Arc<MonitorConfig>) -> Result<Monitor> {
    cfg.validate()?;
    let registry = Arc::new(FetcherRegistry::with_defaults(cfg).context("building http client")?);
    let notifier = Arc::new(notify::build_default(cfg)?);
    // A corrupt state file stops the process here.
    let monitor = Monitor::new(Arc::clone(cfg), registry, notifier, Arc::new(ProcessProbe::new()))
        .context("loading persisted state")?;
    Ok(monitor)
}

async fn cmd_run(cfg: Arc<MonitorConfig>) -> Result<()> {
    let mut monitor = build_monitor(&cfg)?;
    let (stop_tx, stop_rx) = watch::channel(false);

    let server = match cfg.status_addr {
        Some(addr) => {
            let prometheus = match telemetry::install_prometheus() {
                Ok(h) => Some(h),
                Err(e) => {
                    tracing::warn!(error = ?e, "metrics exporter unavailable");
                    None
                }
            };
            let state = StatusState {
                status: monitor.subscribe_status(),
                store: monitor.store().clone(),
                prometheus,
                stale_after: cfg.check_interval() * 3,
            };
            let mut rx = stop_rx.clone();
            Some(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = rx.wait_for(|stop| *stop).await;
                };
                if let Err(e) = status::serve(addr, state, shutdown).await {
                    tracing::error!(error = ?e, "status server failed");
                }
            }))
        }
        None => None,
    };

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("stop signal received, finishing current cycle");
        let _ = stop_tx.send(true);
    });

    monitor.run_continuous(stop_rx).await;
    if let Some(h) = server {
        let _ = h.await;
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = ?e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn cmd_validate(cfg: &MonitorConfig) -> Result<()> {
    let registry = FetcherRegistry::with_defaults(cfg).context("building http client")?;
    let report = validate::validate(cfg, &registry);
    for w in &report.warnings {
        println!("warning: {w}");
    }
    for e in &report.errors {
        println!("error: {e}");
    }
    if !report.is_ok() {
        anyhow::bail!("configuration has {} error(s)", report.errors.len());
    }
    println!("configuration ok ({} source(s))", cfg.active_sources().count());
    Ok(())
}

fn cmd_stats(cfg: &MonitorConfig, days: u32) -> Result<()> {
    let store = PersistenceStore::from_config(cfg);
    let history = store.load_history().context("loading session history")?;
    let stats = history.statistics(days, chrono::Utc::now());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn cmd_reset(cfg: &MonitorConfig, tags: &[String]) -> Result<()> {
    let store = PersistenceStore::from_config(cfg);
    let mut ledger = store.load_ledger().context("loading seen items")?;
    let removed = ledger.reset(tags);
    store.save_ledger(&ledger).context("saving seen items")?;
    if removed.is_empty() {
        println!("nothing to reset");
    }
    for (tag, n) in removed {
        println!("{tag}: removed {n} seen item(s)");
    }
    Ok(())
}
