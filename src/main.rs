use anyhow::{Context, Result};
use clap::Parser;
use foreman::cli::{Args, Commands};
use foreman::config::ForemanConfig;
use foreman::orchestrator::{
    ArtifactSink, LoggingSink, Orchestrator, OrchestratorConfig, TaskOutcome,
};
use foreman::packet::TaskPacket;
use foreman::registry::ProviderRegistry;
use foreman::retry::RetryContextTracker;
use foreman::telemetry::{HttpTelemetrySource, TelemetryAggregator, TelemetrySource};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foreman=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ForemanConfig::discover(args.config.as_deref())?;

    match args.command {
        Commands::Drain { backlog } => drain(config, &backlog).await,
        Commands::Run { spool } => run(config, &spool).await,
        Commands::Check => check(config).await,
        Commands::ShowConfig => {
            println!("{}", config.to_toml_string());
            Ok(())
        }
    }
}

fn build_orchestrator(
    config: &ForemanConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(Arc<Orchestrator>, Option<Arc<TelemetryAggregator>>)> {
    let registry = Arc::new(
        ProviderRegistry::from_descriptors(config.providers.clone())?
            .with_cooldown(config.cooldown()),
    );

    let aggregator = match &config.telemetry {
        Some(telemetry) => {
            let source: Arc<dyn TelemetrySource> =
                Arc::new(HttpTelemetrySource::new(&telemetry.api_url)?);
            Some(Arc::new(TelemetryAggregator::new(
                source,
                registry.clone(),
                config.thresholds(),
            )))
        }
        None => None,
    };

    let sink: Arc<dyn ArtifactSink> = Arc::new(LoggingSink);
    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        Arc::new(RetryContextTracker::new()),
        aggregator.clone(),
        sink,
        OrchestratorConfig {
            max_concurrent_tasks: config.runtime.max_concurrent_tasks,
        },
        shutdown,
    ));

    Ok((orchestrator, aggregator))
}

fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = signal_tx.send(true);
        }
    });
    (tx, rx)
}

fn load_backlog(path: &Path) -> Result<Vec<TaskPacket>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read backlog file {}", path.display()))?;
    let packets: Vec<TaskPacket> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse backlog file {}", path.display()))?;
    Ok(packets)
}

async fn drain(config: ForemanConfig, backlog: &Path) -> Result<()> {
    let (_tx, rx) = shutdown_channel();
    let (orchestrator, _) = build_orchestrator(&config, rx)?;

    let packets = load_backlog(backlog)?;
    info!(count = packets.len(), "draining backlog");

    let reports = orchestrator.drain(packets).await;
    let failures = reports
        .iter()
        .filter(|r| !matches!(r.outcome, TaskOutcome::Succeeded))
        .count();
    info!(total = reports.len(), failed = failures, "drain complete");

    if failures > 0 {
        anyhow::bail!("{} of {} tasks did not succeed", failures, reports.len());
    }
    Ok(())
}

async fn run(config: ForemanConfig, spool: &Path) -> Result<()> {
    let (_tx, mut rx) = shutdown_channel();
    let (orchestrator, aggregator) = build_orchestrator(&config, rx.clone())?;

    if let (Some(aggregator), Some(telemetry)) = (aggregator, &config.telemetry) {
        let cadence = Duration::from_secs(telemetry.cadence_secs.max(1));
        let telemetry_rx = rx.clone();
        tokio::spawn(async move { aggregator.run(cadence, telemetry_rx).await });
    }

    let poll_interval = Duration::from_secs(config.runtime.poll_interval_secs.max(1));
    info!(spool = %spool.display(), poll_secs = poll_interval.as_secs(), "entering continuous mode");

    loop {
        if *rx.borrow() {
            break;
        }

        let packets = collect_spooled_packets(spool);
        if !packets.is_empty() {
            info!(count = packets.len(), "picked up spooled tasks");
            let reports = orchestrator.clone().drain(packets).await;
            for report in reports {
                if !matches!(report.outcome, TaskOutcome::Succeeded) {
                    warn!(task_id = %report.task_id, outcome = ?report.outcome,
                          "task did not succeed");
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = rx.changed() => {}
        }
    }

    info!("continuous mode stopped");
    Ok(())
}

/// Pick up `*.json` packet files, renaming each to `*.taken` so a packet
/// is only processed once even with multiple workers on the spool.
fn collect_spooled_packets(spool: &Path) -> Vec<TaskPacket> {
    let entries = match std::fs::read_dir(spool) {
        Ok(entries) => entries,
        Err(e) => {
            error!(spool = %spool.display(), error = %e, "cannot read spool directory");
            return Vec::new();
        }
    };

    let mut packets = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let taken = path.with_extension("taken");
        if std::fs::rename(&path, &taken).is_err() {
            // Another worker claimed it first.
            continue;
        }
        let parsed = std::fs::read_to_string(&taken)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<TaskPacket>(&raw).map_err(Into::into));
        match parsed {
            Ok(packet) => packets.push(packet),
            Err(e) => error!(file = %taken.display(), error = %e, "skipping malformed packet"),
        }
    }
    packets
}

async fn check(config: ForemanConfig) -> Result<()> {
    let registry = Arc::new(
        ProviderRegistry::from_descriptors(config.providers.clone())?
            .with_cooldown(config.cooldown()),
    );

    println!(
        "{:<20} {:>8} {:>8} {:>10}",
        "provider", "priority", "enabled", "available"
    );
    for descriptor in config.providers {
        let available = match registry.adapter(&descriptor.name) {
            Some(adapter) => adapter.is_available().await,
            None => false,
        };
        println!(
            "{:<20} {:>8} {:>8} {:>10}",
            descriptor.name, descriptor.priority, descriptor.enabled, available
        );
    }
    Ok(())
}
