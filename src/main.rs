//! # NotaryDrip: lifecycle notification engine
//!
//! Usage:
//!   notarydrip run                         # Gateway + sweep loop
//!   notarydrip sweep                       # One sweep pass, then exit
//!   notarydrip emit event.json             # Ingest a domain event ("-" reads stdin)
//!   notarydrip import catalog.json         # Load sequences from a catalog file
//!   notarydrip status client-42 payment_completed

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use notarydrip_core::config::DripConfig;
use notarydrip_core::funnel::FunnelStatus;
use notarydrip_core::types::DomainEvent;
use notarydrip_sequences::NotificationEngine;
use notarydrip_sequences::store::{export_catalog, import_catalog};
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "notarydrip",
    version,
    about = "📬 NotaryDrip: trigger-driven email and SMS drip campaigns"
)]
struct Cli {
    /// Config file (default: ~/.notarydrip/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway and the sweep loop until Ctrl-C
    Run {
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Process every due send once
    Sweep,
    /// Ingest a domain event from a JSON file ("-" for stdin)
    Emit { file: PathBuf },
    /// Load sequences from a catalog file
    Import { file: PathBuf },
    /// Write all sequences to a catalog file
    Export { file: PathBuf },
    /// List sequences and their steps
    List,
    /// Per-sequence send counts
    Stats,
    /// Recent permanent failures
    Failures {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Render a step without sending it
    Preview {
        step_id: String,
        /// Take variables from this subject
        #[arg(long)]
        subject: Option<String>,
        /// Extra variables, key=value
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Propose a funnel status for a subject (only forward moves are written)
    Status { subject_id: String, status: String },
}

fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

fn load_config(path: Option<&PathBuf>) -> Result<DripConfig> {
    let config = match path {
        Some(p) => DripConfig::load_from(p)?,
        None => DripConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "notarydrip=debug,notarydrip_sequences=debug,notarydrip_channels=debug,notarydrip_gateway=debug,tower_http=debug"
    } else {
        "notarydrip=info,notarydrip_sequences=info,notarydrip_channels=info,notarydrip_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = load_config(cli.config.as_ref())?;
    if let Command::Run { port: Some(port) } = &cli.command {
        config.gateway.port = *port;
    }
    let engine = NotificationEngine::from_config(&config).context("Failed to start engine")?;

    match cli.command {
        Command::Run { .. } => run(engine, &config).await?,
        Command::Sweep => {
            let report = engine.sweep(Utc::now()).await?;
            println!("🧹 Sweep: {} due", report.due);
            println!("   ✅ delivered:  {}", report.delivered);
            println!("   🔁 retrying:   {}", report.retrying);
            println!("   ❌ failed:     {}", report.failed);
            println!("   ⏭️  skipped:    {}", report.skipped);
            println!("   🔒 duplicates: {}", report.duplicates);
            if report.errors > 0 {
                println!("   ⚠️  errors:     {}", report.errors);
            }
        }
        Command::Emit { file } => {
            let json = if file.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?
            };
            let event: DomainEvent = serde_json::from_str(&json).context("Invalid event JSON")?;
            let report = engine.ingest(&event).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Import { file } => {
            let report = import_catalog(engine.db(), &file)?;
            println!(
                "📂 Imported: {} created, {} updated ({} steps created, {} updated)",
                report.created, report.updated, report.steps_created, report.steps_updated
            );
        }
        Command::Export { file } => {
            let count = export_catalog(engine.db(), &file)?;
            println!("💾 Exported {count} sequence(s) to {}", file.display());
        }
        Command::List => {
            let sequences = engine.catalog().list()?;
            if sequences.is_empty() {
                println!("No sequences.");
            }
            for seq in sequences {
                let state = if seq.active { "🟢" } else { "⚪" };
                let gate = match seq.required_status {
                    Some(status) => format!(" [{} {}]", seq.status_gate.as_str(), status.as_str()),
                    None => String::new(),
                };
                println!(
                    "{state} {} ({}) {} on {}{gate}",
                    seq.name,
                    seq.id,
                    seq.channel.as_str(),
                    seq.trigger_event.as_str()
                );
                for step in &seq.steps {
                    let state = if step.active { "  ·" } else { "  ✗" };
                    let window = step
                        .window
                        .map(|w| format!(" window {:02}-{:02}", w.start_hour, w.end_hour))
                        .unwrap_or_default();
                    println!(
                        "{state} #{} +{} {}{window} {} ({})",
                        step.order_index,
                        step.delay.value,
                        step.delay.unit.as_str(),
                        step.template_key,
                        step.id
                    );
                }
            }
        }
        Command::Stats => {
            for (seq, stats) in engine.catalog().all_stats()? {
                println!(
                    "{:<32} pending {:>5}  sent {:>5}  skipped {:>5}  failed {:>5}",
                    seq.name, stats.pending, stats.sent, stats.skipped, stats.failed
                );
            }
        }
        Command::Failures { limit } => {
            let failures = engine.db().recent_failures(limit)?;
            if failures.is_empty() {
                println!("No failures recorded.");
            }
            for f in failures {
                println!(
                    "❌ {} {} subject={} sequence={} attempts={}: {}",
                    f.timestamp.to_rfc3339(),
                    f.kind.as_str(),
                    f.subject_id,
                    f.sequence_id,
                    f.attempt_count,
                    f.detail
                );
            }
        }
        Command::Preview { step_id, subject, vars } => {
            let vars: HashMap<String, String> = vars.into_iter().collect();
            let preview = engine.preview(&step_id, subject.as_deref(), &vars).await?;
            if let Some(subject) = &preview.subject {
                println!("Subject: {subject}\n");
            }
            println!("{}", preview.body);
            if !preview.unresolved.is_empty() {
                println!("\n⚠️  Unresolved: {}", preview.unresolved.join(", "));
            }
        }
        Command::Status { subject_id, status } => {
            let proposed = FunnelStatus::parse(&status);
            if proposed == FunnelStatus::Unknown {
                anyhow::bail!("Unknown funnel status '{status}'");
            }
            if engine.propose_status(&subject_id, proposed).await? {
                println!("✅ {subject_id} advanced to {}", proposed.as_str());
            } else {
                println!("ℹ️  {subject_id} unchanged (already at or past {})", proposed.as_str());
            }
        }
    }

    Ok(())
}

/// Gateway and sweeper side by side until Ctrl-C.
async fn run(engine: NotificationEngine, config: &DripConfig) -> Result<()> {
    let settings = engine.settings();
    println!("📬 NotaryDrip v{}", env!("CARGO_PKG_VERSION"));
    println!("   🌐 API:       http://{}:{}/api/v1", config.gateway.host, config.gateway.port);
    println!("   🗄️  Database:  {}", config.database.path);
    println!("   🕐 Timezone:  {}", settings.timezone.name());
    println!("   🧹 Sweep:     every {}s", settings.sweep_interval.as_secs());
    println!("   🪪 Worker:    {}", settings.worker_id);
    println!();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = engine.spawn_sweeper(shutdown_rx.clone());

    let mut failures = engine.feed().subscribe();
    tokio::spawn(async move {
        loop {
            match failures.recv().await {
                Ok(event) => tracing::debug!(
                    "📣 Failure feed: {} for {}",
                    event.kind.as_str(),
                    event.subject_id
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("⚠️ Failure feed listener lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut gateway = tokio::spawn({
        let engine = engine.clone();
        let gateway_config = config.gateway.clone();
        async move { notarydrip_gateway::start(engine, &gateway_config, shutdown_rx).await }
    });

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("🛑 Ctrl-C received, shutting down");
            shutdown_tx.send(true).ok();
            (&mut gateway).await?
        }
        finished = &mut gateway => {
            shutdown_tx.send(true).ok();
            finished?
        }
    };

    sweeper.await.ok();
    result
}
