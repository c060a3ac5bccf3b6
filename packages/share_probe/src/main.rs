use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine_sharing::engine::RecordingEngine;
use engine_sharing::store::status::{KeyKind, RecordState, classify_key};
use engine_sharing::{
    Collector, Directory, EngineSharing, LocalEnvironment, SharingDeps, SharingEvent,
    SharingPolicy, StatusStore, SystemClock,
};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod config;

use crate::config::ProbeConfig;

#[derive(Parser)]
#[command(name = "share-probe")]
#[command(about = "Inspect and exercise engine-sharing presence stores")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding share.toml (defaults to ~/.share-probe)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List presence records and id lists in the configured store
    Inspect(InspectArgs),

    /// Run one garbage-collection pass over the store
    Sweep,

    /// Run several sharing contexts in this process and report who holds
    Simulate(SimulateArgs),
}

#[derive(Parser)]
struct InspectArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct SimulateArgs {
    /// Number of contexts competing for the engine
    #[arg(long, default_value = "3")]
    contexts: usize,

    /// How long to let them run
    #[arg(long, default_value = "10")]
    seconds: u64,

    /// Namespace to share under (defaults to the configured one)
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "share_probe=debug,engine_sharing=debug,info"
    } else {
        "share_probe=info,engine_sharing=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = ProbeConfig::new(cli.config_dir.clone())?;

    match cli.command {
        Commands::Inspect(args) => inspect_command(&config, args.json),
        Commands::Sweep => sweep_command(&config),
        Commands::Simulate(args) => simulate_command(&config, args).await,
    }
}

fn inspect_command(config: &ProbeConfig, as_json: bool) -> Result<()> {
    let status = StatusStore::new(config.open_store()?);
    let timings = config.timings();
    let origin = config.origin();
    let now = chrono::Utc::now().timestamp_millis();

    let mut records = Vec::new();
    let mut lists = Vec::new();
    let mut keys = status.get_all_keys();
    keys.sort();
    for key in &keys {
        match classify_key(key) {
            Some(KeyKind::Presence { id, namespace }) => {
                let entry = match status.inspect_key(key) {
                    RecordState::Present(record) => {
                        let state = if record.is_stale(now, timings.stale_after_millis()) {
                            "stale"
                        } else {
                            "live"
                        };
                        json!({
                            "id": id.0,
                            "namespace": namespace,
                            "state": state,
                            "age_ms": record.age_millis(now),
                            "compatible": record.is_compatible(&origin),
                            "direct_address": record.direct_address,
                            "worker_address": record.worker_address,
                            "origin_host": record.origin_host,
                            "build_id": record.build_id,
                        })
                    }
                    RecordState::Malformed => json!({ "id": id.0, "namespace": namespace, "state": "malformed" }),
                    RecordState::Absent => continue,
                };
                records.push(entry);
            }
            Some(KeyKind::IdList { name }) => {
                let ids: Vec<u64> = status.read_ids(name).iter().map(|id| id.0).collect();
                lists.push(json!({ "name": name, "ids": ids }));
            }
            None => warn!(key = %key, "unrecognized key"),
        }
    }

    if as_json {
        let out = json!({ "records": records, "lists": lists });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if records.is_empty() && lists.is_empty() {
        println!("Store is empty.");
        return Ok(());
    }
    println!("{:<8} {:<16} {:<10} {:>8}  ADDRESS", "ID", "NAMESPACE", "STATE", "AGE");
    for record in &records {
        let address = record
            .get("worker_address")
            .and_then(Value::as_str)
            .or_else(|| record.get("direct_address").and_then(Value::as_str))
            .unwrap_or("-");
        let age = record
            .get("age_ms")
            .and_then(Value::as_i64)
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<16} {:<10} {:>8}  {}",
            record["id"],
            record["namespace"].as_str().unwrap_or("-"),
            record["state"].as_str().unwrap_or("-"),
            age,
            address
        );
    }
    for list in &lists {
        println!("list {}: {}", list["name"].as_str().unwrap_or("-"), list["ids"]);
    }
    Ok(())
}

fn sweep_command(config: &ProbeConfig) -> Result<()> {
    let status = StatusStore::new(config.open_store()?);
    let collector = Collector::new(status, Arc::new(SystemClock), config.timings());
    let report = collector.sweep();
    println!(
        "Removed {} presence record(s) and {} list entr{}.",
        report.records_removed,
        report.ids_removed,
        if report.ids_removed == 1 { "y" } else { "ies" }
    );
    Ok(())
}

async fn simulate_command(config: &ProbeConfig, args: SimulateArgs) -> Result<()> {
    let store = config.open_store()?;
    let env = Arc::new(LocalEnvironment::new());
    let mut file = config.file.sharing.clone();
    if let Some(namespace) = args.namespace {
        file.namespace = namespace;
    }
    let policy = SharingPolicy::from_file(&file, env.as_ref()).context("Invalid sharing policy")?;

    info!(
        contexts = args.contexts,
        namespace = %policy.namespace(),
        store = %config.file.store.kind,
        "starting simulation"
    );

    let mut sharings = Vec::with_capacity(args.contexts);
    for n in 0..args.contexts {
        // Each context allocates from its own id range.
        let directory = Arc::new(Directory::starting_at((n as u64 + 1) * 1000));
        let deps = SharingDeps::new(store.clone(), env.clone(), directory, config.origin())
            .with_timings(config.timings());
        let sharing = EngineSharing::new(policy.clone(), deps, Arc::new(RecordingEngine::new()));

        let mut events = sharing.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SharingEvent::Holder { id } => info!(context = n, %id, "holding"),
                    SharingEvent::Attached { holder } => info!(context = n, ?holder, "attached"),
                    SharingEvent::Lost { reason } => warn!(context = n, reason = %reason, "lost"),
                    SharingEvent::Failed => warn!(context = n, "failed"),
                }
            }
        });
        sharings.push(sharing);
    }

    let starts = sharings.iter().map(|sharing| sharing.start());
    for (n, result) in futures::future::join_all(starts).await.into_iter().enumerate() {
        if let Err(e) = result {
            warn!(context = n, error = %e, "start failed");
        }
    }

    tokio::time::sleep(Duration::from_secs(args.seconds)).await;

    let mut holders = 0;
    for (n, sharing) in sharings.iter().enumerate() {
        let role = if sharing.is_holder() {
            holders += 1;
            "holder"
        } else if sharing.current().is_some() {
            "attached"
        } else {
            "idle"
        };
        let holder = sharing.current().and_then(|handle| handle.holder());
        println!(
            "context {}: {} ({})",
            n,
            role,
            holder.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    println!("{} holder(s) after {}s", holders, args.seconds);

    for sharing in &sharings {
        sharing.dispose();
    }
    Ok(())
}
