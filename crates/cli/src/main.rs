use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use replicon_controller::{ControllerConfig, Driver};
use replicon_core::prelude::*;
use replicon_store::MemoryStore;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod manifest;

#[derive(Parser, Debug)]
#[command(name = "replicon", version, about = "Replica group controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace to watch (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

/// Overrides on top of the `REPLICON_*` environment.
#[derive(Args, Debug, Default)]
struct Knobs {
    /// Concurrent reconcile workers
    #[arg(long)]
    workers: Option<usize>,
    /// Grace period for unit deletion, in seconds
    #[arg(long = "delete-grace")]
    delete_grace_secs: Option<u32>,
    /// Resync converged groups every N seconds (0 disables)
    #[arg(long = "resync")]
    resync_secs: Option<u64>,
    /// Cancel a pass that runs longer than N seconds
    #[arg(long = "pass-timeout")]
    pass_timeout_secs: Option<u64>,
    /// Seed for generated unit names
    #[arg(long = "seed")]
    name_seed: Option<u64>,
}

impl Knobs {
    fn apply(&self, mut cfg: ControllerConfig) -> ControllerConfig {
        if let Some(n) = self.workers.filter(|n| *n > 0) { cfg.workers = n; }
        if let Some(g) = self.delete_grace_secs { cfg.delete_grace_secs = g; }
        if let Some(s) = self.resync_secs { cfg.resync = (s > 0).then(|| Duration::from_secs(s)); }
        if let Some(s) = self.pass_timeout_secs { cfg.pass_timeout = Duration::from_secs(s); }
        if let Some(s) = self.name_seed { cfg.name_seed = Some(s); }
        cfg
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile ReplicaGroups in the current cluster until Ctrl-C
    Run {
        #[command(flatten)]
        knobs: Knobs,
    },
    /// Reconcile a manifest against an in-RAM store and print the result
    Simulate {
        /// YAML file with DesiredState or ReplicaGroup documents
        manifest: PathBuf,
        /// Start created units as Running instead of Pending
        #[arg(long = "running", action = ArgAction::SetTrue)]
        running: bool,
        /// Give up after this many seconds
        #[arg(long = "timeout", default_value_t = 10)]
        timeout_secs: u64,
        #[command(flatten)]
        knobs: Knobs,
    },
    /// Print the ReplicaGroup CustomResourceDefinition
    Crd,
}

fn init_tracing() {
    let env = std::env::var("REPLICON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REPLICON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => {
                    describe();
                    info!(addr = %addr, "Prometheus metrics exporter listening");
                }
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REPLICON_METRICS_ADDR; expected host:port");
        }
    }
}

fn describe() {
    metrics::describe_counter!("reconcile_passes_total", "Reconciliation passes by result");
    metrics::describe_histogram!("reconcile_pass_ms", "Wall time of one reconciliation pass");
    metrics::describe_counter!("units_created_total", "Units created");
    metrics::describe_counter!("units_deleted_total", "Units deleted");
    metrics::describe_counter!("unit_mutation_failures_total", "Failed unit mutations by action");
    metrics::describe_gauge!("workqueue_depth", "Keys waiting in the work queue");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { knobs } => run(cli.namespace, knobs.apply(ControllerConfig::from_env())).await,
        Commands::Simulate { manifest, running, timeout_secs, knobs } => {
            let cfg = knobs.apply(ControllerConfig::from_env());
            simulate(&manifest, running, Duration::from_secs(timeout_secs), cfg, cli.output).await
        }
        Commands::Crd => {
            let crd = replicon_kubehub::ReplicaGroup::crd();
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&crd)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&crd)?),
            }
            Ok(())
        }
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received; shutting down");
            }
            token.cancel();
        }
    });
    token
}

async fn run(namespace: Option<String>, cfg: ControllerConfig) -> Result<()> {
    info!(ns = ?namespace, workers = cfg.workers, "run invoked");
    let store = replicon_kubehub::KubeUnitStore::try_default().await?;
    let client = store.client();
    let (key_tx, mut key_rx) = mpsc::channel::<ObjectKey>(cfg.queue_cap);
    let driver = Driver::new(store, cfg);
    let queue = driver.queue();

    let groups = tokio::spawn({
        let (client, ns, tx) = (client.clone(), namespace.clone(), key_tx.clone());
        async move {
            if let Err(e) = replicon_kubehub::watch_groups(client, ns.as_deref(), tx).await {
                error!(error = ?e, "replicagroup watcher failed");
            }
        }
    });
    let units = tokio::spawn({
        let (ns, tx) = (namespace.clone(), key_tx);
        async move {
            if let Err(e) = replicon_kubehub::watch_units(client, ns.as_deref(), tx).await {
                error!(error = ?e, "pod watcher failed");
            }
        }
    });
    let forward = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move {
            while let Some(key) = key_rx.recv().await {
                queue.add(key);
            }
        }
    });

    driver.run(shutdown_on_ctrl_c()).await;
    groups.abort();
    units.abort();
    forward.abort();
    Ok(())
}

#[derive(Serialize)]
struct GroupReport {
    key: String,
    desired: u32,
    status: GroupStatus,
}

#[derive(Serialize)]
struct SimulationReport {
    converged: bool,
    groups: Vec<GroupReport>,
    units: Vec<ObservedUnit>,
}

fn converged(store: &MemoryStore) -> bool {
    let world = store.current();
    world.desired.values().all(|ds| {
        ds.status.condition.as_ref().map(|c| c.status) == Some(ConditionStatus::True)
            && ds.status.observed_replicas == ds.desired_replicas
    })
}

async fn simulate(path: &std::path::Path, running: bool, timeout: Duration, cfg: ControllerConfig, output: Output) -> Result<()> {
    let groups = manifest::load(path)?;
    info!(path = %path.display(), groups = groups.len(), "simulate invoked");
    let phase = if running { UnitPhase::Running } else { UnitPhase::Pending };
    let store = Arc::new(MemoryStore::new().with_create_phase(phase));
    for ds in groups {
        store.apply_desired(ds);
    }

    let driver = Driver::new(Arc::clone(&store), cfg);
    let queue = driver.queue();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(driver.run(shutdown.clone()));

    // level-triggered: every store change re-enqueues every group
    let mut epochs = store.subscribe_epoch();
    for key in store.desired_keys() {
        queue.add(key);
    }
    let wait = tokio::time::timeout(timeout, async {
        while !converged(&store) {
            if epochs.changed().await.is_err() {
                break;
            }
            for key in store.desired_keys() {
                queue.add(key);
            }
        }
    })
    .await;
    if wait.is_err() {
        warn!(timeout_secs = timeout.as_secs(), "simulation did not converge before the deadline");
    }
    shutdown.cancel();
    if let Err(e) = handle.await {
        warn!(error = %e, "driver task failed");
    }

    let world = store.current();
    let mut groups: Vec<GroupReport> = world
        .desired
        .values()
        .map(|ds| GroupReport { key: ds.key().to_string(), desired: ds.desired_replicas, status: ds.status.clone() })
        .collect();
    groups.sort_by(|a, b| a.key.cmp(&b.key));
    let report = SimulationReport { converged: converged(&store), groups, units: world.sorted_units() };

    match output {
        Output::Human => {
            println!("GROUP                DESIRED  OBSERVED  AVAILABLE  MESSAGE");
            for g in &report.groups {
                let (status, message) = match &g.status.condition {
                    Some(c) => (c.status.as_str(), c.message.as_str()),
                    None => ("-", ""),
                };
                println!("{:<20} {:<8} {:<9} {:<10} {}", g.key, g.desired, g.status.observed_replicas, status, message);
            }
            println!();
            println!("NAMESPACE   NAME                 OWNER        PHASE      AGE");
            for u in &report.units {
                let owner = u.owner_references.first().map(|o| o.name.as_str()).unwrap_or("-");
                println!("{:<11} {:<20} {:<12} {:<10} {}", u.namespace, u.name, owner, u.phase.as_str(), render_age(u.creation_timestamp));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    if !report.converged {
        anyhow::bail!("simulation did not converge within {}s", timeout.as_secs());
    }
    Ok(())
}

fn render_age(created: DateTime<Utc>) -> String {
    let mut secs = (Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
