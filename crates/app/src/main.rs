use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleet_api::{public_result, FleetApi, InProcApi};
use fleet_catalog::CatalogLoader;
use fleet_core::CatalogKind;
use fleet_persist::{LeaseStore, SqliteStore};
use fleet_workers::{
    AllOf, ConvergenceCheck, DeletingResourceManager, LeaderWorker, Reconciler, ResourceDeploymentManager,
    StartupGate, TypeManager, TypeService, WorkerSettings,
};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleet-manager", version, about = "Fleet manager control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database file (default: ~/.fleet-manager/fleet.db)
    #[arg(long, env = "FLEET_DB_PATH", global = true)]
    db_path: Option<String>,

    #[arg(long, env = "FLEET_CONNECTOR_CATALOG_DIRS", value_delimiter = ',', global = true)]
    connector_catalog_dirs: Vec<PathBuf>,
    #[arg(long, env = "FLEET_CONNECTOR_METADATA_DIRS", value_delimiter = ',', global = true)]
    connector_metadata_dirs: Vec<PathBuf>,
    #[arg(long, env = "FLEET_PROCESSOR_CATALOG_DIRS", value_delimiter = ',', global = true)]
    processor_catalog_dirs: Vec<PathBuf>,
    #[arg(long, env = "FLEET_PROCESSOR_METADATA_DIRS", value_delimiter = ',', global = true)]
    processor_metadata_dirs: Vec<PathBuf>,

    /// Leader lease duration in seconds (overrides FLEET_LEASE_SECS)
    #[arg(long)]
    lease_secs: Option<u64>,
    /// Startup gate poll interval in seconds (overrides FLEET_GATE_POLL_SECS)
    #[arg(long)]
    gate_poll_secs: Option<u64>,
    /// Overrides FLEET_TYPE_INTERVAL_SECS
    #[arg(long)]
    type_interval_secs: Option<u64>,
    /// Overrides FLEET_RESOURCE_INTERVAL_SECS
    #[arg(long)]
    resource_interval_secs: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind { Connector, Processor }

impl From<Kind> for CatalogKind {
    fn from(k: Kind) -> Self {
        match k {
            Kind::Connector => CatalogKind::Connector,
            Kind::Processor => CatalogKind::Processor,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconcilers until interrupted (default)
    Serve,
    /// Load a catalog from disk and print its entries without touching the database
    Catalog {
        #[arg(value_enum)]
        kind: Kind,
    },
    /// Show the current leader of each catalog lease
    Leases,
}

#[derive(Serialize)]
struct EntryRow<'a> {
    id: &'a str,
    name: &'a str,
    channels: &'a [String],
    checksum: &'a str,
    source: String,
}

#[derive(Serialize)]
struct LeaseRow {
    lease_type: String,
    leader: String,
    expires: String,
    expired: bool,
}

impl Cli {
    /// Environment settings with command line flags on top.
    fn settings(&self) -> WorkerSettings {
        let flag = |s: Option<u64>, base: Duration| s.filter(|s| *s > 0).map(Duration::from_secs).unwrap_or(base);
        let env = WorkerSettings::from_env();
        WorkerSettings {
            lease_ttl: flag(self.lease_secs, env.lease_ttl),
            gate_poll: flag(self.gate_poll_secs, env.gate_poll),
            type_interval: flag(self.type_interval_secs, env.type_interval),
            resource_interval: flag(self.resource_interval_secs, env.resource_interval),
        }
    }

    /// Loaders for the kinds that have catalog directories configured.
    fn loaders(&self) -> Vec<CatalogLoader> {
        let mut out = Vec::new();
        if !self.connector_catalog_dirs.is_empty() {
            out.push(CatalogLoader::new(
                CatalogKind::Connector,
                self.connector_catalog_dirs.clone(),
                self.connector_metadata_dirs.clone(),
            ));
        }
        if !self.processor_catalog_dirs.is_empty() {
            out.push(CatalogLoader::new(
                CatalogKind::Processor,
                self.processor_catalog_dirs.clone(),
                self.processor_metadata_dirs.clone(),
            ));
        }
        out
    }

    fn open_store(&self) -> Result<SqliteStore> {
        match &self.db_path {
            Some(p) => SqliteStore::open(p),
            None => SqliteStore::open_default(),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("FLEET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLEET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FLEET_METRICS_ADDR; expected host:port");
        }
    }
}

fn render_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms).map(|t| t.to_rfc3339()).unwrap_or_else(|| ms.to_string())
}

async fn serve(cli: &Cli) -> Result<()> {
    let started = Instant::now();
    let settings = cli.settings();
    let store = Arc::new(cli.open_store()?);
    let loaders = cli.loaders();
    if loaders.is_empty() {
        warn!("no catalog directories configured; the startup gate opens immediately");
    }

    let services: Vec<Arc<TypeService>> =
        loaders.into_iter().map(|l| Arc::new(TypeService::new(store.clone(), l))).collect();
    let checks: Vec<Arc<dyn ConvergenceCheck>> =
        services.iter().map(|s| s.clone() as Arc<dyn ConvergenceCheck>).collect();
    let readiness = StartupGate::spawn(Arc::new(AllOf(checks)), settings.gate_poll);

    let reconciler = Reconciler::new();
    for svc in &services {
        let kind = svc.kind();
        let leases: Arc<dyn LeaseStore> = store.clone();
        let manager = TypeManager::new(svc.clone(), readiness.clone(), settings.type_interval);
        reconciler.start(Arc::new(LeaderWorker::new(manager, leases, kind.lease_type(), settings.lease_ttl)))?;
    }
    reconciler.start(Arc::new(ResourceDeploymentManager::new(store.clone(), settings.resource_interval)))?;
    reconciler.start(Arc::new(DeletingResourceManager::new(store.clone(), settings.resource_interval)))?;
    let api = InProcApi::new(store.clone(), readiness.clone());

    tokio::select! {
        _ = readiness.wait() => {
            metrics::gauge!("fleet_ready", 1.0);
            for svc in &services {
                let kind = svc.kind();
                match public_result("listTypes", api.list_types(kind).await) {
                    Ok(types) => info!(kind = %kind, types = types.len(), "fleet-manager: types available"),
                    Err(e) => warn!(kind = %kind, code = %e.code, reason = %e.reason, "fleet-manager: listing types failed"),
                }
            }
            info!(took_ms = %started.elapsed().as_millis(), workers = reconciler.worker_ids().len(), "fleet-manager: ready");
        }
        _ = signal::ctrl_c() => {
            info!("fleet-manager: interrupted before ready");
            reconciler.stop_all().await;
            return Ok(());
        }
    }

    let mut prune = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = prune.tick() => {
                for id in reconciler.prune_terminated().await {
                    info!(worker = %id, "fleet-manager: worker retired");
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }
    info!("fleet-manager: shutting down");
    reconciler.stop_all().await;
    Ok(())
}

fn print_catalog(cli: &Cli, kind: CatalogKind) -> Result<()> {
    let loader = cli
        .loaders()
        .into_iter()
        .find(|l| l.kind() == kind)
        .with_context(|| format!("no {} catalog directories configured", kind))?;
    let report = loader.load()?;
    if let Some(e) = &report.deferred {
        warn!(kind = %kind, error = %e, "catalog has unrecognized metadata");
    }
    let rows: Vec<EntryRow<'_>> = report
        .catalog
        .iter()
        .map(|e| EntryRow {
            id: e.id(),
            name: &e.resource_type.name,
            channels: &e.resource_type.channels,
            checksum: &e.checksum,
            source: e.source.display().to_string(),
        })
        .collect();
    match cli.output {
        Output::Human => {
            println!("{:<32} {:<20} {:<12} CHECKSUM", "ID", "NAME", "CHANNELS");
            for r in &rows {
                println!("{:<32} {:<20} {:<12} {}", r.id, r.name, r.channels.join(","), &r.checksum[..12.min(r.checksum.len())]);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

fn print_leases(cli: &Cli) -> Result<()> {
    let store = cli.open_store()?;
    let now = fleet_core::now_ms();
    let mut rows = Vec::new();
    for kind in [CatalogKind::Connector, CatalogKind::Processor] {
        if let Some(l) = store.current_lease(kind.lease_type())? {
            rows.push(LeaseRow { expired: l.is_expired(now), expires: render_ms(l.expires), lease_type: l.lease_type, leader: l.leader });
        }
    }
    match cli.output {
        Output::Human => {
            println!("{:<16} {:<38} {:<32} STATE", "LEASE", "LEADER", "EXPIRES");
            for r in &rows {
                let state = if r.expired { "expired" } else { "held" };
                println!("{:<16} {:<38} {:<32} {}", r.lease_type, r.leader, r.expires, state);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let outcome = match cli.command.as_ref().unwrap_or(&Commands::Serve) {
        Commands::Serve => serve(&cli).await,
        Commands::Catalog { kind } => print_catalog(&cli, (*kind).into()),
        Commands::Leases => print_leases(&cli),
    };
    if let Err(e) = &outcome {
        error!(error = %format!("{:#}", e), "fleet-manager: failed");
    }
    outcome
}
