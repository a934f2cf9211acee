use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use tabsync_core::{AlwaysLeader, LeadershipGate, SourceKind, SyncPolicy};
use tabsync_engine::driver::LoopDriver;
use tabsync_engine::EngineSettings;
use tabsync_kubehub::{get_kube_client, spawn_lease_gate, spawn_watchers, KubeLister};
use tabsync_organizr::OrganizrClient;

#[derive(Parser, Debug)]
#[command(name = "tabsyncd", version, about = "Sync annotated Kubernetes resources into Organizr tabs")]
struct Config {
    /// Base URL of the Organizr instance
    #[arg(long, env = "TABSYNC_API_URL")]
    api_url: String,

    /// Organizr API key; read from --api-key-file when empty
    #[arg(long, env = "TABSYNC_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,

    /// Path to a file containing the API key (Secret mount)
    #[arg(long, env = "TABSYNC_API_KEY_FILE", default_value = "/var/run/secrets/tabsync/api-key")]
    api_key_file: String,

    /// HTTP timeout for Organizr API calls, in seconds
    #[arg(long, env = "TABSYNC_API_TIMEOUT_SECS", default_value_t = 30)]
    api_timeout_secs: u64,

    /// upsert: create/update only. sync: also delete managed orphans.
    #[arg(long, env = "TABSYNC_SYNC_POLICY", default_value_t = SyncPolicy::Upsert)]
    sync_policy: SyncPolicy,

    /// Seconds between timer-triggered reconciliations (min 10)
    #[arg(long, env = "TABSYNC_RECONCILE_INTERVAL_SECS", default_value_t = 60)]
    reconcile_interval_secs: u64,

    /// Namespaces to watch, comma-separated. Empty means all namespaces.
    #[arg(long, env = "TABSYNC_NAMESPACES", value_delimiter = ',', num_args = 0..)]
    namespaces: Vec<String>,

    /// Resource kinds to watch, comma-separated
    #[arg(
        long,
        env = "TABSYNC_KINDS",
        value_delimiter = ',',
        default_value = "ingresses,services,deployments,statefulsets,daemonsets"
    )]
    kinds: Vec<String>,

    /// Gate reconciliation on a coordination.k8s.io Lease (HA deployments)
    #[arg(long, env = "TABSYNC_LEADER_ELECTION", action = ArgAction::SetTrue)]
    leader_election: bool,

    /// Namespace of the leader-election Lease
    #[arg(long, env = "TABSYNC_LEASE_NAMESPACE", default_value = "default")]
    lease_namespace: String,

    /// Name of the leader-election Lease
    #[arg(long, env = "TABSYNC_LEASE_NAME", default_value = "tabsync-leader")]
    lease_name: String,

    /// Run a single reconcile cycle and exit
    #[arg(long, action = ArgAction::SetTrue)]
    once: bool,

    /// Compute and log the plan without applying it
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
}

fn init_tracing() {
    let env = std::env::var("TABSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TABSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TABSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_kinds(raw: &[String]) -> Result<Vec<SourceKind>> {
    let mut kinds = Vec::new();
    for name in raw {
        match SourceKind::parse(name) {
            Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Some(_) => {}
            None => bail!("unknown resource kind: {name:?}"),
        }
    }
    if kinds.is_empty() {
        bail!("no resource kinds configured");
    }
    Ok(kinds)
}

fn resolve_api_key(cfg: &Config) -> String {
    if !cfg.api_key.is_empty() {
        return cfg.api_key.clone();
    }
    match std::fs::read_to_string(&cfg.api_key_file) {
        Ok(contents) => contents.trim().to_string(),
        Err(_) => String::new(),
    }
}

fn identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("tabsyncd-{}", std::process::id()))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cfg = Config::parse();

    if cfg.reconcile_interval_secs < 10 {
        bail!("reconcile interval must be at least 10 seconds");
    }
    let kinds = parse_kinds(&cfg.kinds)?;
    let api_key = resolve_api_key(&cfg);
    if api_key.is_empty() {
        warn!("no api key configured; Organizr calls will likely be rejected");
    }

    let namespaces: Vec<String> = cfg
        .namespaces
        .iter()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .collect();

    let kind_names: Vec<&str> = kinds.iter().map(|k| k.plural()).collect();
    let ns_display = if namespaces.is_empty() {
        vec!["all".to_string()]
    } else {
        namespaces.clone()
    };
    info!(
        api_url = %cfg.api_url,
        policy = %cfg.sync_policy,
        interval = cfg.reconcile_interval_secs,
        kinds = ?kind_names,
        namespaces = ?ns_display,
        "tabsyncd starting"
    );

    let api = Arc::new(
        OrganizrClient::new(
            &cfg.api_url,
            &api_key,
            Duration::from_secs(cfg.api_timeout_secs),
        )
        .context("building Organizr client")?,
    );

    let client = get_kube_client().await?;
    let lister = Arc::new(KubeLister::new(
        client.clone(),
        kinds.clone(),
        namespaces.clone(),
    ));

    let settings = EngineSettings {
        sync_policy: cfg.sync_policy,
        interval: Duration::from_secs(cfg.reconcile_interval_secs),
        dry_run: cfg.dry_run,
        ..EngineSettings::default()
    };

    let gate: Arc<dyn LeadershipGate> = if cfg.leader_election {
        Arc::new(spawn_lease_gate(
            client.clone(),
            cfg.lease_namespace.clone(),
            cfg.lease_name.clone(),
            identity(),
        ))
    } else {
        Arc::new(AlwaysLeader)
    };

    let mut driver = LoopDriver::new(lister, api, gate, settings);

    if cfg.once {
        let report = driver.run_cycle(None).await?;
        info!(outcome = %report.summary(), "single reconcile cycle complete");
        if report.failed > 0 {
            bail!("{} operation(s) failed", report.failed);
        }
        return Ok(());
    }

    let (change_tx, change_rx) = mpsc::channel(1);
    spawn_watchers(&client, &kinds, &namespaces, change_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("signal received; shutting down");
        let _ = shutdown_tx.send(true);
    });

    driver.run(change_rx, shutdown_rx).await?;
    info!("tabsyncd stopped");
    Ok(())
}
