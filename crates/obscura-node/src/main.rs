//! obscura-node — the Obscura mixing-core daemon.
//!
//! Startup sequence (serve):
//!   1. Load and validate configuration
//!   2. Open the state database and key vault
//!   3. Start the resource governor and its memory monitor
//!   4. Build the chain facade and start endpoint health probes
//!   5. Restore the liquidity pool, start the scheduler fiber
//!   6. Resume live sessions, start the expiry sweep
//!   7. Serve the JSON-RPC 2.0 API until interrupted
//!
//! Every other subcommand is a thin operator client against a running
//! node's RPC endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use obscura_audit::{AuditLog, AuditStore};
use obscura_chain::ChainFacade;
use obscura_core::config::Config;
use obscura_core::constants::HEALTH_RECOVER_THRESHOLD;
use obscura_govern::{GovernorEvent, ResourceGovernor, TimerKind};
use obscura_health::{
    AlertManager, AlertSeverity, FailoverDirector, FailoverPolicy, HealthStatus, RequestClass,
};
use obscura_pool::LiquidityPool;
use obscura_rpc::{RpcServer, RpcServerState};
use obscura_sched::{SchedEvent, Scheduler};
use obscura_session::expiry::spawn_expiry_sweep;
use obscura_session::SessionManager;
use obscura_store::MixStore;

mod client;
use client::OperatorClient;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "obscura-node",
    version,
    about = "Obscura mixing core — non-custodial multi-currency mixer"
)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Node RPC endpoint (operator subcommands).
    #[arg(long, global = true, default_value = "http://127.0.0.1:8545")]
    rpc: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the mixing core.
    Serve,

    /// Print the node's health summary.
    Status,

    /// Session inspection.
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Alert operations.
    Alerts {
        #[command(subcommand)]
        command: AlertsCommand,
    },

    /// Toggle maintenance mode.
    Maintenance {
        /// "on" or "off".
        state: String,
        /// Reason recorded in the audit stream.
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// Show one session by hex id.
    Show { id: String },
}

#[derive(Subcommand, Debug)]
enum AlertsCommand {
    /// List active alerts.
    List,
    /// Acknowledge an alert.
    Ack { id: u64 },
    /// Resolve an alert.
    Resolve { id: u64 },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,obscura=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let exit = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "unrecoverable error");
            1
        }
    };
    std::process::exit(exit);
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Serve => serve(args.config.as_deref()).await,
        Command::Status => {
            let client = OperatorClient::new(&args.rpc);
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Session { command } => {
            let client = OperatorClient::new(&args.rpc);
            match command {
                SessionCommand::Show { id } => {
                    let view = client.session_show(&id).await?;
                    println!("{}", serde_json::to_string_pretty(&view)?);
                }
            }
            Ok(())
        }
        Command::Alerts { command } => {
            let client = OperatorClient::new(&args.rpc);
            let actor = whoami();
            match command {
                AlertsCommand::List => {
                    let alerts = client.alerts_list().await?;
                    println!("{}", serde_json::to_string_pretty(&alerts)?);
                }
                AlertsCommand::Ack { id } => {
                    client.alerts_ack(id, &actor).await?;
                    println!("acknowledged {id}");
                }
                AlertsCommand::Resolve { id } => {
                    client.alerts_resolve(id, &actor).await?;
                    println!("resolved {id}");
                }
            }
            Ok(())
        }
        Command::Maintenance { state, reason } => {
            let on = match state.as_str() {
                "on" => true,
                "off" => false,
                other => anyhow::bail!("maintenance takes on|off, got {other}"),
            };
            let client = OperatorClient::new(&args.rpc);
            client.set_maintenance(on, &reason).await?;
            println!("maintenance mode: {state}");
            Ok(())
        }
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "operator".into())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

// ── Serve ─────────────────────────────────────────────────────────────────────

async fn serve(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(p) => Config::load(p).with_context(|| format!("loading {}", p.display()))?,
        None => {
            warn!("no --config given; serving with development defaults");
            Config::default()
        }
    };
    info!("Obscura core starting");

    // ── State database & vault ────────────────────────────────────────────────
    let data_dir = expand_tilde(&config.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let store = Arc::new(MixStore::open(&data_dir).context("opening state database")?);

    // ── Resource governor ─────────────────────────────────────────────────────
    let governor = ResourceGovernor::new(config.resource.clone());
    let (governor_tx, mut governor_rx) = tokio::sync::mpsc::channel(64);
    governor.spawn_monitor(governor_tx);

    // ── Audit log & alerting ──────────────────────────────────────────────────
    let audit = Arc::new(AuditLog::new(Arc::clone(&store) as Arc<dyn AuditStore>));
    let alerts = Arc::new(AlertManager::with_default_rules(
        config.alerts.channels.clone(),
        config.alerts.cooldown_minutes * 60,
        config.alerts.max_per_hour,
    ));
    if config.alerts.maintenance_mode {
        alerts.set_maintenance_mode(true, "enabled in configuration");
    }

    // Route memory-pressure events into the alert core.
    {
        let alerts = Arc::clone(&alerts);
        let handle = tokio::spawn(async move {
            while let Some(event) = governor_rx.recv().await {
                let now = chrono::Utc::now().timestamp();
                match event {
                    GovernorEvent::MemoryWarning { ratio, cleaned } => {
                        alerts.raise(
                            "resource",
                            "memory",
                            AlertSeverity::Warning,
                            "memory warning",
                            &format!("usage ratio {ratio:.2}, {cleaned} entries cleaned"),
                            now,
                        );
                    }
                    GovernorEvent::MemoryCritical { ratio, evicted } => {
                        alerts.raise(
                            "resource",
                            "memory",
                            AlertSeverity::Critical,
                            "memory critical",
                            &format!("usage ratio {ratio:.2}, {evicted} entries evicted"),
                            now,
                        );
                    }
                    GovernorEvent::MemoryUsage { .. } => {}
                }
            }
        });
        governor.timers.register(
            "governor-alert-pump",
            TimerKind::Interval,
            "routes memory pressure events to alerting",
            handle,
        );
    }

    // ── Chain facade ──────────────────────────────────────────────────────────
    let facade = Arc::new(
        ChainFacade::from_config(&config, Arc::clone(&store), &governor)
            .context("building chain facade")?,
    );
    facade.spawn_probes(&governor);

    // ── Transport failover ────────────────────────────────────────────────────
    let failover = Arc::new(build_failover(&config));
    spawn_failover_feed(Arc::clone(&failover), Arc::clone(&facade), Arc::clone(&alerts), &governor);

    // ── Pool & scheduler ──────────────────────────────────────────────────────
    let pool = Arc::new(
        LiquidityPool::new(&config, Arc::clone(&store)).context("restoring liquidity pool")?,
    );
    let (sched_event_tx, sched_event_rx) = tokio::sync::mpsc::channel::<SchedEvent>(1_024);
    let (scheduler, sched_tx) = Scheduler::new(
        Arc::clone(&facade),
        Arc::clone(&pool),
        Arc::clone(&store),
        config.mixing.clone(),
        sched_event_tx,
    );
    tokio::spawn(scheduler.run());

    // ── Session state machine ─────────────────────────────────────────────────
    let sessions = SessionManager::start(
        Arc::clone(&store),
        Arc::clone(&audit),
        Arc::clone(&pool),
        Arc::clone(&facade),
        sched_tx,
        sched_event_rx,
        Arc::clone(&alerts),
        Arc::clone(&governor),
        config.clone(),
    );
    spawn_expiry_sweep(Arc::clone(&sessions), Arc::clone(&pool), &governor);

    // ── RPC server ────────────────────────────────────────────────────────────
    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr {}", config.listen_addr))?;
    let rpc_state = Arc::new(RpcServerState {
        sessions,
        facade: Arc::clone(&facade),
        alerts: Arc::clone(&alerts),
        config: config.clone(),
    });
    let rpc_handle = RpcServer::new(rpc_state)
        .start(listen_addr)
        .await
        .context("starting RPC server")?;

    info!("core ready");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    // Orderly teardown: stop accepting, clear timers and collections,
    // flush the store. In-flight broadcasts are on-chain and unaffected.
    let _ = rpc_handle.stop();
    governor.shutdown();
    store.flush().context("flushing store")?;
    Ok(())
}

/// Transport policies per request class. Admin deliberately has no
/// fallback: it errors rather than degrades.
fn build_failover(config: &Config) -> FailoverDirector {
    let mut policies = HashMap::new();
    for class in RequestClass::ALL {
        let fallback = match class {
            RequestClass::Admin => None,
            _ => config.transport.fallback.clone(),
        };
        policies.insert(
            class,
            FailoverPolicy {
                primary: config.transport.primary.clone(),
                fallback,
                timeout_ms: config.transport.timeout_ms,
                retries: config.transport.retries,
                auto_recovery: class != RequestClass::Admin,
            },
        );
    }
    FailoverDirector::new(policies, HEALTH_RECOVER_THRESHOLD)
}

/// Feed chain endpoint health into the failover director: healthy majority
/// drives primary recovery, multiple failed endpoints trigger emergency
/// failover for every non-admin class.
fn spawn_failover_feed(
    failover: Arc<FailoverDirector>,
    facade: Arc<ChainFacade>,
    alerts: Arc<AlertManager>,
    governor: &ResourceGovernor,
) {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            obscura_core::constants::HEALTH_PROBE_INTERVAL_SECS,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut failed = 0usize;
            let mut total = 0usize;
            for currency in facade.currencies() {
                let Ok(snapshot) = facade.health(currency) else {
                    continue;
                };
                total += 1;
                if snapshot.status == HealthStatus::Failed {
                    failed += 1;
                }
            }
            failover.record_primary_probe(RequestClass::Blockchain, failed == 0);
            if failed >= 2 && !failover.is_emergency() {
                failover.trigger_emergency("multiple chain endpoints failed");
                alerts.raise(
                    "transport",
                    "failover",
                    AlertSeverity::Emergency,
                    "emergency failover engaged",
                    &format!("{failed}/{total} chain endpoints failed"),
                    chrono::Utc::now().timestamp(),
                );
            } else if failed == 0 && failover.is_emergency() {
                failover.clear_emergency();
            }
        }
    });
    governor.timers.register(
        "failover-feed",
        TimerKind::Interval,
        "feeds chain health into transport failover",
        handle,
    );
}
