use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::clock::{SharedClock, TokioClock};
use floodgate::config::EngineConfig;
use floodgate::ratelimit::{build_limiter, DistributedLimiter, KeyedLimiter, Limiter, Outcome};
use floodgate::store::{CounterStore, InMemoryCounterStore};

/// Drive Floodgate limiters from the command line.
#[derive(Parser, Debug)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// YAML configuration file; `FLOODGATE__*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a stream of requests through the configured limiter
    Simulate(SimulateArgs),
    /// Simulate several nodes sharing one counter store
    Nodes(NodesArgs),
    /// Validate and print the effective configuration
    CheckConfig,
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Number of requests to send
    #[arg(long, default_value_t = 100)]
    requests: u64,

    /// Delay between requests in milliseconds
    #[arg(long, default_value_t = 10)]
    interval_ms: u64,

    /// Number of distinct keys; more than one enables per-key limiting
    #[arg(long, default_value_t = 1)]
    keys: usize,

    /// How long each admitted request works, in milliseconds
    #[arg(long, default_value_t = 0)]
    work_ms: u64,

    /// Probability that an admitted request fails
    #[arg(long, default_value_t = 0.0)]
    failure_rate: f64,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct NodesArgs {
    /// Number of logical nodes
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Total number of requests, spread round-robin over the nodes
    #[arg(long, default_value_t = 100)]
    requests: u64,

    /// Delay between requests in milliseconds
    #[arg(long, default_value_t = 10)]
    interval_ms: u64,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default, Serialize)]
struct SimulationSummary {
    strategy: String,
    keys: usize,
    requests: u64,
    admitted: u64,
    rejected: u64,
    succeeded: u64,
    failed: u64,
    interrupted: bool,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct NodeSummary {
    node_id: String,
    allowed: u64,
    denied: u64,
}

#[derive(Debug, Serialize)]
struct NodesSummary {
    limit: u64,
    window_ms: u128,
    nodes: Vec<NodeSummary>,
    interrupted: bool,
}

/// Where a simulated request gets its limiter from.
enum Source {
    Single(Arc<dyn Limiter>),
    Keyed(KeyedLimiter<dyn Limiter>, usize),
}

impl Source {
    fn limiter_for(&self, request: u64) -> anyhow::Result<(String, Arc<dyn Limiter>)> {
        match self {
            Source::Single(limiter) => Ok(("default".to_string(), limiter.clone())),
            Source::Keyed(keyed, keys) => {
                let key = format!("key-{}", request % *keys as u64);
                let limiter = keyed.for_key(&key)?;
                Ok((key, limiter))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(
        kind = %config.limiter.kind,
        capacity = config.limiter.capacity,
        period_ms = config.limiter.period_ms,
        keyed = config.keyed.is_some(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Simulate(args) => simulate(config, args).await,
        Command::Nodes(args) => nodes(config, args).await,
        Command::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            info!("Configuration is valid");
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn simulate(config: EngineConfig, args: SimulateArgs) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&args.failure_rate) {
        bail!("--failure-rate must be between 0 and 1, got {}", args.failure_rate);
    }
    if args.keys == 0 {
        bail!("--keys must be at least 1");
    }

    let clock: SharedClock = TokioClock::shared();
    let source = if args.keys > 1 || config.keyed.is_some() {
        let keyed_config = config.keyed.clone().unwrap_or_default();
        let keyed = KeyedLimiter::from_config(&config.limiter, &keyed_config, clock.clone())?;
        Source::Keyed(keyed, args.keys)
    } else {
        Source::Single(build_limiter(&config.limiter, clock.clone())?)
    };

    info!(
        requests = args.requests,
        interval_ms = args.interval_ms,
        keys = args.keys,
        "Starting simulation"
    );

    let started = Instant::now();
    let succeeded = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let mut summary = SimulationSummary {
        strategy: config.limiter.kind.to_string(),
        keys: args.keys,
        ..SimulationSummary::default()
    };
    let mut work = JoinSet::new();
    let interval = Duration::from_millis(args.interval_ms);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    for request in 0..args.requests {
        let (key, limiter) = source.limiter_for(request)?;
        summary.requests += 1;

        match limiter.try_admit(1) {
            Some(admission) => {
                summary.admitted += 1;
                debug!(request, key = %key, queued = admission.is_queued(), "Admitted");

                let succeeded = succeeded.clone();
                let failed = failed.clone();
                let work_time = Duration::from_millis(args.work_ms);
                let failure_rate = args.failure_rate;
                work.spawn(async move {
                    let admission = match admission.ready(None).await {
                        Ok(admission) => admission,
                        Err(err) => {
                            warn!(request, error = %err, "Admission was not honored");
                            return;
                        }
                    };
                    tokio::time::sleep(work_time).await;

                    let outcome = if rand::thread_rng().gen_bool(failure_rate) {
                        failed.fetch_add(1, Ordering::Relaxed);
                        Outcome::Failure
                    } else {
                        succeeded.fetch_add(1, Ordering::Relaxed);
                        Outcome::Success
                    };
                    admission.release(outcome);
                });
            }
            None => {
                summary.rejected += 1;
                debug!(request, key = %key, "Rejected");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut shutdown => {
                summary.interrupted = true;
                break;
            }
        }
    }

    if summary.interrupted {
        work.shutdown().await;
    } else {
        while work.join_next().await.is_some() {}
    }

    summary.succeeded = succeeded.load(Ordering::Relaxed);
    summary.failed = failed.load(Ordering::Relaxed);
    summary.elapsed_ms = started.elapsed().as_millis();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            strategy = %summary.strategy,
            requests = summary.requests,
            admitted = summary.admitted,
            rejected = summary.rejected,
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_ms = summary.elapsed_ms as u64,
            "Simulation finished"
        );
    }
    Ok(())
}

async fn nodes(config: EngineConfig, args: NodesArgs) -> anyhow::Result<()> {
    if args.nodes == 0 {
        bail!("--nodes must be at least 1");
    }

    let clock: SharedClock = TokioClock::shared();
    let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
    let base_id = config
        .distributed
        .as_ref()
        .and_then(|d| d.node_id.clone())
        .unwrap_or_else(|| "node".to_string());

    let limiters = (0..args.nodes)
        .map(|i| {
            DistributedLimiter::from_config(
                &config.limiter,
                config.distributed.as_ref(),
                store.clone(),
                clock.clone(),
            )
            .map(|limiter| limiter.with_node_id(format!("{base_id}-{i}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        nodes = args.nodes,
        limit = config.limiter.capacity,
        window_ms = config.limiter.period_ms,
        "Starting multi-node simulation"
    );

    let mut counts = vec![(0u64, 0u64); limiters.len()];
    let mut interrupted = false;
    let interval = Duration::from_millis(args.interval_ms);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    for request in 0..args.requests {
        let index = (request % limiters.len() as u64) as usize;
        let limiter = &limiters[index];
        let decision = limiter.check("shared", 1).await?;
        if decision.allowed {
            counts[index].0 += 1;
        } else {
            counts[index].1 += 1;
        }
        debug!(
            node = %limiter.node_id(),
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Checked shared limit"
        );

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut shutdown => {
                interrupted = true;
                break;
            }
        }
    }

    let summary = NodesSummary {
        limit: config.limiter.capacity,
        window_ms: config.limiter.period().as_millis(),
        nodes: limiters
            .iter()
            .zip(counts)
            .map(|(limiter, (allowed, denied))| NodeSummary {
                node_id: limiter.node_id().to_string(),
                allowed,
                denied,
            })
            .collect(),
        interrupted,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for node in &summary.nodes {
            info!(node = %node.node_id, allowed = node.allowed, denied = node.denied, "Node finished");
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
