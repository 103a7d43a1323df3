use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wirepool::transport::tcp;
use wirepool::{CallError, Core, Route, TimeoutPolicy};

#[derive(Parser)]
#[command(name = "wirepool")]
#[command(version, about = "Connection-pooled, circuit-broken HTTP client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the outcome
    Request {
        /// Destination route (http://host:port)
        route: String,

        /// Request path
        #[arg(long, default_value = "/")]
        path: String,

        /// Request-scoped read timeout in milliseconds
        #[arg(long)]
        response_timeout_ms: Option<u64>,

        /// Hard wall-clock limit in milliseconds
        #[arg(long)]
        hard_timeout_ms: Option<u64>,
    },

    /// Issue many concurrent requests through one shared pool, then print
    /// pool and breaker statistics
    Bench {
        /// Destination route (http://host:port)
        route: String,

        /// Request path
        #[arg(long, default_value = "/")]
        path: String,

        /// Total number of requests
        #[arg(long, default_value = "100")]
        requests: usize,

        /// Concurrent workers
        #[arg(long, default_value = "10")]
        workers: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // One-shot requests don't need worker threads; bench does.
    let is_bench = matches!(cli.command, Commands::Bench { .. });

    let runtime = if is_bench {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = wirepool::config::load_config(cli.config.as_deref())?;
    let core = Core::new(config);

    match cli.command {
        Commands::Request {
            route,
            path,
            response_timeout_ms,
            hard_timeout_ms,
        } => {
            let route: Route = route.parse().context("invalid route")?;
            let mut policy = core.default_policy();
            if let Some(ms) = response_timeout_ms {
                policy = policy.with_response_timeout(Some(Duration::from_millis(ms)));
            }
            if let Some(ms) = hard_timeout_ms {
                policy = policy.with_hard_timeout(Some(Duration::from_millis(ms)));
            }
            cmd_request(&core, &route, &path, &policy).await
        }
        Commands::Bench {
            route,
            path,
            requests,
            workers,
        } => {
            let route: Route = route.parse().context("invalid route")?;
            cmd_bench(core, route, path, requests, workers).await
        }
    }
}

async fn cmd_request(
    core: &Core<wirepool::transport::TcpTransport>,
    route: &Route,
    path: &str,
    policy: &TimeoutPolicy,
) -> Result<()> {
    let request = tcp::get_request(route, path);
    let started = Instant::now();

    match core.execute(route, &request, policy).await {
        Ok(body) => {
            let elapsed = started.elapsed();
            println!(
                "OK  {} bytes in {:.1?} from {}",
                body.len(),
                elapsed,
                route
            );
            let preview_len = body.len().min(256);
            println!("{}", String::from_utf8_lossy(&body[..preview_len]));
            Ok(())
        }
        Err(err) => {
            println!("FAILED ({}) after {:.1?}", failure_kind(&err), started.elapsed());
            Err(err.into())
        }
    }
}

async fn cmd_bench(
    core: Core<wirepool::transport::TcpTransport>,
    route: Route,
    path: String,
    requests: usize,
    workers: usize,
) -> Result<()> {
    let core = Arc::new(core);
    let request = tcp::get_request(&route, &path);
    let per_worker = requests.div_ceil(workers.max(1));

    let started = Instant::now();
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let core = Arc::clone(&core);
        let route = route.clone();
        let request = request.clone();
        handles.push(tokio::spawn(async move {
            let policy = core.default_policy();
            let mut ok = 0u64;
            let mut failed = 0u64;
            for _ in 0..per_worker {
                match core.execute(&route, &request, &policy).await {
                    Ok(_) => ok += 1,
                    Err(err) => {
                        failed += 1;
                        tracing::debug!(error = %err, "bench request failed");
                    }
                }
            }
            (ok, failed)
        }));
    }

    let mut ok = 0u64;
    let mut failed = 0u64;
    for handle in handles {
        let (w_ok, w_failed) = handle.await?;
        ok += w_ok;
        failed += w_failed;
    }
    let elapsed = started.elapsed();

    println!(
        "{} ok, {} failed in {:.1?} ({:.0} req/s)",
        ok,
        failed,
        elapsed,
        ok as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    let stats = core.pool_stats().await;
    println!(
        "pool: leased={} available={} pending={} max={} | created={} reused={} retired={}",
        stats.total.leased,
        stats.total.available,
        stats.total.pending,
        stats.total.max,
        stats.counters.total_created,
        stats.counters.total_reused,
        stats.counters.total_retired,
    );
    println!(
        "breaker: {} for {}",
        core.breaker_state(&route).await.name(),
        route
    );

    Ok(())
}

fn failure_kind(err: &CallError) -> &'static str {
    match err {
        CallError::ConnectFailure { .. } => "connect",
        CallError::LeaseTimeoutExceeded { .. } => "lease timeout",
        CallError::ReadTimeout { .. } => "read timeout",
        CallError::HardTimeoutExceeded { .. } => "hard timeout",
        CallError::CircuitOpen { .. } => "circuit open",
        CallError::TransportError { .. } => "transport",
    }
}
