//! xlogd: log ingestion daemon.
//!
//! Accepts log events over a Redis-compatible list protocol (RPUSH/LPUSH), normalizes them
//! into records, buffers them in memory or on disk, and bulk-indexes them into Elasticsearch.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod client;
mod config;
mod dispatch;
mod event;
mod health;
mod line;
mod metrics;
mod queue;
mod record;
mod resp;
mod retry;
mod server;
mod sink;
mod stats;

use config::Config;
use dispatch::Dispatcher;
use server::ServerContext;
use sink::{BulkSink, ElasticsearchSink};
use stats::{Counters, StatsEmitter};

#[derive(Parser)]
#[command(name = "xlogd")]
#[command(author, version, about = "Log ingestion daemon: RESP list front end, Elasticsearch bulk sink")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Run {
        /// Config file path
        #[arg(short, long, default_value = "xlogd.yaml", value_name = "PATH")]
        config: PathBuf,

        /// Debug logging regardless of config
        #[arg(long)]
        dev: bool,
    },

    /// Validate configuration file
    Validate {
        /// Config file path
        #[arg(short, long, default_value = "xlogd.yaml", value_name = "PATH")]
        config: PathBuf,
    },
}

/// Ignore SIGPIPE so writes to a closed client socket return EPIPE instead of killing the process.
#[cfg(unix)]
fn ignore_sigpipe() {
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }
}
#[cfg(not(unix))]
fn ignore_sigpipe() {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Validate { config }) => {
            init_logging(None, cli.verbose, cli.quiet);
            run_validate(config)
        }
        other => {
            let (config_path, dev) = match other {
                Some(Commands::Run { config, dev }) => (config.clone(), *dev),
                _ => (PathBuf::from("xlogd.yaml"), false),
            };
            let config = Config::load(&config_path)?;
            init_logging(Some(&config), cli.verbose || dev, cli.quiet);
            ignore_sigpipe();
            tracing::info!(path = %config_path.display(), "loaded config");
            if let Err(e) = run_daemon(config).await {
                tracing::error!("{:#}", e);
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Filter directive: `--quiet` wins, then `--verbose`/`--dev`, then XLOGD_LOG_LEVEL, then config.
fn filter_directive(
    config_level: Option<&str>,
    env_level: Option<&str>,
    verbose: bool,
    quiet: bool,
) -> String {
    if quiet {
        return "error".to_string();
    }
    if verbose {
        return "xlogd=debug".to_string();
    }
    let level = env_level
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or(config_level)
        .unwrap_or("info");
    format!("xlogd={}", level)
}

/// Init tracing from config (log_format, log_level) or env. XLOGD_LOG_FORMAT and XLOGD_LOG_LEVEL override.
fn init_logging(config: Option<&Config>, verbose: bool, quiet: bool) {
    let env_format = std::env::var("XLOGD_LOG_FORMAT")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let use_json = env_format
        .as_deref()
        .or(config.and_then(|c| c.log_format.as_deref()))
        .is_some_and(|f| f.trim().eq_ignore_ascii_case("json"));

    let env_level = std::env::var("XLOGD_LOG_LEVEL").ok();
    let directive = filter_directive(
        config.map(|c| c.log_level.as_str()),
        env_level.as_deref(),
        verbose,
        quiet,
    );
    let filter = if config.is_some() || verbose || quiet {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    if use_json {
        let json_fmt = tracing_subscriber::fmt::format()
            .json()
            .with_current_span(false)
            .with_span_list(false);
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .event_format(json_fmt),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .with(filter)
            .init();
    }
}

fn run_validate(config_path: &std::path::Path) -> anyhow::Result<()> {
    match Config::load(config_path) {
        Ok(_) => {
            tracing::info!("config valid");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!("config invalid: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let started_at = Instant::now();
    let signal = tokio::spawn(shutdown_signal(terminate_stream()?));

    let queue = queue::open(&config.queue).context("open queue")?;
    let sink: Arc<dyn BulkSink> =
        Arc::new(ElasticsearchSink::from_config(&config.sink).context("build sink client")?);
    sink.ping()
        .await
        .map_err(|e| anyhow::anyhow!("sink unreachable: {}", e))?;
    tracing::info!(urls = ?config.sink.urls, "sink reachable");

    let counters = Arc::new(Counters::default());
    let dispatcher = Dispatcher::new(
        queue.clone(),
        sink.clone(),
        counters.clone(),
        &config.batch,
        config.index_settings(),
    )?;

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        durable = queue.is_durable(),
        depth = queue.depth(),
        "listening"
    );

    // front end, stats and metrics stop first; the dispatcher drains after the front end is done
    let shutdown = CancellationToken::new();
    let drain = CancellationToken::new();
    let ctx = Arc::new(ServerContext::new(
        config.clone(),
        queue.clone(),
        counters.clone(),
    ));

    let server_handle = tokio::spawn(server::serve(listener, ctx.clone(), shutdown.clone()));
    let mut dispatcher_handle = tokio::spawn(dispatcher.run(drain.clone()));

    let stats_handle = if config.stats.enabled {
        let hostname = stats::resolve_hostname(config.hostname.as_deref());
        let emitter = StatsEmitter::new(
            sink.clone(),
            queue.clone(),
            counters.clone(),
            hostname,
            &config.stats,
        );
        Some(tokio::spawn(emitter.run(shutdown.clone())))
    } else {
        None
    };

    let metrics_handle = match config.metrics.as_ref().filter(|m| m.enabled) {
        Some(m) => {
            metrics::init().context("init metrics")?;
            let addr = format!("{}:{}", m.address, m.port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("bind metrics {}", addr))?;
            tracing::info!(%addr, "metrics server listening on /metrics and /healthz");
            let state = Arc::new(health::HealthState {
                server: ctx.clone(),
                started_at,
            });
            Some(tokio::spawn(health::serve(listener, state, shutdown.clone())))
        }
        None => None,
    };

    if let Err(e) = signal.await {
        tracing::warn!(error = %e, "signal task failed");
    }
    tracing::info!(depth = queue.depth(), "shutdown signal received, draining queue");
    stop_front_end(&shutdown, server_handle, &drain).await;
    if let Some(h) = stats_handle
        && let Err(e) = h.await
    {
        tracing::warn!(error = %e, "stats task failed");
    }

    match config.shutdown_timeout_secs {
        Some(secs) => {
            match tokio::time::timeout(Duration::from_secs(secs), &mut dispatcher_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "dispatcher task failed"),
                Err(_) => {
                    dispatcher_handle.abort();
                    tracing::warn!(
                        remaining = queue.depth(),
                        durable = queue.is_durable(),
                        "queue not drained within shutdown timeout"
                    );
                }
            }
        }
        None => {
            if let Err(e) = dispatcher_handle.await {
                tracing::warn!(error = %e, "dispatcher task failed");
            }
        }
    }

    if let Err(e) = queue.close().await {
        tracing::warn!(error = %e, "close queue");
    }
    if let Some(h) = metrics_handle
        && let Err(e) = h.await
    {
        tracing::warn!(error = %e, "metrics task failed");
    }
    tracing::info!(
        records_total = counters.records_total(),
        "graceful shutdown complete"
    );
    Ok(())
}

/// Stop accepting, wait for in-flight commands, then let the dispatcher run its final drain.
/// Every push acknowledged by the front end is in the queue before the drain starts.
async fn stop_front_end(
    front: &CancellationToken,
    server: JoinHandle<()>,
    drain: &CancellationToken,
) {
    front.cancel();
    if let Err(e) = server.await {
        tracing::warn!(error = %e, "server task failed");
    }
    drain.cancel();
}

/// SIGTERM stream, registered at call time.
#[cfg(unix)]
fn terminate_stream() -> anyhow::Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")
}
#[cfg(not(unix))]
fn terminate_stream() -> anyhow::Result<()> {
    Ok(())
}

/// Future that completes when SIGINT (Ctrl+C) or SIGTERM is received.
#[cfg(unix)]
async fn shutdown_signal(mut terminate: tokio::signal::unix::Signal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate.recv() => {},
    }
}
#[cfg(not(unix))]
async fn shutdown_signal(_: ()) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Ctrl+C handler failed");
        std::future::pending::<()>().await;
    }
}
