// src/bin/qlimit_engine.rs
//
// qlimit-engine: Sidekiq-style worker runtime (separate process).
//
// This binary is intentionally focused on:
// - booting the worker pool (queues + concurrency)
// - booting the schedule poller (deferred + capacity-rescheduled jobs)
// - graceful shutdown via SIGINT/SIGTERM
//
// Example:
//   qlimit-engine --redis redis://127.0.0.1:6379 --queues default,media --priority-queues critical
//
// Notes:
// - Jobs must be registered via qlimit_engine::registry::register_job(...)
//   *before* jobs are produced.

use clap::Parser;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use qlimit_engine::config::{trigger_shutdown, EngineConfig, QueueOptions};

#[derive(Parser, Debug)]
#[command(name = "qlimit-engine", version, about = "Worker runtime with distributed capacity limiting")]
struct Args {
    /// Redis connection URL (also supports env QLIMIT_ENGINE_REDIS_URL / REDIS_URL)
    #[arg(long, env = "QLIMIT_ENGINE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis: String,

    /// Comma-separated queues to poll
    #[arg(long, default_value = "default")]
    queues: String,

    /// Comma-separated queues polled before all others, in order
    #[arg(long, default_value = "")]
    priority_queues: String,

    /// Worker tasks in this process
    #[arg(long, default_value_t = 10)]
    concurrency: usize,

    /// Keep the configured queue order instead of shuffling non-priority queues
    #[arg(long)]
    strict: bool,

    /// Polling weight for the host-identity queue (0 disables it)
    #[arg(long, default_value_t = 0)]
    host_queue_weight: usize,

    /// Grace period before exit after shutdown signal
    #[arg(long, default_value_t = 5)]
    shutdown_grace_secs: u64,
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (local convenience)
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded .env from: {}", path.display());
    }

    // Tracing (respects RUST_LOG)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Support REDIS_URL if the dedicated variable isn't set.
    let redis_url = std::env::var("QLIMIT_ENGINE_REDIS_URL")
        .or_else(|_| std::env::var("REDIS_URL"))
        .unwrap_or_else(|_| args.redis.clone());

    let mut options = QueueOptions::new(split_names(&args.queues));
    options.strict = args.strict;
    for queue in split_names(&args.priority_queues).into_iter().rev() {
        if let Err(err) = options.prioritize_queue(&queue, qlimit_engine::Position::Front) {
            warn!(queue = %queue, error = %err, "skipping priority queue");
        }
    }
    if args.host_queue_weight > 0 {
        options.register_host_queue(args.host_queue_weight);
    }
    if options.all_queues().is_empty() {
        warn!("No queues configured; defaulting to default");
        options.queues.push("default".to_string());
    }

    info!(redis = %redis_url, queues = ?options.all_queues(), concurrency = args.concurrency, "Starting qlimit-engine");

    EngineConfig::new(options, args.concurrency)
        .initialize(redis_url)
        .await?;

    info!("qlimit-engine running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    return;
                }
            }
            std::future::pending::<()>().await
        } => {}
    }

    // Signal worker loops to stop
    trigger_shutdown();

    // Give workers a short grace period to exit loops
    let grace = Duration::from_secs(args.shutdown_grace_secs);
    info!(?grace, "Waiting for graceful shutdown");
    tokio::time::sleep(grace).await;

    info!("qlimit-engine exited");
    Ok(())
}
