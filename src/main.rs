use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use cluster_taskd::commands::{AuthUser, CommandRegistry, GroupPermissions};
use cluster_taskd::config::{DaemonConfig, PermissionConfig};
use cluster_taskd::console::Console;
use cluster_taskd::scheduler::{Scheduler, SchedulerHandle, SystemClock};
use cluster_taskd::worker::{self, ProcessPool, WorkerCommand, signal};

/// How long runtime shutdown waits for blocking reads (stdin).
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let worker_mode = std::env::args().nth(1).as_deref() == Some("worker");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = if worker_mode {
        runtime.block_on(run_worker_process())
    } else {
        runtime.block_on(run_daemon())
    };
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn run_worker_process() -> anyhow::Result<()> {
    // stdout carries the message protocol; logs go to stderr only.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .init();

    let registry = Arc::new(CommandRegistry::with_builtins()?);
    let permissions = Arc::new(GroupPermissions::new(PermissionConfig::from_env()));
    worker::run_worker(registry, permissions).await?;
    Ok(())
}

async fn run_daemon() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env()?;
    let _log_guard = init_daemon_logging(config.log_dir.as_deref());

    eprintln!("cluster-taskd v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.scheduler.worker_count);
    eprintln!("   Tick: {:?}", config.scheduler.tick_interval);
    eprintln!("   Console user: {}", config.console_user);
    eprintln!("   Type 'help' for commands, 'quit' to exit.\n");

    let (messages_tx, messages_rx) = mpsc::unbounded_channel();
    let pool = Arc::new(ProcessPool::spawn(
        WorkerCommand::current_exe()?,
        &config.scheduler,
        messages_tx,
    ));
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        pool,
        messages_rx,
        Arc::new(SystemClock),
    );
    let (handle, mut scheduler_task) = SchedulerHandle::spawn(scheduler);

    let console = Console::new(handle.clone(), AuthUser::new(config.console_user.clone(), &[]));
    let mut console_task = tokio::spawn(async move {
        console
            .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    });

    tokio::select! {
        _ = signal::shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
        result = &mut console_task => {
            match result {
                Ok(Ok(())) => tracing::info!("Console closed"),
                Ok(Err(e)) => tracing::error!("Console failed: {}", e),
                Err(e) => tracing::error!("Console task failed: {}", e),
            }
        }
        result = &mut scheduler_task => {
            // The scheduler only stops on its own when the pool broke.
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("worker pool failed")),
                Err(e) => Err(anyhow::Error::new(e).context("scheduler task failed")),
            };
        }
    }

    console_task.abort();
    if let Err(e) = handle.shutdown().await {
        tracing::debug!("Scheduler already stopped: {}", e);
    }
    scheduler_task.await??;
    tracing::info!("Daemon stopped");
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
fn init_daemon_logging(
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "cluster-taskd.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .boxed();
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("Warning: Failed to create log directory {}: {}", dir.display(), e);
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}
