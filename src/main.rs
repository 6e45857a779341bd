//! facelive - headless pipeline runner
//!
//! Builds the default face pipeline with the built-in collaborators, restores
//! which stages were on, and pumps it until Ctrl-C.

use anyhow::Context;
use facelive_rs::{
    config::{ensure_dir, AppConfig},
    heap::WeakHeap,
    pipeline::{PipelineRuntime, Scheduler},
    stages::{default_graph, synthetic::PreviewHandle, Collaborators, DefaultStageFactory},
    state::StateDb,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default();

    // Initialize logging
    let log_dir = config.log_dir()?;
    ensure_dir(&log_dir)?;
    let (file_writer, _log_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "facelive.log"));
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,facelive_rs=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    tracing::info!("Starting facelive");

    let state_path = config.state_path()?;
    let runtime = PipelineRuntime {
        heap: WeakHeap::new(config.heap.capacity_mb),
        db: StateDb::open(&state_path),
        timing: config.stages.timing(),
    };
    tracing::info!("State database: {}", state_path.display());

    let preview = PreviewHandle::new();
    let factory = DefaultStageFactory::new(Collaborators::synthetic(preview.clone()));
    let mut pipeline = default_graph()
        .build(&factory, runtime)
        .context("Failed to build pipeline")?;
    for stage in pipeline.stages() {
        tracing::debug!(
            "{} ({}): {}",
            stage.name(),
            stage.kind(),
            stage.kind().description().replace('\n', " ")
        );
    }
    pipeline
        .restore_on_off_states()
        .context("Failed to restore stage states")?;

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut scheduler = Scheduler::interval(config.pump_interval());
    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        scheduler.pump(&mut [&mut pipeline]);

        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            let heap = pipeline.heap().stats();
            tracing::info!(
                "frames shown: {}, heap: {} entries / {} bytes, evictions: {}",
                preview.frames_shown(),
                heap.entries,
                heap.used_bytes,
                heap.evictions
            );
            for stage in pipeline.stages() {
                if let Some(err) = stage.last_error() {
                    tracing::warn!("{}: {}", stage.name(), err);
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    pipeline.shutdown(&mut scheduler, config.shutdown_timeout())?;
    Ok(())
}
