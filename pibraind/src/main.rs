//! pibraind - background knowledge-graph daemon for AI coding-agent sessions.
//!
//! Boots the storage engine, a pool of analysis workers, the session
//! watcher, and the cron scheduler in one process (§4.9), and runs them
//! until asked to stop.

mod process_lock;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use pibrain_core::config::Config;
use pibrain_core::db::StorageEngine;
use pibrain_core::queue::JobQueue;
use pibrain_core::scheduler::Scheduler;
use pibrain_core::watcher::{SessionEvent, SessionWatcher};
use pibrain_core::worker::Worker;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::process_lock::PidLock;

#[derive(Parser, Debug)]
#[command(name = "pibraind", about = "Background knowledge-graph daemon for AI coding-agent sessions")]
struct Args {
    /// Path to a config file, overriding the default XDG config location.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };

    let _log_guard = pibrain_core::logging::init(&config.logging).context("failed to initialize logging")?;
    tracing::info!("pibraind starting up");

    let pid_lock = PidLock::acquire(&Config::pid_path()).context("failed to acquire daemon PID lock")?;

    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "opening database");
    let engine = StorageEngine::open(&db_path).context("failed to open database")?;
    engine.migrate().context("failed to run database migrations")?;

    std::fs::create_dir_all(&config.sessions_dir)
        .with_context(|| format!("failed to create sessions dir: {}", config.sessions_dir.display()))?;
    std::fs::create_dir_all(engine.nodes_dir())
        .with_context(|| format!("failed to create nodes dir: {}", engine.nodes_dir().display()))?;

    let prompt_template = Arc::new(ArcSwap::from_pointee(load_prompt_template(&config)));
    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(Arc::clone(&shutdown), Arc::clone(&prompt_template), config.prompt.path.clone())
        .context("failed to install signal handlers")?;

    let watcher = SessionWatcher::start(&config.sessions_dir, &config.watcher).context("failed to start session watcher")?;
    let watcher_ref = &watcher;

    std::thread::scope(|scope| -> Result<()> {
        for worker_id in 0..config.daemon.worker_count {
            let engine = &engine;
            let config = &config;
            let prompt_template = Arc::clone(&prompt_template);
            let shutdown = Arc::clone(&shutdown);
            scope.spawn(move || run_worker_loop(worker_id, engine, config, &prompt_template, shutdown));
        }

        let watcher_thread = {
            let engine = &engine;
            let config = &config;
            let shutdown = Arc::clone(&shutdown);
            scope.spawn(move || run_watcher_loop(watcher_ref, engine, config, shutdown))
        };

        let scheduler = Scheduler::new(&engine, &config).context("failed to build scheduler")?;
        run_scheduler_loop(&scheduler, &config, Arc::clone(&shutdown));

        if let Err(e) = watcher_thread.join() {
            tracing::error!(?e, "watcher thread panicked");
        }
        Ok(())
    })?;

    drop(pid_lock);
    tracing::info!("pibraind shut down cleanly");
    Ok(())
}

/// Reads the analyzer prompt from `config.prompt.path`, falling back to a
/// minimal built-in template so a daemon with no prompt file configured
/// still boots (the external analyzer contract only requires *some* prompt
/// text be piped to it; the file's content is an operator concern).
fn load_prompt_template(config: &Config) -> String {
    match std::fs::read_to_string(&config.prompt.path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(path = %config.prompt.path.display(), error = %e, "prompt file unreadable, using built-in default");
            "Analyze the referenced session segment and respond with a single JSON object.".to_string()
        }
    }
}

/// Claims and processes jobs until told to shut down. Each worker sleeps for
/// `daemon.pollIntervalMs` after finding the queue empty, rather than
/// busy-looping. Re-snapshots the prompt template on every iteration so a
/// SIGHUP-triggered reload takes effect on the next claimed job without
/// restarting the worker.
fn run_worker_loop(worker_id: usize, engine: &StorageEngine, config: &Config, prompt_template: &ArcSwap<String>, shutdown: Arc<AtomicBool>) {
    let queue = JobQueue::new(engine);
    let poll_interval = Duration::from_millis(config.daemon.poll_interval_ms);

    tracing::info!(worker_id, "worker started");
    while !shutdown.load(Ordering::SeqCst) {
        let job = match queue.claim_next() {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "failed to claim next job");
                std::thread::sleep(poll_interval);
                continue;
            }
        };

        let Some(job) = job else {
            std::thread::sleep(poll_interval);
            continue;
        };

        tracing::info!(worker_id, job_id = %job.id, job_type = job.job_type.as_str(), "processing job");
        let prompt = prompt_template.load();
        let worker = Worker { engine, config, prompt_template: prompt.as_str() };
        match worker.process(&job.payload, job.job_type, job.max_retries) {
            Ok(node) => {
                if let Err(e) = queue.complete(&job.id) {
                    tracing::error!(worker_id, job_id = %job.id, error = %e, "failed to mark job complete");
                }
                tracing::info!(worker_id, job_id = %job.id, node_id = %node.id, "job completed");
            }
            Err(classified) => {
                tracing::warn!(worker_id, job_id = %job.id, reason = %classified.reason.0, "job failed");
                if let Err(e) = queue.fail(&job.id, &classified, &config.retry.into()) {
                    tracing::error!(worker_id, job_id = %job.id, error = %e, "failed to record job failure");
                }
            }
        }
    }
    tracing::info!(worker_id, "worker stopped");
}

/// Translates watcher lifecycle events into queued analysis jobs. Per
/// spec.md §4.4's readiness rules, both a newly discovered file (`New`,
/// rule a) and a file that has gone idle with unanalyzed entries (`Idle`,
/// rule c) enqueue the whole observed file (from its start to its current
/// length) as one segment. `Changed` only resets the idle clock and is
/// logged, not enqueued, so an actively-growing file isn't requeued on
/// every debounce tick. This boundary-detection-to-job-payload glue is the
/// daemon-process responsibility spec.md's worker Non-goals defer to the
/// caller.
fn run_watcher_loop(watcher: &SessionWatcher, engine: &StorageEngine, config: &Config, shutdown: Arc<AtomicBool>) {
    let queue = JobQueue::new(engine);
    let poll_interval = Duration::from_millis(config.daemon.poll_interval_ms.min(500));

    while !shutdown.load(Ordering::SeqCst) {
        while let Ok(event) = watcher.events().try_recv() {
            match event {
                SessionEvent::New(path) => enqueue_analysis_job(&queue, &path, "new session discovered"),
                SessionEvent::Idle(path) => enqueue_analysis_job(&queue, &path, "session went idle"),
                SessionEvent::Changed(path) => {
                    tracing::debug!(session_file = %path.display(), "session file changed, awaiting idle");
                }
                SessionEvent::Removed(path) => {
                    tracing::info!(session_file = %path.display(), "session file removed");
                }
                SessionEvent::Ready => {
                    tracing::info!("session watcher initial scan complete");
                }
            }
        }
        while let Ok(err) = watcher.errors().try_recv() {
            tracing::warn!(path = ?err.path, message = %err.message, "session watcher error");
        }
        std::thread::sleep(poll_interval);
    }
}

/// Builds and enqueues an initial-segment analysis job for `path`, logging
/// the outcome. Shared by the `New` and `Idle` readiness rules.
fn enqueue_analysis_job(queue: &JobQueue, path: &Path, reason: &str) {
    let session_file = path.to_string_lossy().to_string();
    let segment_end = std::fs::metadata(path).map(|m| m.len().to_string()).unwrap_or_else(|_| "eof".to_string());
    let job = pibrain_core::worker::build_initial_job(&session_file, "0", &segment_end);
    match queue.enqueue(job) {
        Ok(job_id) => tracing::info!(job_id = %job_id, session_file = %session_file, reason, "enqueued analysis job"),
        Err(e) => tracing::error!(error = %e, session_file = %session_file, "failed to enqueue job"),
    }
}

/// Ticks the scheduler on `daemon.pollIntervalMs` until shutdown is
/// requested, then marks it shut down so any in-flight tick is the last one.
fn run_scheduler_loop(scheduler: &Scheduler<'_>, config: &Config, shutdown: Arc<AtomicBool>) {
    let poll_interval = Duration::from_millis(config.daemon.poll_interval_ms);
    while !shutdown.load(Ordering::SeqCst) {
        let results = scheduler.tick(chrono::Utc::now());
        for result in &results {
            if !result.errors.is_empty() {
                tracing::warn!(job = %result.job_type, errors = ?result.errors, "scheduler run reported errors");
            }
        }
        std::thread::sleep(poll_interval);
    }
    scheduler.request_shutdown();
}

/// Registers TERM/INT for graceful shutdown via `ctrlc`, and HUP via
/// `signal-hook` (which `ctrlc` cannot register) to reload the prompt
/// template from disk into `prompt_template`, an `ArcSwap` every worker
/// snapshots per job — the atomic-swap-on-reload design note applied to
/// the one piece of live config workers actually re-read per iteration.
fn install_signal_handlers(shutdown: Arc<AtomicBool>, prompt_template: Arc<ArcSwap<String>>, prompt_path: std::path::PathBuf) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("failed to register SIGINT/SIGTERM handler")?;

    let mut signals =
        signal_hook::iterator::Signals::new([signal_hook::consts::SIGHUP]).context("failed to register SIGHUP handler")?;
    std::thread::spawn(move || {
        for signal in signals.forever() {
            tracing::info!(signal, "received SIGHUP, reloading prompt template");
            match std::fs::read_to_string(&prompt_path) {
                Ok(content) => prompt_template.store(Arc::new(content)),
                Err(e) => tracing::warn!(path = %prompt_path.display(), error = %e, "prompt reload failed, keeping current template"),
            }
        }
    });

    Ok(())
}
