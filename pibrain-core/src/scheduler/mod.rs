//! Cron-driven orchestration of reanalysis, connection-discovery, and
//! aggregation passes over the whole graph (§4.8).

use crate::aggregate::{InsightAggregator, PatternAggregator, MIN_CLUSTER_SUPPORT, MIN_PATTERN_OCCURRENCES};
use crate::config::Config;
use crate::db::StorageEngine;
use crate::discovery::ConnectionDiscoverer;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::queue::JobQueue;
use crate::types::{JobType, NewJob};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One of the scheduler's four named cron jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobName {
    Reanalysis,
    ConnectionDiscovery,
    PatternAggregation,
    Clustering,
}

impl JobName {
    pub const ALL: [JobName; 4] =
        [JobName::Reanalysis, JobName::ConnectionDiscovery, JobName::PatternAggregation, JobName::Clustering];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::Reanalysis => "reanalysis",
            JobName::ConnectionDiscovery => "connection_discovery",
            JobName::PatternAggregation => "pattern_aggregation",
            JobName::Clustering => "clustering",
        }
    }
}

/// The outcome of one scheduler run, kept around so a status query (or the
/// daemon's own logs) can report the last attempt per job without
/// re-running it.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub job_type: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub items_processed: usize,
    pub errors: Vec<String>,
}

/// Parses `expr` as a six-field (with seconds) cron expression, the same
/// validation the scheduler applies at construction time.
pub fn is_valid_cron_expression(expr: &str) -> bool {
    Schedule::from_str(expr).is_ok()
}

/// The next `n` fire times for `expr`, starting strictly after now.
pub fn get_next_run_times(expr: &str, n: usize) -> Result<Vec<DateTime<Utc>>> {
    let schedule = Schedule::from_str(expr).map_err(|e| Error::Config(format!("invalid cron expression `{expr}`: {e}")))?;
    Ok(schedule.upcoming(Utc).take(n).collect())
}

struct CompiledJob {
    name: JobName,
    schedule: Schedule,
    enabled: bool,
}

/// Holds the compiled cron schedules and drives ticks. Invalid cron
/// expressions are rejected at construction rather than at the first tick,
/// so a daemon fails to start on a config typo instead of silently skipping
/// a job forever.
pub struct Scheduler<'a> {
    engine: &'a StorageEngine,
    config: &'a Config,
    embedding: Option<Box<dyn EmbeddingProvider>>,
    jobs: Vec<CompiledJob>,
    last_run: Mutex<HashMap<&'static str, DateTime<Utc>>>,
    last_result: Mutex<HashMap<&'static str, RunResult>>,
    shutdown: AtomicBool,
}

impl<'a> Scheduler<'a> {
    pub fn new(engine: &'a StorageEngine, config: &'a Config) -> Result<Self> {
        let mut jobs = Vec::new();
        for name in JobName::ALL {
            let Some(job_config) = config.scheduler.jobs.get(name.as_str()) else { continue };
            let schedule = Schedule::from_str(&job_config.cron)
                .map_err(|e| Error::Config(format!("invalid cron expression for job `{}`: {e}", name.as_str())))?;
            jobs.push(CompiledJob { name, schedule, enabled: job_config.enabled });
        }

        let embedding = crate::embedding::create_provider(config.embedding.as_ref())?;

        Ok(Scheduler {
            engine,
            config,
            embedding,
            jobs,
            last_run: Mutex::new(HashMap::new()),
            last_result: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Marks the scheduler as draining; in-flight `tick` calls still
    /// complete, but no further job is started once set.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn last_result(&self, name: JobName) -> Option<RunResult> {
        self.last_result.lock().unwrap().get(name.as_str()).cloned()
    }

    /// Runs every enabled job whose schedule has a fire time at or before
    /// `now` since it last ran. Intended to be called once per
    /// `daemon.pollIntervalMs` tick from the supervisor loop.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<RunResult> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let due: Vec<JobName> = self.jobs.iter().filter(|job| job.enabled && self.is_due(job, now)).map(|job| job.name).collect();

        let mut results = Vec::new();
        for name in due {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let result = self.run_job(name, now);
            self.last_run.lock().unwrap().insert(name.as_str(), now);
            self.last_result.lock().unwrap().insert(name.as_str(), result.clone());
            results.push(result);
        }
        results
    }

    fn is_due(&self, job: &CompiledJob, now: DateTime<Utc>) -> bool {
        match self.last_run.lock().unwrap().get(job.name.as_str()).copied() {
            None => true,
            Some(since) => job.schedule.after(&since).next().map(|next| next <= now).unwrap_or(false),
        }
    }

    fn run_job(&self, name: JobName, now: DateTime<Utc>) -> RunResult {
        tracing::info!(job = name.as_str(), "scheduler run starting");
        let (items_processed, errors) = match name {
            JobName::Reanalysis => self.run_reanalysis(),
            JobName::ConnectionDiscovery => self.run_connection_discovery(),
            JobName::PatternAggregation => self.run_pattern_aggregation(),
            JobName::Clustering => self.run_clustering(),
        };
        let completed_at = Utc::now();
        tracing::info!(job = name.as_str(), items_processed, error_count = errors.len(), "scheduler run finished");
        RunResult { job_type: name.as_str().to_string(), started_at: now, completed_at, items_processed, errors }
    }

    fn run_reanalysis(&self) -> (usize, Vec<String>) {
        let current_version = self.current_prompt_version();
        let nodes = match self.engine.nodes_with_stale_prompt_version(&current_version) {
            Ok(nodes) => nodes,
            Err(e) => return (0, vec![e.to_string()]),
        };

        let queue = JobQueue::new(self.engine);
        let mut processed = 0;
        let mut errors = Vec::new();
        for node in nodes.into_iter().take(self.config.scheduler.batch_size) {
            let job = NewJob {
                job_type: JobType::Reanalysis,
                priority: None,
                payload: serde_json::json!({
                    "sessionFile": node.session_file,
                    "segmentStart": node.segment_start,
                    "segmentEnd": node.segment_end,
                    "reanalysisHint": format!(
                        "promptVersion {} predates current {}",
                        node.prompt_version, current_version
                    ),
                }),
                max_retries: None,
            };
            match queue.enqueue(job) {
                Ok(_) => processed += 1,
                Err(e) => errors.push(e.to_string()),
            }
        }
        (processed, errors)
    }

    fn run_connection_discovery(&self) -> (usize, Vec<String>) {
        let nodes = if self.config.scheduler.rerun_historical {
            self.engine.all_current_nodes()
        } else {
            let since = self
                .last_run
                .lock()
                .unwrap()
                .get(JobName::ConnectionDiscovery.as_str())
                .copied()
                .unwrap_or_else(epoch);
            self.engine.nodes_analyzed_since(since)
        };

        let nodes = match nodes {
            Ok(nodes) => nodes,
            Err(e) => return (0, vec![e.to_string()]),
        };

        let discoverer = ConnectionDiscoverer::new(self.engine, &self.config.discovery);
        let mut processed = 0;
        let mut errors = Vec::new();
        for node in nodes {
            match discoverer.discover_for_node(&node) {
                Ok(()) => processed += 1,
                Err(e) => errors.push(format!("{}: {e}", node.id)),
            }
        }
        (processed, errors)
    }

    fn run_pattern_aggregation(&self) -> (usize, Vec<String>) {
        let aggregator = PatternAggregator::new(self.engine);
        match aggregator.run(MIN_PATTERN_OCCURRENCES) {
            Ok(result) => (result.failure_patterns_upserted + result.lesson_patterns_upserted, Vec::new()),
            Err(e) => (0, vec![e.to_string()]),
        }
    }

    fn run_clustering(&self) -> (usize, Vec<String>) {
        let aggregator = InsightAggregator::new(self.engine, self.embedding.as_deref());
        match aggregator.run(MIN_CLUSTER_SUPPORT, self.config.discovery.lesson_similarity_threshold) {
            Ok(result) => (result.insights_upserted, Vec::new()),
            Err(e) => (0, vec![e.to_string()]),
        }
    }

    fn current_prompt_version(&self) -> String {
        self.config
            .prompt
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "v1".to_string())
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_and_invalid_cron_expressions() {
        assert!(is_valid_cron_expression("0 0 * * * *"));
        assert!(!is_valid_cron_expression("not a cron expression"));
    }

    #[test]
    fn next_run_times_are_strictly_increasing() {
        let times = get_next_run_times("0 */15 * * * *", 3).unwrap();
        assert_eq!(times.len(), 3);
        assert!(times[0] < times[1]);
        assert!(times[1] < times[2]);
    }

    #[test]
    fn constructor_rejects_invalid_cron_expression() {
        let mut config = Config::default();
        config.scheduler.jobs.insert(
            "reanalysis".to_string(),
            crate::config::CronJobConfig { cron: "garbage".to_string(), enabled: true },
        );
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        assert!(Scheduler::new(&engine, &config).is_err());
    }

    #[test]
    fn tick_runs_a_job_on_its_first_due_check_and_not_again_immediately() {
        let mut config = Config::default();
        config.scheduler.jobs.clear();
        config.scheduler.jobs.insert(
            "pattern_aggregation".to_string(),
            crate::config::CronJobConfig { cron: "* * * * * *".to_string(), enabled: true },
        );
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let scheduler = Scheduler::new(&engine, &config).unwrap();

        let now = Utc::now();
        let results = scheduler.tick(now);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].job_type, "pattern_aggregation");
    }

    #[test]
    fn shutdown_stops_further_ticks() {
        let mut config = Config::default();
        config.scheduler.jobs.clear();
        config.scheduler.jobs.insert(
            "clustering".to_string(),
            crate::config::CronJobConfig { cron: "* * * * * *".to_string(), enabled: true },
        );
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let scheduler = Scheduler::new(&engine, &config).unwrap();
        scheduler.request_shutdown();
        assert!(scheduler.tick(Utc::now()).is_empty());
    }
}
