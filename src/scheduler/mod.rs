//! Recurring maintenance jobs.
//!
//! The job set is fixed ([`JobName`]). Each job has its own interval (never
//! below [`MIN_JOB_INTERVAL_SECS`]), counters and bounded run history, all
//! persisted in `scheduler.json` so they survive restarts. A background
//! driver wakes every tick and runs whatever is due; jobs can also be
//! triggered by hand.

pub mod jobs;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ForemanConfig, MIN_JOB_INTERVAL_SECS};
use crate::errors::SchedulerError;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobName {
    MergeQueueRefresh,
    StaleTaskSweep,
    AuditCompaction,
    WorkspaceCleanup,
}

impl JobName {
    pub const ALL: [JobName; 4] = [
        Self::MergeQueueRefresh,
        Self::StaleTaskSweep,
        Self::AuditCompaction,
        Self::WorkspaceCleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MergeQueueRefresh => "merge_queue_refresh",
            Self::StaleTaskSweep => "stale_task_sweep",
            Self::AuditCompaction => "audit_compaction",
            Self::WorkspaceCleanup => "workspace_cleanup",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|j| j.as_str() == s)
    }

    pub fn default_interval(&self) -> Duration {
        match self {
            Self::MergeQueueRefresh => Duration::from_secs(5 * 60),
            Self::StaleTaskSweep => Duration::from_secs(15 * 60),
            Self::AuditCompaction => Duration::from_secs(60 * 60),
            Self::WorkspaceCleanup => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("Invalid job name: {}", s))
    }
}

/// Work done by one job. The returned string is a short summary for the
/// run history.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn run(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub trigger: JobTrigger,
    pub summary: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub name: JobName,
    pub interval_secs: u64,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    /// Cleared by the next successful run.
    pub last_error: Option<String>,
    /// `None` means the job has never run and is due immediately.
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: VecDeque<JobRun>,
}

impl JobState {
    fn new(name: JobName, interval: Duration) -> Self {
        Self {
            name,
            interval_secs: interval.as_secs(),
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            last_run_at: None,
            last_success_at: None,
            last_duration_ms: None,
            last_error: None,
            next_run_at: None,
            history: VecDeque::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SchedulerDocument {
    pub jobs: BTreeMap<JobName, JobState>,
}

impl SchedulerDocument {
    fn job_mut(&mut self, name: JobName) -> &mut JobState {
        self.jobs
            .entry(name)
            .or_insert_with(|| JobState::new(name, name.default_interval()))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub history_limit: usize,
    pub intervals: BTreeMap<String, u64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            history_limit: 50,
            intervals: BTreeMap::new(),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &ForemanConfig) -> Self {
        let section = &config.toml.scheduler;
        Self {
            tick: Duration::from_secs(section.tick_secs.max(1)),
            history_limit: section.history_limit.max(1),
            intervals: section.intervals.clone(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_interval(name: JobName, interval: Duration) -> Result<(), SchedulerError> {
    if interval.as_secs() < MIN_JOB_INTERVAL_SECS {
        return Err(SchedulerError::IntervalTooShort {
            job: name.to_string(),
            min_secs: MIN_JOB_INTERVAL_SECS,
            got_secs: interval.as_secs(),
        });
    }
    Ok(())
}

struct Driver {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Marks a job as executing until dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<JobName>>,
    name: JobName,
}

impl<'a> RunningGuard<'a> {
    fn acquire(running: &'a Mutex<HashSet<JobName>>, name: JobName) -> Option<Self> {
        lock(running)
            .insert(name)
            .then(|| Self { running, name })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.name);
    }
}

pub struct JobScheduler {
    store: DocumentStore<SchedulerDocument>,
    settings: SchedulerSettings,
    executors: Mutex<HashMap<JobName, Arc<dyn JobExecutor>>>,
    write_lock: Mutex<()>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    driver: Mutex<Option<Driver>>,
    running: Mutex<HashSet<JobName>>,
}

impl JobScheduler {
    /// Open the scheduler state, creating entries for every job and applying
    /// interval overrides from `settings`. Invalid overrides are logged and
    /// ignored.
    pub fn open(path: impl Into<PathBuf>, settings: SchedulerSettings) -> Result<Self, SchedulerError> {
        let scheduler = Self {
            store: DocumentStore::new(path),
            settings,
            executors: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            started_at: Mutex::new(None),
            driver: Mutex::new(None),
            running: Mutex::new(HashSet::new()),
        };

        let overrides = scheduler.settings.intervals.clone();
        scheduler.mutate(|doc| {
            for name in JobName::ALL {
                doc.job_mut(name);
            }
            for (job, secs) in &overrides {
                let Some(name) = JobName::from_str_opt(job) else {
                    warn!(job = %job, "ignoring interval for unknown job");
                    continue;
                };
                let interval = Duration::from_secs(*secs);
                if let Err(e) = check_interval(name, interval) {
                    warn!(error = %e, "ignoring configured interval");
                    continue;
                }
                doc.job_mut(name).interval_secs = *secs;
            }
            Ok(())
        })?;
        Ok(scheduler)
    }

    pub fn from_config(config: &ForemanConfig) -> Result<Self, SchedulerError> {
        Self::open(config.scheduler_file(), SchedulerSettings::from_config(config))
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut SchedulerDocument) -> Result<R, SchedulerError>,
    ) -> Result<R, SchedulerError> {
        let _guard = lock(&self.write_lock);
        self.store.update(f)
    }

    pub fn register(&self, name: JobName, executor: Arc<dyn JobExecutor>) {
        lock(&self.executors).insert(name, executor);
    }

    fn executor(&self, name: JobName) -> Option<Arc<dyn JobExecutor>> {
        lock(&self.executors).get(&name).cloned()
    }

    pub fn set_interval(&self, name: JobName, interval: Duration) -> Result<JobState, SchedulerError> {
        check_interval(name, interval)?;
        self.mutate(|doc| {
            let job = doc.job_mut(name);
            job.interval_secs = interval.as_secs();
            if let Some(last) = job.last_run_at {
                job.next_run_at = Some(last + chrono::Duration::seconds(job.interval_secs as i64));
            }
            Ok(job.clone())
        })
    }

    pub fn jobs(&self) -> Result<Vec<JobState>, SchedulerError> {
        let mut doc = self.store.load()?;
        for name in JobName::ALL {
            doc.job_mut(name);
        }
        Ok(doc.jobs.into_values().collect())
    }

    pub fn job(&self, name: JobName) -> Result<JobState, SchedulerError> {
        let mut doc = self.store.load()?;
        Ok(doc.job_mut(name).clone())
    }

    /// Run history for one job, oldest first.
    pub fn history(&self, name: JobName) -> Result<Vec<JobRun>, SchedulerError> {
        Ok(self.job(name)?.history.into_iter().collect())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.started_at).is_some()
    }

    /// True while `name` is executing, whether scheduled or triggered.
    pub fn is_job_running(&self, name: JobName) -> bool {
        lock(&self.running).contains(&name)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.started_at)
    }

    /// Start the background driver. Returns false (and changes nothing,
    /// including the start time) if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        {
            let mut started = lock(&self.started_at);
            if started.is_some() {
                return false;
            }
            *started = Some(Utc::now());
        }

        let token = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.settings.tick);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.run_due_jobs(Utc::now()).await {
                            warn!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
            debug!("scheduler driver stopped");
        });
        *lock(&self.driver) = Some(Driver { token, handle });
        info!(tick = ?self.settings.tick, "job scheduler started");
        true
    }

    /// Stop the driver. A job already executing finishes first. Returns false
    /// if the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let was_running = lock(&self.started_at).take().is_some();
        let driver = lock(&self.driver).take();
        if let Some(driver) = driver {
            driver.token.cancel();
            if let Err(e) = driver.handle.await {
                warn!(error = %e, "scheduler driver ended abnormally");
            }
        }
        if was_running {
            info!("job scheduler stopped");
        }
        was_running
    }

    /// Run a job now, outside its schedule. The run is recorded in history
    /// and counters like any other. Fails with `AlreadyRunning` while the
    /// same job is executing.
    pub async fn trigger_job(&self, name: JobName) -> Result<JobRun, SchedulerError> {
        self.execute(name, JobTrigger::Manual).await
    }

    /// Run every registered job whose next run is at or before `now`,
    /// concurrently. Jobs without an executor, or already executing, are
    /// skipped.
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<(JobName, JobRun)>, SchedulerError> {
        let due: Vec<JobName> = self
            .jobs()?
            .into_iter()
            .filter(|job| job.is_due(now))
            .map(|job| job.name)
            .filter(|name| self.executor(*name).is_some())
            .filter(|name| !self.is_job_running(*name))
            .collect();

        // Due jobs are independent of each other; each records its own run.
        let results = join_all(
            due.iter()
                .map(|name| self.execute(*name, JobTrigger::Scheduled)),
        )
        .await;
        let mut runs = Vec::with_capacity(due.len());
        for (name, run) in due.into_iter().zip(results) {
            match run {
                Ok(run) => runs.push((name, run)),
                // Started manually between the filter and now.
                Err(SchedulerError::AlreadyRunning(_)) => {
                    debug!(job = %name, "job already running, skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(runs)
    }

    async fn execute(&self, name: JobName, trigger: JobTrigger) -> Result<JobRun, SchedulerError> {
        let executor = self
            .executor(name)
            .ok_or_else(|| SchedulerError::NoExecutor(name.to_string()))?;
        let _running = RunningGuard::acquire(&self.running, name)
            .ok_or_else(|| SchedulerError::AlreadyRunning(name.to_string()))?;

        let started_at = Utc::now();
        let clock = Instant::now();
        debug!(job = %name, ?trigger, "running job");
        let result = executor.run().await;
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        let run = match result {
            Ok(summary) => {
                info!(job = %name, duration_ms, %summary, "job succeeded");
                JobRun {
                    started_at,
                    duration_ms,
                    success: true,
                    trigger,
                    summary: Some(summary),
                    error: None,
                }
            }
            Err(e) => {
                warn!(job = %name, duration_ms, error = %e, "job failed");
                JobRun {
                    started_at,
                    duration_ms,
                    success: false,
                    trigger,
                    summary: None,
                    error: Some(format!("{:#}", e)),
                }
            }
        };

        let history_limit = self.settings.history_limit;
        self.mutate(|doc| {
            let job = doc.job_mut(name);
            job.run_count += 1;
            if run.success {
                job.success_count += 1;
                job.last_success_at = Some(started_at);
                job.last_error = None;
            } else {
                job.failure_count += 1;
                job.last_error = run.error.clone();
            }
            job.last_run_at = Some(started_at);
            job.last_duration_ms = Some(duration_ms);
            job.next_run_at =
                Some(started_at + chrono::Duration::seconds(job.interval_secs as i64));
            job.history.push_back(run.clone());
            while job.history.len() > history_limit {
                job.history.pop_front();
            }
            Ok(())
        })?;
        Ok(run)
    }
}
