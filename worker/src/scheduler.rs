use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::RwLock,
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    cancel::{CancelSource, CancelToken},
    error::JobError,
};

/// A unit of periodic work. `run` must observe `ctx` at every suspension point.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: &CancelToken) -> Result<(), JobError>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub run_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Fire every job immediately instead of waiting one full interval.
    pub run_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
            run_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobRun {
    pub job: &'static str,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: &'static str,
    pub interval_secs: u64,
    pub state: JobState,
    pub runs: u64,
    pub skipped: u64,
    pub last_run: Option<JobRun>,
}

/// Which in-flight runs finished inside the grace period and which were abandoned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<&'static str>,
    pub timed_out: Vec<&'static str>,
}

type Statuses = Arc<RwLock<Vec<JobStatus>>>;

/// Read side of the scheduler, shared with the health endpoint.
#[derive(Clone, Default)]
pub struct SchedulerHandle {
    statuses: Statuses,
}

impl SchedulerHandle {
    pub async fn statuses(&self) -> Vec<JobStatus> {
        self.statuses.read().await.clone()
    }
}

struct Registered {
    job: Arc<dyn Job>,
    every: Duration,
}

struct InFlight {
    index: usize,
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    jobs: Vec<Registered>,
    statuses: Statuses,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            jobs: Vec::new(),
            statuses: Arc::default(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            statuses: self.statuses.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Registers `job` to run every `every`; a zero interval is bumped to 1ms.
    pub async fn register(&mut self, job: Arc<dyn Job>, every: Duration) -> &mut Self {
        let every = every.max(Duration::from_millis(1));
        self.statuses.write().await.push(JobStatus {
            name: job.name(),
            interval_secs: every.as_secs(),
            state: JobState::Idle,
            runs: 0,
            skipped: 0,
            last_run: None,
        });
        self.jobs.push(Registered { job, every });
        self
    }

    /// Drives every registered job until `shutdown` resolves, then cancels
    /// in-flight runs and waits up to the grace period for them.
    pub async fn run<S>(self, shutdown: S) -> ShutdownReport
    where
        S: Future<Output = ()> + Send,
    {
        let root = CancelSource::new();
        let mut tickers = JoinSet::new();
        for (index, registered) in self.jobs.into_iter().enumerate() {
            info!(job = registered.job.name(), every_secs = registered.every.as_secs(), "job scheduled");
            tickers.spawn(drive(
                index,
                registered,
                root.token(),
                self.config.clone(),
                self.statuses.clone(),
            ));
        }

        shutdown.await;
        // tickers start runs under the same lock, so no run slips past the snapshot
        let running: Vec<usize> = {
            let statuses = self.statuses.write().await;
            root.cancel();
            statuses
                .iter()
                .enumerate()
                .filter(|(_, status)| status.state == JobState::Running)
                .map(|(index, _)| index)
                .collect()
        };
        info!(running = running.len(), "shutdown requested, cancelling jobs");

        let mut in_flight = Vec::new();
        while let Some(joined) = tickers.join_next().await {
            match joined {
                Ok(Some(run)) if running.contains(&run.index) => in_flight.push(run),
                Ok(_) => {}
                Err(err) => error!(error = %err, "job ticker panicked"),
            }
        }
        in_flight.sort_by_key(|run| run.index);

        let deadline = Instant::now() + self.config.shutdown_grace;
        let mut report = ShutdownReport::default();
        for mut run in in_flight {
            match tokio::time::timeout_at(deadline, &mut run.handle).await {
                Ok(_) => report.completed.push(run.name),
                Err(_) => {
                    run.handle.abort();
                    warn!(job = run.name, "job did not stop within the grace period");
                    report.timed_out.push(run.name);
                }
            }
        }
        report
    }
}

/// Ticker loop for one job. Returns the handle of its latest run, if any.
async fn drive(
    index: usize,
    registered: Registered,
    root: CancelToken,
    config: SchedulerConfig,
    statuses: Statuses,
) -> Option<InFlight> {
    let Registered { job, every } = registered;
    let name = job.name();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !config.run_on_startup {
        ticker.tick().await;
    }

    let mut current: Option<JoinHandle<()>> = None;
    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if current.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(job = name, "previous run still in progress, skipping tick");
            metrics::counter!("worker_job_skipped_total", "job" => name).increment(1);
            if let Some(status) = statuses.write().await.get_mut(index) {
                status.skipped += 1;
            }
            continue;
        }
        let mut guard = statuses.write().await;
        if root.is_cancelled() {
            break;
        }
        if let Some(status) = guard.get_mut(index) {
            status.state = JobState::Running;
        }
        current = Some(tokio::spawn(execute(
            index,
            job.clone(),
            root.clone(),
            config.run_timeout,
            statuses.clone(),
        )));
    }

    current.map(|handle| InFlight {
        index,
        name,
        handle,
    })
}

async fn execute(
    index: usize,
    job: Arc<dyn Job>,
    root: CancelToken,
    timeout: Duration,
    statuses: Statuses,
) {
    let name = job.name();
    let ctx = root.with_timeout(timeout);
    let started_at = Utc::now();
    let started = Instant::now();

    let result = async {
        match tokio::time::timeout(timeout, job.run(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::TimedOut),
        }
    }
    .instrument(info_span!("job_run", job = name))
    .await;
    // a deadline-driven cancellation is a timeout, not a shutdown
    let result = match result {
        Err(JobError::Cancelled) if !root.is_cancelled() => Err(JobError::TimedOut),
        other => other,
    };

    let elapsed = started.elapsed();
    let outcome = match &result {
        Ok(()) => "ok",
        Err(JobError::TimedOut) => "timeout",
        Err(JobError::Cancelled) => "cancelled",
        Err(_) => "error",
    };
    metrics::counter!("worker_job_runs_total", "job" => name, "outcome" => outcome).increment(1);
    metrics::histogram!("worker_job_duration_seconds", "job" => name).record(elapsed.as_secs_f64());
    match &result {
        Ok(()) => info!(job = name, elapsed_ms = elapsed.as_millis() as u64, "job run completed"),
        Err(JobError::Cancelled) => info!(job = name, "job run cancelled"),
        Err(err) => warn!(job = name, error = %err, elapsed_ms = elapsed.as_millis() as u64, "job run failed"),
    }

    let run = JobRun {
        job: name,
        started_at,
        duration_ms: elapsed.as_millis() as u64,
        error: result.as_ref().err().map(ToString::to_string),
    };
    if let Some(status) = statuses.write().await.get_mut(index) {
        status.runs += 1;
        status.state = if result.is_ok() {
            JobState::Idle
        } else {
            JobState::Failed
        };
        status.last_run = Some(run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self, _ctx: &CancelToken) -> Result<(), JobError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_start_waits_one_interval() {
        let job = Arc::new(Counting(AtomicUsize::new(0)));
        let mut scheduler = Scheduler::new(SchedulerConfig {
            run_on_startup: false,
            ..Default::default()
        });
        scheduler.register(job.clone(), Duration::from_secs(60)).await;
        let handle = scheduler.handle();

        let report = scheduler
            .run(tokio::time::sleep(Duration::from_secs(90)))
            .await;
        assert_eq!(job.0.load(Ordering::SeqCst), 1);
        assert!(report.timed_out.is_empty());
        let statuses = handle.statuses().await;
        assert_eq!(statuses[0].runs, 1);
        assert_eq!(statuses[0].state, JobState::Idle);
    }
}
