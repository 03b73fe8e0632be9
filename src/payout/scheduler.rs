//! Periodic jobs
//!
//! Three independent loops: payout sweep, rank pool accrual and the retry of
//! activations whose commissions never committed. The same jobs can be run
//! once from the cron binary or the admin API through `JobRunner`.

use bson::DateTime;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::income::{AccrualReport, DistributionEngine, PendingRun, PoolService};
use crate::payout::processor::{PayoutProcessor, SweepReport};
use crate::types::{Result, UplineError};

/// Activations retried per distribution run
pub const DEFAULT_DISTRIBUTION_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    PayoutSweep,
    PoolAccrual,
    Distribute,
}

impl Job {
    pub const ALL: [Job; 3] = [Job::Distribute, Job::PoolAccrual, Job::PayoutSweep];

    pub fn as_str(self) -> &'static str {
        match self {
            Job::PayoutSweep => "payout-sweep",
            Job::PoolAccrual => "pool-accrual",
            Job::Distribute => "distribute",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Job {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "payout-sweep" => Ok(Job::PayoutSweep),
            "pool-accrual" => Ok(Job::PoolAccrual),
            "distribute" => Ok(Job::Distribute),
            other => Err(format!("unknown job: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobReport {
    PayoutSweep(SweepReport),
    PoolAccrual(AccrualReport),
    Distribute(PendingRun),
}

/// Runs one job to completion
#[derive(Clone)]
pub struct JobRunner {
    payouts: Arc<PayoutProcessor>,
    pool: PoolService,
    distribution: DistributionEngine,
    distribution_batch: usize,
}

impl JobRunner {
    pub fn new(payouts: Arc<PayoutProcessor>, pool: PoolService, distribution: DistributionEngine) -> Self {
        Self {
            payouts,
            pool,
            distribution,
            distribution_batch: DEFAULT_DISTRIBUTION_BATCH,
        }
    }

    pub async fn run(&self, job: Job, now: DateTime) -> Result<JobReport> {
        debug!(job = %job, "Running job");
        match job {
            Job::PayoutSweep => self.payouts.sweep(now).await.map(JobReport::PayoutSweep),
            Job::PoolAccrual => self.pool.accrue(now).await.map(JobReport::PoolAccrual),
            Job::Distribute => self
                .distribution
                .distribute_pending(self.distribution_batch)
                .await
                .map(JobReport::Distribute),
        }
    }

    /// Run on its own task so a dropped caller cannot cut a job off between
    /// a gateway call and the ledger write that records it
    pub async fn run_detached(&self, job: Job, now: DateTime) -> Result<JobReport> {
        let runner = self.clone();
        tokio::spawn(async move { runner.run(job, now).await })
            .await
            .map_err(|e| UplineError::Internal(format!("Job {job} task failed: {e}")))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerIntervals {
    pub payout_sweep: Duration,
    pub pool_accrual: Duration,
    pub distribution_retry: Duration,
}

impl Default for SchedulerIntervals {
    fn default() -> Self {
        Self {
            payout_sweep: Duration::from_secs(60),
            pool_accrual: Duration::from_secs(3600),
            distribution_retry: Duration::from_secs(300),
        }
    }
}

impl SchedulerIntervals {
    fn for_job(&self, job: Job) -> Duration {
        match job {
            Job::PayoutSweep => self.payout_sweep,
            Job::PoolAccrual => self.pool_accrual,
            Job::Distribute => self.distribution_retry,
        }
    }
}

/// In-process interval loops for every job
pub struct Scheduler {
    runner: JobRunner,
    intervals: SchedulerIntervals,
    running: Arc<RwLock<bool>>,
}

impl Scheduler {
    pub fn new(runner: JobRunner, intervals: SchedulerIntervals) -> Self {
        Self {
            runner,
            intervals,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Spawn one loop per job
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Scheduler already running");
                return;
            }
            *running = true;
        }

        for job in Job::ALL {
            let period = self.intervals.for_job(job);
            info!(job = %job, interval = ?period, "Starting scheduled job");

            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // A slow sweep should not be followed by a burst of catch-up runs
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    interval.tick().await;

                    if !*scheduler.running.read().await {
                        info!(job = %job, "Scheduled job stopped");
                        break;
                    }

                    if let Err(e) = scheduler.runner.run(job, DateTime::now()).await {
                        error!(job = %job, error = %e, "Scheduled job failed");
                    }
                }
            });
        }
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopping scheduler");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
