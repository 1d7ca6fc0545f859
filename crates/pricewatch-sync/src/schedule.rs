//! Recurring jobs. Each job is a plain `(cadence, JobKind)` pair so tests
//! can run a job directly instead of waiting on the cron clock.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::{DigestSweepSummary, HealthReport, MonitorConfig, PriceMonitor, SweepSummary, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullSweep,
    DailyDigest,
    HistoryExpiry,
    HealthCheck,
}

impl JobKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::FullSweep => "full_sweep",
            Self::DailyDigest => "daily_digest",
            Self::HistoryExpiry => "history_expiry",
            Self::HealthCheck => "health_check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    /// Six-field cron expression (seconds first).
    pub cadence: String,
    pub kind: JobKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobReport {
    FullSweep(SweepSummary),
    DailyDigest(DigestSweepSummary),
    HistoryExpiry { removed: usize },
    HealthCheck(HealthReport),
}

pub async fn run_job(monitor: &PriceMonitor, kind: JobKind) -> Result<JobReport, SyncError> {
    Ok(match kind {
        JobKind::FullSweep => JobReport::FullSweep(monitor.run_full_sweep().await?),
        JobKind::DailyDigest => JobReport::DailyDigest(monitor.run_daily_digest().await?),
        JobKind::HistoryExpiry => JobReport::HistoryExpiry {
            removed: monitor.purge_expired_history().await?,
        },
        JobKind::HealthCheck => JobReport::HealthCheck(monitor.health_check().await),
    })
}

pub struct Scheduler {
    monitor: Arc<PriceMonitor>,
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new(monitor: Arc<PriceMonitor>) -> Self {
        Self {
            monitor,
            jobs: Vec::new(),
        }
    }

    pub fn from_config(monitor: Arc<PriceMonitor>, config: &MonitorConfig) -> Self {
        Self::new(monitor)
            .with_job(&config.sweep_cron, JobKind::FullSweep)
            .with_job(&config.digest_cron, JobKind::DailyDigest)
            .with_job(&config.history_expiry_cron, JobKind::HistoryExpiry)
            .with_job(&config.health_check_cron, JobKind::HealthCheck)
    }

    pub fn with_job(mut self, cadence: impl Into<String>, kind: JobKind) -> Self {
        self.jobs.push(ScheduledJob {
            cadence: cadence.into(),
            kind,
        });
        self
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// Run one job now, outside its cadence.
    pub async fn trigger(&self, kind: JobKind) -> Result<JobReport, SyncError> {
        run_job(&self.monitor, kind).await
    }

    /// Register every job with a cron scheduler and start it. The returned
    /// handle keeps the jobs alive.
    pub async fn start(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for job in &self.jobs {
            let kind = job.kind;
            let monitor = Arc::clone(&self.monitor);
            let cron_job = Job::new_async(job.cadence.as_str(), move |_uuid, _l| {
                let monitor = Arc::clone(&monitor);
                Box::pin(async move {
                    info!(job = kind.name(), "scheduled job triggered");
                    match run_job(&monitor, kind).await {
                        Ok(report) => info!(job = kind.name(), ?report, "scheduled job finished"),
                        Err(err) => error!(job = kind.name(), error = %err, "scheduled job failed"),
                    }
                })
            })
            .with_context(|| format!("creating {} job for cron {}", kind.name(), job.cadence))?;
            sched.add(cron_job).await.context("adding scheduler job")?;
        }
        sched.start().await.context("starting scheduler")?;
        info!(jobs = self.jobs.len(), "scheduler started");
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use pricewatch_adapters::OfflinePriceFetcher;
    use pricewatch_core::{CheckResult, Competitor, FetchStatus, PriceHistoryRecord, Product, User};
    use pricewatch_storage::{MemoryRecordStore, RecordStore};

    use super::*;
    use crate::{AlertNotifier, NoDelay};

    fn scheduler(store: Arc<MemoryRecordStore>) -> Scheduler {
        let notifier = AlertNotifier::new(store.clone(), None, "noreply@example.com");
        let monitor = PriceMonitor::new(store, Arc::new(OfflinePriceFetcher), notifier)
            .with_pacer(Arc::new(NoDelay));
        Scheduler::from_config(Arc::new(monitor), &MonitorConfig::default())
    }

    #[test]
    fn config_registers_all_four_jobs() {
        let sched = scheduler(Arc::new(MemoryRecordStore::new()));
        let kinds: Vec<JobKind> = sched.jobs().iter().map(|j| j.kind).collect();
        assert_eq!(
            kinds,
            vec![
                JobKind::FullSweep,
                JobKind::DailyDigest,
                JobKind::HistoryExpiry,
                JobKind::HealthCheck
            ]
        );
        assert_eq!(sched.jobs()[0].cadence, "0 0 2 * * *");
    }

    #[tokio::test]
    async fn jobs_run_directly_without_waiting() {
        let store = Arc::new(MemoryRecordStore::new());
        let user = User::new("seller@example.com");
        let mut product = Product::new(user.id, "Lens");
        product.add_competitor(Competitor::new("mock://a?price=10", None));
        store.save_user(&user).await.unwrap();
        store.save_product(&product).await.unwrap();

        let old = CheckResult {
            competitor_id: product.competitors[0].id,
            status: FetchStatus::Success,
            old_price: None,
            new_price: Some(9.0),
            percent_change: 0.0,
        };
        let checked_at = Utc::now() - Duration::days(45);
        let expired = PriceHistoryRecord::from_check(product.id, &old, checked_at);
        store.insert_price_history(&[expired]).await.unwrap();

        let sched = scheduler(store.clone());
        match sched.trigger(JobKind::FullSweep).await.unwrap() {
            JobReport::FullSweep(summary) => assert_eq!(summary.products_checked, 1),
            other => panic!("unexpected report {other:?}"),
        }
        match sched.trigger(JobKind::HistoryExpiry).await.unwrap() {
            JobReport::HistoryExpiry { removed } => assert_eq!(removed, 1),
            other => panic!("unexpected report {other:?}"),
        }
        match sched.trigger(JobKind::HealthCheck).await.unwrap() {
            JobReport::HealthCheck(report) => {
                assert!(report.healthy);
                assert_eq!(report.users, 1);
            }
            other => panic!("unexpected report {other:?}"),
        }
        assert!(matches!(
            sched.trigger(JobKind::DailyDigest).await.unwrap(),
            JobReport::DailyDigest(_)
        ));
    }
}
