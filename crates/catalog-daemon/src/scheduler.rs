//! Scheduled build and optimize jobs on top of tokio-cron-scheduler.
//!
//! Each job skips a tick while its previous run is still active.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use catalog_indexing::IndexBuildService;
use catalog_types::ScheduleSettings;

pub const BUILD_JOB: &str = "index_build";
pub const OPTIMIZE_JOB: &str = "index_optimize";

/// Errors that can occur during scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Error from the underlying tokio-cron-scheduler
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Invalid cron expression
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,
}

impl From<JobSchedulerError> for SchedulerError {
    fn from(err: JobSchedulerError) -> Self {
        SchedulerError::Scheduler(err.to_string())
    }
}

/// Validate a 6-field cron expression (sec min hour day month weekday).
pub fn validate_cron_expression(expr: &str) -> Result<(), SchedulerError> {
    match Job::new_async(expr, |_uuid, _lock| Box::pin(async {})) {
        Ok(_) => Ok(()),
        Err(e) => Err(SchedulerError::InvalidCron(format!("{}: {}", expr, e))),
    }
}

/// Tracks whether a job is running; a second acquire while held fails.
#[derive(Clone, Default)]
pub struct OverlapGuard {
    is_running: Arc<AtomicBool>,
}

impl OverlapGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the previous run is still active.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                flag: self.is_running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// Releases the running flag when dropped, including on panic.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one scheduled tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran { failures: usize },
    SkippedOverlap,
    SkippedShutdown,
}

/// Build every index type with pending work.
pub async fn run_build_tick(
    service: &IndexBuildService,
    guard: &OverlapGuard,
    shutdown: &CancellationToken,
) -> TickOutcome {
    run_guarded(BUILD_JOB, guard, shutdown, async {
        let mut failures = 0;
        for (index_type, result) in service.build_all().await {
            match result {
                Ok(report) => info!(
                    index_type = %index_type,
                    documents_added = report.documents_added,
                    documents_deleted = report.documents_deleted,
                    rebuilt = report.rebuilt,
                    "Scheduled build completed"
                ),
                Err(e) => {
                    failures += 1;
                    warn!(index_type = %index_type, error = %e, "Scheduled build failed");
                }
            }
        }
        failures
    })
    .await
}

/// Optimize every index type that is not excluded.
pub async fn run_optimize_tick(
    service: &IndexBuildService,
    guard: &OverlapGuard,
    shutdown: &CancellationToken,
) -> TickOutcome {
    run_guarded(OPTIMIZE_JOB, guard, shutdown, async {
        match service.optimize_indices().await {
            Ok(report) => {
                info!(
                    optimized = report.optimized.len(),
                    skipped = report.skipped.len(),
                    "Scheduled optimize completed"
                );
                0
            }
            Err(e) => {
                error!(error = %e, "Scheduled optimize failed");
                1
            }
        }
    })
    .await
}

async fn run_guarded<Fut>(
    name: &str,
    guard: &OverlapGuard,
    shutdown: &CancellationToken,
    job: Fut,
) -> TickOutcome
where
    Fut: Future<Output = usize>,
{
    if shutdown.is_cancelled() {
        return TickOutcome::SkippedShutdown;
    }
    let Some(_running) = guard.try_acquire() else {
        info!(job = %name, "Previous run still active, skipping");
        return TickOutcome::SkippedOverlap;
    };

    info!(job = %name, "Job started");
    let start = Instant::now();
    let failures = job.await;
    info!(
        job = %name,
        failures,
        duration_ms = start.elapsed().as_millis() as u64,
        "Job completed"
    );
    TickOutcome::Ran { failures }
}

/// Cron-driven build and optimize jobs over one service.
pub struct BuildScheduler {
    scheduler: JobScheduler,
    service: Arc<IndexBuildService>,
    shutdown_token: CancellationToken,
    is_running: AtomicBool,
}

impl BuildScheduler {
    /// Create the scheduler and register both jobs. Call `start()` to run them.
    pub async fn new(
        service: Arc<IndexBuildService>,
        schedule: &ScheduleSettings,
    ) -> Result<Self, SchedulerError> {
        validate_cron_expression(&schedule.build_cron)?;
        validate_cron_expression(&schedule.optimize_cron)?;

        let scheduler = Self {
            scheduler: JobScheduler::new().await?,
            service,
            shutdown_token: CancellationToken::new(),
            is_running: AtomicBool::new(false),
        };

        scheduler
            .add_cron_job(BUILD_JOB, &schedule.build_cron, |service, guard, token| async move {
                run_build_tick(&service, &guard, &token).await;
            })
            .await?;
        scheduler
            .add_cron_job(
                OPTIMIZE_JOB,
                &schedule.optimize_cron,
                |service, guard, token| async move {
                    run_optimize_tick(&service, &guard, &token).await;
                },
            )
            .await?;

        Ok(scheduler)
    }

    async fn add_cron_job<F, Fut>(
        &self,
        name: &str,
        cron_expr: &str,
        job_fn: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn(Arc<IndexBuildService>, OverlapGuard, CancellationToken) -> Fut
            + Clone
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service = self.service.clone();
        let shutdown_token = self.shutdown_token.clone();
        let guard = OverlapGuard::new();

        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let job_fn = job_fn.clone();
            let service = service.clone();
            let guard = guard.clone();
            let token = shutdown_token.clone();
            Box::pin(async move { job_fn(service, guard, token).await })
        })
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;

        let uuid = self.scheduler.add(job).await?;
        info!(job = %name, uuid = %uuid, cron = %cron_expr, "Job registered");
        Ok(())
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.scheduler.start().await?;
        info!("Scheduler started");
        Ok(())
    }

    /// Stop scheduling, skip further ticks and cancel running builds.
    pub async fn shutdown(&mut self) {
        info!("Initiating scheduler shutdown");
        self.shutdown_token.cancel();
        self.service.cancel();

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Error during scheduler shutdown: {}", e);
        }
        self.is_running.store(false, Ordering::SeqCst);
        info!("Scheduler shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use catalog_indexing::testing::{
        InMemoryEntityLoader, InMemoryIndexEngine, InMemoryNotificationStore,
    };
    use catalog_indexing::{Collaborators, FieldCopyTranslator, ThresholdIndexBuildPolicy};
    use catalog_types::{EntityRecord, IndexNotification, IndexType, PipelineSettings};

    fn service_with(
        store: Arc<InMemoryNotificationStore>,
        loader: Arc<InMemoryEntityLoader>,
        engine: Arc<InMemoryIndexEngine>,
    ) -> Arc<IndexBuildService> {
        Arc::new(IndexBuildService::new(
            Collaborators {
                notification_store: store,
                entity_loader: loader,
                translator: Arc::new(FieldCopyTranslator::new()),
                engine,
            },
            Arc::new(ThresholdIndexBuildPolicy::default()),
            PipelineSettings {
                retry_initial_interval_ms: 1,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_validate_cron_expression() {
        assert!(validate_cron_expression("*/30 * * * * *").is_ok());
        assert!(validate_cron_expression("0 0 3 * * *").is_ok());
        assert!(validate_cron_expression("invalid").is_err());
        assert!(validate_cron_expression("").is_err());
    }

    #[test]
    fn test_overlap_guard_skips_second_acquire() {
        let guard = OverlapGuard::new();
        let first = guard.try_acquire();
        assert!(first.is_some());
        assert!(guard.is_running());
        assert!(guard.try_acquire().is_none());

        drop(first);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_build_tick_indexes_pending_notifications() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let loader = Arc::new(InMemoryEntityLoader::new());
        let engine = Arc::new(InMemoryIndexEngine::new());
        loader.put(EntityRecord::new(IndexType::Sku, 1).with_field("code", "A-1"));
        store.push(IndexNotification::update(IndexType::Sku, 1));
        let service = service_with(store.clone(), loader, engine.clone());

        let outcome =
            run_build_tick(&service, &OverlapGuard::new(), &CancellationToken::new()).await;

        assert_eq!(outcome, TickOutcome::Ran { failures: 0 });
        assert_eq!(engine.committed_uids(IndexType::Sku), vec![1]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_tick_skips_while_previous_run_active() {
        let service = service_with(
            Arc::new(InMemoryNotificationStore::new()),
            Arc::new(InMemoryEntityLoader::new()),
            Arc::new(InMemoryIndexEngine::new()),
        );
        let guard = OverlapGuard::new();
        let _running = guard.try_acquire();

        let outcome = run_optimize_tick(&service, &guard, &CancellationToken::new()).await;

        assert_eq!(outcome, TickOutcome::SkippedOverlap);
    }

    #[tokio::test]
    async fn test_tick_skips_after_shutdown() {
        let store = Arc::new(InMemoryNotificationStore::new());
        store.push(IndexNotification::update(IndexType::Product, 1));
        let service = service_with(
            store.clone(),
            Arc::new(InMemoryEntityLoader::new()),
            Arc::new(InMemoryIndexEngine::new()),
        );
        let token = CancellationToken::new();
        token.cancel();

        let outcome = run_build_tick(&service, &OverlapGuard::new(), &token).await;

        assert_eq!(outcome, TickOutcome::SkippedShutdown);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_rejects_invalid_cron() {
        let service = service_with(
            Arc::new(InMemoryNotificationStore::new()),
            Arc::new(InMemoryEntityLoader::new()),
            Arc::new(InMemoryIndexEngine::new()),
        );
        let schedule = ScheduleSettings {
            build_cron: "every minute".to_string(),
            ..Default::default()
        };

        let result = BuildScheduler::new(service, &schedule).await;
        assert!(matches!(result, Err(SchedulerError::InvalidCron(_))));
    }

    #[tokio::test]
    async fn test_scheduler_start_and_shutdown() {
        let service = service_with(
            Arc::new(InMemoryNotificationStore::new()),
            Arc::new(InMemoryEntityLoader::new()),
            Arc::new(InMemoryIndexEngine::new()),
        );
        let mut scheduler = BuildScheduler::new(service, &ScheduleSettings::default())
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::AlreadyRunning)
        ));

        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
    }
}
