//! End-to-end driver for one index build run.
//!
//! A run repeats fetch -> classify -> process -> commit -> consume until no
//! new notifications arrive or `max_build_iterations` is reached. Groups are
//! produced sequentially by the grouping stage, queued through a bounded
//! channel and processed by a worker pool of `worker_count` concurrent
//! groups. Commits, optimizations and delete-all take the index write lock.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use catalog_types::{IndexNotification, IndexType, PipelineSettings, Uid};

use crate::collaborators::Collaborators;
use crate::error::PipelineError;
use crate::grouping::UidGroupingStage;
use crate::locks::IndexWriteLocks;
use crate::performance::{metrics, PerformanceSnapshot, PipelinePerformance};
use crate::policy::{IndexBuildPolicy, IndexBuildPolicyContext, IndexBuildPolicyContextFactory};
use crate::processor::{NotificationBatch, NotificationProcessor};
use crate::stage::{GroupAction, GroupDispatcher, GroupTask, IndexingStage, StageOutput, UidGroup};
use crate::stages::{upsert_chain, DeleteStage, UpsertChain};

/// Lifecycle of a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Idle,
    Fetching,
    Grouping,
    Processing,
    PolicyCheck,
    Committing,
    Optimizing,
    Completed,
    Failed,
    Cancelled,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Idle => "idle",
            BuildState::Fetching => "fetching",
            BuildState::Grouping => "grouping",
            BuildState::Processing => "processing",
            BuildState::PolicyCheck => "policy_check",
            BuildState::Committing => "committing",
            BuildState::Optimizing => "optimizing",
            BuildState::Completed => "completed",
            BuildState::Failed => "failed",
            BuildState::Cancelled => "cancelled",
        }
    }

    /// True once the run can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Completed | BuildState::Failed | BuildState::Cancelled
        )
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub index_type: IndexType,
    pub state: BuildState,
    /// Fetch/process/consume cycles that found work
    pub iterations: usize,
    /// Groups processed, including failed and timed out ones
    pub groups: usize,
    pub failed_groups: usize,
    pub timed_out_groups: usize,
    pub documents_added: u64,
    pub documents_deleted: u64,
    pub commits: usize,
    pub optimized: bool,
    pub rebuilt: bool,
    pub notifications_consumed: usize,
    /// Entities changed since the last clean build without a notification
    pub modified_entities: usize,
    pub performance: PerformanceSnapshot,
}

impl BuildReport {
    fn new(index_type: IndexType) -> Self {
        Self {
            index_type,
            state: BuildState::Idle,
            iterations: 0,
            groups: 0,
            failed_groups: 0,
            timed_out_groups: 0,
            documents_added: 0,
            documents_deleted: 0,
            commits: 0,
            optimized: false,
            rebuilt: false,
            notifications_consumed: 0,
            modified_entities: 0,
            performance: PerformanceSnapshot::default(),
        }
    }
}

/// How a group ended after all attempts.
enum GroupOutcome {
    Succeeded { group: UidGroup, output: StageOutput },
    Failed { task: GroupTask, error: PipelineError },
    TimedOut { task: GroupTask },
    /// Fatal or configuration error: stop the run
    Abort(PipelineError),
}

/// What the worker pool did during one iteration.
struct ProcessingSummary {
    processed: HashSet<Uid>,
    /// Context since the last commit
    uncommitted: IndexBuildPolicyContext,
    operations: u64,
    documents: u64,
    failures: usize,
    /// Uids of upsert groups that failed or timed out
    failed_upserts: Vec<Uid>,
    cancelled: bool,
}

/// Drives one build run for one index type.
pub struct IndexBuildOrchestrator {
    index_type: IndexType,
    collaborators: Collaborators,
    processor: NotificationProcessor,
    policy: Arc<dyn IndexBuildPolicy>,
    settings: PipelineSettings,
    locks: IndexWriteLocks,
    cancel: CancellationToken,
    force_rebuild: bool,
    contexts: IndexBuildPolicyContextFactory,
    performance: Arc<PipelinePerformance>,
    state: watch::Sender<BuildState>,
}

impl IndexBuildOrchestrator {
    pub fn new(
        index_type: IndexType,
        collaborators: Collaborators,
        policy: Arc<dyn IndexBuildPolicy>,
        settings: PipelineSettings,
        locks: IndexWriteLocks,
    ) -> Self {
        let (state, _) = watch::channel(BuildState::Idle);
        Self {
            index_type,
            processor: NotificationProcessor::new(collaborators.notification_store.clone()),
            collaborators,
            policy,
            settings,
            locks,
            cancel: CancellationToken::new(),
            force_rebuild: false,
            contexts: IndexBuildPolicyContextFactory,
            performance: PipelinePerformance::new(),
            state,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Rebuild from a full scan regardless of pending notifications.
    pub fn with_forced_rebuild(mut self) -> Self {
        self.force_rebuild = true;
        self
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn state(&self) -> BuildState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<BuildState> {
        self.state.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn performance(&self) -> &Arc<PipelinePerformance> {
        &self.performance
    }

    fn transition(&self, next: BuildState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        match next {
            BuildState::Processing | BuildState::PolicyCheck => {
                debug!(index_type = %self.index_type, from = %previous, to = %next, "Build state")
            }
            _ => info!(index_type = %self.index_type, from = %previous, to = %next, "Build state"),
        }
    }

    /// Run the build.
    ///
    /// Returns the report only when the run completed. Groups that kept
    /// failing turn into a single `RetriesExhausted` after everything else
    /// has been committed. Cancellation returns `Cancelled` after committing
    /// finished work; a fatal error rolls back and returns `BuildFailed`.
    pub async fn run(&self) -> Result<BuildReport, PipelineError> {
        if let Err(message) = self.settings.validate() {
            self.transition(BuildState::Failed);
            return Err(PipelineError::InvalidArgument(message));
        }

        let mut report = BuildReport::new(self.index_type);
        let mut last_failure = None;
        let result = self.run_iterations(&mut report, &mut last_failure).await;
        report.performance = self.performance.snapshot();

        match result {
            Ok(()) if report.failed_groups > 0 => {
                self.transition(BuildState::Failed);
                let error = PipelineError::RetriesExhausted {
                    index_type: self.index_type,
                    failed_groups: report.failed_groups,
                    attempts: self.settings.max_group_attempts,
                    last_error: last_failure.unwrap_or_default(),
                };
                warn!(index_type = %self.index_type, error = %error, "Build finished with failed groups");
                Err(error)
            }
            Ok(()) => {
                self.transition(BuildState::Completed);
                report.state = BuildState::Completed;
                info!(
                    index_type = %self.index_type,
                    iterations = report.iterations,
                    groups = report.groups,
                    timed_out = report.timed_out_groups,
                    added = report.documents_added,
                    deleted = report.documents_deleted,
                    commits = report.commits,
                    consumed = report.notifications_consumed,
                    "Build completed"
                );
                Ok(report)
            }
            Err(PipelineError::Cancelled { index_type }) => {
                self.transition(BuildState::Cancelled);
                info!(index_type = %index_type, "Build cancelled");
                Err(PipelineError::Cancelled { index_type })
            }
            Err(e) => {
                error!(index_type = %self.index_type, error = %e, "Build aborted");
                if let Err(rollback) = self.collaborators.engine.rollback(self.index_type).await {
                    warn!(index_type = %self.index_type, error = %rollback, "Rollback failed");
                }
                self.transition(BuildState::Failed);
                if e.is_configuration() {
                    return Err(e);
                }
                Err(PipelineError::BuildFailed {
                    index_type: self.index_type,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn run_iterations(
        &self,
        report: &mut BuildReport,
        last_failure: &mut Option<String>,
    ) -> Result<(), PipelineError> {
        let store = &self.collaborators.notification_store;
        let loader = &self.collaborators.entity_loader;
        let engine = &self.collaborators.engine;
        let started_at = Utc::now();
        let last_build = self
            .retry("read last build time", || store.last_build_time(self.index_type))
            .await?;
        let mut seen_up_to: Option<u64> = None;
        let mut force_rebuild = self.force_rebuild;

        for iteration in 1..=self.settings.max_build_iterations {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            self.transition(BuildState::Fetching);
            let mut batch = self
                .retry("fetch notifications", || {
                    self.processor.fetch_batch(self.index_type, seen_up_to)
                })
                .await?;
            self.performance.increment(
                metrics::NOTIFICATIONS_FETCHED,
                batch.notification_ids().len() as u64,
            );

            let index_exists = self
                .retry("check index", || engine.index_exists(self.index_type))
                .await?;
            let rebuild = force_rebuild || batch.is_rebuild() || !index_exists;

            // Later iterations only pick up new notifications. A full scan
            // covers modified entities anyway, and a DELETE_ALL drops them.
            let since =
                last_build.filter(|_| iteration == 1 && !rebuild && !batch.is_delete_all());
            if let Some(since) = since {
                let modified = self
                    .retry("find modified entities", || {
                        loader.modified_since(self.index_type, since)
                    })
                    .await?;
                batch.add_modified(&modified);
                report.modified_entities = batch.modified_count();
                debug!(
                    index_type = %self.index_type,
                    since = %since,
                    modified = report.modified_entities,
                    "Found entities modified since the last build"
                );
            }

            if !rebuild && !batch.has_work() {
                debug!(index_type = %self.index_type, iteration, "No pending notifications");
                break;
            }

            info!(
                index_type = %self.index_type,
                iteration,
                notifications = batch.notification_ids().len(),
                modified = batch.modified_count(),
                rebuild,
                delete_all = batch.is_delete_all(),
                index_exists,
                "Starting build iteration"
            );
            report.iterations = iteration;
            seen_up_to = seen_up_to.max(batch.max_notification_id());
            force_rebuild = false;

            // Nothing in the store asks for this rebuild: if it does not
            // finish, queue a REBUILD so the next run starts over.
            let unrecorded_rebuild = rebuild && batch.rebuild_marker.is_none();
            match self.run_iteration(&mut batch, rebuild, report, last_failure).await {
                Ok(requeued) => seen_up_to = seen_up_to.max(requeued),
                Err(e) => {
                    if unrecorded_rebuild {
                        self.requeue_rebuild().await;
                    }
                    return Err(e);
                }
            }
        }

        if report.failed_groups == 0 && report.timed_out_groups == 0 {
            self.retry("store last build time", || {
                store.set_last_build_time(self.index_type, started_at)
            })
            .await?;
            debug!(index_type = %self.index_type, at = %started_at, "Recorded last build time");
        }
        Ok(())
    }

    /// Store a REBUILD notification for an unfinished rebuild. Failing to
    /// do so is logged; the run's own error is what gets reported.
    async fn requeue_rebuild(&self) {
        let store = &self.collaborators.notification_store;
        match store.put(IndexNotification::rebuild(self.index_type)).await {
            Ok(id) => warn!(
                index_type = %self.index_type,
                id,
                "Rebuild did not finish; queued a rebuild for the next run"
            ),
            Err(e) => error!(
                index_type = %self.index_type,
                error = %e,
                "Failed to queue a rebuild for the next run"
            ),
        }
    }

    /// One fetch/process/consume cycle. Returns the id of a notification
    /// queued for the next run, if any.
    async fn run_iteration(
        &self,
        batch: &mut NotificationBatch,
        rebuild: bool,
        report: &mut BuildReport,
        last_failure: &mut Option<String>,
    ) -> Result<Option<u64>, PipelineError> {
        let loader = &self.collaborators.entity_loader;
        let engine = &self.collaborators.engine;

        for change in batch.related().to_vec() {
            let uids = self
                .retry("resolve related", || {
                    loader.related_uids(self.index_type, &change.related)
                })
                .await?;
            debug!(
                index_type = %self.index_type,
                entity_type = %change.related.entity_type,
                related_uid = change.related.uid,
                uids = uids.len(),
                "Resolved related change"
            );
            batch.apply_related(change.notification_id, &uids);
        }

        let reset = rebuild || batch.is_delete_all();
        if reset {
            let _guard = self.locks.lock(self.index_type).await;
            let _timer = self.performance.start_timer(metrics::DELETE_ALL);
            self.retry("delete all", || engine.delete_all(self.index_type))
                .await?;
            report.rebuilt |= rebuild;
        }

        self.transition(BuildState::Grouping);
        let run_cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(self.settings.worker_count.saturating_mul(2).max(1));

        let (produced, processed) = tokio::join!(
            self.produce_groups(batch, rebuild, tx, run_cancel.clone()),
            self.process_groups(rx, report, last_failure, run_cancel.clone())
        );
        let summary = processed?;
        let cancelled =
            summary.cancelled || matches!(produced, Err(PipelineError::Cancelled { .. }));
        if let Err(e) = produced {
            // Once the pool stopped for cancellation, whatever the producer
            // ran into is part of the same cancellation.
            if !cancelled {
                return Err(e);
            }
            debug!(index_type = %self.index_type, error = %e, "Group production stopped");
        }

        if reset || summary.uncommitted.operations_count() > 0 {
            self.commit(report).await?;
        }

        if !cancelled {
            let mut context = self
                .contexts
                .create_index_build_policy_context(self.index_type)
                .record(summary.operations, summary.documents);
            if rebuild {
                context = context.for_full_rebuild();
            }
            if self.policy.is_optimization_required(&context) {
                self.optimize(report).await?;
            }
        }

        // The reset of a rebuild is only done once the full scan went
        // through; a delete-all is done once committed.
        let reset_done = if rebuild {
            summary.failures == 0 && !cancelled
        } else {
            reset
        };
        let consumable = batch.consumable_ids(&summary.processed, reset_done);
        if !consumable.is_empty() {
            let removed = self
                .retry("remove notifications", || {
                    self.collaborators.notification_store.remove(&consumable)
                })
                .await?;
            self.performance
                .increment(metrics::NOTIFICATIONS_CONSUMED, removed as u64);
            report.notifications_consumed += removed;
        }
        debug!(
            index_type = %self.index_type,
            consumed = consumable.len(),
            pending = batch.notification_ids().len().saturating_sub(consumable.len()),
            "Consumed notifications"
        );

        if cancelled {
            return Err(self.cancelled());
        }

        // The scan finished but some of its groups did not. Without a
        // REBUILD notification to keep, their uids need one of their own.
        if rebuild && batch.rebuild_marker.is_none() && !summary.failed_upserts.is_empty() {
            let mut uids = summary.failed_upserts;
            uids.sort_unstable();
            uids.dedup();
            let id = self
                .retry("queue failed uids", || {
                    self.collaborators
                        .notification_store
                        .put(IndexNotification::update_many(self.index_type, uids.clone()))
                })
                .await?;
            warn!(
                index_type = %self.index_type,
                id,
                uids = uids.len(),
                "Queued uids of failed rebuild groups for the next run"
            );
            return Ok(Some(id));
        }
        Ok(None)
    }

    /// Group the batch's work and queue it for the worker pool.
    async fn produce_groups(
        &self,
        batch: &NotificationBatch,
        rebuild: bool,
        tx: mpsc::Sender<GroupTask>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let task_ids = Arc::new(AtomicUsize::new(0));
        let upserts = UidGroupingStage::new(self.settings.group_size)?
            .with_performance(self.performance.clone())
            .with_next(Arc::new(GroupDispatcher::new(
                self.index_type,
                GroupAction::Upsert,
                tx.clone(),
                task_ids.clone(),
                cancel.clone(),
            )));
        let deletes = UidGroupingStage::new(self.settings.group_size)?
            .with_performance(self.performance.clone())
            .with_next(Arc::new(GroupDispatcher::new(
                self.index_type,
                GroupAction::Delete,
                tx,
                task_ids,
                cancel,
            )));

        let deleted: HashSet<Uid> = batch.deletes().into_iter().collect();
        let mut scanned = HashSet::new();

        if rebuild {
            let loader = &self.collaborators.entity_loader;
            let page_size = self.settings.rebuild_page_size;
            let mut after = None;
            let mut page = 0;
            loop {
                let uids = self
                    .retry("scan uids", || loader.all_uids(self.index_type, after, page_size))
                    .await?;
                let last_page = uids.len() < page_size;
                after = uids.last().copied().or(after);
                let uids: Vec<Uid> = uids.into_iter().filter(|uid| !deleted.contains(uid)).collect();
                debug!(index_type = %self.index_type, page, uids = uids.len(), "Scanned page");
                scanned.extend(uids.iter().copied());
                upserts.run(uids).await?;

                if last_page {
                    break;
                }
                page += 1;
            }
        }

        let pending: Vec<Uid> = batch
            .upserts()
            .into_iter()
            .filter(|uid| !scanned.contains(uid))
            .collect();
        upserts.run(pending).await?;
        deletes.run(batch.deletes()).await?;
        Ok(())
    }

    /// Drain the group queue with `worker_count` concurrent groups,
    /// committing whenever the policy asks for it.
    async fn process_groups(
        &self,
        rx: mpsc::Receiver<GroupTask>,
        report: &mut BuildReport,
        last_failure: &mut Option<String>,
        run_cancel: CancellationToken,
    ) -> Result<ProcessingSummary, PipelineError> {
        let collaborators = &self.collaborators;
        let upsert = upsert_chain(
            self.index_type,
            collaborators.entity_loader.clone(),
            collaborators.translator.clone(),
            collaborators.engine.clone(),
            self.policy.clone(),
            self.performance.clone(),
        );
        let delete = DeleteStage::new(
            self.index_type,
            collaborators.engine.clone(),
            self.performance.clone(),
        );

        let mut summary = ProcessingSummary {
            processed: HashSet::new(),
            uncommitted: self.contexts.create_index_build_policy_context(self.index_type),
            operations: 0,
            documents: 0,
            failures: 0,
            failed_upserts: Vec::new(),
            cancelled: false,
        };

        let outcomes = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|task| (task, rx))
        })
        .map(|task| self.process_group(task, &upsert, &delete))
        .buffer_unordered(self.settings.worker_count.max(1));
        futures::pin_mut!(outcomes);

        self.transition(BuildState::Processing);
        while let Some(outcome) = outcomes.next().await {
            self.transition(BuildState::PolicyCheck);
            report.groups += 1;

            match outcome {
                GroupOutcome::Succeeded { group, output } => {
                    self.record_output(&output);
                    report.documents_added += output.documents_added;
                    report.documents_deleted += output.documents_deleted;
                    summary.operations += output.index_operations();
                    summary.documents += output.documents_added;
                    summary.processed.extend(group.uids);
                    summary.uncommitted = summary
                        .uncommitted
                        .record(output.index_operations(), output.documents_added);

                    if self.policy.is_commit_required(&summary.uncommitted) {
                        self.commit(report).await?;
                        summary.uncommitted = summary.uncommitted.after_commit();
                    }
                }
                GroupOutcome::Failed { task, error } => {
                    self.performance.increment(metrics::GROUPS_FAILED, 1);
                    report.failed_groups += 1;
                    summary.failures += 1;
                    warn!(index_type = %self.index_type, task = task.id, error = %error, "Group failed");
                    *last_failure = Some(error.to_string());
                    if task.action == GroupAction::Upsert {
                        summary.failed_upserts.extend(task.group.uids);
                    }
                }
                GroupOutcome::TimedOut { task } => {
                    self.performance.increment(metrics::GROUPS_TIMED_OUT, 1);
                    report.timed_out_groups += 1;
                    summary.failures += 1;
                    warn!(index_type = %self.index_type, task = task.id, "Group timed out");
                    if task.action == GroupAction::Upsert {
                        summary.failed_upserts.extend(task.group.uids);
                    }
                }
                GroupOutcome::Abort(error) => {
                    run_cancel.cancel();
                    return Err(error);
                }
            }

            if self.cancel.is_cancelled() {
                debug!(index_type = %self.index_type, "Cancellation requested; stopping dispatch");
                run_cancel.cancel();
                summary.cancelled = true;
                break;
            }
            self.transition(BuildState::Processing);
        }

        Ok(summary)
    }

    async fn process_group(
        &self,
        task: GroupTask,
        upsert: &UpsertChain,
        delete: &DeleteStage,
    ) -> GroupOutcome {
        let timeout = (self.settings.group_timeout_secs > 0)
            .then(|| Duration::from_secs(self.settings.group_timeout_secs));
        let mut backoff = self.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(
                index_type = %self.index_type,
                task = task.id,
                action = ?task.action,
                uids = task.group.len(),
                attempt,
                "Processing group"
            );

            let send = async {
                match task.action {
                    GroupAction::Upsert => upsert.send(task.group.clone()).await,
                    GroupAction::Delete => delete.send(task.group.clone()).await,
                }
            };
            let result = match timeout {
                Some(limit) => tokio::time::timeout(limit, send).await.unwrap_or(Err(
                    PipelineError::GroupTimeout {
                        group: task.id,
                        timeout: limit,
                    },
                )),
                None => send.await,
            };

            match result {
                Ok(output) => {
                    return GroupOutcome::Succeeded {
                        group: task.group,
                        output,
                    }
                }
                Err(PipelineError::GroupTimeout { .. }) => return GroupOutcome::TimedOut { task },
                Err(e) if e.is_transient() && attempt < self.settings.max_group_attempts => {
                    self.performance.increment(metrics::GROUPS_RETRIED, 1);
                    let delay = backoff.next_backoff().unwrap_or(self.initial_interval());
                    warn!(
                        index_type = %self.index_type,
                        task = task.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Group failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => return GroupOutcome::Failed { task, error: e },
                Err(e) => {
                    error!(index_type = %self.index_type, task = task.id, error = %e, "Group aborted the run");
                    return GroupOutcome::Abort(e);
                }
            }
        }
    }

    fn record_output(&self, output: &StageOutput) {
        let perf = &self.performance;
        perf.increment(metrics::GROUPS_SUCCEEDED, 1);
        perf.increment(metrics::ENTITIES_LOADED, output.entities_loaded);
        perf.increment(metrics::ENTITIES_MISSING, output.entities_missing);
        perf.increment(metrics::DOCUMENTS_TRANSLATED, output.documents_translated);
        perf.increment(metrics::DOCUMENTS_ADDED, output.documents_added);
        perf.increment(metrics::ADD_DOCUMENTS_CALLS, output.add_document_calls);
        perf.increment(metrics::DOCUMENTS_DELETED, output.documents_deleted);
    }

    async fn commit(&self, report: &mut BuildReport) -> Result<(), PipelineError> {
        self.transition(BuildState::Committing);
        let engine = &self.collaborators.engine;
        let _guard = self.locks.lock(self.index_type).await;
        let _timer = self.performance.start_timer(metrics::COMMIT);
        self.retry("commit", || engine.commit(self.index_type)).await?;
        self.performance.increment(metrics::COMMITS, 1);
        report.commits += 1;
        debug!(index_type = %self.index_type, commits = report.commits, "Committed");
        Ok(())
    }

    async fn optimize(&self, report: &mut BuildReport) -> Result<(), PipelineError> {
        self.transition(BuildState::Optimizing);
        let engine = &self.collaborators.engine;
        let _guard = self.locks.lock(self.index_type).await;
        let _timer = self.performance.start_timer(metrics::OPTIMIZE);
        self.retry("optimize", || engine.optimize(self.index_type)).await?;
        self.performance.increment(metrics::OPTIMIZATIONS, 1);
        report.optimized = true;
        info!(index_type = %self.index_type, "Optimized index");
        Ok(())
    }

    fn cancelled(&self) -> PipelineError {
        PipelineError::Cancelled {
            index_type: self.index_type,
        }
    }

    fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.settings.retry_initial_interval_ms)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval())
            .with_max_elapsed_time(None)
            .build()
    }

    /// Retry a collaborator call on transient errors, up to
    /// `max_group_attempts` attempts.
    async fn retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.max_group_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.initial_interval());
                    warn!(
                        index_type = %self.index_type,
                        operation,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
