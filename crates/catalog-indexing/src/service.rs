//! The exposed entry point for building and optimizing indices.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use catalog_types::{IndexType, PipelineSettings, Settings};

use crate::collaborators::Collaborators;
use crate::error::PipelineError;
use crate::locks::IndexWriteLocks;
use crate::orchestrator::{BuildReport, IndexBuildOrchestrator};
use crate::policy::{IndexBuildPolicy, IndexBuildPolicyContextFactory, ThresholdIndexBuildPolicy};
use crate::processor::NotificationProcessor;

/// Result of an optimize pass over every index type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizeReport {
    pub optimized: Vec<IndexType>,
    pub skipped: Vec<IndexType>,
}

/// Creates one orchestrator per build run and shares the index write
/// locks between them.
///
/// Builds of the same index type are serialized; different index types
/// run independently.
pub struct IndexBuildService {
    collaborators: Collaborators,
    policy: Arc<dyn IndexBuildPolicy>,
    settings: PipelineSettings,
    locks: IndexWriteLocks,
    runs: Arc<HashMap<IndexType, Arc<Mutex<()>>>>,
    optimize_exclusions: BTreeSet<IndexType>,
    contexts: IndexBuildPolicyContextFactory,
    cancel: CancellationToken,
}

impl IndexBuildService {
    pub fn new(
        collaborators: Collaborators,
        policy: Arc<dyn IndexBuildPolicy>,
        settings: PipelineSettings,
    ) -> Self {
        let runs = IndexType::ALL
            .iter()
            .map(|index_type| (*index_type, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            collaborators,
            policy,
            settings,
            locks: IndexWriteLocks::new(),
            runs: Arc::new(runs),
            optimize_exclusions: BTreeSet::new(),
            contexts: IndexBuildPolicyContextFactory,
            cancel: CancellationToken::new(),
        }
    }

    /// Service configured from loaded settings with the threshold policy.
    pub fn from_settings(
        collaborators: Collaborators,
        settings: &Settings,
    ) -> Result<Self, PipelineError> {
        settings.validate()?;
        let policy = Arc::new(ThresholdIndexBuildPolicy::from_settings(&settings.policy));
        Self::new(collaborators, policy, settings.pipeline.clone())
            .with_optimize_exclusions(settings.optimize_exclusions.as_slice())
    }

    /// Exclude index types (by name) from [`optimize_indices`](Self::optimize_indices).
    pub fn with_optimize_exclusions<S: AsRef<str>>(
        mut self,
        names: &[S],
    ) -> Result<Self, PipelineError> {
        for name in names {
            self.optimize_exclusions
                .insert(IndexType::from_name(name.as_ref())?);
        }
        Ok(self)
    }

    pub fn locks(&self) -> &IndexWriteLocks {
        &self.locks
    }

    pub fn policy_contexts(&self) -> &IndexBuildPolicyContextFactory {
        &self.contexts
    }

    /// Cancel running and future builds of this service.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn orchestrator(&self, index_type: IndexType) -> IndexBuildOrchestrator {
        IndexBuildOrchestrator::new(
            index_type,
            self.collaborators.clone(),
            self.policy.clone(),
            self.settings.clone(),
            self.locks.clone(),
        )
        .with_cancellation(self.cancel.child_token())
    }

    async fn run(&self, orchestrator: IndexBuildOrchestrator) -> Result<BuildReport, PipelineError> {
        let index_type = orchestrator.index_type();
        let _run = match self.runs.get(&index_type) {
            Some(lock) => Some(lock.clone().lock_owned().await),
            None => None,
        };
        orchestrator.run().await
    }

    /// Run a build of `index_type`: incremental from pending notifications,
    /// or a full rebuild when one is requested or the index is missing.
    pub async fn build_index(&self, index_type: IndexType) -> Result<BuildReport, PipelineError> {
        self.run(self.orchestrator(index_type)).await
    }

    /// Force a full rebuild of the index named `name`.
    pub async fn rebuild_index(&self, name: &str) -> Result<BuildReport, PipelineError> {
        let index_type = IndexType::from_name(name)?;
        info!(index_type = %index_type, "Rebuild requested");
        self.run(self.orchestrator(index_type).with_forced_rebuild())
            .await
    }

    /// Build every index type with pending work, one after the other.
    ///
    /// Every type is attempted; failures are returned alongside the reports.
    pub async fn build_all(&self) -> Vec<(IndexType, Result<BuildReport, PipelineError>)> {
        let mut results = Vec::new();
        for index_type in IndexType::ALL {
            match self.is_build_needed(index_type).await {
                Ok(false) => {
                    debug!(index_type = %index_type, "Nothing to build");
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    results.push((index_type, Err(e)));
                    continue;
                }
            }
            let result = self.build_index(index_type).await;
            if let Err(e) = &result {
                warn!(index_type = %index_type, error = %e, "Build failed");
            }
            results.push((index_type, result));
        }
        results
    }

    async fn is_build_needed(&self, index_type: IndexType) -> Result<bool, PipelineError> {
        let processor = NotificationProcessor::new(self.collaborators.notification_store.clone());
        if processor.pending_index_types().await?.contains(&index_type) {
            return Ok(true);
        }
        Ok(!self.collaborators.engine.index_exists(index_type).await?)
    }

    /// True when a REBUILD or DELETE_ALL is pending or the index does not
    /// exist yet.
    pub async fn is_rebuild_required(&self, index_type: IndexType) -> Result<bool, PipelineError> {
        let processor = NotificationProcessor::new(self.collaborators.notification_store.clone());
        if processor.is_rebuild_requested(index_type).await? {
            return Ok(true);
        }
        Ok(!self.collaborators.engine.index_exists(index_type).await?)
    }

    /// Optimize every index type the policy asks for, except excluded
    /// types and types waiting for a rebuild.
    pub async fn optimize_indices(&self) -> Result<OptimizeReport, PipelineError> {
        let engine = &self.collaborators.engine;
        let mut report = OptimizeReport::default();

        for index_type in IndexType::ALL {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.optimize_exclusions.contains(&index_type) || self.is_rebuild_required(index_type).await? {
                report.skipped.push(index_type);
                continue;
            }

            let stats = engine.stats(index_type).await?;
            let context = self
                .contexts
                .create_index_build_policy_context(index_type)
                .record(stats.deleted_docs, stats.num_docs);
            if !self.policy.is_optimization_required(&context) {
                report.skipped.push(index_type);
                continue;
            }

            let _guard = self.locks.lock(index_type).await;
            engine.optimize(index_type).await?;
            info!(index_type = %index_type, deleted_docs = stats.deleted_docs, "Optimized index");
            report.optimized.push(index_type);
        }

        Ok(report)
    }
}
