//! Index build policy: when to hand documents to the engine, when to
//! commit, when to optimize.
//!
//! Decisions are pure functions of an [`IndexBuildPolicyContext`]
//! snapshot. Contexts are values: recording work produces a new context
//! rather than mutating the old one.

use catalog_types::{IndexType, PolicySettings};

use crate::error::PipelineError;

/// Counter value meaning "no data".
pub const UNKNOWN: i64 = -1;

/// Snapshot of build progress fed to the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBuildPolicyContext {
    index_type: IndexType,
    operations_count: i64,
    documents_added: i64,
    full_rebuild: bool,
}

impl IndexBuildPolicyContext {
    /// Context with both counters at zero.
    pub fn new(index_type: IndexType) -> Self {
        Self {
            index_type,
            operations_count: 0,
            documents_added: 0,
            full_rebuild: false,
        }
    }

    /// Context carrying no data; every policy decision is false.
    pub fn unknown(index_type: IndexType) -> Self {
        Self {
            index_type,
            operations_count: UNKNOWN,
            documents_added: UNKNOWN,
            full_rebuild: false,
        }
    }

    /// Context with explicit counters. Values below -1 are rejected.
    pub fn with_counts(
        index_type: IndexType,
        operations_count: i64,
        documents_added: i64,
    ) -> Result<Self, PipelineError> {
        if operations_count < UNKNOWN || documents_added < UNKNOWN {
            return Err(PipelineError::InvalidArgument(format!(
                "policy counters must be >= -1 (operations={}, documents={})",
                operations_count, documents_added
            )));
        }
        Ok(Self {
            index_type,
            operations_count,
            documents_added,
            full_rebuild: false,
        })
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn operations_count(&self) -> i64 {
        self.operations_count
    }

    pub fn documents_added(&self) -> i64 {
        self.documents_added
    }

    pub fn is_full_rebuild(&self) -> bool {
        self.full_rebuild
    }

    /// Same counters, marked as belonging to a full rebuild.
    pub fn for_full_rebuild(self) -> Self {
        Self {
            full_rebuild: true,
            ..self
        }
    }

    /// New context with `operations` more index operations, `documents`
    /// of which were added documents. Unknown counters become known.
    pub fn record(self, operations: u64, documents: u64) -> Self {
        Self {
            operations_count: self.operations_count.max(0) + operations as i64,
            documents_added: self.documents_added.max(0) + documents as i64,
            ..self
        }
    }

    /// New context after a commit: counters back to zero.
    pub fn after_commit(self) -> Self {
        Self {
            operations_count: 0,
            documents_added: 0,
            ..self
        }
    }
}

/// Decides when the pipeline batches, commits and optimizes.
pub trait IndexBuildPolicy: Send + Sync {
    fn is_optimization_required(&self, context: &IndexBuildPolicyContext) -> bool;

    fn is_commit_required(&self, context: &IndexBuildPolicyContext) -> bool;

    fn is_add_documents_required(&self, context: &IndexBuildPolicyContext) -> bool;
}

/// Threshold-based default policy.
#[derive(Debug, Clone)]
pub struct ThresholdIndexBuildPolicy {
    commit_threshold: i64,
    add_documents_threshold: i64,
    optimize_threshold: i64,
}

impl ThresholdIndexBuildPolicy {
    pub fn new(commit_threshold: i64, add_documents_threshold: i64, optimize_threshold: i64) -> Self {
        Self {
            commit_threshold: commit_threshold.max(1),
            add_documents_threshold: add_documents_threshold.max(1),
            optimize_threshold: optimize_threshold.max(1),
        }
    }

    pub fn from_settings(settings: &PolicySettings) -> Self {
        Self::new(
            settings.commit_threshold,
            settings.add_documents_threshold,
            settings.optimize_threshold,
        )
    }
}

impl Default for ThresholdIndexBuildPolicy {
    fn default() -> Self {
        Self::from_settings(&PolicySettings::default())
    }
}

impl IndexBuildPolicy for ThresholdIndexBuildPolicy {
    fn is_optimization_required(&self, context: &IndexBuildPolicyContext) -> bool {
        if context.operations_count == UNKNOWN || context.documents_added == UNKNOWN {
            return false;
        }
        context.full_rebuild || context.operations_count >= self.optimize_threshold
    }

    fn is_commit_required(&self, context: &IndexBuildPolicyContext) -> bool {
        if context.operations_count == UNKNOWN || context.documents_added == UNKNOWN {
            return false;
        }
        context.operations_count >= self.commit_threshold
    }

    fn is_add_documents_required(&self, context: &IndexBuildPolicyContext) -> bool {
        if context.operations_count == UNKNOWN || context.documents_added == UNKNOWN {
            return false;
        }
        context.documents_added >= self.add_documents_threshold
    }
}

/// Creates fresh policy contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexBuildPolicyContextFactory;

impl IndexBuildPolicyContextFactory {
    pub fn create_index_build_policy_context(
        &self,
        index_type: IndexType,
    ) -> IndexBuildPolicyContext {
        IndexBuildPolicyContext::new(index_type)
    }
}
