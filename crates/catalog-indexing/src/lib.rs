//! Index build pipeline for catalog search.
//!
//! This crate turns pending index notifications into search index updates:
//! it fetches notifications, groups the affected uids, loads and translates
//! entities, hands documents to the index engine and commits according to
//! a pluggable policy.
//!
//! ## Key Components
//!
//! - [`IndexBuildService`]: entry point; one orchestrator per run, shared write locks
//! - [`IndexBuildOrchestrator`]: drives one run through its [`BuildState`]s
//! - [`NotificationProcessor`] / [`NotificationBatch`]: retrieval and coalescing of notifications
//! - [`UidGroupingStage`]: partitions uids into bounded groups
//! - [`IndexingStage`]: one pipeline step (load, translate, add-document, delete)
//! - [`IndexBuildPolicy`]: commit / add-documents / optimize decisions
//! - [`PipelinePerformance`]: per-run counters and timers
//!
//! ## Architecture
//!
//! 1. Notifications for an index type are read (not removed) from the store
//! 2. They are coalesced: latest action per uid, newest DELETE_ALL or REBUILD wins
//! 3. Uids are grouped and queued for a bounded worker pool
//! 4. Each group runs load -> translate -> add-document (or delete), retried on transient errors
//! 5. Commits happen when the policy asks and at the end of the run
//! 6. Only notifications fully covered by committed work are removed
//!
//! ## Example
//!
//! ```ignore
//! use catalog_indexing::{Collaborators, IndexBuildService};
//!
//! let service = IndexBuildService::from_settings(collaborators, &settings)?;
//! let report = service.build_index(IndexType::Product).await?;
//! println!("{} documents added", report.documents_added);
//! ```

pub mod adapters;
pub mod collaborators;
pub mod error;
pub mod grouping;
pub mod locks;
pub mod orchestrator;
pub mod performance;
pub mod policy;
pub mod processor;
pub mod service;
pub mod stage;
pub mod stages;
pub mod translator;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use collaborators::{
    Collaborators, DocumentTranslator, EngineStats, EntityLoader, IndexEngine, NotificationStore,
    SearchIndexLocator,
};
pub use error::PipelineError;
pub use grouping::UidGroupingStage;
pub use locks::IndexWriteLocks;
pub use orchestrator::{BuildReport, BuildState, IndexBuildOrchestrator};
pub use performance::{metrics, PerformanceSnapshot, PipelinePerformance};
pub use policy::{
    IndexBuildPolicy, IndexBuildPolicyContext, IndexBuildPolicyContextFactory,
    ThresholdIndexBuildPolicy,
};
pub use processor::{NotificationBatch, NotificationProcessor, RelatedChange, UidAction};
pub use service::{IndexBuildService, OptimizeReport};
pub use stage::{GroupAction, GroupDispatcher, GroupTask, IndexingStage, StageOutput, UidGroup};
pub use stages::{upsert_chain, AddDocumentStage, DeleteStage, LoadStage, TranslateStage, UpsertChain};
pub use translator::FieldCopyTranslator;
