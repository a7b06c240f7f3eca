//! Pipeline stage contract and the fan-out dispatcher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use catalog_types::{IndexType, Uid};

use crate::error::PipelineError;

/// A bounded set of uids processed as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidGroup {
    /// Position of the group within its grouping run (0-based)
    pub sequence: usize,
    pub uids: Vec<Uid>,
}

impl UidGroup {
    pub fn new(sequence: usize, uids: Vec<Uid>) -> Self {
        Self { sequence, uids }
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}

/// What a stage chain did with a batch. Summed across stages and groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub entities_loaded: u64,
    pub entities_missing: u64,
    pub documents_translated: u64,
    pub documents_added: u64,
    pub documents_deleted: u64,
    pub add_document_calls: u64,
}

impl StageOutput {
    pub fn merge(mut self, other: StageOutput) -> Self {
        self.entities_loaded += other.entities_loaded;
        self.entities_missing += other.entities_missing;
        self.documents_translated += other.documents_translated;
        self.documents_added += other.documents_added;
        self.documents_deleted += other.documents_deleted;
        self.add_document_calls += other.add_document_calls;
        self
    }

    /// Index operations issued: documents added plus documents deleted.
    pub fn index_operations(&self) -> u64 {
        self.documents_added + self.documents_deleted
    }
}

/// One step of the pipeline: consumes a batch and forwards its output
/// to the next stage.
#[async_trait]
pub trait IndexingStage<B: Send + 'static>: Send + Sync {
    async fn send(&self, batch: B) -> Result<StageOutput, PipelineError>;
}

#[async_trait]
impl<B, S> IndexingStage<B> for Arc<S>
where
    B: Send + 'static,
    S: IndexingStage<B> + ?Sized,
{
    async fn send(&self, batch: B) -> Result<StageOutput, PipelineError> {
        (**self).send(batch).await
    }
}

/// What the worker pool should do with a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    /// Load, translate and add documents
    Upsert,
    /// Delete documents
    Delete,
}

/// A group queued for the worker pool.
#[derive(Debug, Clone)]
pub struct GroupTask {
    /// Unique within a build run
    pub id: usize,
    pub index_type: IndexType,
    pub action: GroupAction,
    pub group: UidGroup,
}

/// Fan-out stage: forwards each group into a bounded channel drained by
/// the worker pool. Sending waits while the channel is full.
pub struct GroupDispatcher {
    index_type: IndexType,
    action: GroupAction,
    sender: mpsc::Sender<GroupTask>,
    task_ids: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl GroupDispatcher {
    pub fn new(
        index_type: IndexType,
        action: GroupAction,
        sender: mpsc::Sender<GroupTask>,
        task_ids: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index_type,
            action,
            sender,
            task_ids,
            cancel,
        }
    }
}

#[async_trait]
impl IndexingStage<UidGroup> for GroupDispatcher {
    async fn send(&self, group: UidGroup) -> Result<StageOutput, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                index_type: self.index_type,
            });
        }

        let task = GroupTask {
            id: self.task_ids.fetch_add(1, Ordering::SeqCst),
            index_type: self.index_type,
            action: self.action,
            group,
        };
        debug!(task = task.id, action = ?task.action, uids = task.group.len(), "Dispatching group");

        // Cancellation wins over a send that became possible at the same
        // time, and over the pool dropping its receiver after cancelling.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled { index_type: self.index_type }),
            result = self.sender.send(task) => match result {
                Ok(()) => Ok(StageOutput::default()),
                Err(_) if self.cancel.is_cancelled() => {
                    Err(PipelineError::Cancelled { index_type: self.index_type })
                }
                Err(_) => Err(PipelineError::IllegalState(
                    "worker pool stopped accepting groups".to_string(),
                )),
            },
        }
    }
}
