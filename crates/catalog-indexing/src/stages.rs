//! Concrete pipeline stages: load -> translate -> add-document, and delete.
//!
//! Stages report what they did through [`StageOutput`] instead of writing
//! counters directly, so a retried group is counted once, by the caller,
//! after it succeeds. Timers are recorded on every attempt.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use catalog_types::{EntityRecord, IndexDocument, IndexType};

use crate::collaborators::{DocumentTranslator, EntityLoader, IndexEngine};
use crate::error::PipelineError;
use crate::performance::{metrics, PipelinePerformance};
use crate::policy::{IndexBuildPolicy, IndexBuildPolicyContextFactory};
use crate::stage::{IndexingStage, StageOutput, UidGroup};

/// Loads the entities of a group and forwards them.
pub struct LoadStage<N> {
    index_type: IndexType,
    loader: Arc<dyn EntityLoader>,
    performance: Arc<PipelinePerformance>,
    next: N,
}

impl<N> LoadStage<N> {
    pub fn new(
        index_type: IndexType,
        loader: Arc<dyn EntityLoader>,
        performance: Arc<PipelinePerformance>,
        next: N,
    ) -> Self {
        Self {
            index_type,
            loader,
            performance,
            next,
        }
    }
}

#[async_trait]
impl<N> IndexingStage<UidGroup> for LoadStage<N>
where
    N: IndexingStage<Vec<EntityRecord>>,
{
    async fn send(&self, group: UidGroup) -> Result<StageOutput, PipelineError> {
        let entities = {
            let _timer = self.performance.start_timer(metrics::LOAD);
            self.loader.load_entities(self.index_type, &group.uids).await?
        };

        let loaded = entities.len() as u64;
        let missing = (group.len() as u64).saturating_sub(loaded);
        if missing > 0 {
            debug!(group = group.sequence, missing, "Entities no longer exist; skipped");
        }

        let output = StageOutput {
            entities_loaded: loaded,
            entities_missing: missing,
            ..Default::default()
        };
        Ok(output.merge(self.next.send(entities).await?))
    }
}

/// Translates entities into documents and forwards them.
pub struct TranslateStage<N> {
    translator: Arc<dyn DocumentTranslator>,
    performance: Arc<PipelinePerformance>,
    next: N,
}

impl<N> TranslateStage<N> {
    pub fn new(
        translator: Arc<dyn DocumentTranslator>,
        performance: Arc<PipelinePerformance>,
        next: N,
    ) -> Self {
        Self {
            translator,
            performance,
            next,
        }
    }
}

#[async_trait]
impl<N> IndexingStage<Vec<EntityRecord>> for TranslateStage<N>
where
    N: IndexingStage<Vec<IndexDocument>>,
{
    async fn send(&self, entities: Vec<EntityRecord>) -> Result<StageOutput, PipelineError> {
        let documents = {
            let _timer = self.performance.start_timer(metrics::TRANSLATE);
            entities
                .iter()
                .map(|entity| self.translator.to_document(entity))
                .collect::<Result<Vec<_>, _>>()?
        };

        let output = StageOutput {
            documents_translated: documents.len() as u64,
            ..Default::default()
        };
        Ok(output.merge(self.next.send(documents).await?))
    }
}

/// Hands documents to the engine whenever the policy asks for it, and
/// the remainder at the end of each group.
pub struct AddDocumentStage {
    index_type: IndexType,
    engine: Arc<dyn IndexEngine>,
    policy: Arc<dyn IndexBuildPolicy>,
    contexts: IndexBuildPolicyContextFactory,
    performance: Arc<PipelinePerformance>,
}

impl AddDocumentStage {
    pub fn new(
        index_type: IndexType,
        engine: Arc<dyn IndexEngine>,
        policy: Arc<dyn IndexBuildPolicy>,
        performance: Arc<PipelinePerformance>,
    ) -> Self {
        Self {
            index_type,
            engine,
            policy,
            contexts: IndexBuildPolicyContextFactory,
            performance,
        }
    }

    async fn flush(
        &self,
        buffer: &mut Vec<IndexDocument>,
        output: &mut StageOutput,
    ) -> Result<(), PipelineError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let _timer = self.performance.start_timer(metrics::ADD_DOCUMENTS);
        let added = self.engine.add_documents(self.index_type, buffer).await?;
        output.documents_added += added as u64;
        output.add_document_calls += 1;
        buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl IndexingStage<Vec<IndexDocument>> for AddDocumentStage {
    async fn send(&self, documents: Vec<IndexDocument>) -> Result<StageOutput, PipelineError> {
        let mut output = StageOutput::default();
        let mut buffer = Vec::new();
        let empty = self.contexts.create_index_build_policy_context(self.index_type);

        for document in documents {
            buffer.push(document);
            let context = empty.record(buffer.len() as u64, buffer.len() as u64);
            if self.policy.is_add_documents_required(&context) {
                self.flush(&mut buffer, &mut output).await?;
            }
        }
        self.flush(&mut buffer, &mut output).await?;

        Ok(output)
    }
}

/// Deletes the documents of a group.
pub struct DeleteStage {
    index_type: IndexType,
    engine: Arc<dyn IndexEngine>,
    performance: Arc<PipelinePerformance>,
}

impl DeleteStage {
    pub fn new(
        index_type: IndexType,
        engine: Arc<dyn IndexEngine>,
        performance: Arc<PipelinePerformance>,
    ) -> Self {
        Self {
            index_type,
            engine,
            performance,
        }
    }
}

#[async_trait]
impl IndexingStage<UidGroup> for DeleteStage {
    async fn send(&self, group: UidGroup) -> Result<StageOutput, PipelineError> {
        let _timer = self.performance.start_timer(metrics::DELETE);
        let deleted = self.engine.delete(self.index_type, &group.uids).await?;
        Ok(StageOutput {
            documents_deleted: deleted as u64,
            ..Default::default()
        })
    }
}

/// The load -> translate -> add-document chain.
pub type UpsertChain = LoadStage<TranslateStage<AddDocumentStage>>;

/// Wire the upsert chain for one index type.
pub fn upsert_chain(
    index_type: IndexType,
    loader: Arc<dyn EntityLoader>,
    translator: Arc<dyn DocumentTranslator>,
    engine: Arc<dyn IndexEngine>,
    policy: Arc<dyn IndexBuildPolicy>,
    performance: Arc<PipelinePerformance>,
) -> UpsertChain {
    let add = AddDocumentStage::new(index_type, engine, policy, performance.clone());
    let translate = TranslateStage::new(translator, performance.clone(), add);
    LoadStage::new(index_type, loader, performance, translate)
}
