//! Partitions a uid set into bounded groups.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use catalog_types::Uid;

use crate::error::PipelineError;
use crate::performance::{metrics, PipelinePerformance};
use crate::stage::{IndexingStage, StageOutput, UidGroup};

/// Splits uids into consecutive groups of at most `group_size` and sends
/// each group, in order, to the next stage.
///
/// Downstream errors are returned unchanged; the remaining groups are not
/// sent.
pub struct UidGroupingStage<N> {
    group_size: usize,
    next: Option<N>,
    performance: Arc<PipelinePerformance>,
}

impl<N> UidGroupingStage<N>
where
    N: IndexingStage<UidGroup>,
{
    /// Fails with `InvalidArgument` when `group_size` is zero.
    pub fn new(group_size: usize) -> Result<Self, PipelineError> {
        if group_size == 0 {
            return Err(PipelineError::InvalidArgument(
                "group size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            group_size,
            next: None,
            performance: PipelinePerformance::new(),
        })
    }

    /// Same as [`new`](Self::new) for signed sizes; rejects `<= 0`.
    pub fn from_signed(group_size: i64) -> Result<Self, PipelineError> {
        if group_size <= 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "group size must be greater than zero, got {}",
                group_size
            )));
        }
        let size = usize::try_from(group_size)
            .map_err(|e| PipelineError::InvalidArgument(e.to_string()))?;
        Self::new(size)
    }

    pub fn with_next(mut self, next: N) -> Self {
        self.next = Some(next);
        self
    }

    pub fn with_performance(mut self, performance: Arc<PipelinePerformance>) -> Self {
        self.performance = performance;
        self
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn performance(&self) -> &Arc<PipelinePerformance> {
        &self.performance
    }

    /// Partition `uids` without sending. Duplicates keep their first
    /// position.
    pub fn partition(&self, uids: impl IntoIterator<Item = Uid>) -> Vec<UidGroup> {
        let mut seen = HashSet::new();
        let unique: Vec<Uid> = uids.into_iter().filter(|uid| seen.insert(*uid)).collect();

        unique
            .chunks(self.group_size)
            .enumerate()
            .map(|(sequence, chunk)| UidGroup::new(sequence, chunk.to_vec()))
            .collect()
    }

    /// Partition `uids` and send every group downstream, one at a time.
    ///
    /// Fails with `IllegalState` before sending anything if no next stage
    /// has been set.
    pub async fn run(
        &self,
        uids: impl IntoIterator<Item = Uid>,
    ) -> Result<StageOutput, PipelineError> {
        let next = self.next.as_ref().ok_or_else(|| {
            PipelineError::IllegalState("grouping stage has no next stage".to_string())
        })?;

        let _timer = self.performance.start_timer(metrics::GROUPING);
        let groups = self.partition(uids);
        let total_uids: usize = groups.iter().map(UidGroup::len).sum();
        self.performance
            .increment(metrics::GROUPING_GROUPS, groups.len() as u64);
        self.performance
            .increment(metrics::GROUPING_UIDS, total_uids as u64);
        debug!(groups = groups.len(), uids = total_uids, group_size = self.group_size, "Grouped uids");

        let mut output = StageOutput::default();
        for group in groups {
            output = output.merge(next.send(group).await?);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingStage;

    fn stage(group_size: usize) -> (UidGroupingStage<Arc<RecordingStage>>, Arc<RecordingStage>) {
        let recorder = Arc::new(RecordingStage::new());
        let stage = UidGroupingStage::new(group_size)
            .unwrap()
            .with_next(recorder.clone());
        (stage, recorder)
    }

    #[tokio::test]
    async fn test_groups_of_three() {
        let (stage, recorder) = stage(3);
        stage.run(vec![1, 2, 3, 4]).await.unwrap();

        assert_eq!(recorder.uid_groups(), vec![vec![1, 2, 3], vec![4]]);
    }

    #[tokio::test]
    async fn test_group_size_one_gives_singletons() {
        let (stage, recorder) = stage(1);
        stage.run(vec![5, 6, 7]).await.unwrap();
        assert_eq!(recorder.uid_groups(), vec![vec![5], vec![6], vec![7]]);
    }

    #[tokio::test]
    async fn test_large_group_size_gives_one_group() {
        let (stage, recorder) = stage(100);
        stage.run(vec![5, 6, 7]).await.unwrap();
        assert_eq!(recorder.uid_groups(), vec![vec![5, 6, 7]]);
    }

    #[tokio::test]
    async fn test_partition_covers_input_once() {
        let (stage, _) = stage(4);
        let groups = stage.partition((1..=10).chain([3, 4]));

        let mut all: Vec<Uid> = groups.iter().flat_map(|g| g.uids.clone()).collect();
        assert!(groups.iter().all(|g| g.len() <= 4));
        all.sort_unstable();
        assert_eq!(all, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_input_sends_nothing() {
        let (stage, recorder) = stage(3);
        stage.run(Vec::new()).await.unwrap();
        assert!(recorder.uid_groups().is_empty());
        assert_eq!(stage.performance().counter(metrics::GROUPING_GROUPS), 0);
    }

    #[test]
    fn test_zero_group_size_rejected() {
        assert!(matches!(
            UidGroupingStage::<RecordingStage>::new(0),
            Err(PipelineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_negative_group_size_rejected() {
        assert!(matches!(
            UidGroupingStage::<RecordingStage>::from_signed(-1),
            Err(PipelineError::InvalidArgument(_))
        ));
        assert!(matches!(
            UidGroupingStage::<RecordingStage>::from_signed(0),
            Err(PipelineError::InvalidArgument(_))
        ));
        assert!(UidGroupingStage::<RecordingStage>::from_signed(2).is_ok());
    }

    #[tokio::test]
    async fn test_missing_next_stage_is_illegal_state() {
        let stage = UidGroupingStage::<RecordingStage>::new(2).unwrap();
        let result = stage.run(vec![1, 2, 3]).await;
        assert!(matches!(result, Err(PipelineError::IllegalState(_))));
        assert_eq!(stage.performance().counter(metrics::GROUPING_GROUPS), 0);
    }

    #[tokio::test]
    async fn test_downstream_error_propagates_and_metrics_recorded() {
        let recorder = Arc::new(RecordingStage::failing_on(1, PipelineError::Fatal("disk".into())));
        let stage = UidGroupingStage::new(2)
            .unwrap()
            .with_next(recorder.clone());

        let result = stage.run(vec![1, 2, 3, 4, 5]).await;
        assert!(matches!(result, Err(PipelineError::Fatal(msg)) if msg == "disk"));

        // Group 0 went through, group 1 failed, group 2 was never sent
        assert_eq!(recorder.uid_groups(), vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(stage.performance().counter(metrics::GROUPING_GROUPS), 3);
        assert_eq!(stage.performance().counter(metrics::GROUPING_UIDS), 5);
    }
}
