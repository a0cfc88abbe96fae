//! Partitioned execution of large transformation steps.
//!
//! A dataset above the batch threshold is split into `max_workers`
//! contiguous row ranges. Each range is transformed on the blocking pool,
//! gated by a semaphore owned by the pipeline instance, and the results are
//! concatenated back in partition order.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::pipeline::TransformationStep;
use crate::domain::Dataset;
use crate::error::PipelineError;

pub struct PartitionCoordinator {
    enabled: bool,
    max_workers: usize,
    batch_size: usize,
    workers: Arc<Semaphore>,
}

impl PartitionCoordinator {
    pub fn new(enabled: bool, max_workers: usize, batch_size: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            enabled,
            max_workers,
            batch_size,
            workers: Arc::new(Semaphore::new(max_workers)),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Partition only when enabled and strictly above the batch threshold
    pub fn should_partition(&self, rows: usize) -> bool {
        self.enabled && rows > self.batch_size
    }

    /// Apply `step` to every partition and merge the results in order.
    ///
    /// Any partition failure fails the whole step and discards all partial
    /// results. Cancellation is checked before fan-out and after fan-in.
    pub async fn run(
        &self,
        dataset: Dataset,
        step: &TransformationStep,
        cancel: &CancellationToken,
    ) -> Result<Dataset, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let started = Instant::now();
        let rows = dataset.row_count();
        let partitions = dataset.split(self.max_workers);
        let count = partitions.len();

        debug!(step = %step.name, rows, partitions = count, "Partitioning step");

        let mut tasks = JoinSet::new();
        for (index, partition) in partitions.into_iter().enumerate() {
            let function = step.function.clone();
            let params = step.params.clone();
            let workers = self.workers.clone();

            tasks.spawn(async move {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|e| anyhow::anyhow!("worker pool closed: {}", e))?;
                let output = tokio::task::spawn_blocking(move || function(partition, &params))
                    .await
                    .map_err(|e| anyhow::anyhow!("worker panicked: {}", e))??;
                Ok::<_, anyhow::Error>((index, output))
            });
        }

        let mut merged: Vec<Option<Dataset>> = vec![None; count];
        let mut first_error: Option<PipelineError> = None;

        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok((index, output))) => {
                    merged[index] = Some(output);
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(join_err) => format!("partition task failed: {}", join_err),
            };

            error!(step = %step.name, error = %failure, "Partition failed");
            if first_error.is_none() {
                first_error = Some(PipelineError::transformation(&step.name, failure));
                tasks.abort_all();
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let parts = merged
            .into_iter()
            .enumerate()
            .map(|(index, part)| {
                part.ok_or_else(|| {
                    PipelineError::transformation(
                        &step.name,
                        format!("partition {} produced no result", index),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = Dataset::concat(parts);
        debug!(
            step = %step.name,
            rows_in = rows,
            rows_out = output.row_count(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Partitions merged"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::Params;
    use serde_json::{json, Value};

    fn numbers(n: i64) -> Dataset {
        Dataset::from_rows(["n"], (0..n).map(|i| vec![json!(i)]).collect()).unwrap()
    }

    fn double(mut data: Dataset, _: &Params) -> anyhow::Result<Dataset> {
        data.map_column("n", |v| Ok(json!(v.as_i64().unwrap_or_default() * 2)))?;
        Ok(data)
    }

    #[test]
    fn test_threshold() {
        let coordinator = PartitionCoordinator::new(true, 4, 100);
        assert!(!coordinator.should_partition(100));
        assert!(coordinator.should_partition(101));
        assert!(!PartitionCoordinator::new(false, 4, 100).should_partition(1000));
    }

    #[tokio::test]
    async fn test_matches_sequential_output() {
        let coordinator = PartitionCoordinator::new(true, 4, 10);
        let step = TransformationStep::new("double", double);

        let parallel = coordinator
            .run(numbers(103), &step, &CancellationToken::new())
            .await
            .unwrap();
        let sequential = step.apply(numbers(103)).unwrap();

        assert_eq!(parallel, sequential);
    }

    #[tokio::test]
    async fn test_partition_failure_fails_step() {
        let coordinator = PartitionCoordinator::new(true, 4, 10);
        let step = TransformationStep::new("picky", |data: Dataset, _: &Params| {
            if data.rows().iter().any(|r| r[0] == Value::from(42)) {
                anyhow::bail!("cannot handle 42");
            }
            Ok(data)
        });

        let err = coordinator
            .run(numbers(100), &step, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transformation { ref step, .. } if step == "picky"));
        assert!(err.to_string().contains("cannot handle 42"));
    }

    #[tokio::test]
    async fn test_cancelled_before_fan_out() {
        let coordinator = PartitionCoordinator::new(true, 2, 1);
        let step = TransformationStep::new("double", double);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = coordinator.run(numbers(10), &step, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
