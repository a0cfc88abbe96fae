//! Main orchestrator for pipeline execution.
//!
//! Runs the five phases (extract, validate input, transform, validate
//! output, load) on a single flow of control, applying the error policy to
//! every source, step and sink, and owns the instance's status, cache,
//! checkpoints and worker pool.
//!
//! A run that never reaches its terminal bookkeeping (its future was dropped
//! or it panicked) is settled by [`RunGuard`], so the instance can run again.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::ConnectorRegistry;
use crate::domain::{
    Dataset, ErrorScope, EventType, PipelineEvent, PipelineMetrics, PipelineStatus,
};
use crate::error::PipelineError;

use super::cache::ExtractionCache;
use super::checkpoint::CheckpointStore;
use super::event_store::EventStore;
use super::partition::PartitionCoordinator;
use super::pipeline::{PipelineConfig, SinkDescriptor, SourceDescriptor, TransformationStep};
use super::policy::{ErrorPolicy, UnitFailure};
use super::validation::{Stage, ValidationRuleSet};

/// A built pipeline, ready to run
pub struct Orchestrator {
    pub(super) config: PipelineConfig,
    pub(super) sources: Vec<SourceDescriptor>,
    pub(super) steps: Vec<TransformationStep>,
    pub(super) sinks: Vec<SinkDescriptor>,
    pub(super) rules: ValidationRuleSet,
    pub(super) connectors: ConnectorRegistry,
    pub(super) cache: Option<ExtractionCache>,
    pub(super) checkpoints: CheckpointStore,
    pub(super) partitions: PartitionCoordinator,
    pub(super) policy: ErrorPolicy,

    /// Directory holding one event log per run
    pub(super) runs_dir: Option<PathBuf>,

    pub(super) status: Arc<watch::Sender<PipelineStatus>>,
    pub(super) cancel: CancellationToken,
    pub(super) last_metrics: Arc<Mutex<Option<PipelineMetrics>>>,
}

/// Observes status and requests cancellation while a run borrows the orchestrator
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    status: watch::Receiver<PipelineStatus>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    pub fn status(&self) -> PipelineStatus {
        *self.status.borrow()
    }

    /// Request cancellation of the current (or next) run
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the orchestrator reports `status`
    pub async fn wait_for(&mut self, status: PipelineStatus) -> Result<(), PipelineError> {
        self.status
            .wait_for(|s| *s == status)
            .await
            .map(|_| ())
            .map_err(|_| PipelineError::Fatal(anyhow::anyhow!("orchestrator dropped")))
    }
}

/// State owned by one run
struct RunContext {
    metrics: PipelineMetrics,
    events: Option<EventStore>,
}

impl RunContext {
    fn event(&self, unit: Option<&str>, event_type: EventType, summary: String) -> PipelineEvent {
        PipelineEvent::new(
            self.metrics.run_id,
            unit.map(str::to_string),
            event_type,
            summary,
        )
    }

    async fn emit(&self, event: PipelineEvent) {
        record_event(self.events.as_ref(), event).await;
    }
}

/// Settles an abandoned run when dropped while still armed
struct RunGuard {
    run_id: Uuid,
    pipeline: String,
    status: Arc<watch::Sender<PipelineStatus>>,
    last_metrics: Arc<Mutex<Option<PipelineMetrics>>>,
    armed: bool,
}

impl RunGuard {
    fn new(orchestrator: &Orchestrator, run_id: Uuid) -> Self {
        Self {
            run_id,
            pipeline: orchestrator.config.name.clone(),
            status: orchestrator.status.clone(),
            last_metrics: orchestrator.last_metrics.clone(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let (status, reason) = if std::thread::panicking() {
            (PipelineStatus::Failed, "run panicked before completion")
        } else {
            (PipelineStatus::Cancelled, "run abandoned before completion")
        };
        warn!(run_id = %self.run_id, pipeline = %self.pipeline, %status, "{}", reason);

        let mut metrics = PipelineMetrics::new(self.run_id, &self.pipeline);
        metrics.record_error(ErrorScope::Pipeline, reason);
        metrics.finish(status);
        *self
            .last_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics);
        self.status.send_replace(status);
    }
}

/// Event-log failures never fail a run
async fn record_event(log: Option<&EventStore>, event: PipelineEvent) {
    let Some(log) = log else {
        return;
    };
    if let Err(e) = log.append(&event).await {
        warn!(error = %e, event = ?event.event_type, "Failed to write run event");
    }
}

impl Orchestrator {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[TransformationStep] {
        &self.steps
    }

    pub fn sinks(&self) -> &[SinkDescriptor] {
        &self.sinks
    }

    pub fn rules(&self) -> &ValidationRuleSet {
        &self.rules
    }

    pub fn status(&self) -> PipelineStatus {
        *self.status.borrow()
    }

    /// Metrics of the most recent terminated run
    pub fn last_metrics(&self) -> Option<PipelineMetrics> {
        self.last_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            status: self.status.subscribe(),
            cancel: self.cancel.clone(),
        }
    }

    /// Hold the pipeline; runs are rejected until [`Orchestrator::resume`]
    pub fn pause(&mut self) -> Result<(), PipelineError> {
        self.transition(PipelineStatus::Paused)?;
        info!(pipeline = %self.config.name, "Pipeline paused");
        Ok(())
    }

    /// Release a paused pipeline back to Idle
    pub fn resume(&mut self) -> Result<(), PipelineError> {
        self.transition(PipelineStatus::Idle)?;
        info!(pipeline = %self.config.name, "Pipeline resumed");
        Ok(())
    }

    fn transition(&self, next: PipelineStatus) -> Result<(), PipelineError> {
        let current = self.status();
        if !current.can_transition_to(next) {
            return Err(PipelineError::InvalidState {
                name: self.config.name.clone(),
                status: current,
            });
        }
        self.status.send_replace(next);
        Ok(())
    }

    /// Execute all five phases
    #[instrument(skip(self), fields(pipeline = %self.config.name))]
    pub async fn run(&mut self) -> Result<PipelineMetrics, PipelineError> {
        let (mut ctx, guard) = self.begin_run().await?;
        let outcome = self.execute(&mut ctx).await;
        let result = self.finish_run(ctx, outcome).await;
        guard.disarm();
        result
    }

    /// Re-run the transform phase from `step` using its pre-step checkpoint,
    /// then validate and load as usual
    #[instrument(skip(self), fields(pipeline = %self.config.name))]
    pub async fn resume_from_checkpoint(
        &mut self,
        step: &str,
    ) -> Result<PipelineMetrics, PipelineError> {
        let index = self
            .steps
            .iter()
            .position(|s| s.name == step)
            .ok_or_else(|| PipelineError::CheckpointNotFound(step.to_string()))?;
        let dataset = self.restore_checkpoint(step).await?;

        let (mut ctx, guard) = self.begin_run().await?;
        ctx.metrics.records_processed = dataset.row_count();
        info!(%step, rows = dataset.row_count(), "Resuming from checkpoint");
        ctx.emit(ctx.event(
            Some(step),
            EventType::CheckpointRestored,
            format!("Resumed from checkpoint of step '{}'", step),
        ))
        .await;

        let outcome = self.execute_from(&mut ctx, dataset, index).await;
        let result = self.finish_run(ctx, outcome).await;
        guard.disarm();
        result
    }

    /// Dataset a step consumed on its last execution
    pub async fn restore_checkpoint(&self, step: &str) -> Result<Dataset, PipelineError> {
        self.checkpoints
            .restore(step)
            .await?
            .map(|snapshot| snapshot.dataset)
            .ok_or_else(|| PipelineError::CheckpointNotFound(step.to_string()))
    }

    async fn begin_run(&mut self) -> Result<(RunContext, RunGuard), PipelineError> {
        match self.status() {
            PipelineStatus::Running => {
                return Err(PipelineError::AlreadyRunning(self.config.name.clone()))
            }
            status if !status.can_start() => {
                return Err(PipelineError::InvalidState {
                    name: self.config.name.clone(),
                    status,
                })
            }
            _ => {}
        }

        let run_id = Uuid::new_v4();
        let metrics = PipelineMetrics::new(run_id, &self.config.name);
        let events = self.open_event_log(run_id).await;

        self.status.send_replace(PipelineStatus::Running);
        let guard = RunGuard::new(self, run_id);
        info!(%run_id, "Starting pipeline run");

        let ctx = RunContext { metrics, events };
        ctx.emit(ctx.event(
            None,
            EventType::RunStarted,
            format!("Pipeline '{}' started", self.config.name),
        ))
        .await;
        Ok((ctx, guard))
    }

    async fn open_event_log(&self, run_id: Uuid) -> Option<EventStore> {
        if !self.config.monitoring_enabled {
            return None;
        }
        let runs_dir = self.runs_dir.as_ref()?;

        match EventStore::open_run(runs_dir, run_id).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(%run_id, error = %e, "Failed to open run event log, continuing without it");
                None
            }
        }
    }

    async fn finish_run(
        &mut self,
        mut ctx: RunContext,
        outcome: Result<(), PipelineError>,
    ) -> Result<PipelineMetrics, PipelineError> {
        let (status, event_type) = match &outcome {
            Ok(()) => (PipelineStatus::Completed, EventType::RunCompleted),
            Err(PipelineError::Cancelled) => (PipelineStatus::Cancelled, EventType::RunCancelled),
            Err(_) => (PipelineStatus::Failed, EventType::RunFailed),
        };

        if let Err(e) = &outcome {
            if !e.is_unit_failure() && !matches!(e, PipelineError::Cancelled) {
                ctx.metrics.record_error(ErrorScope::Pipeline, e.to_string());
            }
        }

        ctx.metrics.finish(status);
        let metrics = ctx.metrics.clone();

        let mut event = ctx
            .event(None, event_type, format!("Pipeline '{}' {}", self.config.name, status))
            .with_duration((metrics.processing_time_secs * 1000.0) as u64);
        if let Err(e) = &outcome {
            event = event.with_error(e.to_string());
        }
        ctx.emit(event).await;

        if let Some(log) = &ctx.events {
            if let Err(e) = log.write_summary(&metrics).await {
                warn!(error = %e, "Failed to write run summary");
            }
        }

        match &outcome {
            Ok(()) => info!(
                run_id = %metrics.run_id,
                records = metrics.records_processed,
                steps = metrics.steps_completed.len(),
                sinks = metrics.sinks_loaded.len(),
                errors = metrics.errors.len(),
                quality = metrics.data_quality_score,
                duration_secs = metrics.processing_time_secs,
                "Pipeline run completed"
            ),
            Err(PipelineError::Cancelled) => {
                warn!(run_id = %metrics.run_id, "Pipeline run cancelled")
            }
            Err(e) => error!(run_id = %metrics.run_id, error = %e, "Pipeline run failed"),
        }

        // A consumed cancellation must not leak into the next run
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        *self
            .last_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics.clone());
        self.status.send_replace(status);

        outcome.map(|()| metrics)
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let data = self.extract(ctx).await?;
        self.check_cancelled()?;
        self.validate(ctx, &data, Stage::Input).await?;
        self.execute_from(ctx, data, 0).await
    }

    async fn execute_from(
        &self,
        ctx: &mut RunContext,
        data: Dataset,
        from: usize,
    ) -> Result<(), PipelineError> {
        self.check_cancelled()?;
        let data = self.transform(ctx, data, from).await?;
        self.check_cancelled()?;
        self.validate(ctx, &data, Stage::Output).await?;
        self.check_cancelled()?;
        self.load(ctx, &data).await
    }

    /// Record a unit's final failure and decide whether the run continues
    async fn unit_failed(
        &self,
        ctx: &mut RunContext,
        scope: ErrorScope,
        unit: &str,
        event_type: EventType,
        failure: UnitFailure,
    ) -> Result<(), PipelineError> {
        if matches!(failure.error, PipelineError::Cancelled) {
            return Err(PipelineError::Cancelled);
        }

        let message = failure.error.to_string();
        error!(
            %scope,
            attempts = failure.attempts,
            mode = %self.policy.mode(),
            error = %message,
            "Unit failed"
        );
        ctx.metrics.record_error(scope, message.clone());
        ctx.emit(
            ctx.event(
                Some(unit),
                event_type,
                format!("'{}' failed after {} attempt(s)", unit, failure.attempts),
            )
            .with_error(message),
        )
        .await;

        if self.policy.aborts_on_failure() {
            return Err(failure.error);
        }
        Ok(())
    }

    async fn extract(&self, ctx: &mut RunContext) -> Result<Dataset, PipelineError> {
        let mut parts = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            self.check_cancelled()?;

            if let Some(cache) = &self.cache {
                if let Some(data) = cache.get(source).await {
                    debug!(source = %source.name, rows = data.row_count(), "Cache hit");
                    ctx.emit(ctx.event(
                        Some(&source.name),
                        EventType::CacheHit,
                        format!("Source '{}' served from cache", source.name),
                    ))
                    .await;
                    parts.push(data);
                    continue;
                }
            }

            let started = Instant::now();
            let run_id = ctx.metrics.run_id;
            let log = ctx.events.as_ref();
            let result = self
                .policy
                .execute(&source.name, move |attempt| async move {
                    if attempt > 1 {
                        record_event(log, retry_event(run_id, &source.name, attempt)).await;
                    }
                    self.read_source(source).await
                })
                .await;

            match result {
                Ok(data) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(source = %source.name, rows = data.row_count(), duration_ms, "Source extracted");
                    if let Some(cache) = &self.cache {
                        cache.put(source, &data).await;
                    }
                    ctx.emit(
                        ctx.event(
                            Some(&source.name),
                            EventType::SourceExtracted,
                            format!("Extracted {} rows from '{}'", data.row_count(), source.name),
                        )
                        .with_duration(duration_ms),
                    )
                    .await;
                    parts.push(data);
                }
                Err(failure) => {
                    self.unit_failed(
                        ctx,
                        ErrorScope::Source(source.name.clone()),
                        &source.name,
                        EventType::SourceSkipped,
                        failure,
                    )
                    .await?
                }
            }
        }

        let data = Dataset::concat(parts);
        ctx.metrics.records_processed = data.row_count();
        Ok(data)
    }

    async fn read_source(&self, source: &SourceDescriptor) -> Result<Dataset, PipelineError> {
        let extraction_error = |message: String| PipelineError::Extraction {
            source_name: source.name.clone(),
            message,
        };

        let connector = self
            .connectors
            .source(source.format)
            .ok_or_else(|| extraction_error(format!("no connector for format '{}'", source.format)))?;

        connector
            .extract(source)
            .await
            .map_err(|e| extraction_error(format!("{:#}", e)))
    }

    async fn validate(
        &self,
        ctx: &mut RunContext,
        data: &Dataset,
        stage: Stage,
    ) -> Result<(), PipelineError> {
        if !self.config.validation_enabled {
            return Ok(());
        }

        let report = self.rules.evaluate(data, stage);
        ctx.metrics.apply_quality_score(report.score);
        if stage == Stage::Output {
            ctx.metrics.records_failed = report.affected_records();
        }
        for issue in report.issues.iter().filter(|i| i.errored) {
            ctx.metrics.record_error(
                ErrorScope::Validation(stage),
                format!("Rule '{}' errored: {}", issue.rule, issue.message),
            );
        }
        ctx.metrics.quality_issues.extend(report.issues.iter().cloned());

        info!(
            %stage,
            rules = report.rules_evaluated,
            issues = report.issues.len(),
            score = report.score,
            "Validation evaluated"
        );
        ctx.emit(ctx.event(
            None,
            EventType::ValidationEvaluated,
            format!(
                "{} validation: {} rule(s), {} issue(s), score {}",
                stage,
                report.rules_evaluated,
                report.issues.len(),
                report.score
            ),
        ))
        .await;

        if let Some(issue) = report.critical_failure() {
            let err = PipelineError::CriticalValidation {
                stage,
                rule: issue.rule.clone(),
                message: issue.message.clone(),
            };
            ctx.metrics
                .record_error(ErrorScope::Validation(stage), err.to_string());
            return Err(err);
        }
        Ok(())
    }

    async fn transform(
        &self,
        ctx: &mut RunContext,
        mut data: Dataset,
        from: usize,
    ) -> Result<Dataset, PipelineError> {
        for step in self.steps.iter().skip(from) {
            self.check_cancelled()?;

            let started = Instant::now();
            let run_id = ctx.metrics.run_id;
            let log = ctx.events.as_ref();
            let input = &data;
            let result = self
                .policy
                .execute(&step.name, move |attempt| async move {
                    if attempt > 1 {
                        record_event(log, retry_event(run_id, &step.name, attempt)).await;
                    }
                    self.run_step(step, input).await
                })
                .await;

            match result {
                Ok(output) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(
                        step = %step.name,
                        rows_in = data.row_count(),
                        rows_out = output.row_count(),
                        duration_ms,
                        "Step completed"
                    );
                    ctx.emit(
                        ctx.event(
                            Some(&step.name),
                            EventType::StepCompleted,
                            format!("Step '{}' produced {} rows", step.name, output.row_count()),
                        )
                        .with_duration(duration_ms),
                    )
                    .await;
                    ctx.metrics.steps_completed.push(step.name.clone());
                    data = output;
                }
                Err(failure) => {
                    self.unit_failed(
                        ctx,
                        ErrorScope::Step(step.name.clone()),
                        &step.name,
                        EventType::StepSkipped,
                        failure,
                    )
                    .await?
                }
            }
        }

        Ok(data)
    }

    /// One attempt of a step: checkpoint, validate input, apply, validate output
    async fn run_step(
        &self,
        step: &TransformationStep,
        input: &Dataset,
    ) -> Result<Dataset, PipelineError> {
        if self.config.checkpoint_enabled {
            self.checkpoints
                .save(&step.name, input)
                .await
                .map_err(|e| PipelineError::transformation(&step.name, format!("{:#}", e)))?;
        }

        if let Some(validator) = &step.input_validator {
            if !validator(input) {
                return Err(PipelineError::transformation(&step.name, "input validator rejected dataset"));
            }
        }

        let output = if self.partitions.should_partition(input.row_count()) {
            self.partitions.run(input.clone(), step, &self.cancel).await?
        } else {
            let owned = step.clone();
            let data = input.clone();
            tokio::task::spawn_blocking(move || owned.apply(data))
                .await
                .map_err(|e| PipelineError::transformation(&step.name, format!("step panicked: {}", e)))?
                .map_err(|e| PipelineError::transformation(&step.name, format!("{:#}", e)))?
        };

        if let Some(validator) = &step.output_validator {
            if !validator(&output) {
                return Err(PipelineError::transformation(&step.name, "output validator rejected result"));
            }
        }

        Ok(output)
    }

    async fn load(&self, ctx: &mut RunContext, data: &Dataset) -> Result<(), PipelineError> {
        for sink in &self.sinks {
            self.check_cancelled()?;

            let started = Instant::now();
            let run_id = ctx.metrics.run_id;
            let log = ctx.events.as_ref();
            let result = self
                .policy
                .execute(&sink.name, move |attempt| async move {
                    if attempt > 1 {
                        record_event(log, retry_event(run_id, &sink.name, attempt)).await;
                    }
                    self.deliver(sink, data).await
                })
                .await;

            match result {
                Ok(()) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(sink = %sink.name, rows = data.row_count(), duration_ms, "Sink loaded");
                    ctx.emit(
                        ctx.event(
                            Some(&sink.name),
                            EventType::SinkLoaded,
                            format!("Delivered {} rows to '{}'", data.row_count(), sink.name),
                        )
                        .with_duration(duration_ms),
                    )
                    .await;
                    ctx.metrics.sinks_loaded.push(sink.name.clone());
                }
                Err(failure) => {
                    self.unit_failed(
                        ctx,
                        ErrorScope::Sink(sink.name.clone()),
                        &sink.name,
                        EventType::SinkFailed,
                        failure,
                    )
                    .await?
                }
            }
        }

        Ok(())
    }

    async fn deliver(&self, sink: &SinkDescriptor, data: &Dataset) -> Result<(), PipelineError> {
        let load_error = |message: String| PipelineError::Load {
            sink: sink.name.clone(),
            message,
        };

        let connector = self
            .connectors
            .sink(sink.kind)
            .ok_or_else(|| load_error(format!("no connector for sink kind '{}'", sink.kind)))?;

        connector
            .load(data, sink)
            .await
            .map_err(|e| load_error(format!("{:#}", e)))
    }
}

fn retry_event(run_id: Uuid, unit: &str, attempt: u32) -> PipelineEvent {
    PipelineEvent::new(
        run_id,
        Some(unit.to_string()),
        EventType::UnitRetrying,
        format!("'{}' attempt {}", unit, attempt),
    )
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("sources", &self.sources)
            .field("steps", &self.steps)
            .field("sinks", &self.sinks)
            .field("connectors", &self.connectors)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
