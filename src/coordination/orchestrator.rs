use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use super::context::RunContext;
use super::fanout::{PhaseResult, TaskOutcome};
use super::gatherer::{GatherStrategy, SourceGatherer};
use super::publisher::{OutputPublisher, PublishTarget};
use super::registry::{Layout, RESULT_CATEGORIES, Registry, TRANSFORM_JOB};
use super::task::TaskFactory;
use crate::config::{GatherPolicy, RunConfig, SourceMode};
use crate::error::{ExecutionError, FatalFailure, Phase, PipelineError, display_chain};
use crate::io::ObjectStore;
use crate::io::keys::join_key;
use crate::telemetry::{ProgressStats, Telemetry, TelemetryEvent};

/// Environment variable listing the gathered sources for the transform job
pub const SOURCES_ENV: &str = "INTEGRATION_SOURCES";

/// Where the integration results ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLocation {
    /// Results were not persisted and remain under this directory
    Local(PathBuf),
    /// Results were published under these remote prefixes
    Remote(Vec<String>),
}

/// Summary of a completed integration run
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub source_mode: SourceMode,
    pub gather_policy: GatherPolicy,
    pub refreshed: Vec<String>,
    pub refresh_failed: Vec<String>,
    pub refresh_published: Vec<String>,
    pub preserved_files: usize,
    pub gathered: Vec<String>,
    pub gather_failed: Vec<String>,
    pub published: Vec<String>,
    pub output: OutputLocation,
    pub stats: ProgressStats,
}

/// Runs the fixed integration pipeline: refresh, gather, transform, publish
pub struct Orchestrator {
    config: RunConfig,
    layout: Layout,
    registry: Registry,
    tasks: Arc<dyn TaskFactory>,
    store: Option<Arc<dyn ObjectStore>>,
    phase_timeout: Duration,
    telemetry: Telemetry,
}

impl Orchestrator {
    /// Create a new Orchestrator
    ///
    /// Fails when the configuration needs the remote store and none is given.
    pub fn new(
        config: RunConfig,
        layout: Layout,
        registry: Registry,
        tasks: Arc<dyn TaskFactory>,
        store: Option<Arc<dyn ObjectStore>>,
        phase_timeout: Duration,
        telemetry: Telemetry,
    ) -> Result<Self, PipelineError> {
        if config.needs_store() && store.is_none() {
            return Err(PipelineError::StoreUnavailable(config.source_mode));
        }

        Ok(Self {
            config,
            layout,
            registry,
            tasks,
            store,
            phase_timeout,
            telemetry,
        })
    }

    fn gatherer(&self) -> SourceGatherer {
        let strategy = match (&self.store, self.config.source_mode.is_remote()) {
            (Some(store), true) => GatherStrategy::Remote(Arc::clone(store)),
            _ => GatherStrategy::Local,
        };
        SourceGatherer::new(&self.registry, strategy, self.telemetry.clone())
    }

    fn publisher(&self) -> Option<OutputPublisher> {
        if !self.config.persist_remote {
            return None;
        }
        self.store
            .as_ref()
            .map(|store| OutputPublisher::new(Arc::clone(store), self.telemetry.clone()))
    }

    /// Run every phase in order, stopping at the first fatal one
    pub async fn run(&self, ctx: &RunContext) -> Result<IntegrationReport, PipelineError> {
        let start_time = Instant::now();
        let mut report = IntegrationReport {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            source_mode: self.config.source_mode,
            gather_policy: self.config.gather_policy,
            refreshed: Vec::new(),
            refresh_failed: Vec::new(),
            refresh_published: Vec::new(),
            preserved_files: 0,
            gathered: Vec::new(),
            gather_failed: Vec::new(),
            published: Vec::new(),
            output: OutputLocation::Local(self.layout.job_dir(TRANSFORM_JOB).join("out")),
            stats: ProgressStats::default(),
        };

        info!(
            run_id = %report.run_id,
            source = %self.config.source_mode,
            refresh = self.config.force_refresh,
            persist = self.config.persist_remote,
            "Starting integration run"
        );

        // 1. Refresh sources
        if self.config.force_refresh {
            self.refresh(ctx, &mut report).await?;
        }

        // 2. Gather source outputs
        let gathered = self
            .gatherer()
            .gather(self.config.gather_policy, &self.phase_context(ctx, Phase::Gather))
            .await?;
        report.gathered = gathered.succeeded();
        report.gather_failed = gathered.failed();

        // 3. Transform
        self.transform(ctx, &report.gathered).await?;

        // 4. Publish results
        if let Some(publisher) = self.publisher() {
            report.published = self.publish_results(&publisher, ctx).await?;
            report.output = OutputLocation::Remote(
                report
                    .published
                    .iter()
                    .map(|name| join_key(&publisher.location(), name))
                    .collect(),
            );
        } else {
            info!(dir = ?report.output, "results not persisted, output remains local");
        }

        report.duration = start_time.elapsed();
        info!(
            run_id = %report.run_id,
            gathered = report.gathered.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Integration run complete"
        );
        Ok(report)
    }

    fn phase_context(&self, ctx: &RunContext, phase: Phase) -> RunContext {
        info!("Starting {} phase", phase);
        ctx.with_timeout(self.phase_timeout)
    }

    async fn refresh(
        &self,
        ctx: &RunContext,
        report: &mut IntegrationReport,
    ) -> Result<(), FatalFailure> {
        let phase_ctx = self.phase_context(ctx, Phase::Refresh);

        if self.config.persist_remote {
            let term_scoped: Vec<_> = self.registry.term_scoped().into_iter().cloned().collect();
            report.preserved_files = self
                .gatherer()
                .preserve_prior(&term_scoped, &phase_ctx)
                .await;
        }

        let jobs = self
            .registry
            .refresh_order()
            .iter()
            .map(|job| (job.clone(), Vec::new()))
            .collect();
        let result = self.run_sequential(Phase::Refresh, jobs, &phase_ctx).await;

        report.refreshed = result.succeeded();
        report.refresh_failed = result.failed();
        if result.none_succeeded() {
            return Err(result.into_fatal(Phase::Refresh));
        }
        if let Some(partial) = result.partial_failure(Phase::Refresh) {
            warn!("{}", partial);
        }

        let Some(publisher) = self.publisher() else {
            return Ok(());
        };

        let targets: Vec<_> = report
            .refreshed
            .iter()
            .filter_map(|name| self.registry.source(name))
            .map(|source| PublishTarget::new(source.name.clone(), source.local_output_dir.clone()))
            .collect();
        let publish_ctx = self.phase_context(ctx, Phase::RefreshPublish);
        let published = publisher
            .publish_all(Phase::RefreshPublish, &targets, &publish_ctx)
            .await;

        report.refresh_published = published.succeeded();
        if published.none_succeeded() {
            return Err(published.into_fatal(Phase::RefreshPublish));
        }
        if let Some(partial) = published.partial_failure(Phase::RefreshPublish) {
            warn!("{}", partial);
        }
        Ok(())
    }

    async fn transform(&self, ctx: &RunContext, gathered: &[String]) -> Result<(), FatalFailure> {
        let phase_ctx = self.phase_context(ctx, Phase::Transform);
        let env = vec![(SOURCES_ENV.to_string(), gathered.join(","))];

        let result = self
            .run_sequential(
                Phase::Transform,
                vec![(TRANSFORM_JOB.to_string(), env)],
                &phase_ctx,
            )
            .await;

        if !result.is_complete() || result.none_succeeded() {
            return Err(result.into_fatal(Phase::Transform));
        }
        Ok(())
    }

    async fn publish_results(
        &self,
        publisher: &OutputPublisher,
        ctx: &RunContext,
    ) -> Result<Vec<String>, FatalFailure> {
        let phase_ctx = self.phase_context(ctx, Phase::Publish);
        let targets: Vec<_> = RESULT_CATEGORIES
            .iter()
            .map(|category| PublishTarget::new(*category, self.layout.result_dir(category)))
            .collect();

        let result = publisher
            .publish_all(Phase::Publish, &targets, &phase_ctx)
            .await;

        if !result.is_complete() {
            return Err(result.into_fatal(Phase::Publish));
        }
        Ok(result.succeeded())
    }

    /// Run jobs one after another, recording one outcome per job
    async fn run_sequential(
        &self,
        phase: Phase,
        jobs: Vec<(String, Vec<(String, String)>)>,
        ctx: &RunContext,
    ) -> PhaseResult<(), ExecutionError> {
        self.telemetry.emit(TelemetryEvent::PhaseStarted {
            phase,
            units: jobs.len(),
        });

        let mut outcomes = Vec::with_capacity(jobs.len());
        for (index, (job, env)) in jobs.into_iter().enumerate() {
            self.telemetry.emit(TelemetryEvent::UnitStarted {
                phase,
                name: job.clone(),
            });
            let task = self.tasks.create(&job, env);
            info!(job = %task.name(), "Running job");

            let started = Instant::now();
            let result = task.execute(ctx).await;

            match &result {
                Ok(()) => info!(job = %job, "Job succeeded"),
                Err(err) => warn!(job = %job, error = %display_chain(err), "Job failed"),
            }
            self.telemetry.emit(TelemetryEvent::UnitFinished {
                phase,
                name: job.clone(),
                ok: result.is_ok(),
                duration_ms: started.elapsed().as_millis() as u64,
            });

            outcomes.push(TaskOutcome {
                index,
                name: job,
                result,
            });
        }

        PhaseResult::from_outcomes(outcomes)
    }
}
