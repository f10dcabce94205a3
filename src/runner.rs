//! High-level runner API for the source integrator.
//!
//! This module wires configuration, the remote store, job execution and the
//! orchestrator together behind a couple of functions.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::{Context, Result};
use derive_builder::Builder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{DEFAULT_INTERPRETER, DEFAULT_PHASE_TIMEOUT, RunConfig, StoreSettings};
use crate::coordination::{Layout, Orchestrator, ProcessTaskFactory, Registry, TaskFactory};
use crate::io::{ObjectStore, S3ObjectStore};
use crate::telemetry::{Telemetry, spawn_collector};

pub use crate::config::{GatherPolicy, SourceMode};
pub use crate::coordination::{IntegrationReport, OutputLocation, RunContext};
pub use crate::telemetry::ProgressStats;

/// Arguments for an integration run or a single job
#[derive(Debug, Clone, Builder)]
pub struct RunArgs {
    /// Project root holding `scripts/` (and optionally `venv/`)
    #[builder(setter(into), default = "PathBuf::from(\".\")")]
    pub root: PathBuf,

    /// Deadline applied to each phase separately
    #[builder(default = "DEFAULT_PHASE_TIMEOUT")]
    pub phase_timeout: Duration,

    /// Interpreter used for jobs when the project has no virtualenv
    #[builder(setter(into), default = "DEFAULT_INTERPRETER.to_string()")]
    pub interpreter: String,

    /// Suppress progress bars
    #[builder(default)]
    pub quiet: bool,
}

/// Run the full integration pipeline
///
/// Configuration is resolved from `vars` (normally the process environment).
/// The S3 client is only created when the source mode is remote.
///
/// # Example
///
/// ```no_run
/// use source_integrator::runner::{RunArgsBuilder, RunContext, run_integration};
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = RunArgsBuilder::default().root("/srv/project").build()?;
/// let report = run_integration(args, std::env::vars(), &RunContext::new()).await?;
/// println!("Gathered {:?} in {:?}", report.gathered, report.duration);
/// # Ok(())
/// # }
/// ```
pub async fn run_integration<I>(
    args: RunArgs,
    vars: I,
    ctx: &RunContext,
) -> Result<IntegrationReport>
where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: Vec<(String, String)> = vars.into_iter().collect();
    let config =
        RunConfig::resolve(vars.iter().cloned()).context("Invalid integration configuration")?;
    let settings =
        StoreSettings::resolve(&config, vars).context("Invalid remote store configuration")?;

    let store: Option<Arc<dyn ObjectStore>> = match settings {
        Some(settings) => {
            let store = S3ObjectStore::connect(&settings).await;
            info!(location = %store.location(), "Using remote store");
            let store: Arc<dyn ObjectStore> = Arc::new(store);
            Some(store)
        }
        None => None,
    };

    let layout = Layout::new(&args.root);
    let registry = Registry::standard(&layout);
    let tasks = Arc::new(ProcessTaskFactory::new(layout.clone(), &args.interpreter));

    run_pipeline(config, layout, registry, tasks, store, &args, ctx).await
}

/// Run the pipeline with explicit collaborators, collecting telemetry into the report
pub(crate) async fn run_pipeline(
    config: RunConfig,
    layout: Layout,
    registry: Registry,
    tasks: Arc<dyn TaskFactory>,
    store: Option<Arc<dyn ObjectStore>>,
    args: &RunArgs,
    ctx: &RunContext,
) -> Result<IntegrationReport> {
    let (telemetry, rx) = Telemetry::channel();
    let collector = spawn_collector(rx, !args.quiet);

    let result = match Orchestrator::new(
        config,
        layout,
        registry,
        tasks,
        store,
        args.phase_timeout,
        telemetry,
    ) {
        Ok(orchestrator) => orchestrator.run(ctx).await,
        Err(e) => Err(e),
    };

    // The orchestrator owned the last sender, so the collector is finishing
    let stats = collector.await.context("Telemetry collector failed")?;

    let mut report = result.context("Integration run failed")?;
    report.stats = stats;
    Ok(report)
}

/// Run a single collection job to completion
pub async fn run_job(args: &RunArgs, job: &str, ctx: &RunContext) -> Result<()> {
    let factory = ProcessTaskFactory::new(Layout::new(&args.root), &args.interpreter);
    info!(job, interpreter = %factory.interpreter().display(), "Running job");

    factory
        .create(job, Vec::new())
        .execute(ctx)
        .await
        .with_context(|| format!("Job '{}' failed", job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_run_args_defaults() {
        let args = RunArgsBuilder::default().build().unwrap();
        assert_eq!(args.root, PathBuf::from("."));
        assert_eq!(args.phase_timeout, DEFAULT_PHASE_TIMEOUT);
        assert_eq!(args.interpreter, DEFAULT_INTERPRETER);
        assert!(!args.quiet);
    }

    #[tokio::test]
    async fn test_invalid_configuration_fails_before_work() {
        let dir = TempDir::new().unwrap();
        let args = RunArgsBuilder::default()
            .root(dir.path())
            .quiet(true)
            .build()
            .unwrap();

        let err = run_integration(
            args,
            vars(&[("INTEGRATION_SOURCE", "staging")]),
            &RunContext::new(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("Invalid integration configuration"));
        assert!(format!("{:#}", err).contains("staging"));
        // Nothing was created under the root
        assert!(!dir.path().join("scripts").exists());
    }

    #[tokio::test]
    async fn test_remote_mode_requires_storage_uri() {
        let dir = TempDir::new().unwrap();
        let args = RunArgsBuilder::default()
            .root(dir.path())
            .quiet(true)
            .build()
            .unwrap();

        let err = run_integration(
            args,
            vars(&[("INTEGRATION_SOURCE", "prod")]),
            &RunContext::new(),
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", err).contains("STORAGE_URI"));
    }

    #[tokio::test]
    async fn test_run_job_missing_entry_point() {
        let dir = TempDir::new().unwrap();
        let args = RunArgsBuilder::default()
            .root(dir.path())
            .build()
            .unwrap();

        let err = run_job(&args, "grades", &RunContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Job 'grades' failed"));
        assert!(format!("{:#}", err).contains("main.py"));
    }
}
