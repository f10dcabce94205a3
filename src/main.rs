use anyhow::Context;
use clap::{Parser, Subcommand};
use source_integrator::runner::{
    IntegrationReport, OutputLocation, RunArgs, RunArgsBuilder, RunContext, run_integration,
    run_job,
};
use std::path::PathBuf;

#[derive(Parser, Clone)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Refresh (optional), gather, transform and publish (optional) source data
    Integrate {
        /// Project root containing scripts/
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Per-phase timeout (e.g., 90s, 30m, 2h; plain numbers are seconds)
        #[arg(long, default_value = "30m")]
        phase_timeout: String,

        /// Interpreter for jobs when the root has no venv/
        #[arg(long, default_value = "python3")]
        interpreter: String,

        /// Write the run report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },

    /// Run a single collection job
    RunJob {
        /// Job name (directory under scripts/)
        job: String,

        /// Project root containing scripts/
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Interpreter for the job when the root has no venv/
        #[arg(long, default_value = "python3")]
        interpreter: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // A missing .env file is fine; the process environment still applies
    let _ = dotenvy::dotenv();

    let ctx = RunContext::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cancelling running jobs...");
            interrupt.cancel();
        }
    });

    match args.command {
        Command::Integrate {
            root,
            phase_timeout,
            interpreter,
            report,
            quiet,
        } => {
            init_tracing(quiet);
            let phase_timeout = cli::parse_duration_string(&phase_timeout).map_err(|e| {
                anyhow::anyhow!("Invalid phase timeout '{}': {}", phase_timeout, e)
            })?;
            let run_args = RunArgsBuilder::default()
                .root(root)
                .phase_timeout(phase_timeout)
                .interpreter(interpreter)
                .quiet(quiet)
                .build()?;
            integrate(run_args, report, &ctx).await?;
        }
        Command::RunJob {
            job,
            root,
            interpreter,
        } => {
            init_tracing(false);
            let run_args = RunArgsBuilder::default()
                .root(root)
                .interpreter(interpreter)
                .build()?;
            run_job(&run_args, &job, &ctx).await?;
            println!("Job '{}' completed", job);
        }
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if quiet {
        EnvFilter::new("source_integrator=warn")
    } else {
        EnvFilter::new("source_integrator=info")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn integrate(
    run_args: RunArgs,
    report_path: Option<PathBuf>,
    ctx: &RunContext,
) -> anyhow::Result<()> {
    let quiet = run_args.quiet;
    if !quiet {
        println!("Source Integrator");
        println!("=================");
        println!("Root: {}", run_args.root.display());
        println!("Phase timeout: {:?}", run_args.phase_timeout);
        println!();
    }

    let report = run_integration(run_args, std::env::vars(), ctx).await?;

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    print_summary(&report);
    Ok(())
}

fn print_summary(report: &IntegrationReport) {
    println!();
    println!("Integration Summary");
    println!("===================");
    println!("Run ID: {}", report.run_id);
    println!("Source mode: {}", report.source_mode);
    if !report.refreshed.is_empty() || !report.refresh_failed.is_empty() {
        println!("Refreshed: {}", cli::names(&report.refreshed));
        if !report.refresh_failed.is_empty() {
            println!("Refresh failed: {}", cli::names(&report.refresh_failed));
        }
    }
    println!("Gathered: {}", cli::names(&report.gathered));
    if !report.gather_failed.is_empty() {
        println!("Gather failed: {}", cli::names(&report.gather_failed));
    }
    println!("Files transferred: {}", report.stats.files_transferred);
    match &report.output {
        OutputLocation::Local(dir) => println!("Output (local): {}", dir.display()),
        OutputLocation::Remote(prefixes) => {
            println!("Output (published):");
            for prefix in prefixes {
                println!("  {}", prefix);
            }
        }
    }
    println!("Duration: {:.2}s", report.duration.as_secs_f64());

    if let (Some(p50), Some(p90), Some(p99)) = report.stats.get_percentiles() {
        println!("Unit latency: p50={}ms p90={}ms p99={}ms", p50, p90, p99);
    }
}

/// CLI utility functions for parsing command-line arguments
mod cli {
    use std::time::Duration;

    /// Parse human-readable durations like "90s", "30m", "2h"
    pub fn parse_duration_string(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim().to_lowercase();

        let (number_part, unit_part) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(pos) => s.split_at(pos),
            // No unit, assume seconds
            None => (s.as_str(), "s"),
        };

        let number: u64 = number_part
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid duration number '{}': {}", number_part, e))?;

        let multiplier = match unit_part.trim() {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid duration unit '{}'. Valid units: s, m, h",
                    unit_part
                ));
            }
        };

        if number == 0 {
            return Err(anyhow::anyhow!("Duration must be greater than zero"));
        }

        let secs = number
            .checked_mul(multiplier)
            .ok_or_else(|| anyhow::anyhow!("Duration '{}' is too large", s))?;
        Ok(Duration::from_secs(secs))
    }

    pub fn names(names: &[String]) -> String {
        if names.is_empty() {
            "(none)".to_string()
        } else {
            names.join(", ")
        }
    }

}
