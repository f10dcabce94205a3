//! External job execution
//!
//! A [`Task`] is one named job run to completion under a [`RunContext`]. The
//! production implementation spawns `scripts/{job}/main.py` with the project
//! interpreter; tests substitute in-process tasks through [`TaskFactory`].

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::RunContext;
use super::registry::Layout;
use crate::error::ExecutionError;

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &RunContext) -> Result<(), ExecutionError>;
}

/// Builds the task for a job name with extra environment variables
pub trait TaskFactory: Send + Sync {
    fn create(&self, job: &str, env: Vec<(String, String)>) -> Box<dyn Task>;
}

/// Job run as a child process of the interpreter
#[derive(Debug, Clone)]
pub struct ProcessTask {
    job: String,
    job_dir: PathBuf,
    entry_point: PathBuf,
    interpreter: PathBuf,
    env: Vec<(String, String)>,
}

impl ProcessTask {
    pub fn new(
        layout: &Layout,
        job: &str,
        interpreter: impl Into<PathBuf>,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            job: job.to_string(),
            job_dir: layout.job_dir(job),
            entry_point: layout.entry_point(job),
            interpreter: interpreter.into(),
            env,
        }
    }
}

fn forward_lines<R>(job: String, stream: R, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(job = %job, "{}", line);
            } else {
                info!(job = %job, "{}", line);
            }
        }
    })
}

#[async_trait]
impl Task for ProcessTask {
    fn name(&self) -> &str {
        &self.job
    }

    async fn execute(&self, ctx: &RunContext) -> Result<(), ExecutionError> {
        if !tokio::fs::try_exists(&self.entry_point)
            .await
            .unwrap_or(false)
        {
            return Err(ExecutionError::NotFound {
                job: self.job.clone(),
                path: self.entry_point.clone(),
            });
        }
        if let Err(reason) = ctx.check() {
            return Err(ExecutionError::Interrupted {
                job: self.job.clone(),
                reason,
            });
        }

        debug!(
            job = %self.job,
            interpreter = %self.interpreter.display(),
            "spawning job"
        );

        let mut child = Command::new(&self.interpreter)
            .arg(&self.entry_point)
            .current_dir(&self.job_dir)
            .env("SCRAPER", &self.job)
            .env("PYTHONPATH", &self.job_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                job: self.job.clone(),
                source,
            })?;

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(self.job.clone(), stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(self.job.clone(), stderr, true));
        }

        let waited = ctx.run(child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(ExecutionError::Spawn {
                    job: self.job.clone(),
                    source,
                });
            }
            Err(reason) => {
                warn!(job = %self.job, %reason, "killing interrupted job");
                let _ = child.kill().await;
                for forwarder in forwarders {
                    forwarder.abort();
                }
                return Err(ExecutionError::Interrupted {
                    job: self.job.clone(),
                    reason,
                });
            }
        };

        // Background processes started by the job can keep its pipes open after exit
        let drained = ctx.run(join_all(forwarders.iter_mut())).await;
        if let Err(reason) = drained {
            warn!(job = %self.job, %reason, "job output still open after exit");
            for forwarder in &forwarders {
                forwarder.abort();
            }
            return Err(ExecutionError::Interrupted {
                job: self.job.clone(),
                reason,
            });
        }

        if status.success() {
            info!(job = %self.job, "job completed");
            Ok(())
        } else {
            Err(ExecutionError::NonZeroExit {
                job: self.job.clone(),
                code: status.code(),
            })
        }
    }
}

/// Creates [`ProcessTask`]s for the project layout
#[derive(Debug, Clone)]
pub struct ProcessTaskFactory {
    layout: Layout,
    interpreter: PathBuf,
}

impl ProcessTaskFactory {
    /// Uses the project virtualenv interpreter when present, `configured` otherwise
    pub fn new(layout: Layout, configured: &str) -> Self {
        let venv = layout.venv_interpreter();
        let interpreter = if venv.is_file() {
            venv
        } else {
            PathBuf::from(configured)
        };
        Self {
            layout,
            interpreter,
        }
    }

    pub fn interpreter(&self) -> &std::path::Path {
        &self.interpreter
    }
}

impl TaskFactory for ProcessTaskFactory {
    fn create(&self, job: &str, env: Vec<(String, String)>) -> Box<dyn Task> {
        Box::new(ProcessTask::new(
            &self.layout,
            job,
            self.interpreter.clone(),
            env,
        ))
    }
}
