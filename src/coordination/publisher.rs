//! Upload local output directories to the object store
//!
//! Each target directory is published under a prefix named after the target.
//! Per-file problems are logged and skipped; a target fails only when nothing
//! at all could be uploaded. Local copies are removed only after a successful
//! publish and only for the files that reached the store, so a failed one
//! leaves its directory untouched and skipped files stay for the next run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::context::RunContext;
use super::fanout::{self, PhaseResult, Unit};
use crate::error::{Phase, PublishError, display_chain};
use crate::io::ObjectStore;
use crate::io::keys::{content_type_for, join_key, validate_key};
use crate::io::local_fs;
use crate::telemetry::{Telemetry, TelemetryEvent};

/// A local directory published under the prefix `name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub name: String,
    pub local_dir: PathBuf,
}

impl PublishTarget {
    pub fn new(name: impl Into<String>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            local_dir: local_dir.into(),
        }
    }
}

#[derive(Debug, Default)]
struct Uploaded {
    files: Vec<PathBuf>,
    attempted: usize,
    bytes: u64,
}

pub struct OutputPublisher {
    store: Arc<dyn ObjectStore>,
    telemetry: Telemetry,
}

impl OutputPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, telemetry: Telemetry) -> Self {
        Self { store, telemetry }
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Upload every file directly under `target.local_dir` to `{target.name}/{file}`
    ///
    /// Returns the number of files uploaded.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn publish(
        &self,
        target: &PublishTarget,
        ctx: &RunContext,
    ) -> Result<usize, PublishError> {
        upload_dir(self.store.as_ref(), target, ctx)
            .await
            .map(|uploaded| uploaded.files.len())
    }

    /// Remove every regular file directly under `dir`, returning how many were removed
    ///
    /// Sub-directories stay and a missing directory removes nothing. Files
    /// that cannot be removed are logged and skipped.
    pub async fn clean_local(dir: &Path) -> std::io::Result<usize> {
        let result = local_fs::remove_files(dir).await?;
        for (path, err) in &result.failed {
            warn!(path = %path.display(), error = %err, "failed to remove published file");
        }
        debug!(dir = %dir.display(), removed = result.removed, "cleaned local directory");
        Ok(result.removed)
    }

    /// Publish every target concurrently, then remove the uploaded files of
    /// the ones that succeeded
    pub async fn publish_all(
        &self,
        phase: Phase,
        targets: &[PublishTarget],
        ctx: &RunContext,
    ) -> PhaseResult<usize, PublishError> {
        let units = targets
            .iter()
            .map(|target| {
                let target = target.clone();
                let store = Arc::clone(&self.store);
                let telemetry = self.telemetry.clone();
                let ctx = ctx.clone();
                Unit::new(target.name.clone(), async move {
                    let uploaded = upload_dir(store.as_ref(), &target, &ctx).await?;
                    telemetry.emit(TelemetryEvent::FilesTransferred {
                        phase,
                        name: target.name.clone(),
                        files: uploaded.files.len() as u64,
                        bytes: uploaded.bytes,
                    });
                    Ok::<_, PublishError>(uploaded)
                })
            })
            .collect();

        let result = fanout::run_all(phase, units, &self.telemetry).await;

        for (name, err) in &result.failures {
            warn!(target = %name, error = %display_chain(err), "failed to publish");
        }

        let mut published = PhaseResult {
            successes: Vec::with_capacity(result.successes.len()),
            failures: result.failures,
        };

        for (name, uploaded) in result.successes {
            info!(
                target = %name,
                files = uploaded.files.len(),
                location = %self.store.location(),
                "published"
            );
            if let Some(target) = targets.iter().find(|t| t.name == name) {
                Self::clean_published(target, &uploaded).await;
            }
            published.successes.push((name, uploaded.files.len()));
        }

        published
    }

    /// Remove what reached the store; skipped or failed files stay in place
    async fn clean_published(target: &PublishTarget, uploaded: &Uploaded) {
        if uploaded.files.len() == uploaded.attempted {
            if let Err(e) = Self::clean_local(&target.local_dir).await {
                warn!(
                    target = %target.name,
                    dir = %target.local_dir.display(),
                    error = %e,
                    "failed to clean published directory"
                );
            }
            return;
        }

        let result = local_fs::remove_paths(&uploaded.files).await;
        for (path, err) in &result.failed {
            warn!(path = %path.display(), error = %err, "failed to remove published file");
        }
        debug!(
            target = %target.name,
            removed = result.removed,
            kept = uploaded.attempted - uploaded.files.len(),
            "removed published files"
        );
    }
}

async fn upload_dir(
    store: &dyn ObjectStore,
    target: &PublishTarget,
    ctx: &RunContext,
) -> Result<Uploaded, PublishError> {
    let interrupted = |reason| PublishError::Interrupted {
        name: target.name.clone(),
        reason,
    };
    let nothing_uploaded = |attempted| PublishError::NothingUploaded {
        name: target.name.clone(),
        dir: target.local_dir.clone(),
        attempted,
    };

    let files = match ctx.run(local_fs::list_files(&target.local_dir)).await {
        Err(reason) => return Err(interrupted(reason)),
        Ok(Ok(Some(files))) => files,
        Ok(Ok(None)) => {
            warn!(target = %target.name, dir = %target.local_dir.display(), "directory does not exist");
            return Err(nothing_uploaded(0));
        }
        Ok(Err(e)) => {
            warn!(target = %target.name, dir = %target.local_dir.display(), error = %e, "failed to list directory");
            return Err(nothing_uploaded(0));
        }
    };

    let attempted = files.len();
    let mut uploaded = Uploaded {
        attempted,
        ..Uploaded::default()
    };

    for file in files {
        let Some(file_name) = file.file_name().and_then(|n| n.to_str()) else {
            warn!(file = %file.display(), "skipping file with non UTF-8 name");
            continue;
        };

        let body = match ctx.run(tokio::fs::read(&file)).await.map_err(interrupted)? {
            Ok(body) => body,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "failed to read file");
                continue;
            }
        };
        if body.is_empty() {
            warn!(file = %file.display(), "skipping empty file");
            continue;
        }

        let key = join_key(&target.name, file_name);
        if let Err(e) = validate_key(&key) {
            warn!(file = %file.display(), error = %e, "skipping file");
            continue;
        }

        let bytes = body.len() as u64;
        let put = store.put(&key, body, content_type_for(&file));
        match ctx.run(put).await.map_err(interrupted)? {
            Ok(()) => {
                debug!(key = %key, bytes, "uploaded");
                uploaded.files.push(file);
                uploaded.bytes += bytes;
            }
            Err(e) => warn!(file = %file.display(), error = %e, "failed to upload file"),
        }
    }

    if uploaded.files.is_empty() {
        return Err(nothing_uploaded(attempted));
    }
    if uploaded.files.len() < attempted {
        warn!(
            target = %target.name,
            uploaded = uploaded.files.len(),
            attempted,
            "published with skipped files"
        );
    }

    Ok(uploaded)
}
