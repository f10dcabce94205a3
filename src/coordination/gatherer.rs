//! Collect every source's output into the shared input directory
//!
//! Local mode copies each source's `out/` files; remote mode mirrors the
//! source's prefix from the object store. Sources are gathered concurrently,
//! one unit per source, and downloads within a source share a bounded pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::context::RunContext;
use super::fanout::{self, PhaseResult, Unit};
use super::registry::{Registry, SourceJob};
use crate::config::{GatherPolicy, REMOTE_FETCH_CONCURRENCY};
use crate::error::{
    FatalFailure, GatherError, Interrupted, Phase, StoreError, WorkerPanic, display_chain,
};
use crate::io::ObjectStore;
use crate::io::keys::{folder_prefix, is_directory_marker, mirror_path};
use crate::io::local_fs;
use crate::telemetry::{Telemetry, TelemetryEvent};

/// Where source data is read from
#[derive(Clone)]
pub enum GatherStrategy {
    /// Copy from each source's local output directory
    Local,
    /// Download each source's prefix from the object store
    Remote(Arc<dyn ObjectStore>),
}

impl std::fmt::Debug for GatherStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatherStrategy::Local => f.write_str("Local"),
            GatherStrategy::Remote(store) => write!(f, "Remote({})", store.location()),
        }
    }
}

/// Files and bytes written by one source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gathered {
    pub files: usize,
    pub bytes: u64,
}

pub struct SourceGatherer {
    sources: Vec<SourceJob>,
    shared_input_root: Option<PathBuf>,
    strategy: GatherStrategy,
    telemetry: Telemetry,
}

impl SourceGatherer {
    pub fn new(registry: &Registry, strategy: GatherStrategy, telemetry: Telemetry) -> Self {
        let shared_input_root = registry
            .sources()
            .first()
            .and_then(|s| s.shared_input_dir.parent())
            .map(Path::to_path_buf);

        Self {
            sources: registry.sources().to_vec(),
            shared_input_root,
            strategy,
            telemetry,
        }
    }

    /// Create the shared input root and one directory per source
    ///
    /// Failures are logged; a source whose directory cannot be created fails
    /// on its own when gathered.
    pub async fn prepare_directories(&self) {
        if let Some(root) = &self.shared_input_root
            && let Err(e) = tokio::fs::create_dir_all(root).await
        {
            warn!(path = %root.display(), error = %e, "failed to create shared input root");
        }
        for source in &self.sources {
            if let Err(e) = tokio::fs::create_dir_all(&source.shared_input_dir).await {
                warn!(
                    source = %source.name,
                    path = %source.shared_input_dir.display(),
                    error = %e,
                    "failed to create shared input directory"
                );
            }
        }
    }

    /// Gather every source concurrently and apply `policy`
    ///
    /// `Strict` fails when any source fails. `Partial` fails only when no
    /// source succeeded; other failures are logged and the successful sources
    /// are returned. Dispatching zero sources is always fatal.
    pub async fn gather(
        &self,
        policy: GatherPolicy,
        ctx: &RunContext,
    ) -> Result<PhaseResult<Gathered, GatherError>, FatalFailure> {
        self.prepare_directories().await;

        let units = self
            .sources
            .iter()
            .map(|source| {
                let source = source.clone();
                let strategy = self.strategy.clone();
                let ctx = ctx.clone();
                let telemetry = self.telemetry.clone();
                Unit::new(source.name.clone(), async move {
                    let gathered = match strategy {
                        GatherStrategy::Local => copy_local(&source, &ctx).await?,
                        GatherStrategy::Remote(store) => {
                            download_source(&store, &source, &ctx).await?
                        }
                    };
                    telemetry.emit(TelemetryEvent::FilesTransferred {
                        phase: Phase::Gather,
                        name: source.name.clone(),
                        files: gathered.files as u64,
                        bytes: gathered.bytes,
                    });
                    Ok::<_, GatherError>(gathered)
                })
            })
            .collect();

        let result = fanout::run_all(Phase::Gather, units, &self.telemetry).await;

        for (name, err) in &result.failures {
            warn!(source = %name, error = %display_chain(err), "failed to gather source");
        }
        for (name, gathered) in &result.successes {
            info!(source = %name, files = gathered.files, "gathered source");
        }

        let fatal = result.none_succeeded()
            || (policy == GatherPolicy::Strict && !result.is_complete());
        if fatal {
            return Err(result.into_fatal(Phase::Gather));
        }
        if let Some(partial) = result.partial_failure(Phase::Gather) {
            warn!("{}", partial);
        }

        Ok(result)
    }

    /// Restore previously published output of `sources` into their local
    /// output directories, so a refresh only adds to it
    ///
    /// Best effort: failures are logged and never stop the run. Returns the
    /// number of files restored.
    pub async fn preserve_prior(&self, sources: &[SourceJob], ctx: &RunContext) -> usize {
        let GatherStrategy::Remote(store) = &self.strategy else {
            debug!("no remote store, nothing to preserve");
            return 0;
        };

        let mut restored = 0;
        for source in sources {
            let prefix = folder_prefix(&source.name);
            match download_prefix(
                store,
                &source.name,
                &prefix,
                &source.local_output_dir,
                ctx,
            )
            .await
            {
                Ok(download) => {
                    if download.gathered.files == 0 && download.errors.is_empty() {
                        info!(source = %source.name, "no prior output to preserve");
                    }
                    for err in &download.errors {
                        warn!(
                            source = %source.name,
                            error = %display_chain(err),
                            "failed to preserve prior object"
                        );
                    }
                    restored += download.gathered.files;
                }
                Err(err) => {
                    warn!(
                        source = %source.name,
                        error = %display_chain(&err),
                        "failed to preserve prior output"
                    );
                }
            }
        }

        info!(files = restored, "preserved prior output");
        restored
    }
}

fn interrupted(source: &SourceJob, reason: Interrupted) -> GatherError {
    GatherError::Interrupted {
        source_name: source.name.clone(),
        reason,
    }
}

async fn copy_local(source: &SourceJob, ctx: &RunContext) -> Result<Gathered, GatherError> {
    let dir = &source.local_output_dir;
    let files = ctx
        .run(local_fs::list_files(dir))
        .await
        .map_err(|reason| interrupted(source, reason))?
        .map_err(|e| GatherError::Io {
            source_name: source.name.clone(),
            operation: "list directory",
            path: dir.clone(),
            source: e,
        })?
        .ok_or_else(|| GatherError::MissingDirectory {
            source_name: source.name.clone(),
            path: dir.clone(),
        })?;

    if files.is_empty() {
        return Err(GatherError::EmptyDirectory {
            source_name: source.name.clone(),
            path: dir.clone(),
        });
    }

    let mut gathered = Gathered::default();
    for file in files {
        let Some(file_name) = file.file_name() else {
            continue;
        };
        let dest = source.shared_input_dir.join(file_name);
        let bytes = ctx
            .run(local_fs::copy_atomic(&file, &dest))
            .await
            .map_err(|reason| interrupted(source, reason))?
            .map_err(|e| GatherError::Io {
                source_name: source.name.clone(),
                operation: "copy file",
                path: file.clone(),
                source: e,
            })?;

        debug!(source = %source.name, file = %dest.display(), bytes, "copied file");
        gathered.files += 1;
        gathered.bytes += bytes;
    }

    Ok(gathered)
}

async fn download_source(
    store: &Arc<dyn ObjectStore>,
    source: &SourceJob,
    ctx: &RunContext,
) -> Result<Gathered, GatherError> {
    let prefix = folder_prefix(&source.name);
    let download =
        download_prefix(store, &source.name, &prefix, &source.shared_input_dir, ctx).await?;

    if let Some(first) = download.errors.into_iter().next() {
        return Err(first);
    }
    if download.gathered.files == 0 {
        return Err(GatherError::EmptyPrefix {
            source_name: source.name.clone(),
            prefix,
        });
    }
    Ok(download.gathered)
}

/// Result of mirroring one prefix: what was written plus per-object errors
#[derive(Debug, Default)]
struct Download {
    gathered: Gathered,
    errors: Vec<GatherError>,
}

impl Download {
    fn record(
        &mut self,
        joined: Result<Result<u64, GatherError>, tokio::task::JoinError>,
        source_name: &str,
    ) {
        match joined {
            Ok(Ok(bytes)) => {
                self.gathered.files += 1;
                self.gathered.bytes += bytes;
            }
            Ok(Err(err)) => self.errors.push(err),
            Err(join_error) => self.errors.push(GatherError::Panicked(WorkerPanic {
                name: source_name.to_string(),
                message: join_error.to_string(),
            })),
        }
    }
}

/// Mirror every object under `prefix` into `dest`, keeping nested key paths
///
/// Directory markers are skipped. At most [`REMOTE_FETCH_CONCURRENCY`]
/// objects are fetched at once. Only a failed listing is returned as `Err`.
async fn download_prefix(
    store: &Arc<dyn ObjectStore>,
    source_name: &str,
    prefix: &str,
    dest: &Path,
    ctx: &RunContext,
) -> Result<Download, GatherError> {
    let keys = ctx
        .run(store.list(prefix))
        .await
        .map_err(|reason| GatherError::Interrupted {
            source_name: source_name.to_string(),
            reason,
        })?
        .map_err(|source| GatherError::Store {
            source_name: source_name.to_string(),
            source,
        })?;
    debug!(source = %source_name, prefix, objects = keys.len(), "listed remote objects");

    let mut download = Download::default();
    let mut join_set = JoinSet::new();

    for key in keys {
        if is_directory_marker(&key) {
            continue;
        }
        let Some(path) = mirror_path(dest, prefix, &key) else {
            download.errors.push(GatherError::Store {
                source_name: source_name.to_string(),
                source: StoreError::InvalidKey {
                    key,
                    reason: "key does not map to a path below the destination".to_string(),
                },
            });
            continue;
        };

        while join_set.len() >= REMOTE_FETCH_CONCURRENCY {
            if let Some(joined) = join_set.join_next().await {
                download.record(joined, source_name);
            }
        }

        join_set.spawn(fetch_object(
            Arc::clone(store),
            source_name.to_string(),
            key,
            path,
            ctx.clone(),
        ));
    }

    while let Some(joined) = join_set.join_next().await {
        download.record(joined, source_name);
    }

    Ok(download)
}

async fn fetch_object(
    store: Arc<dyn ObjectStore>,
    source_name: String,
    key: String,
    path: PathBuf,
    ctx: RunContext,
) -> Result<u64, GatherError> {
    let interrupted = |reason| GatherError::Interrupted {
        source_name: source_name.clone(),
        reason,
    };

    let body = ctx
        .run(store.get(&key))
        .await
        .map_err(interrupted)?
        .map_err(|source| GatherError::Store {
            source_name: source_name.clone(),
            source,
        })?;

    let bytes = body.len() as u64;
    ctx.run(local_fs::write_atomic(&path, &body))
        .await
        .map_err(interrupted)?
        .map_err(|source| GatherError::Io {
            source_name: source_name.clone(),
            operation: "write object",
            path: path.clone(),
            source,
        })?;

    debug!(source = %source_name, key = %key, bytes, "downloaded object");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::registry::Layout;
    use crate::io::object_store::memory::MemoryObjectStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_outputs(layout: &Layout, source: &str, files: &[&str]) {
        let dir = layout.local_output_dir(source);
        std::fs::create_dir_all(&dir).unwrap();
        for file in files {
            std::fs::write(dir.join(file), format!("{} data", file)).unwrap();
        }
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn local_gatherer(layout: &Layout, names: &[&str]) -> SourceGatherer {
        let registry = Registry::new(layout, names);
        SourceGatherer::new(&registry, GatherStrategy::Local, Telemetry::disabled())
    }

    fn remote_gatherer(
        layout: &Layout,
        names: &[&str],
        store: &Arc<MemoryObjectStore>,
    ) -> SourceGatherer {
        let registry = Registry::new(layout, names);
        let store: Arc<dyn ObjectStore> = store.clone();
        SourceGatherer::new(&registry, GatherStrategy::Remote(store), Telemetry::disabled())
    }

    #[tokio::test]
    async fn test_local_gather_copies_every_source() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        for source in ["a", "b", "c"] {
            write_outputs(&layout, source, &["one.json", "two.json"]);
        }

        let result = local_gatherer(&layout, &["a", "b", "c"])
            .gather(GatherPolicy::Strict, &RunContext::new())
            .await
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(result.succeeded(), vec!["a", "b", "c"]);
        let total: usize = result.successes.iter().map(|(_, g)| g.files).sum();
        assert_eq!(total, 6);
        for source in ["a", "b", "c"] {
            assert_eq!(
                file_names(&layout.shared_input_dir(source)),
                vec!["one.json", "two.json"]
            );
        }
    }

    #[tokio::test]
    async fn test_strict_gather_fails_on_empty_source() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_outputs(&layout, "a", &["a.json"]);
        write_outputs(&layout, "b", &[]);
        write_outputs(&layout, "c", &["c.json"]);

        let fatal = local_gatherer(&layout, &["a", "b", "c"])
            .gather(GatherPolicy::Strict, &RunContext::new())
            .await
            .unwrap_err();

        assert_eq!(fatal.phase, Phase::Gather);
        assert_eq!(fatal.failed, vec!["b"]);
        assert!(fatal.to_string().contains("no files found"));
        // The healthy sources were still copied
        assert_eq!(file_names(&layout.shared_input_dir("a")), vec!["a.json"]);
        assert_eq!(file_names(&layout.shared_input_dir("c")), vec!["c.json"]);
    }

    #[tokio::test]
    async fn test_partial_gather_fails_only_without_successes() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_outputs(&layout, "a", &["a.json"]);
        write_outputs(&layout, "b", &[]);
        // "c" has no output directory at all

        let result = local_gatherer(&layout, &["a", "b", "c"])
            .gather(GatherPolicy::Partial, &RunContext::new())
            .await
            .unwrap();
        assert_eq!(result.succeeded(), vec!["a"]);
        assert!(matches!(
            result.failure("b"),
            Some(GatherError::EmptyDirectory { .. })
        ));
        assert!(matches!(
            result.failure("c"),
            Some(GatherError::MissingDirectory { .. })
        ));

        let fatal = local_gatherer(&layout, &["b", "c"])
            .gather(GatherPolicy::Partial, &RunContext::new())
            .await
            .unwrap_err();
        assert_eq!(fatal.failed, vec!["b", "c"]);
        assert_eq!(fatal.total, 2);
    }

    #[tokio::test]
    async fn test_regather_does_not_duplicate_files() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_outputs(&layout, "a", &["x.csv", "y.csv"]);
        let gatherer = local_gatherer(&layout, &["a"]);

        gatherer
            .gather(GatherPolicy::Strict, &RunContext::new())
            .await
            .unwrap();
        std::fs::write(layout.local_output_dir("a").join("x.csv"), "updated").unwrap();
        gatherer
            .gather(GatherPolicy::Strict, &RunContext::new())
            .await
            .unwrap();

        let shared = layout.shared_input_dir("a");
        assert_eq!(file_names(&shared), vec!["x.csv", "y.csv"]);
        assert_eq!(std::fs::read_to_string(shared.join("x.csv")).unwrap(), "updated");
    }

    #[tokio::test]
    async fn test_local_gather_ignores_subdirectories() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_outputs(&layout, "a", &["a.json"]);
        std::fs::create_dir_all(layout.local_output_dir("a").join("archive")).unwrap();

        let result = local_gatherer(&layout, &["a"])
            .gather(GatherPolicy::Strict, &RunContext::new())
            .await
            .unwrap();
        assert_eq!(result.successes[0].1.files, 1);
        assert_eq!(file_names(&layout.shared_input_dir("a")), vec!["a.json"]);
    }

    #[tokio::test]
    async fn test_directories_prepared_for_every_source() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());

        local_gatherer(&layout, &["a", "b"]).prepare_directories().await;
        assert!(layout.shared_input_dir("a").is_dir());
        assert!(layout.shared_input_dir("b").is_dir());
    }

    #[tokio::test]
    async fn test_remote_gather_mirrors_nested_keys() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("grades/", b"");
        store.insert("grades/2024/", b"");
        store.insert("grades/2024/fall.csv", b"fall");
        store.insert("grades/spring.csv", b"spring");
        store.insert("coursebook/c.json", b"{}");

        let result = remote_gatherer(&layout, &["grades", "coursebook"], &store)
            .gather(GatherPolicy::Strict, &RunContext::new())
            .await
            .unwrap();

        assert_eq!(result.successes[0].1.files, 2);
        let shared = layout.shared_input_dir("grades");
        assert_eq!(
            std::fs::read(shared.join("2024").join("fall.csv")).unwrap(),
            b"fall"
        );
        assert_eq!(std::fs::read(shared.join("spring.csv")).unwrap(), b"spring");
        assert_eq!(
            std::fs::read(layout.shared_input_dir("coursebook").join("c.json")).unwrap(),
            b"{}"
        );
    }

    #[tokio::test]
    async fn test_remote_gather_empty_prefix_fails() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("grades/", b"");

        let fatal = remote_gatherer(&layout, &["grades"], &store)
            .gather(GatherPolicy::Partial, &RunContext::new())
            .await
            .unwrap_err();
        assert!(fatal.to_string().contains("no objects found under 'grades/'"));
    }

    #[tokio::test]
    async fn test_remote_fetch_error_becomes_source_outcome() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("grades/a.csv", b"a");
        store.insert("grades/b.csv", b"b");
        store.fail_get("grades/b.csv");

        let fatal = remote_gatherer(&layout, &["grades"], &store)
            .gather(GatherPolicy::Strict, &RunContext::new())
            .await
            .unwrap_err();
        assert_eq!(fatal.failed, vec!["grades"]);
        // The objects that could be fetched were still written
        assert!(layout.shared_input_dir("grades").join("a.csv").exists());
    }

    #[tokio::test]
    async fn test_remote_fetches_are_bounded() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let store = Arc::new(MemoryObjectStore::new());
        for i in 0..12 {
            store.insert(&format!("grades/{:02}.csv", i), b"row");
        }
        store.delay_gets(Duration::from_millis(20));

        let result = remote_gatherer(&layout, &["grades"], &store)
            .gather(GatherPolicy::Strict, &RunContext::new())
            .await
            .unwrap();

        assert_eq!(result.successes[0].1.files, 12);
        assert!(store.max_concurrent_gets() <= REMOTE_FETCH_CONCURRENCY);
        assert!(store.max_concurrent_gets() > 1);
    }

    #[tokio::test]
    async fn test_cancelled_gather_fails_every_source() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_outputs(&layout, "a", &["a.json"]);

        let ctx = RunContext::new();
        ctx.cancel();
        let fatal = local_gatherer(&layout, &["a"])
            .gather(GatherPolicy::Partial, &ctx)
            .await
            .unwrap_err();
        assert!(fatal.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_preserve_prior_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("grades/2024.csv", b"old");
        store.insert("grades/broken.csv", b"x");
        store.fail_get("grades/broken.csv");

        let registry = Registry::new(&layout, &["grades", "coursebook"]);
        let gatherer = remote_gatherer(&layout, &["grades", "coursebook"], &store);

        // coursebook has nothing stored; grades has one unreadable object
        let restored = gatherer
            .preserve_prior(registry.sources(), &RunContext::new())
            .await;

        assert_eq!(restored, 1);
        assert_eq!(
            std::fs::read(layout.local_output_dir("grades").join("2024.csv")).unwrap(),
            b"old"
        );
    }

    #[tokio::test]
    async fn test_preserve_prior_without_store_is_noop() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let registry = Registry::new(&layout, &["grades"]);

        let restored = local_gatherer(&layout, &["grades"])
            .preserve_prior(registry.sources(), &RunContext::new())
            .await;
        assert_eq!(restored, 0);
    }
}
