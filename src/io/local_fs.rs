use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Regular files directly under `dir`, sorted by name
///
/// Sub-directories are ignored. Returns `Ok(None)` when `dir` does not exist.
pub async fn list_files(dir: &Path) -> std::io::Result<Option<Vec<PathBuf>>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    Ok(Some(files))
}

/// Temporary sibling used while a destination file is being written
fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Move a fully written staging file over `dest`, discarding it on failure
async fn commit(staging: PathBuf, dest: &Path) -> std::io::Result<()> {
    if let Err(e) = fs::rename(&staging, dest).await {
        let _ = fs::remove_file(&staging).await;
        return Err(e);
    }
    Ok(())
}

/// Write `data` to `dest`, replacing any existing file atomically
///
/// Parent directories are created as needed. Readers never observe a partially
/// written file: the content goes to a temporary sibling which is renamed over
/// the destination once synced.
pub async fn write_atomic(dest: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let staging = staging_path(dest);
    let written = async {
        let mut file = fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&staging).await;
        return Err(e);
    }

    commit(staging, dest).await
}

/// Copy `src` to `dest`, replacing any existing file atomically
pub async fn copy_atomic(src: &Path, dest: &Path) -> std::io::Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let staging = staging_path(dest);
    let bytes = match fs::copy(src, &staging).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }
    };

    commit(staging, dest).await?;
    Ok(bytes)
}

/// Outcome of removing the files under a directory
#[derive(Debug, Default)]
pub struct CleanResult {
    pub removed: usize,
    pub failed: Vec<(PathBuf, std::io::Error)>,
}

/// Remove every regular file directly under `dir`
///
/// Sub-directories are left alone and a missing directory is not an error.
/// Individual removal failures are collected rather than aborting the sweep.
pub async fn remove_files(dir: &Path) -> std::io::Result<CleanResult> {
    let Some(files) = list_files(dir).await? else {
        return Ok(CleanResult::default());
    };
    Ok(remove_paths(&files).await)
}

/// Remove exactly the given files
pub async fn remove_paths(files: &[PathBuf]) -> CleanResult {
    let mut result = CleanResult::default();
    for file in files {
        match fs::remove_file(file).await {
            Ok(()) => result.removed += 1,
            Err(e) => result.failed.push((file.clone(), e)),
        }
    }
    result
}
