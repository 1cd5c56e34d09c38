use crate::Result;
use std::path::Path;
use std::time::SystemTime;
use tempfile::TempPath;
use tokio::fs::{self, File};

/// Opens a temporary file next to `dest` so the final rename stays on one
/// filesystem.
pub(crate) async fn temp_file_for(dest: &Path) -> Result<(File, TempPath)> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    fs::create_dir_all(&dir).await?;
    let temp = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".larder-")
            .suffix(".tmp")
            .tempfile_in(dir)
    })
    .await
    .map_err(|e| crate::Error::Other(format!("temp file task failed: {}", e)))??;
    let (file, path) = temp.into_parts();
    Ok((File::from_std(file), path))
}

/// Flushes `file` to disk and renames it over `dest`. A crash before the
/// rename leaves the previous `dest` untouched.
pub(crate) async fn commit(file: File, temp: TempPath, dest: &Path) -> Result<()> {
    file.sync_all().await?;
    drop(file);
    temp.persist(dest).map_err(|e| e.error)?;
    if let Some(parent) = dest.parent() {
        sync_dir(parent).await;
    }
    Ok(())
}

pub(crate) async fn write_atomic(dest: &Path, data: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let (mut file, temp) = temp_file_for(dest).await?;
    file.write_all(data).await?;
    file.flush().await?;
    commit(file, temp, dest).await
}

async fn sync_dir(dir: &Path) {
    // Not supported everywhere; the rename itself already happened.
    if let Ok(handle) = File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}

pub(crate) fn is_not_found(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}

/// Modification time of `path`, or `None` if it does not exist.
pub(crate) async fn modified_time(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata.modified()?)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn set_modified_time(path: &Path, time: SystemTime) -> Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path).await?;
    let file = file.into_std().await;
    tokio::task::spawn_blocking(move || file.set_modified(time))
        .await
        .map_err(|e| crate::Error::Other(format!("set mtime task failed: {}", e)))??;
    Ok(())
}
