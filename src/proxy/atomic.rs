//! Temp-file-then-rename writes for artifacts other invocations read.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::error::{ProxyError, Result};

/// Sibling path used while `path` is being written: `<path>.tmp`.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `data` to `path` so readers see either the old file or the complete
/// new one, never a partial write.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProxyError::io(parent, e))?;
    }

    let tmp = temp_path(path);
    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ProxyError::io(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ProxyError::io(path, e));
    }
    Ok(())
}
