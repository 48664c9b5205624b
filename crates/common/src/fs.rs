//! Crash-safe file persistence

use std::path::Path;

use tracing::debug;

/// Write `contents` to `path` atomically.
///
/// Writes a temporary file in the same directory, then renames it over the
/// target, so a crash mid-write never leaves a truncated file behind. The file
/// is created owner read/write only since it may hold session tokens.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".into());
    let tmp_path = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&tmp_path, path).await?;
    debug!(path = %path.display(), bytes = contents.len(), "persisted file");
    Ok(())
}
