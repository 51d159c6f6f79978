//! Filesystem utilities for cross-device file moves.
//!
//! Retained final artifacts may leave the scope's filesystem (tmpfs to a
//! persistent volume), so a plain rename can fail with EXDEV.

use std::path::Path;

use tokio::fs;

use crate::error::{ErrorKind, PipelineError, PipelineResult};

/// Move a file, falling back to copy+rename+delete across devices.
///
/// The copy goes to a temp file beside the destination first so the final
/// rename is atomic on the destination filesystem.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> PipelineResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    if let Some(parent) = dst.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).await.map_err(|e| io_err(e, dst))?;
        }
    }

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            tracing::debug!(
                "Cross-device rename, falling back to copy+delete: {} -> {}",
                src.display(),
                dst.display()
            );
            copy_and_delete(src, dst).await
        }
        Err(e) => Err(io_err(e, src)),
    }
}

/// EXDEV is error code 18 on Linux/macOS.
fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(18)
}

async fn copy_and_delete(src: &Path, dst: &Path) -> PipelineResult<()> {
    let tmp_dst = dst.with_extension("tmp");

    fs::copy(src, &tmp_dst).await.map_err(|e| io_err(e, src))?;

    if let Err(e) = fs::rename(&tmp_dst, dst).await {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(io_err(e, dst));
    }

    if let Err(e) = fs::remove_file(src).await {
        tracing::warn!(
            "Failed to remove source after cross-device move: {}: {}",
            src.display(),
            e
        );
    }

    Ok(())
}

fn io_err(e: std::io::Error, path: &Path) -> PipelineError {
    PipelineError::with_source(
        "fsops",
        ErrorKind::Resource,
        format!("file move failed for {}", path.display()),
        e,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_same_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"content").await.unwrap();

        move_file(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).await.unwrap(), "content");
    }

    #[tokio::test]
    async fn test_move_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("nested/deep/dst.txt");
        fs::write(&src, b"x").await.unwrap();

        move_file(&src, &dst).await.unwrap();
        assert!(dst.exists());
    }

    #[tokio::test]
    async fn test_move_overwrites_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"new").await.unwrap();
        fs::write(&dst, b"old").await.unwrap();

        move_file(&src, &dst).await.unwrap();
        assert_eq!(fs::read_to_string(&dst).await.unwrap(), "new");
    }
}
