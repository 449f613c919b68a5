//! Filesystem helpers.

use std::path::Path;
use tracing::debug;

use crate::error::MediaResult;

/// Move a file, falling back to copy+delete across filesystems.
pub async fn move_file(from: impl AsRef<Path>, to: impl AsRef<Path>) -> MediaResult<()> {
    let from = from.as_ref();
    let to = to.as_ref();

    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        // EXDEV: rename cannot cross mount points
        Err(e) if e.raw_os_error() == Some(18) => {
            debug!(from = %from.display(), to = %to.display(), "cross-device move, copying");
            let tmp = to.with_extension("tmp");
            tokio::fs::copy(from, &tmp).await?;
            tokio::fs::rename(&tmp, to).await?;
            tokio::fs::remove_file(from).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Total size in bytes of a set of files.
pub async fn total_size(paths: &[impl AsRef<Path>]) -> MediaResult<u64> {
    let mut total = 0;
    for path in paths {
        total += tokio::fs::metadata(path.as_ref()).await?.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_move_file() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("a.mp4");
        let to = dir.path().join("nested/b.mp4");
        tokio::fs::write(&from, b"data").await.unwrap();

        move_file(&from, &to).await.unwrap();

        assert!(!from.exists());
        assert_eq!(tokio::fs::read(&to).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_total_size() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        tokio::fs::write(&a, b"12345").await.unwrap();
        tokio::fs::write(&b, b"678").await.unwrap();

        assert_eq!(total_size(&[a, b]).await.unwrap(), 8);
    }
}
