//! Staging of input archives at their registered paths.

use std::future::Future;
use std::io;
use std::path::Path;

/// Writes an input archive in the engine's format to `dest`.
///
/// The archive content comes from outside the driver; `source` is whatever
/// the caller handed to the workflow as the dataset.
pub trait ArchiveWriter: Send + Sync {
    fn write_archive(
        &self,
        source: &Path,
        dest: &Path,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

/// Copies an already formatted archive into place.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyArchive;

impl ArchiveWriter for CopyArchive {
    async fn write_archive(&self, source: &Path, dest: &Path) -> io::Result<()> {
        if source == dest {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, dest).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_into_a_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("x.tsv");
        std::fs::write(&src, "cpt:ncats=3\n").unwrap();
        let dest = dir.path().join("nested/ws/original_predictor");

        CopyArchive.write_archive(&src, &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "cpt:ncats=3\n");
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CopyArchive
            .write_archive(&dir.path().join("absent"), &dir.path().join("out"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
