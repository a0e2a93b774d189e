use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Failed to stage upload at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to release staged file {path}: {source}")]
    Release {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Staging directory unavailable: {0}")]
    Directory(#[from] std::io::Error),
}

/// An upload written to disk, waiting for classification.
///
/// Each staged file has its own uuid-based name so overlapping uploads never
/// share a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub id: Uuid,
    pub path: PathBuf,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct StagingStore {
    dir: PathBuf,
    extension: String,
}

impl StagingStore {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the staging directory and removes staged files a previous
    /// process left behind. Files not named `<uuid>.<extension>` are kept.
    /// Must only run before uploads are accepted.
    pub async fn prepare(&self) -> Result<usize, StagingError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() || !self.is_staged_name(&entry.path()) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to sweep stale staged file {:?}: {}", entry.path(), e),
            }
        }

        if removed > 0 {
            info!("🧹 Swept {} stale staged file(s) from {:?}", removed, self.dir);
        }
        Ok(removed)
    }

    fn is_staged_name(&self, path: &Path) -> bool {
        let stem_is_uuid = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| Uuid::parse_str(stem).is_ok());
        let extension_matches = path
            .extension()
            .is_some_and(|ext| ext == self.extension.as_str());
        stem_is_uuid && extension_matches
    }

    pub async fn stage(&self, data: &[u8]) -> Result<StagedFile, StagingError> {
        let id = Uuid::new_v4();
        let path = self.dir.join(format!("{}.{}", id, self.extension));

        if let Err(source) = tokio::fs::write(&path, data).await {
            // Don't leave a truncated file around
            let _ = tokio::fs::remove_file(&path).await;
            return Err(StagingError::Write { path, source });
        }

        debug!("Staged {} bytes at {:?}", data.len(), path);
        Ok(StagedFile { id, path })
    }

    /// Removes the staged file. Releasing a file that is already gone is not
    /// an error.
    pub async fn release(&self, staged: &StagedFile) -> Result<(), StagingError> {
        match tokio::fs::remove_file(&staged.path).await {
            Ok(()) => {
                debug!("Released staged file {:?}", staged.path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StagingError::Release {
                path: staged.path.clone(),
                source,
            }),
        }
    }
}
