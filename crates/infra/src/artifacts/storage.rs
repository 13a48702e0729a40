//! Shared artifact files on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid artifact name `{0}`")]
    InvalidName(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Directory of content-addressed bundles shared between owners.
///
/// Files only ever appear here complete: writers stage beside the target and
/// rename into place.
#[derive(Debug, Clone)]
pub struct ArtifactStorage {
    root: PathBuf,
}

impl ArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a bare file name inside the shared root.
    pub fn path_for(&self, artifact_name: &str) -> Result<PathBuf, StorageError> {
        let invalid = artifact_name.is_empty()
            || artifact_name == "."
            || artifact_name == ".."
            || artifact_name.contains(['/', '\\']);
        if invalid {
            return Err(StorageError::InvalidName(artifact_name.to_string()));
        }
        Ok(self.root.join(artifact_name))
    }

    pub fn exists(&self, artifact_name: &str) -> bool {
        self.path_for(artifact_name).is_ok_and(|p| p.is_file())
    }

    /// Place a finished per-job bundle into shared storage under `artifact_name`.
    ///
    /// The source stays where it is. Returns the shared path.
    pub fn publish(&self, source: &Path, artifact_name: &str) -> Result<PathBuf, StorageError> {
        let target = self.path_for(artifact_name)?;
        fs::create_dir_all(&self.root).map_err(|e| StorageError::io(&self.root, e))?;

        let staging = self.root.join(format!(".{artifact_name}.{}.tmp", Uuid::now_v7().simple()));
        if let Err(e) = link_or_copy(source, &staging) {
            let _ = fs::remove_file(&staging);
            return Err(StorageError::io(&staging, e));
        }
        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_file(&staging);
            return Err(StorageError::io(&target, e));
        }
        debug!(artifact = %artifact_name, path = %target.display(), "artifact published");
        Ok(target)
    }

    /// Give a job its own copy of a shared bundle at `destination`.
    pub fn materialize(&self, artifact_name: &str, destination: &Path) -> Result<u64, StorageError> {
        let source = self.path_for(artifact_name)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        match fs::remove_file(destination) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(destination, e)),
        }
        link_or_copy(&source, destination).map_err(|e| StorageError::io(destination, e))?;
        fs::metadata(destination)
            .map(|m| m.len())
            .map_err(|e| StorageError::io(destination, e))
    }

    /// Delete a shared file. A missing file is not an error.
    pub fn remove(&self, artifact_name: &str) -> Result<bool, StorageError> {
        let path = self.path_for(artifact_name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }
}

fn link_or_copy(source: &Path, destination: &Path) -> io::Result<()> {
    match fs::hard_link(source, destination) {
        Ok(()) => Ok(()),
        Err(_) => fs::copy(source, destination).map(|_| ()),
    }
}
