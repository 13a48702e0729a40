//! Streams a folder into a gzip-compressed tarball.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cancel::CancelFlag;

/// Gzip effort, 0 (store) to 9 (smallest output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub const FASTEST: Self = Self(1);

    pub fn new(level: u32) -> Option<Self> {
        (level <= 9).then_some(Self(level))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::FASTEST
    }
}

impl TryFrom<u32> for CompressionLevel {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("compression level {value} is outside 0..=9"))
    }
}

impl From<CompressionLevel> for u32 {
    fn from(level: CompressionLevel) -> Self {
        level.0
    }
}

/// Coarse failure class, used for log fields and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorCategory {
    Structural,
    ResourceExhausted,
    Cancelled,
}

impl BuildErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("source folder {0} does not exist or is not a directory")]
    SourceMissing(PathBuf),
    #[error("no space left while writing {path}")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("io error while archiving {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    pub fn category(&self) -> BuildErrorCategory {
        match self {
            BuildError::SourceMissing(_) | BuildError::Io { .. } => BuildErrorCategory::Structural,
            BuildError::DiskFull { .. } => BuildErrorCategory::ResourceExhausted,
            BuildError::Cancelled => BuildErrorCategory::Cancelled,
        }
    }

    /// Classify an IO failure; `ENOSPC` is resource exhaustion, the rest structural.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::StorageFull {
            BuildError::DiskFull {
                path: path.to_path_buf(),
                source,
            }
        } else {
            BuildError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Byte counters handed to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildProgress {
    pub processed_bytes: u64,
    pub total_bytes: u64,
}

impl BuildProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        ((self.processed_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub source: &'a Path,
    pub destination: &'a Path,
    /// Denominator for progress; normally the measured folder size.
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub artifact_bytes: u64,
    pub processed_bytes: u64,
    pub entries: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveBuilder {
    level: CompressionLevel,
}

impl ArchiveBuilder {
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Write `request.source` into `request.destination`.
    ///
    /// Output goes to `<destination>.partial` and is renamed into place only
    /// after it has been flushed and synced, so a reader never sees a
    /// truncated bundle. On any error the partial file is removed.
    pub fn build(
        &self,
        request: &BuildRequest<'_>,
        cancel: &CancelFlag,
        mut on_progress: impl FnMut(BuildProgress),
    ) -> Result<BuildOutcome, BuildError> {
        if !request.source.is_dir() {
            return Err(BuildError::SourceMissing(request.source.to_path_buf()));
        }
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let partial = partial_path(request.destination);
        let result = self
            .write_archive(request, &partial, cancel, &mut on_progress)
            .and_then(|outcome| {
                fs::rename(&partial, request.destination)
                    .map_err(|e| BuildError::from_io(request.destination, e))?;
                Ok(outcome)
            });

        match &result {
            Ok(outcome) => info!(
                source = %request.source.display(),
                destination = %request.destination.display(),
                artifact_bytes = outcome.artifact_bytes,
                entries = outcome.entries,
                level = self.level.get(),
                "archive built"
            ),
            Err(err) => {
                if let Err(rm) = fs::remove_file(&partial) {
                    if rm.kind() != io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %rm, "failed to remove partial archive");
                    }
                }
                debug!(category = err.category().as_str(), error = %err, "archive build aborted");
            }
        }
        result
    }

    fn write_archive(
        &self,
        request: &BuildRequest<'_>,
        partial: &Path,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(BuildProgress),
    ) -> Result<BuildOutcome, BuildError> {
        if let Some(parent) = partial.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::from_io(parent, e))?;
        }
        let file = File::create(partial).map_err(|e| BuildError::from_io(partial, e))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::new(self.level.get()));
        let mut tar = tar::Builder::new(encoder);
        tar.follow_symlinks(false);

        let mut processed = 0u64;
        let mut entries = 0u64;

        let walker = WalkDir::new(request.source)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name();

        for entry in walker {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(request.source).to_path_buf();
                    match err.into_io_error() {
                        Some(io) if io.kind() == io::ErrorKind::NotFound => {
                            warn!(path = %path.display(), "entry vanished while archiving, skipping");
                            continue;
                        }
                        Some(io) => return Err(BuildError::from_io(&path, io)),
                        None => {
                            return Err(BuildError::Io {
                                path,
                                source: io::Error::other("filesystem loop detected"),
                            });
                        }
                    }
                }
            };

            let path = entry.path();
            let relative = match path.strip_prefix(request.source) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let file_type = entry.file_type();

            if file_type.is_dir() {
                tar.append_dir(relative, path)
                    .map_err(|e| self.classify(path, e, cancel))?;
                entries += 1;
            } else if file_type.is_file() {
                let file = match File::open(path) {
                    Ok(file) => file,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        warn!(path = %path.display(), "file vanished while archiving, skipping");
                        continue;
                    }
                    Err(err) => return Err(BuildError::from_io(path, err)),
                };
                let meta = file.metadata().map_err(|e| BuildError::from_io(path, e))?;
                let mut header = tar::Header::new_gnu();
                header.set_metadata(&meta);
                header.set_size(meta.len());

                let reader = ProgressReader {
                    inner: file.take(meta.len()),
                    processed: &mut processed,
                    total: request.total_bytes,
                    cancel,
                    on_progress: &mut *on_progress,
                };
                tar.append_data(&mut header, relative, reader)
                    .map_err(|e| self.classify(path, e, cancel))?;
                entries += 1;
            } else {
                debug!(path = %path.display(), "skipping non-regular entry");
            }
        }

        let encoder = tar
            .into_inner()
            .map_err(|e| self.classify(partial, e, cancel))?;
        let mut writer = encoder
            .finish()
            .map_err(|e| BuildError::from_io(partial, e))?;
        writer.flush().map_err(|e| BuildError::from_io(partial, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| BuildError::from_io(partial, e.into_error()))?;
        file.sync_all().map_err(|e| BuildError::from_io(partial, e))?;
        let artifact_bytes = file
            .metadata()
            .map_err(|e| BuildError::from_io(partial, e))?
            .len();

        Ok(BuildOutcome {
            artifact_bytes,
            processed_bytes: processed,
            entries,
        })
    }

    fn classify(&self, path: &Path, err: io::Error, cancel: &CancelFlag) -> BuildError {
        if cancel.is_cancelled() {
            BuildError::Cancelled
        } else {
            BuildError::from_io(path, err)
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

/// Counts bytes as tar pulls them and aborts the copy once cancelled.
struct ProgressReader<'a, R> {
    inner: R,
    processed: &'a mut u64,
    total: u64,
    cancel: &'a CancelFlag,
    on_progress: &'a mut dyn FnMut(BuildProgress),
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("archive build cancelled"));
        }
        let n = self.inner.read(buf)?;
        if n > 0 {
            *self.processed += n as u64;
            (self.on_progress)(BuildProgress {
                processed_bytes: *self.processed,
                total_bytes: self.total,
            });
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("track01.flac"), vec![7u8; 64 * 1024]).unwrap();
        fs::create_dir(dir.path().join("art")).unwrap();
        fs::write(dir.path().join("art/cover.jpg"), b"not really a jpeg").unwrap();
        dir
    }

    fn read_bundle(path: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        let mut files = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.header().entry_type().is_file() {
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut body = Vec::new();
                entry.read_to_end(&mut body).unwrap();
                files.insert(name, body);
            }
        }
        files
    }

    #[test]
    fn builds_readable_bundle_with_relative_paths() {
        let src = fixture();
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("bundle.tar.gz");
        let request = BuildRequest {
            source: src.path(),
            destination: &dest,
            total_bytes: 64 * 1024 + 17,
        };

        let outcome = ArchiveBuilder::default()
            .build(&request, &CancelFlag::new(), |_| {})
            .unwrap();

        assert_eq!(outcome.processed_bytes, 64 * 1024 + 17);
        assert_eq!(outcome.entries, 3);
        assert_eq!(outcome.artifact_bytes, fs::metadata(&dest).unwrap().len());
        assert!(!partial_path(&dest).exists());

        let files = read_bundle(&dest);
        assert_eq!(files.len(), 2);
        assert_eq!(files["art/cover.jpg"], b"not really a jpeg");
        assert_eq!(files["track01.flac"].len(), 64 * 1024);
    }

    #[test]
    fn progress_is_monotonic_and_reaches_total() {
        let src = fixture();
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("b.tar.gz");
        let total = 64 * 1024 + 17;
        let mut seen = Vec::new();

        ArchiveBuilder::new(CompressionLevel::new(6).unwrap())
            .build(
                &BuildRequest {
                    source: src.path(),
                    destination: &dest,
                    total_bytes: total,
                },
                &CancelFlag::new(),
                |p| seen.push(p.processed_bytes),
            )
            .unwrap();

        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), total);
    }

    #[test]
    fn missing_source_is_structural() {
        let out = tempfile::tempdir().unwrap();
        let missing = out.path().join("gone");
        let dest = out.path().join("b.tar.gz");
        let err = ArchiveBuilder::default()
            .build(
                &BuildRequest {
                    source: &missing,
                    destination: &dest,
                    total_bytes: 0,
                },
                &CancelFlag::new(),
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, BuildError::SourceMissing(_)));
        assert_eq!(err.category(), BuildErrorCategory::Structural);
        assert!(!dest.exists());
    }

    #[test]
    fn cancellation_mid_stream_leaves_nothing_behind() {
        let src = fixture();
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("b.tar.gz");
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();

        let err = ArchiveBuilder::default()
            .build(
                &BuildRequest {
                    source: src.path(),
                    destination: &dest,
                    total_bytes: 64 * 1024 + 17,
                },
                &cancel,
                |_| {
                    trigger.cancel();
                },
            )
            .unwrap_err();

        assert!(matches!(err, BuildError::Cancelled));
        assert_eq!(err.category(), BuildErrorCategory::Cancelled);
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn compression_level_rejects_out_of_range() {
        assert!(CompressionLevel::new(10).is_none());
        assert_eq!(CompressionLevel::default().get(), 1);
        assert!(CompressionLevel::try_from(0).is_ok());
    }
}
