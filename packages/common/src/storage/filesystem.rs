use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::error::StorageError;
use super::permissions::DirMode;
use super::resolver::PathResolver;

/// Directories and file bytes under the storage root.
///
/// All paths passed in must already be resolved to absolute paths under the
/// root (see [`PathResolver::resolve_safe`]); this type does not re-validate them.
#[derive(Debug)]
pub struct FilesystemStore {
    root: PathBuf,
    staging: PathBuf,
    dir_mode: DirMode,
}

impl FilesystemStore {
    /// Create the root and staging directories if needed.
    pub async fn new(resolver: &PathResolver, dir_mode: DirMode) -> Result<Self, StorageError> {
        fs::create_dir_all(resolver.root()).await?;
        fs::create_dir_all(resolver.staging_dir()).await?;
        Ok(Self {
            root: resolver.root().to_path_buf(),
            staging: resolver.staging_dir().to_path_buf(),
            dir_mode,
        })
    }

    /// Unique path for an in-flight write.
    fn temp_path(&self) -> PathBuf {
        self.staging
            .join(format!("{}.part", uuid::Uuid::new_v4()))
    }

    /// Create every missing directory between the root and the parent of `path`.
    ///
    /// Only directories created by this call receive the configured mode;
    /// existing ones are left alone. Returns the created directories, outermost first.
    pub async fn ensure_parents(&self, path: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let Some(parent) = path.parent() else {
            return Ok(Vec::new());
        };

        let mut missing = Vec::new();
        let mut cursor = Some(parent);
        while let Some(dir) = cursor {
            if dir == self.root || !dir.starts_with(&self.root) || fs::try_exists(dir).await? {
                break;
            }
            missing.push(dir.to_path_buf());
            cursor = dir.parent();
        }

        if missing.is_empty() {
            return Ok(missing);
        }

        fs::create_dir_all(parent).await?;
        // Innermost first: a mode without search permission blocks chmod beneath it.
        for dir in &missing {
            self.dir_mode.apply(dir).await?;
        }
        missing.reverse();
        debug!(created = missing.len(), mode = %self.dir_mode, "Created parent directories");

        Ok(missing)
    }

    /// Copy `reader` into a fresh staging file, flushed and synced.
    ///
    /// A reader error or a size overrun removes the staging file. So does
    /// dropping the returned [`StagedFile`] (or this future) before it is
    /// persisted.
    pub async fn stage<R>(&self, mut reader: R, max_size: u64) -> Result<StagedFile, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut staged = StagedFile {
            path: self.temp_path(),
            bytes: 0,
            persisted: false,
        };

        let mut temp_file = fs::File::create(&staged.path).await?;
        let mut limited = (&mut reader).take(max_size.saturating_add(1));
        let written = tokio::io::copy(&mut limited, &mut temp_file).await?;
        if written > max_size {
            return Err(StorageError::SizeLimitExceeded {
                actual: written,
                limit: max_size,
            });
        }

        temp_file.flush().await?;
        temp_file.sync_all().await?;
        staged.bytes = written;
        Ok(staged)
    }

    /// Remove the file at `path`. Returns `false` if there was nothing to remove.
    pub async fn delete_if_exists(&self, path: &Path) -> Result<bool, StorageError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a regular file (following symlinks) exists at `path`.
    pub async fn is_regular_file(&self, path: &Path) -> bool {
        fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    /// Open the regular file at `path` for reading, with its length.
    pub async fn open(&self, path: &Path) -> Result<(fs::File, u64), StorageError> {
        let not_found = || StorageError::NotFound(path.display().to_string());

        let file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                return Err(not_found());
            }
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(not_found());
        }
        Ok((file, meta.len()))
    }

    /// Lazily walk `dir` and yield every regular file beneath it, in no particular order.
    ///
    /// Symlinks are not followed and the staging directory is skipped. If `dir`
    /// is itself a regular file it is the only item yielded.
    pub fn walk_regular_files(
        &self,
        dir: &Path,
    ) -> impl Iterator<Item = Result<PathBuf, StorageError>> + Send + use<> {
        let staging = self.staging.clone();
        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |entry| entry.path() != staging)
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_file() => Some(Ok(entry.into_path())),
                Ok(_) => None,
                Err(e) => Some(Err(StorageError::Io(e.into()))),
            })
    }
}

/// Upload bytes sitting in the staging directory, not yet visible at any reference path.
///
/// Removed from disk on drop unless [`StagedFile::persist`] succeeded.
#[derive(Debug)]
#[must_use = "a staged file is discarded when dropped"]
pub struct StagedFile {
    path: PathBuf,
    bytes: u64,
    persisted: bool,
}

impl StagedFile {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Rename the staged bytes onto `destination`, replacing any existing file.
    pub async fn persist(mut self, destination: &Path) -> Result<u64, StorageError> {
        fs::rename(&self.path, destination).await?;
        self.persisted = true;
        Ok(self.bytes)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staged upload");
            }
        }
    }
}
