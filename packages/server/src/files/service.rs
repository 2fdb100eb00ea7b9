use std::path::{Path, PathBuf};

use common::storage::filesystem::FilesystemStore;
use common::storage::{PathLocks, PathResolver, StorageError};
use futures::TryStreamExt;
use sea_orm::{DatabaseConnection, TransactionTrait};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info, instrument, warn};

use super::index::{FileIndex, NewFileRecord};
use crate::config::StorageConfig;
use crate::entity::file_record;

/// Root-relative paths of stored files, produced on demand.
pub type FileListing = Box<dyn Iterator<Item = Result<String, StorageError>> + Send>;

/// An open stored file together with the reference path it was requested by.
#[derive(Debug)]
pub struct FileResource {
    pub file: tokio::fs::File,
    /// Length in bytes at the time the file was opened.
    pub len: u64,
    /// The reference path exactly as the caller supplied it.
    pub ref_path: String,
}

/// Outcome of checking every index row against the filesystem.
#[derive(Debug, Default)]
pub struct AuditReport {
    pub checked: u64,
    /// Records with no regular file at their filepath.
    pub missing_files: Vec<file_record::Model>,
    /// Records whose filepath lies outside the root or whose stored filename
    /// is not the last segment of the filepath.
    pub malformed: Vec<file_record::Model>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.missing_files.is_empty() && self.malformed.is_empty()
    }
}

/// Reference-addressed file storage backed by a directory tree and a metadata index.
///
/// Mutations on one resolved path are serialised through an in-process lock;
/// the unique index on `filepath` backs that up across processes.
pub struct StorageService {
    db: DatabaseConnection,
    resolver: PathResolver,
    store: FilesystemStore,
    locks: PathLocks,
    max_upload_size: u64,
}

impl StorageService {
    /// Validate the configured root and prepare it on disk.
    pub async fn new(db: DatabaseConnection, config: &StorageConfig) -> Result<Self, StorageError> {
        let resolver = PathResolver::new(&config.location)?;
        let store = FilesystemStore::new(&resolver, config.dir_mode).await?;

        info!(
            root = %resolver.root().display(),
            dir_mode = %config.dir_mode,
            max_upload_size = config.max_upload_size,
            "Storage root ready"
        );

        Ok(Self {
            db,
            resolver,
            store,
            locks: PathLocks::new(),
            max_upload_size: config.max_upload_size,
        })
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    /// Store the bytes of `reader` at `ref_path` and record them in the index.
    ///
    /// Fails with `Conflict` if a record already exists for the resolved path;
    /// existing files are never overwritten through this call. The bytes are
    /// staged before the path lock and the index transaction are taken, so a
    /// slow client holds neither. The index insert and the rename into place
    /// commit together: if the rename fails the insert is rolled back, and if
    /// the commit fails the renamed file is removed.
    #[instrument(skip(self, reader, original_filename))]
    pub async fn store<R>(
        &self,
        reader: R,
        original_filename: &str,
        ref_path: &str,
    ) -> Result<file_record::Model, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = BufReader::new(reader);
        if reader.fill_buf().await?.is_empty() {
            return Err(StorageError::EmptyUpload);
        }

        let destination = self.resolver.resolve_safe(ref_path)?;
        if destination == self.resolver.root() {
            return Err(StorageError::InvalidReference(
                "Reference path must name a file.".into(),
            ));
        }
        let filepath = path_str(&destination)?;
        let stored_filename = destination
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StorageError::InvalidReference("Reference path must name a file.".into()))?;
        let original_filename = if original_filename.trim().is_empty() {
            stored_filename
        } else {
            original_filename
        };

        let staged = self.store.stage(reader, self.max_upload_size).await?;

        let _guard = self.locks.lock(&destination).await;

        self.store.ensure_parents(&destination).await?;

        let txn = self.db.begin().await?;
        let index = FileIndex::new(&txn);

        if index.find_by_filepath(filepath).await?.is_some() {
            return Err(StorageError::Conflict(ref_path.to_owned()));
        }

        let record = index
            .insert(NewFileRecord {
                original_filename,
                stored_filename,
                filepath,
            })
            .await
            .map_err(|e| match e {
                StorageError::IntegrityViolation(_) => StorageError::Conflict(ref_path.to_owned()),
                other => other,
            })?;

        let written = match staged.persist(&destination).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!(%filepath, error = %rollback_err, "Failed to roll back file record insert");
                }
                return Err(e);
            }
        };

        if let Err(commit_err) = txn.commit().await {
            error!(%filepath, error = %commit_err, "Commit failed after write; removing file");
            if let Err(cleanup_err) = self.store.delete_if_exists(&destination).await {
                error!(
                    %filepath,
                    error = %cleanup_err,
                    "Orphaned file left on disk; manual cleanup required"
                );
            }
            return Err(commit_err.into());
        }

        info!(id = record.id, %filepath, bytes = written, "Stored file");
        Ok(record)
    }

    /// Absolute path of the file behind `ref_path`, if a regular file exists there.
    pub async fn load(&self, ref_path: &str) -> Result<PathBuf, StorageError> {
        let path = self.resolver.resolve_safe(ref_path)?;
        if !self.store.is_regular_file(&path).await {
            return Err(StorageError::NotFound(ref_path.to_owned()));
        }
        Ok(path)
    }

    /// Open the file behind `ref_path` for reading.
    pub async fn load_as_resource(&self, ref_path: &str) -> Result<FileResource, StorageError> {
        let path = self.load(ref_path).await?;
        let (file, len) = self.store.open(&path).await.map_err(|e| match e {
            StorageError::NotFound(_) => StorageError::NotFound(ref_path.to_owned()),
            other => other,
        })?;

        Ok(FileResource {
            file,
            len,
            ref_path: ref_path.to_owned(),
        })
    }

    /// Lazily list every regular file under `ref_dir` as a `/`-separated path
    /// relative to the root. An empty `ref_dir` lists the whole store.
    ///
    /// A `ref_dir` that cannot be walked, missing ones included, is an I/O failure.
    pub async fn load_all_files_under_path(
        &self,
        ref_dir: &str,
    ) -> Result<FileListing, StorageError> {
        let dir = self.resolver.resolve_safe(ref_dir)?;
        tokio::fs::symlink_metadata(&dir).await?;

        let resolver = self.resolver.clone();
        Ok(Box::new(self.store.walk_regular_files(&dir).map(
            move |entry| {
                let path = entry?;
                resolver.relativize(&path).ok_or_else(|| {
                    StorageError::IntegrityViolation(format!(
                        "walked outside the root: {}",
                        path.display()
                    ))
                })
            },
        )))
    }

    /// Remove the file behind `ref_path` and its record.
    ///
    /// The file goes first, then the row. A record whose file is already gone
    /// is still removed, with a warning. If the row cannot be removed after the
    /// file was, the index is left stale and the error is returned for an
    /// operator to resolve.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, ref_path: &str) -> Result<(), StorageError> {
        let path = self.resolver.resolve_safe(ref_path)?;
        let filepath = path_str(&path)?;

        let _guard = self.locks.lock(&path).await;

        let record = FileIndex::new(&self.db)
            .find_by_filepath(filepath)
            .await?
            .ok_or_else(|| StorageError::NotFound(ref_path.to_owned()))?;

        if !self.store.delete_if_exists(&path).await? {
            warn!(
                id = record.id,
                %filepath,
                "Record had no file on disk; removing the record anyway"
            );
        }

        let removed = async {
            let txn = self.db.begin().await?;
            let removed = FileIndex::new(&txn).delete(&record).await?;
            txn.commit().await?;
            Ok::<_, StorageError>(removed)
        }
        .await;

        match removed {
            Ok(true) => {
                info!(id = record.id, %filepath, "Deleted file");
                Ok(())
            }
            Ok(false) => {
                warn!(id = record.id, %filepath, "Record was already removed by another writer");
                Ok(())
            }
            Err(e) => {
                error!(
                    id = record.id,
                    %filepath,
                    error = %e,
                    "File removed but its record remains; manual intervention required"
                );
                Err(e)
            }
        }
    }

    /// Look up a record by the last segment of its filepath.
    pub async fn get_file_details(
        &self,
        stored_filename: &str,
    ) -> Result<file_record::Model, StorageError> {
        FileIndex::new(&self.db)
            .find_by_stored_filename(stored_filename)
            .await?
            .ok_or_else(|| StorageError::NotFound(stored_filename.to_owned()))
    }

    /// Replace the original filename on the record with the given stored filename.
    #[instrument(skip(self))]
    pub async fn update_file_details(
        &self,
        stored_filename: &str,
        new_original_filename: &str,
    ) -> Result<file_record::Model, StorageError> {
        let txn = self.db.begin().await?;
        let index = FileIndex::new(&txn);

        let mut record = index
            .find_by_stored_filename(stored_filename)
            .await?
            .ok_or_else(|| StorageError::NotFound(stored_filename.to_owned()))?;
        record.original_filename = new_original_filename.to_owned();

        let updated = index.update(record).await?;
        txn.commit().await?;

        info!(id = updated.id, "Updated file details");
        Ok(updated)
    }

    /// Check every record against the filesystem without changing anything.
    pub async fn audit(&self) -> Result<AuditReport, StorageError> {
        let index = FileIndex::new(&self.db);
        let mut records = std::pin::pin!(index.list_all().await?);
        let mut report = AuditReport::default();

        while let Some(record) = records.try_next().await? {
            report.checked += 1;
            let path = Path::new(&record.filepath);

            let well_formed = path.starts_with(self.resolver.root())
                && path.file_name().and_then(|n| n.to_str()) == Some(record.stored_filename.as_str());
            if !well_formed {
                report.malformed.push(record);
            } else if !self.store.is_regular_file(path).await {
                report.missing_files.push(record);
            }
        }

        Ok(report)
    }
}

fn path_str(path: &Path) -> Result<&str, StorageError> {
    path.to_str()
        .ok_or_else(|| StorageError::InvalidReference("Reference path must be valid UTF-8.".into()))
}
