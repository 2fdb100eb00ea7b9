use thiserror::Error;

/// Errors raised by the storage core.
///
/// `Io` and `Index` together form the "I/O failure" class: the former for the
/// filesystem, the latter for the metadata index.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage root is missing or unusable. Fatal at startup.
    #[error("invalid storage configuration: {0}")]
    InvalidConfiguration(String),

    /// The reference path is absolute or escapes the storage root.
    #[error("invalid reference path: {0}")]
    InvalidReference(String),

    #[error("Failed to store empty file.")]
    EmptyUpload,

    /// A record already exists at the resolved filepath.
    #[error("File with the same name already exists.")]
    Conflict(String),

    #[error("File not found: {0}")]
    NotFound(String),

    /// The index and the filesystem disagree, or an index constraint was violated.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("upload exceeds size limit ({actual} > {limit} bytes)")]
    SizeLimitExceeded { actual: u64, limit: u64 },

    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata index error: {0}")]
    Index(String),
}

#[cfg(feature = "sea-orm")]
impl From<sea_orm::DbErr> for StorageError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::Index(err.to_string())
    }
}
