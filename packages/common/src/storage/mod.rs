mod error;
mod lock;
mod permissions;
mod resolver;

pub mod filesystem;

pub use error::StorageError;
pub use lock::{PathGuard, PathLocks};
pub use permissions::DirMode;
pub use resolver::{PathResolver, STAGING_DIR_NAME};
