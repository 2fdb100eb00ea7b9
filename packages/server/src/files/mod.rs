mod index;
mod service;

pub use index::{FileIndex, NewFileRecord};
pub use service::{AuditReport, FileListing, FileResource, StorageService};
