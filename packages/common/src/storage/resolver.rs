use std::path::{Component, Path, PathBuf};

use super::error::StorageError;

/// Hidden directory under the root where uploads are staged before the final rename.
pub const STAGING_DIR_NAME: &str = ".staging";

/// Maps caller-supplied reference paths to absolute paths under the storage root.
///
/// This is the only place a reference path is interpreted. Everything downstream
/// works with the absolute, normalised paths it returns.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    staging: PathBuf,
}

impl PathResolver {
    /// Build a resolver for the configured root `location`.
    ///
    /// Relative locations are taken relative to the process working directory.
    /// The root does not need to exist yet.
    pub fn new(location: &str) -> Result<Self, StorageError> {
        let location = location.trim();
        if location.is_empty() {
            return Err(StorageError::InvalidConfiguration(
                "File upload location can not be empty".into(),
            ));
        }

        let root = std::path::absolute(location).map_err(|e| {
            StorageError::InvalidConfiguration(format!(
                "cannot make storage location '{location}' absolute: {e}"
            ))
        })?;
        let root = normalize(&root);

        if root.to_str().is_none() {
            return Err(StorageError::InvalidConfiguration(format!(
                "storage location {} is not valid UTF-8",
                root.display()
            )));
        }

        Ok(Self {
            staging: root.join(STAGING_DIR_NAME),
            root,
        })
    }

    /// The absolute, normalised storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Resolve `ref_path` to an absolute path that is guaranteed to lie under the root.
    ///
    /// `..` segments are collapsed first, so `a/../b` is accepted while
    /// `../../etc/passwd` is rejected. Absolute inputs are always rejected.
    pub fn resolve_safe(&self, ref_path: &str) -> Result<PathBuf, StorageError> {
        if ref_path.contains('\0') {
            return Err(StorageError::InvalidReference(
                "Reference path must not contain null bytes.".into(),
            ));
        }

        let path = normalize(Path::new(ref_path));
        if matches!(
            path.components().next(),
            Some(Component::RootDir | Component::Prefix(_))
        ) {
            return Err(StorageError::InvalidReference(
                "Absolute paths are not allowed.".into(),
            ));
        }

        let resolved = normalize(&self.root.join(&path));
        if !resolved.starts_with(&self.root) {
            return Err(StorageError::InvalidReference(
                "Cannot access files/folders outside the root directory.".into(),
            ));
        }
        if resolved.starts_with(&self.staging) {
            return Err(StorageError::InvalidReference(
                "The staging area is not addressable.".into(),
            ));
        }

        Ok(resolved)
    }

    /// Project an absolute path under the root back to a `/`-separated root-relative path.
    pub fn relativize(&self, absolute: &Path) -> Option<String> {
        absolute
            .strip_prefix(&self.root)
            .ok()
            .map(to_forward_slashes)
    }
}

/// Join the normal components of `path` with `/`, whatever the platform separator.
fn to_forward_slashes(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(segment) => Some(segment.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Lexically collapse `.` and `..` without touching the filesystem.
///
/// Leading `..` segments of a relative path are kept; `..` directly under a
/// root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}
