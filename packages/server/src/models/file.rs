use serde::{Deserialize, Serialize};

use crate::entity::file_record;

/// Request body naming a reference path.
#[derive(Deserialize, utoipa::ToSchema)]
pub struct RefRequest {
    /// Reference path relative to the storage root.
    #[serde(rename = "ref")]
    #[schema(example = "users/42/avatar.png")]
    pub ref_path: String,
}

/// Request body for renaming a file's original filename.
#[derive(Deserialize, utoipa::ToSchema)]
pub struct UpdateFileDetailsRequest {
    #[schema(example = "profile-picture.png")]
    pub original_filename: String,
}

/// Response DTO for a stored file's metadata record.
#[derive(Serialize, utoipa::ToSchema)]
pub struct FileRecordResponse {
    #[schema(example = 1)]
    pub id: i64,
    /// Filename supplied by the uploader.
    #[schema(example = "avatar.png")]
    pub original_filename: String,
    /// Last segment of the on-disk path.
    #[schema(example = "avatar.png")]
    pub stored_filename: String,
    /// Absolute on-disk path.
    #[schema(example = "/var/store/users/42/avatar.png")]
    pub filepath: String,
}

impl From<file_record::Model> for FileRecordResponse {
    fn from(model: file_record::Model) -> Self {
        Self {
            id: model.id,
            original_filename: model.original_filename,
            stored_filename: model.stored_filename,
            filepath: model.filepath,
        }
    }
}
