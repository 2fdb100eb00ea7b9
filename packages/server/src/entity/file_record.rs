use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Metadata for one stored file. Exactly one row exists per file written by the store.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "file_record")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Filename as supplied by the uploader's client.
    #[sea_orm(column_type = "Text")]
    pub original_filename: String,

    /// Last segment of `filepath`. Not unique across the table.
    #[sea_orm(indexed)]
    pub stored_filename: String,

    /// Absolute, normalised on-disk path under the storage root.
    #[sea_orm(unique)]
    pub filepath: String,
}

impl ActiveModelBehavior for ActiveModel {}
