use common::storage::StorageError;
use futures::{Stream, TryStreamExt};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, StreamTrait,
};

use crate::entity::file_record;

/// Fields supplied when a file is first recorded. The id is assigned by the database.
#[derive(Debug, Clone, Copy)]
pub struct NewFileRecord<'a> {
    pub original_filename: &'a str,
    pub stored_filename: &'a str,
    pub filepath: &'a str,
}

/// Queries over the `file_record` table.
///
/// Runs against whatever connection it is given: a pooled connection gives
/// every call its own implicit transaction, a `DatabaseTransaction` lets the
/// caller group several calls.
pub struct FileIndex<'a, C: ConnectionTrait> {
    conn: &'a C,
}

impl<'a, C: ConnectionTrait> FileIndex<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    pub async fn find_by_filepath(
        &self,
        filepath: &str,
    ) -> Result<Option<file_record::Model>, StorageError> {
        Ok(file_record::Entity::find()
            .filter(file_record::Column::Filepath.eq(filepath))
            .one(self.conn)
            .await?)
    }

    /// Look up a record by stored filename.
    ///
    /// Stored filenames are not unique in the table; more than one match is
    /// reported as an integrity violation rather than picking one.
    pub async fn find_by_stored_filename(
        &self,
        stored_filename: &str,
    ) -> Result<Option<file_record::Model>, StorageError> {
        let mut rows = file_record::Entity::find()
            .filter(file_record::Column::StoredFilename.eq(stored_filename))
            .order_by_asc(file_record::Column::Id)
            .limit(2)
            .all(self.conn)
            .await?;

        if rows.len() > 1 {
            return Err(StorageError::IntegrityViolation(format!(
                "multiple records share stored filename '{stored_filename}'"
            )));
        }
        Ok(rows.pop())
    }

    /// Insert a record. A second record for the same filepath is an integrity violation.
    pub async fn insert(
        &self,
        record: NewFileRecord<'_>,
    ) -> Result<file_record::Model, StorageError> {
        let model = file_record::ActiveModel {
            original_filename: Set(record.original_filename.to_owned()),
            stored_filename: Set(record.stored_filename.to_owned()),
            filepath: Set(record.filepath.to_owned()),
            ..Default::default()
        };

        match model.insert(self.conn).await {
            Ok(inserted) => Ok(inserted),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(StorageError::IntegrityViolation(format!(
                    "a record for {} already exists",
                    record.filepath
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist every field of `record`, keyed by its id.
    pub async fn update(
        &self,
        record: file_record::Model,
    ) -> Result<file_record::Model, StorageError> {
        let id = record.id;
        let active = record.into_active_model().reset_all();

        match active.update(self.conn).await {
            Ok(updated) => Ok(updated),
            Err(DbErr::RecordNotUpdated) => {
                Err(StorageError::NotFound(format!("file record {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a record by id. Returns `false` if the row was already gone.
    pub async fn delete(&self, record: &file_record::Model) -> Result<bool, StorageError> {
        let result = file_record::Entity::delete_by_id(record.id)
            .exec(self.conn)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

impl<'a, C> FileIndex<'a, C>
where
    C: ConnectionTrait + StreamTrait + Send,
{
    /// Lazily enumerate every record, in no particular order.
    pub async fn list_all(
        &self,
    ) -> Result<impl Stream<Item = Result<file_record::Model, StorageError>> + Send, StorageError>
    {
        let rows = file_record::Entity::find().stream(self.conn).await?;
        Ok(rows.map_err(StorageError::from))
    }
}
