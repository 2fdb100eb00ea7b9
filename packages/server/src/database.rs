use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};

/// Connect to the metadata index and bring its schema up to date.
pub async fn init_db(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(db_url.to_owned());

    // SQLite allows a single writer; one pooled connection keeps transactions
    // from failing with SQLITE_BUSY on lock upgrade.
    let max_connections = if db_url.starts_with("sqlite:") { 1 } else { 20 };

    opt.max_connections(max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(30))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    db.get_schema_registry("refstore::entity::*")
        .sync(&db)
        .await?;

    Ok(db)
}
