pub use sea_orm;

use std::path::Path;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    Database::connect(database_url).await
}

/// Opens a crawl result store for reading. The file is written by the crawl
/// worker; it is never created from here.
pub async fn connect_result_store(path: &Path) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let url = format!("sqlite://{}?mode=ro", path.display());
    let mut opts = ConnectOptions::new(url);
    opts.max_connections(2).sqlx_logging(false);
    Database::connect(opts).await
}
