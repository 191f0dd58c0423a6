use std::{fmt, path::PathBuf, str::FromStr};

use crawldesk_db::{
    entities::{html, images, visited},
    sea_orm::{
        ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    },
};
use tokio::sync::OnceCell;

const RECENT_VISITED_LIMIT: u64 = 25;
const FILES_LIMIT: u64 = 50;
const FILE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("result store query failed: {0}")]
    Db(#[from] DbErr),
    #[error("invalid file type: {0}")]
    UnknownCategory(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FileCategory {
    #[serde(rename = "HTML")]
    Html,
    Image,
}

impl FromStr for FileCategory {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            v if v.eq_ignore_ascii_case("html") => Ok(Self::Html),
            v if v.eq_ignore_ascii_case("image") => Ok(Self::Image),
            other => Err(StoreError::UnknownCategory(other.to_string())),
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Html => f.write_str("HTML"),
            Self::Image => f.write_str("Image"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VisitedRecord {
    pub id: i32,
    pub url: String,
    pub referrer: String,
    pub last_visited_at: String,
    pub is_complete: bool,
    pub is_blocked: bool,
}

impl From<visited::Model> for VisitedRecord {
    fn from(m: visited::Model) -> Self {
        Self {
            id: m.id,
            url: m.url,
            referrer: m.referrer,
            last_visited_at: m.last_visited_at.format(FILE_DATE_FORMAT).to_string(),
            is_complete: m.is_complete,
            is_blocked: m.is_blocked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoredFile {
    pub id: i32,
    pub file_name: String,
    pub file_type: FileCategory,
    pub file_size: usize,
    pub file_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileCollection {
    pub file_type: FileCategory,
    pub files: Vec<StoredFile>,
}

/// Read-only handle on one tenant's crawl result database.
///
/// The worker creates the file on its first write, so the connection is opened
/// lazily and a missing file reads as empty.
#[derive(Debug)]
pub struct ResultStore {
    path: PathBuf,
    conn: OnceCell<DatabaseConnection>,
}

impl ResultStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            conn: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn connection(&self) -> Result<Option<&DatabaseConnection>, StoreError> {
        if let Some(conn) = self.conn.get() {
            return Ok(Some(conn));
        }
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let conn = self
            .conn
            .get_or_try_init(|| crawldesk_db::connect_result_store(&self.path))
            .await?;
        Ok(Some(conn))
    }

    pub async fn recent_visited(&self) -> Result<Vec<VisitedRecord>, StoreError> {
        let Some(db) = self.connection().await? else {
            return Ok(Vec::new());
        };
        let rows = visited::Entity::find()
            .order_by_desc(visited::Column::LastVisitedAt)
            .order_by_desc(visited::Column::Id)
            .limit(RECENT_VISITED_LIMIT)
            .all(db)
            .await?;
        Ok(rows.into_iter().map(VisitedRecord::from).collect())
    }

    pub async fn files_by_category(&self, category: FileCategory) -> Result<FileCollection, StoreError> {
        let Some(db) = self.connection().await? else {
            return Ok(FileCollection {
                file_type: category,
                files: Vec::new(),
            });
        };

        let files = match category {
            FileCategory::Html => html::Entity::find()
                .order_by_desc(html::Column::UpdatedAt)
                .limit(FILES_LIMIT)
                .all(db)
                .await?
                .into_iter()
                .map(|m| StoredFile {
                    id: m.id,
                    file_name: m.url,
                    file_type: category,
                    file_size: m.html.len(),
                    file_date: m.updated_at.format(FILE_DATE_FORMAT).to_string(),
                })
                .collect(),
            FileCategory::Image => images::Entity::find()
                .filter(images::Column::Success.eq(true))
                .filter(images::Column::Image.is_not_null())
                .order_by_desc(images::Column::UpdatedAt)
                .limit(FILES_LIMIT)
                .all(db)
                .await?
                .into_iter()
                .map(|m| StoredFile {
                    id: m.id,
                    file_name: m.url,
                    file_type: category,
                    file_size: m.image.as_ref().map(Vec::len).unwrap_or(0),
                    file_date: m.updated_at.format(FILE_DATE_FORMAT).to_string(),
                })
                .collect(),
        };

        Ok(FileCollection {
            file_type: category,
            files,
        })
    }
}
