use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found")]
    NotFound,

    #[error("Not allowed: {0}")]
    Denied(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
