use nearby_core::GeoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error("config error: {0}")]
    Config(String),

    #[error("directory snapshot is {age_secs}s old (limit {max_age_secs}s)")]
    StaleSnapshot { age_secs: u64, max_age_secs: u64 },
}

pub type Result<T> = std::result::Result<T, StoreError>;
