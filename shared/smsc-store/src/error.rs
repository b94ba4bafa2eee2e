use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("no connection: {0}")]
    Pool(String),

    #[error("{0}")]
    Configuration(String),

    #[error("json column: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Decode(String),
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

impl From<StoreError> for smsc_core::SmscError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Configuration(msg) => Self::Config(msg),
            other => Self::Database(other.to_string()),
        }
    }
}
