#![forbid(unsafe_code)]

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("corrupt {collection} record {id}")]
    Corrupt { collection: &'static str, id: String },
    #[error("storage quota exceeded (limit={limit_bytes} bytes, requested={requested_bytes} bytes)")]
    QuotaExceeded {
        limit_bytes: usize,
        requested_bytes: usize,
    },
    #[error("unknown id")]
    UnknownId,
}
