/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid dependent kind: {0}")]
    InvalidKind(#[from] hitledger_common::ConfigError),

    #[error("Dependent kind already registered: {0}")]
    DuplicateKind(String),

    #[error("Rewrite of {kind} record {record_id} was rejected")]
    RewriteRejected { kind: String, record_id: i64 },

    #[error("Resource {id} is still referenced by {kind}")]
    ResourceInUse { id: i64, kind: String },

    #[error("Resource {0} not found")]
    ResourceNotFound(i64),

    #[error("Unique index on hits.request_id is missing; run bootstrap first")]
    MissingHitIndex,
}
