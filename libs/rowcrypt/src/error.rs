use thiserror::Error;

/// Unified error type for encrypted-column operations.
///
/// Runtime decryption failures (no key or a wrong key active while reading
/// an encrypted column) surface from the database as [`CryptError::Db`] with
/// the driver error untouched. The crate never catches or reinterprets them
/// and performs no retries: a wrong-key condition is not transient.
#[derive(Debug, Error)]
pub enum CryptError {
    /// Fatal declaration error, surfaced on first use of the entity.
    #[error("invalid encrypted-entity declaration: {0}")]
    Config(String),

    /// An encrypted column was about to be persisted with no key bound.
    ///
    /// Raised before any write reaches the database.
    #[error("no encryption key bound to encrypt column '{field}'")]
    MissingKey {
        /// Name of the offending encrypted column.
        field: String,
    },

    /// Database error, including pgcrypto decrypt failures.
    #[error(transparent)]
    Db(#[from] sea_orm::DbErr),

    /// Statement construction failed (e.g. mismatched insert row shape).
    #[error("failed to build SQL statement: {0}")]
    Stmt(#[from] sea_orm::sea_query::error::Error),
}
