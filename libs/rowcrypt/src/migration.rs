//! Schema helpers for encrypted columns.
//!
//! Encrypted columns are physically stored as opaque `bytea`; their logical
//! type lives only in the application-level declaration
//! ([`crate::EncryptedEntity::cast_type`]). The helper never emits
//! uniqueness or index clauses: ciphertext is non-comparable, so those
//! declarations are excluded by construction.

use sea_orm::sea_query::{Alias, ColumnDef};
use sea_orm::{ConnectionTrait, DbErr};

/// Column definition for an encrypted column: opaque variable-length binary.
///
/// ```ignore
/// manager
///     .create_table(
///         Table::create()
///             .table(Alias::new("books"))
///             .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
///             .col(encrypted_column("title").not_null())
///             .to_owned(),
///     )
///     .await?;
/// ```
#[must_use]
pub fn encrypted_column(name: &str) -> ColumnDef {
    let mut def = ColumnDef::new(Alias::new(name));
    def.custom(Alias::new("bytea"));
    def
}

/// Enable the pgcrypto extension providing `pgp_sym_encrypt` /
/// `pgp_sym_decrypt`. Call from a migration (via
/// `SchemaManager::get_connection()`) or test setup.
///
/// # Errors
/// Returns [`DbErr`] if the extension cannot be created.
pub async fn enable_pgcrypto<C: ConnectionTrait>(conn: &C) -> Result<(), DbErr> {
    conn.execute_unprepared("CREATE EXTENSION IF NOT EXISTS pgcrypto")
        .await?;
    Ok(())
}
