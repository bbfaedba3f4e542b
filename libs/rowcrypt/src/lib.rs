//! Transparent per-row column encryption for `SeaORM` on PostgreSQL.
//!
//! Application code reads and writes plaintext through normal model fields;
//! this crate encrypts on write and decrypts on read inside the generated
//! SQL, using pgcrypto's symmetric functions with the key scoped to the
//! connection for the duration of one operation.
//!
//! # Declaring an encrypted entity
//!
//! ```ignore
//! use rowcrypt::{EncryptedEntity, EncryptedModel, KeySlot};
//! use sea_orm::entity::prelude::*;
//!
//! #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
//! #[sea_orm(table_name = "books")]
//! pub struct Model {
//!     #[sea_orm(primary_key, auto_increment = false)]
//!     pub id: Uuid,
//!     pub title: String,          // stored as bytea, read back as text
//!     #[sea_orm(ignore)]
//!     pub key: KeySlot,           // non-persisted key carrier
//! }
//!
//! #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
//! pub enum Relation {}
//!
//! impl ActiveModelBehavior for ActiveModel {}
//!
//! impl EncryptedEntity for Entity {
//!     fn encrypted_columns() -> &'static [Column] {
//!         &[Column::Title]
//!     }
//! }
//!
//! impl EncryptedModel for Model {
//!     fn key_slot(&self) -> &KeySlot { &self.key }
//!     fn key_slot_mut(&mut self) -> &mut KeySlot { &mut self.key }
//! }
//! ```
//!
//! # Querying
//!
//! ```ignore
//! use rowcrypt::{CryptoConn, KeySlot, SelectKeyExt};
//!
//! let conn = CryptoConn::connect("postgres://...").await?;
//!
//! let book = book::Model {
//!     id: Uuid::new_v4(),
//!     title: "The Lord of the Rings".to_owned(),
//!     key: KeySlot::bound("rosenkohl"),
//! };
//! conn.insert::<book::Entity>(book).await?;
//!
//! let n = book::Entity::find()
//!     .with_key("rosenkohl")
//!     .filter_eq(book::Column::Title, "The Lord of the Rings")
//!     .count(&conn)
//!     .await?;
//! assert_eq!(n, 1);
//! ```
//!
//! Reading without a key (or with the wrong key) is not silently tolerated:
//! the generated SQL stays valid, and PostgreSQL rejects the decrypt at
//! execution time. Models hydrated from a keyed fetch remember their key,
//! so refresh, re-save, and related-entity queries work without re-supplying
//! it.
//!
//! # Scope and limits
//!
//! - Encrypted columns cannot be primary keys, unique, or indexed;
//!   ciphertext is non-comparable. Filtering and ordering happen through
//!   decrypt expressions with plaintext semantics.
//! - Key management, rotation, and derivation are out of scope; the key is
//!   an opaque secret supplied by the caller.
//! - One [`CryptoConn`] is one logical flow; concurrent use of a single
//!   connection under different keys is unsupported.

mod conn;
mod entity;
mod error;
mod expr;
mod key;
mod ops;
mod scope;
mod select;

pub mod migration;

pub use conn::CryptoConn;
pub use entity::{check_entity, EncryptedEntity, EncryptedModel, RESERVED_KEY_FIELD};
pub use error::CryptError;
pub use expr::ExprCtx;
pub use key::{EncryptionKey, KeySlot};
pub use ops::{DeleteKeyExt, KeyedDelete, KeyedUpdate, UpdateKeyExt};
pub use select::{
    FindRelatedKeyExt, KeyedSelect, KeyedSelectTwo, KeyedSelectTwoMany, SelectKeyExt,
};
