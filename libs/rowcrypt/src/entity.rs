use sea_orm::{EntityTrait, IdenStatic, Iterable, ModelTrait, PrimaryKeyToColumn};

use crate::error::CryptError;
use crate::key::{EncryptionKey, KeySlot};

/// Conventional name of the key-carrying model field.
///
/// A persisted column must not use this name: the non-persisted
/// [`KeySlot`] field claims it on the model struct.
pub const RESERVED_KEY_FIELD: &str = "key";

/// Declares which columns of an entity are encrypted at rest.
///
/// The enumeration is built once at entity-definition time and consulted as
/// a static lookup; nothing is discovered by runtime reflection.
///
/// Encrypted columns are stored as opaque `bytea` (see
/// [`crate::migration::encrypted_column`]) and must not be part of the
/// primary key, unique, or indexed — ciphertext is non-comparable and
/// non-orderable. The primary-key rule is checked on first use; the schema
/// helper never emits uniqueness or index clauses.
///
/// # Example
/// ```ignore
/// impl EncryptedEntity for Entity {
///     fn encrypted_columns() -> &'static [Column] {
///         &[Column::Title]
///     }
/// }
/// ```
pub trait EncryptedEntity: EntityTrait {
    /// The columns whose stored bytes are ciphertext.
    fn encrypted_columns() -> &'static [Self::Column];

    /// Logical SQL type an encrypted column decrypts back to.
    ///
    /// Used as the cast target of the decrypt expression. The physical
    /// storage type is always opaque binary.
    #[must_use]
    fn cast_type(_col: Self::Column) -> &'static str {
        "text"
    }
}

/// Marks a model as encryption-capable and exposes its [`KeySlot`].
///
/// Implemented by pointing both accessors at the model's
/// `#[sea_orm(ignore)]` key field. The slot is private state: it never
/// persists, never serializes key material, and does not take part in model
/// equality.
pub trait EncryptedModel: ModelTrait {
    fn key_slot(&self) -> &KeySlot;
    fn key_slot_mut(&mut self) -> &mut KeySlot;

    /// The key this instance remembers, if any.
    fn bound_key(&self) -> Option<&EncryptionKey> {
        self.key_slot().key()
    }

    /// Bind (or rebind) the instance key.
    fn bind_key(&mut self, key: EncryptionKey) {
        self.key_slot_mut().bind(key);
    }
}

/// Whether `col` is declared encrypted on `E`.
pub(crate) fn is_encrypted<E>(col: E::Column) -> bool
where
    E: EncryptedEntity,
{
    E::encrypted_columns()
        .iter()
        .any(|c| std::mem::discriminant(c) == std::mem::discriminant(&col))
}

/// First encrypted column of `E`, for error reporting.
pub(crate) fn first_encrypted<E>() -> Option<&'static str>
where
    E: EncryptedEntity,
{
    E::encrypted_columns().first().map(IdenStatic::as_str)
}

/// Validate an entity's encrypted-column declaration.
///
/// Runs implicitly on first use of every keyed operation; exposed so
/// applications can fail fast at startup, the way schema checks usually do.
///
/// # Errors
/// Returns [`CryptError::Config`] if an encrypted column is part of the
/// primary key, or if a persisted column uses the reserved key-field name.
pub fn check_entity<E>() -> Result<(), CryptError>
where
    E: EncryptedEntity,
    E::Column: Copy,
{
    for pk in E::PrimaryKey::iter() {
        let col = pk.into_column();
        if is_encrypted::<E>(col) {
            return Err(CryptError::Config(format!(
                "encrypted column '{}' cannot be part of the primary key",
                col.as_str()
            )));
        }
    }
    for col in E::Column::iter() {
        if col.as_str() == RESERVED_KEY_FIELD {
            return Err(CryptError::Config(format!(
                "column name '{RESERVED_KEY_FIELD}' is reserved for the key-carrying field"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sea_orm::entity::prelude::Uuid;

    use super::*;
    use crate::key::KeySlot;

    mod plain_book {
        use sea_orm::entity::prelude::*;

        use crate::entity::{EncryptedEntity, EncryptedModel};
        use crate::key::KeySlot;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "books")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            pub title: String,
            #[sea_orm(ignore)]
            pub key: KeySlot,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}

        impl EncryptedEntity for Entity {
            fn encrypted_columns() -> &'static [Column] {
                &[Column::Title]
            }
        }

        impl EncryptedModel for Model {
            fn key_slot(&self) -> &KeySlot {
                &self.key
            }
            fn key_slot_mut(&mut self) -> &mut KeySlot {
                &mut self.key
            }
        }
    }

    mod encrypted_pk {
        use sea_orm::entity::prelude::*;

        use crate::entity::EncryptedEntity;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "tokens")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub secret: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}

        impl EncryptedEntity for Entity {
            fn encrypted_columns() -> &'static [Column] {
                &[Column::Secret]
            }
        }
    }

    mod reserved_name {
        use sea_orm::entity::prelude::*;

        use crate::entity::EncryptedEntity;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "locks")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            // Persisted column colliding with the reserved key-field name.
            pub key: String,
            pub label: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}

        impl EncryptedEntity for Entity {
            fn encrypted_columns() -> &'static [Column] {
                &[Column::Label]
            }
        }
    }

    #[test]
    fn valid_declaration_passes() {
        assert!(check_entity::<plain_book::Entity>().is_ok());
    }

    #[test]
    fn encrypted_primary_key_is_a_config_error() {
        let err = check_entity::<encrypted_pk::Entity>().unwrap_err();
        match err {
            CryptError::Config(msg) => assert!(msg.contains("primary key"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reserved_column_name_is_a_config_error() {
        let err = check_entity::<reserved_name::Entity>().unwrap_err();
        match err {
            CryptError::Config(msg) => assert!(msg.contains("reserved"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn encrypted_lookup_is_static() {
        assert!(is_encrypted::<plain_book::Entity>(plain_book::Column::Title));
        assert!(!is_encrypted::<plain_book::Entity>(plain_book::Column::Id));
        assert_eq!(first_encrypted::<plain_book::Entity>(), Some("title"));
    }

    #[test]
    fn model_key_state_machine() {
        let mut book = plain_book::Model {
            id: Uuid::new_v4(),
            title: "The Lord of the Rings".to_owned(),
            key: KeySlot::default(),
        };
        assert!(book.bound_key().is_none());

        book.bind_key(crate::key::EncryptionKey::new("rosenkohl"));
        assert!(book.bound_key().is_some());

        // Rebind is idempotent.
        book.bind_key(crate::key::EncryptionKey::new("rosenkohl"));
        assert_eq!(
            book.bound_key().unwrap(),
            &crate::key::EncryptionKey::new("rosenkohl")
        );
    }
}
