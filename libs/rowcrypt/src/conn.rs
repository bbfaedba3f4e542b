//! Connection wrapper owning the key scope.
//!
//! [`CryptoConn`] wraps a private `SeaORM` connection together with the
//! per-connection key state. Terminal operations of keyed handles execute
//! against it; the raw connection is never exposed, so no query can bypass
//! the decrypt/encrypt rewriting by accident.
//!
//! One `CryptoConn` is one logical flow: concurrent use under different
//! keys is unsupported. Callers needing concurrent differently-keyed access
//! use separate connections.

use sea_orm::sea_query::{Alias, Expr};
use sea_orm::{
    ColumnTrait, Condition, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    DbBackend, EntityName, EntityTrait, Iterable, ModelTrait, PrimaryKeyToColumn,
};

use crate::entity::{check_entity, EncryptedEntity, EncryptedModel};
use crate::error::CryptError;
use crate::key::EncryptionKey;
use crate::ops::{build_insert, build_update, DeleteKeyExt, KeyedDelete, KeyedUpdate, UpdateKeyExt};
use crate::scope::KeyState;
use crate::select::{KeyedSelect, SelectKeyExt};

/// Database connection with connection-scoped key binding.
pub struct CryptoConn {
    db: DatabaseConnection,
    key_state: KeyState,
}

impl CryptoConn {
    /// Connect with default options.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, CryptError> {
        Self::connect_with(ConnectOptions::new(url.to_owned())).await
    }

    /// Connect with explicit [`ConnectOptions`] (pool sizing, timeouts).
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] if the connection cannot be established.
    pub async fn connect_with(options: ConnectOptions) -> Result<Self, CryptError> {
        let db = Database::connect(options).await?;
        let conn = Self::new(db);
        tracing::debug!(engine = conn.db_engine(), "connection established");
        Ok(conn)
    }

    /// Wrap an existing connection.
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            key_state: KeyState::default(),
        }
    }

    pub(crate) fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub(crate) fn key_state(&self) -> &KeyState {
        &self.key_state
    }

    /// Database engine identifier for tracing and logging.
    #[must_use]
    pub fn db_engine(&self) -> &'static str {
        match self.db.get_database_backend() {
            DbBackend::Postgres => "postgres",
            DbBackend::MySql => "mysql",
            DbBackend::Sqlite => "sqlite",
        }
    }

    /// Key-bound select for `E`; shorthand for `E::find().with_key(key)`.
    pub fn find<E>(&self, key: impl Into<EncryptionKey>) -> KeyedSelect<E>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
    {
        E::find().with_key(key)
    }

    /// Key-bound bulk update for `E`.
    pub fn update_many<E>(&self, key: impl Into<EncryptionKey>) -> KeyedUpdate<E>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
    {
        E::update_many().with_key(key)
    }

    /// Key-bound bulk delete for `E`.
    pub fn delete_many<E>(&self, key: impl Into<EncryptionKey>) -> KeyedDelete<E>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
    {
        E::delete_many().with_key(key)
    }

    /// Insert one model, encrypting its fields under the model's bound key.
    ///
    /// The model is returned unchanged (still plaintext, key still bound).
    ///
    /// # Errors
    /// Returns [`CryptError::MissingKey`] before any write if the entity has
    /// encrypted columns and the model carries no key.
    pub async fn insert<E>(&self, model: E::Model) -> Result<E::Model, CryptError>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
        E::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        let stmt = build_insert::<E>(std::slice::from_ref(&model))?;
        let scope = self.key_state.enter(model.bound_key());
        let result = self
            .db
            .execute(self.db.get_database_backend().build(&stmt))
            .await;
        drop(scope);
        result?;
        Ok(model)
    }

    /// Insert with an explicit key override, binding it to the model first.
    ///
    /// # Errors
    /// See [`CryptoConn::insert`].
    pub async fn insert_with_key<E>(
        &self,
        mut model: E::Model,
        key: impl Into<EncryptionKey>,
    ) -> Result<E::Model, CryptError>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
        E::Model: EncryptedModel,
    {
        model.bind_key(key.into());
        self.insert::<E>(model).await
    }

    /// Bulk-insert in one round trip. Each model's encrypted fields are
    /// wrapped with that model's own bound key; the caller's models are
    /// never mutated and stay plaintext after the call.
    ///
    /// # Errors
    /// Returns [`CryptError::MissingKey`] before any write if any model
    /// carries no key; nothing is inserted in that case.
    pub async fn insert_many<E>(&self, models: &[E::Model]) -> Result<u64, CryptError>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
        E::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        if models.is_empty() {
            return Ok(0);
        }
        let stmt = build_insert::<E>(models)?;
        let scope = self
            .key_state
            .enter(models.first().and_then(EncryptedModel::bound_key));
        let result = self
            .db
            .execute(self.db.get_database_backend().build(&stmt))
            .await;
        drop(scope);
        Ok(result?.rows_affected())
    }

    /// Persist all non-primary-key fields of `model`, addressed by primary
    /// key, under the scoped key.
    ///
    /// # Errors
    /// Returns [`CryptError::MissingKey`] before any write if the entity has
    /// encrypted columns and no key is in scope.
    pub async fn update<E>(&self, model: &E::Model) -> Result<u64, CryptError>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
        E::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        let scope = self.key_state.enter(model.bound_key());
        let effective = self.key_state.active_key();
        let result = match build_update::<E>(model, effective.as_ref()) {
            Ok(stmt) => self
                .db
                .execute(self.db.get_database_backend().build(&stmt))
                .await
                .map_err(CryptError::from),
            Err(err) => Err(err),
        };
        drop(scope);
        Ok(result?.rows_affected())
    }

    /// Update with an explicit key override, binding it to the model first.
    ///
    /// # Errors
    /// See [`CryptoConn::update`].
    pub async fn update_with_key<E>(
        &self,
        model: &mut E::Model,
        key: impl Into<EncryptionKey>,
    ) -> Result<u64, CryptError>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
        E::Model: EncryptedModel,
    {
        model.bind_key(key.into());
        self.update::<E>(model).await
    }

    /// Reload `model` from storage, decrypting under its remembered key.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] with a record-not-found error if the row
    /// no longer exists, or on decrypt failure under a wrong key.
    pub async fn refresh<E>(&self, model: &mut E::Model) -> Result<(), CryptError>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
        E::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        let key = model.bound_key().cloned();
        let scope = self.key_state.enter(key.as_ref());
        let effective = self.key_state.active_key();
        let handle =
            KeyedSelect::<E>::from_parts(E::find(), effective).filter(pk_condition::<E>(model));
        let fetched = handle.one(self).await;
        drop(scope);
        let Some(fetched) = fetched? else {
            return Err(CryptError::Db(sea_orm::DbErr::RecordNotFound(format!(
                "no row to refresh in table '{}'",
                E::default().table_name()
            ))));
        };
        for col in E::Column::iter() {
            model.set(col, fetched.get(col));
        }
        if let Some(key) = fetched.bound_key().cloned() {
            model.bind_key(key);
        }
        Ok(())
    }

    /// Fetch the row matching `model` on the `probe` columns, or insert
    /// `model` if none matches. Returns the row and whether it was created.
    ///
    /// The whole composite runs in one key scope: the inner find and insert
    /// enter pass-through scopes under the key of the operation.
    ///
    /// # Errors
    /// Returns [`CryptError::MissingKey`] if an insert becomes necessary and
    /// the model carries no key, or [`CryptError::Db`] on query failure.
    pub async fn get_or_create<E>(
        &self,
        model: E::Model,
        probe: &[E::Column],
    ) -> Result<(E::Model, bool), CryptError>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
        E::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        let key = model.bound_key().cloned();
        let scope = self.key_state.enter(key.as_ref());
        let effective = self.key_state.active_key();
        let mut handle = KeyedSelect::<E>::from_parts(E::find(), effective);
        for col in probe {
            handle = handle.filter_eq(*col, model.get(*col));
        }
        let result = match handle.one(self).await {
            Ok(Some(existing)) => Ok((existing, false)),
            Ok(None) => self.insert::<E>(model).await.map(|created| (created, true)),
            Err(err) => Err(err),
        };
        drop(scope);
        result
    }

    /// Update the row matching `model` on the `probe` columns with the
    /// model's values, or insert `model` if none matches. Returns the
    /// persisted model and whether it was created.
    ///
    /// # Errors
    /// Returns [`CryptError::MissingKey`] if the model carries no key, or
    /// [`CryptError::Db`] on query failure.
    pub async fn update_or_create<E>(
        &self,
        mut model: E::Model,
        probe: &[E::Column],
    ) -> Result<(E::Model, bool), CryptError>
    where
        E: EncryptedEntity,
        E::Column: ColumnTrait + Copy,
        E::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        let key = model.bound_key().cloned();
        let scope = self.key_state.enter(key.as_ref());
        let effective = self.key_state.active_key();
        let mut handle = KeyedSelect::<E>::from_parts(E::find(), effective);
        for col in probe {
            handle = handle.filter_eq(*col, model.get(*col));
        }
        let result = match handle.one(self).await {
            Ok(Some(existing)) => {
                for pk in E::PrimaryKey::iter() {
                    let col = pk.into_column();
                    model.set(col, existing.get(col));
                }
                self.update::<E>(&model).await.map(|_| (model, false))
            }
            Ok(None) => self.insert::<E>(model).await.map(|created| (created, true)),
            Err(err) => Err(err),
        };
        drop(scope);
        result
    }
}

/// Condition addressing `model`'s row by primary key.
fn pk_condition<E>(model: &E::Model) -> Condition
where
    E: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
    E::Model: EncryptedModel,
{
    let mut cond = Condition::all();
    for pk in E::PrimaryKey::iter() {
        let col = pk.into_column();
        cond = cond.add(
            Expr::col((Alias::new(E::default().table_name()), col)).eq(Expr::value(model.get(col))),
        );
    }
    cond
}
