//! Write-path operations: keyed updates and deletes, and the statement
//! builders behind insert and save.
//!
//! Writes never mutate the caller's models. For each encrypted column a
//! write-view expression (`pgp_sym_encrypt($value::text, $key)`) is computed
//! aside and handed to the statement, so there is no wrap/restore step and a
//! partial failure cannot leave an instance half-wrapped.

use std::fmt;

use sea_orm::sea_query::{Alias, Expr, InsertStatement, Query, SimpleExpr, UpdateStatement};
use sea_orm::{
    ColumnTrait, Condition, DbBackend, EntityName, EntityTrait, IdenStatic, Iterable, ModelTrait,
    PrimaryKeyToColumn, QueryFilter, QueryTrait, Statement, Value,
};

use crate::conn::CryptoConn;
use crate::entity::{check_entity, first_encrypted, is_encrypted, EncryptedEntity, EncryptedModel};
use crate::error::CryptError;
use crate::expr::ExprCtx;
use crate::key::EncryptionKey;
use crate::select::{pending_condition, PendingOp};

type ExprFn<E> = Box<dyn Fn(&ExprCtx<'_, E>) -> SimpleExpr + Send + Sync>;

enum WriteOp<E: EntityTrait> {
    Value(Value),
    Expr(ExprFn<E>),
}

/// A keyed bulk update. Values assigned to encrypted columns are encrypted
/// on write; filter predicates on encrypted columns decrypt on read; both
/// sides of the statement use the same scoped key.
#[must_use]
pub struct KeyedUpdate<E: EntityTrait> {
    inner: sea_orm::UpdateMany<E>,
    key: Option<EncryptionKey>,
    sets: Vec<(E::Column, WriteOp<E>)>,
    pending: Vec<PendingOp<E>>,
}

impl<E: EntityTrait> fmt::Debug for KeyedUpdate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedUpdate")
            .field("sets", &self.sets.len())
            .field("pending", &self.pending.len())
            .field("keyed", &self.key.is_some())
            .finish()
    }
}

/// Entry point turning a `SeaORM` `UpdateMany` into a keyed update.
pub trait UpdateKeyExt<E: EntityTrait>: Sized {
    fn with_key(self, key: impl Into<EncryptionKey>) -> KeyedUpdate<E>;
}

impl<E> UpdateKeyExt<E> for sea_orm::UpdateMany<E>
where
    E: EncryptedEntity,
{
    fn with_key(self, key: impl Into<EncryptionKey>) -> KeyedUpdate<E> {
        KeyedUpdate {
            inner: self,
            key: Some(key.into()),
            sets: Vec::new(),
            pending: Vec::new(),
        }
    }
}

impl<E> KeyedUpdate<E>
where
    E: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
{
    /// Assign a literal value to a column.
    pub fn set(mut self, col: E::Column, value: impl Into<Value>) -> Self {
        self.sets.push((col, WriteOp::Value(value.into())));
        self
    }

    /// Assign a computed expression to a column.
    ///
    /// The closure receives the compiler context, so column references made
    /// through [`ExprCtx::col`] read through decrypt and the whole tree is
    /// re-encrypted for storage:
    ///
    /// ```ignore
    /// // title = title || '!'
    /// book::Entity::update_many()
    ///     .with_key(key)
    ///     .set_expr(book::Column::Title, |ctx| {
    ///         Func::cust(Alias::new("concat"))
    ///             .arg(ctx.col(book::Column::Title))
    ///             .arg(Expr::val("!"))
    ///             .into()
    ///     })
    ///     .exec(&conn)
    ///     .await?;
    /// ```
    pub fn set_expr<F>(mut self, col: E::Column, f: F) -> Self
    where
        F: Fn(&ExprCtx<'_, E>) -> SimpleExpr + Send + Sync + 'static,
    {
        self.sets.push((col, WriteOp::Expr(Box::new(f))));
        self
    }

    /// Add a plain condition.
    pub fn filter(mut self, cond: Condition) -> Self {
        self.inner = QueryFilter::filter(self.inner, cond);
        self
    }

    /// Exact-match filter with plaintext semantics.
    pub fn filter_eq(mut self, col: E::Column, value: impl Into<Value>) -> Self {
        self.pending.push(PendingOp::FilterEq(col, value.into()));
        self
    }

    /// `LIKE` pattern filter with plaintext semantics.
    pub fn filter_like(mut self, col: E::Column, pattern: impl Into<String>) -> Self {
        self.pending.push(PendingOp::FilterLike(col, pattern.into()));
        self
    }

    fn compile(&self, key: Option<&EncryptionKey>) -> Result<sea_orm::UpdateMany<E>, CryptError> {
        let ctx = ExprCtx::<E>::new(key);
        if !ctx.has_key() {
            if let Some((col, _)) = self.sets.iter().find(|(col, _)| is_encrypted::<E>(*col)) {
                return Err(CryptError::MissingKey {
                    field: col.as_str().to_owned(),
                });
            }
        }
        let mut query = self.inner.clone();
        for (col, op) in &self.sets {
            let expr = match op {
                WriteOp::Value(value) => ctx.write_value(*col, value.clone()),
                WriteOp::Expr(f) => ctx.write_expr(*col, f(&ctx)),
            };
            query = query.col_expr(*col, expr);
        }
        for op in &self.pending {
            if let Some(cond) = pending_condition(op, &ctx) {
                query = QueryFilter::filter(query, cond);
            }
        }
        Ok(query)
    }

    /// Render the statement this update would execute under its own key.
    ///
    /// # Errors
    /// Returns [`CryptError::MissingKey`] if an encrypted column is assigned
    /// without a key.
    pub fn build(&self, backend: DbBackend) -> Result<Statement, CryptError> {
        Ok(self.compile(self.key.as_ref())?.build(backend))
    }

    /// Execute the update, returning the number of affected rows.
    ///
    /// # Errors
    /// Returns [`CryptError::MissingKey`] before any write if an encrypted
    /// column is assigned without a key, or [`CryptError::Db`] on failure.
    pub async fn exec(self, conn: &CryptoConn) -> Result<u64, CryptError> {
        check_entity::<E>()?;
        let scope = conn.key_state().enter(self.key.as_ref());
        let effective = conn.key_state().active_key();
        let compiled = self.compile(effective.as_ref());
        let result = match compiled {
            Ok(query) => query.exec(conn.db()).await.map_err(CryptError::from),
            Err(err) => Err(err),
        };
        drop(scope);
        Ok(result?.rows_affected)
    }
}

/// A keyed bulk delete. Filter predicates on encrypted columns decrypt with
/// the scoped key; rows themselves need no decryption to be deleted.
#[must_use]
#[derive(Clone, Debug)]
pub struct KeyedDelete<E: EntityTrait> {
    inner: sea_orm::DeleteMany<E>,
    key: Option<EncryptionKey>,
    pending: Vec<PendingOp<E>>,
}

/// Entry point turning a `SeaORM` `DeleteMany` into a keyed delete.
pub trait DeleteKeyExt<E: EntityTrait>: Sized {
    fn with_key(self, key: impl Into<EncryptionKey>) -> KeyedDelete<E>;
}

impl<E> DeleteKeyExt<E> for sea_orm::DeleteMany<E>
where
    E: EncryptedEntity,
{
    fn with_key(self, key: impl Into<EncryptionKey>) -> KeyedDelete<E> {
        KeyedDelete {
            inner: self,
            key: Some(key.into()),
            pending: Vec::new(),
        }
    }
}

impl<E> KeyedDelete<E>
where
    E: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
{
    /// Add a plain condition.
    pub fn filter(mut self, cond: Condition) -> Self {
        self.inner = QueryFilter::filter(self.inner, cond);
        self
    }

    /// Exact-match filter with plaintext semantics.
    pub fn filter_eq(mut self, col: E::Column, value: impl Into<Value>) -> Self {
        self.pending.push(PendingOp::FilterEq(col, value.into()));
        self
    }

    /// `LIKE` pattern filter with plaintext semantics.
    pub fn filter_like(mut self, col: E::Column, pattern: impl Into<String>) -> Self {
        self.pending.push(PendingOp::FilterLike(col, pattern.into()));
        self
    }

    fn compile(&self, key: Option<&EncryptionKey>) -> sea_orm::DeleteMany<E> {
        let ctx = ExprCtx::<E>::new(key);
        let mut query = self.inner.clone();
        for op in &self.pending {
            if let Some(cond) = pending_condition(op, &ctx) {
                query = QueryFilter::filter(query, cond);
            }
        }
        query
    }

    /// Render the statement this delete would execute under its own key.
    pub fn build(&self, backend: DbBackend) -> Statement {
        self.compile(self.key.as_ref()).build(backend)
    }

    /// Execute the delete, returning the number of affected rows.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure.
    pub async fn exec(self, conn: &CryptoConn) -> Result<u64, CryptError> {
        check_entity::<E>()?;
        let scope = conn.key_state().enter(self.key.as_ref());
        let effective = conn.key_state().active_key();
        let result = self.compile(effective.as_ref()).exec(conn.db()).await;
        drop(scope);
        Ok(result?.rows_affected)
    }
}

/// Build a (possibly multi-row) INSERT where each row's encrypted columns
/// are wrapped with that row's own bound key.
///
/// Fails with [`CryptError::MissingKey`] before anything reaches the
/// database if any model with encrypted columns carries no key.
pub(crate) fn build_insert<E>(models: &[E::Model]) -> Result<InsertStatement, CryptError>
where
    E: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
    E::Model: EncryptedModel,
{
    let mut stmt = Query::insert();
    stmt.into_table(E::default().table_ref());
    let columns: Vec<E::Column> = E::Column::iter().collect();
    stmt.columns(columns.clone());
    for model in models {
        if model.bound_key().is_none() {
            if let Some(field) = first_encrypted::<E>() {
                return Err(CryptError::MissingKey {
                    field: field.to_owned(),
                });
            }
        }
        let ctx = ExprCtx::<E>::new(model.bound_key());
        let row: Vec<SimpleExpr> = columns
            .iter()
            .map(|col| ctx.write_value(*col, model.get(*col)))
            .collect();
        stmt.values(row)?;
    }
    Ok(stmt)
}

/// Build an UPDATE of all non-primary-key columns of `model`, addressed by
/// its primary key, under `key`.
pub(crate) fn build_update<E>(
    model: &E::Model,
    key: Option<&EncryptionKey>,
) -> Result<UpdateStatement, CryptError>
where
    E: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
    E::Model: EncryptedModel,
{
    if key.is_none() {
        if let Some(field) = first_encrypted::<E>() {
            return Err(CryptError::MissingKey {
                field: field.to_owned(),
            });
        }
    }
    let ctx = ExprCtx::<E>::new(key);
    let pk_cols: Vec<E::Column> = E::PrimaryKey::iter()
        .map(PrimaryKeyToColumn::into_column)
        .collect();
    let is_pk = |col: &E::Column| {
        pk_cols
            .iter()
            .any(|pk| std::mem::discriminant(pk) == std::mem::discriminant(col))
    };

    let mut stmt = Query::update();
    stmt.table(E::default().table_ref());
    for col in E::Column::iter() {
        if is_pk(&col) {
            continue;
        }
        stmt.value(col, ctx.write_value(col, model.get(col)));
    }
    for pk in pk_cols {
        stmt.and_where(
            Expr::col((Alias::new(E::default().table_name()), pk)).eq(Expr::value(model.get(pk))),
        );
    }
    Ok(stmt)
}
