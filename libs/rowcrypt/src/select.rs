//! Key-bound query handles.
//!
//! A [`KeyedSelect`] wraps a `SeaORM` `Select` together with an optional
//! encryption key and the encrypted-column operations that can only be
//! compiled once the effective key is known. Chained builder calls stay
//! lazy and never open a key scope; only terminal operations do.
//!
//! Cloning a handle preserves the key, so the key survives an arbitrary
//! chain of lazy calls before the terminal call executes.

use sea_orm::sea_query::{Expr, Func};
use sea_orm::{
    ColumnTrait, Condition, DbBackend, EntityTrait, FromQueryResult, IdenStatic, Iterable,
    ModelTrait, Order, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, QueryTrait, Related,
    Statement, Value,
};

use crate::conn::CryptoConn;
use crate::entity::{check_entity, EncryptedEntity, EncryptedModel};
use crate::error::CryptError;
use crate::expr::ExprCtx;
use crate::key::EncryptionKey;

/// A builder call on an encrypted column, recorded until the effective key
/// is known at terminal time.
#[derive(Clone, Debug)]
pub(crate) enum PendingOp<E: EntityTrait> {
    FilterEq(E::Column, Value),
    FilterLike(E::Column, String),
    OrderBy(E::Column, Order),
}

/// Compile one pending filter into a condition; `None` for ordering ops.
pub(crate) fn pending_condition<E>(op: &PendingOp<E>, ctx: &ExprCtx<'_, E>) -> Option<Condition>
where
    E: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
{
    match op {
        PendingOp::FilterEq(col, value) => {
            Some(Condition::all().add(Expr::expr(ctx.col(*col)).eq(Expr::value(value.clone()))))
        }
        PendingOp::FilterLike(col, pattern) => {
            Some(Condition::all().add(Expr::expr(ctx.col(*col)).like(pattern.as_str())))
        }
        PendingOp::OrderBy(..) => None,
    }
}

fn apply_pending<Q, E>(mut query: Q, ctx: &ExprCtx<'_, E>, pending: &[PendingOp<E>]) -> Q
where
    Q: QueryFilter + QueryOrder,
    E: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
{
    for op in pending {
        if let Some(cond) = pending_condition(op, ctx) {
            query = QueryFilter::filter(query, cond);
        } else if let PendingOp::OrderBy(col, order) = op {
            query = QueryOrder::order_by(query, ctx.col(*col), order.clone());
        }
    }
    query
}

/// Replace the select list so every encrypted column reads through its
/// decrypt expression. Aliases keep the column names the model hydration
/// expects; `prefix` carries the combined-query prefixes (`A_`/`B_`).
fn rewrite_columns<Q, E>(mut query: Q, ctx: &ExprCtx<'_, E>, prefix: &str) -> Q
where
    Q: QuerySelect,
    E: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
{
    for col in E::Column::iter() {
        let alias = format!("{prefix}{}", col.as_str());
        query = QuerySelect::expr_as(query, ctx.col(col), alias);
    }
    query
}

/// A lazy, cloneable query handle carrying an optional encryption key.
#[must_use]
#[derive(Clone, Debug)]
pub struct KeyedSelect<E: EntityTrait> {
    inner: sea_orm::Select<E>,
    key: Option<EncryptionKey>,
    pending: Vec<PendingOp<E>>,
}

/// Entry points turning a `SeaORM` `Select` into a keyed handle.
pub trait SelectKeyExt<E: EntityTrait>: Sized {
    /// Bind `key` to this query. Every terminal operation on the returned
    /// handle decrypts and encrypts under it.
    fn with_key(self, key: impl Into<EncryptionKey>) -> KeyedSelect<E>;

    /// A handle without a key. Encrypted columns still compile to valid SQL
    /// with an empty key parameter, which the database rejects at execution
    /// time — unscoped reads fail loudly rather than silently.
    fn without_key(self) -> KeyedSelect<E>;
}

impl<E> SelectKeyExt<E> for sea_orm::Select<E>
where
    E: EncryptedEntity,
{
    fn with_key(self, key: impl Into<EncryptionKey>) -> KeyedSelect<E> {
        KeyedSelect {
            inner: self,
            key: Some(key.into()),
            pending: Vec::new(),
        }
    }

    fn without_key(self) -> KeyedSelect<E> {
        KeyedSelect {
            inner: self,
            key: None,
            pending: Vec::new(),
        }
    }
}

impl<E> KeyedSelect<E>
where
    E: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
{
    pub(crate) fn from_parts(inner: sea_orm::Select<E>, key: Option<EncryptionKey>) -> Self {
        Self {
            inner,
            key,
            pending: Vec::new(),
        }
    }

    pub(crate) fn key(&self) -> Option<&EncryptionKey> {
        self.key.as_ref()
    }

    /// Add a plain condition. Encrypted columns must go through
    /// [`KeyedSelect::filter_eq`] and friends so their references are
    /// rewritten with the scoped key.
    pub fn filter(mut self, cond: Condition) -> Self {
        self.inner = QueryFilter::filter(self.inner, cond);
        self
    }

    /// Exact-match filter. For an encrypted column this compiles to
    /// `pgp_sym_decrypt(col, $key)::<type> = $value`, so filtering follows
    /// plaintext semantics.
    pub fn filter_eq(mut self, col: E::Column, value: impl Into<Value>) -> Self {
        self.pending.push(PendingOp::FilterEq(col, value.into()));
        self
    }

    /// Substring filter (`LIKE '%value%'`) with plaintext semantics.
    pub fn filter_contains(mut self, col: E::Column, value: &str) -> Self {
        self.pending
            .push(PendingOp::FilterLike(col, format!("%{value}%")));
        self
    }

    /// Raw `LIKE` pattern filter with plaintext semantics.
    pub fn filter_like(mut self, col: E::Column, pattern: impl Into<String>) -> Self {
        self.pending
            .push(PendingOp::FilterLike(col, pattern.into()));
        self
    }

    /// Order by a column; encrypted columns order by their decrypted value.
    pub fn order_by(mut self, col: E::Column, order: Order) -> Self {
        self.pending.push(PendingOp::OrderBy(col, order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.inner = QuerySelect::limit(self.inner, limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.inner = QuerySelect::offset(self.inner, offset);
        self
    }

    /// Compile the handle against `key`: apply the recorded encrypted-column
    /// operations and rewrite the select list for decrypt-on-read.
    fn compile(&self, key: Option<&EncryptionKey>) -> sea_orm::Select<E> {
        let ctx = ExprCtx::<E>::new(key);
        let query = apply_pending(self.inner.clone(), &ctx, &self.pending);
        if E::encrypted_columns().is_empty() {
            return query;
        }
        rewrite_columns(QuerySelect::select_only(query), &ctx, "")
    }

    /// Render the statement this handle would execute under its own key.
    ///
    /// Diagnostic surface: the SQL never contains key material, which is
    /// always a bound parameter.
    pub fn build(&self, backend: DbBackend) -> Statement {
        self.compile(self.key.as_ref()).build(backend)
    }

    /// Fetch all rows. Hydrated models remember the key that was effective
    /// during the fetch.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure, including decrypt
    /// rejections under a wrong or missing key.
    pub async fn all(self, conn: &CryptoConn) -> Result<Vec<E::Model>, CryptError>
    where
        E::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        let scope = conn.key_state().enter(self.key.as_ref());
        let effective = conn.key_state().active_key();
        let result = self.compile(effective.as_ref()).all(conn.db()).await;
        drop(scope);
        let mut models = result?;
        if let Some(key) = effective {
            for model in &mut models {
                model.bind_key(key.clone());
            }
        }
        Ok(models)
    }

    /// Fetch at most one row.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure.
    pub async fn one(self, conn: &CryptoConn) -> Result<Option<E::Model>, CryptError>
    where
        E::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        let scope = conn.key_state().enter(self.key.as_ref());
        let effective = conn.key_state().active_key();
        let result = self.compile(effective.as_ref()).one(conn.db()).await;
        drop(scope);
        let mut model = result?;
        if let (Some(key), Some(model)) = (effective, model.as_mut()) {
            model.bind_key(key.clone());
        }
        Ok(model)
    }

    /// Count matching rows.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure.
    pub async fn count(self, conn: &CryptoConn) -> Result<u64, CryptError>
    where
        E::Model: FromQueryResult + Send + Sync,
    {
        check_entity::<E>()?;
        let scope = conn.key_state().enter(self.key.as_ref());
        let effective = conn.key_state().active_key();
        let result = self.compile(effective.as_ref()).count(conn.db()).await;
        drop(scope);
        Ok(result?)
    }

    /// Whether any row matches.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure.
    pub async fn exists(self, conn: &CryptoConn) -> Result<bool, CryptError>
    where
        E::Model: EncryptedModel,
    {
        Ok(self.limit(1).one(conn).await?.is_some())
    }

    /// Maximum of a column under plaintext semantics (`MAX` over the
    /// decrypted value for encrypted columns).
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure.
    pub async fn max_of(
        self,
        col: E::Column,
        conn: &CryptoConn,
    ) -> Result<Option<String>, CryptError> {
        self.aggregate(Agg::Max, col, conn).await
    }

    /// Minimum of a column under plaintext semantics.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure.
    pub async fn min_of(
        self,
        col: E::Column,
        conn: &CryptoConn,
    ) -> Result<Option<String>, CryptError> {
        self.aggregate(Agg::Min, col, conn).await
    }

    async fn aggregate(
        self,
        agg: Agg,
        col: E::Column,
        conn: &CryptoConn,
    ) -> Result<Option<String>, CryptError> {
        check_entity::<E>()?;
        let scope = conn.key_state().enter(self.key.as_ref());
        let effective = conn.key_state().active_key();
        let ctx = ExprCtx::<E>::new(effective.as_ref());
        let query = apply_pending(self.inner.clone(), &ctx, &self.pending);
        let call = match agg {
            Agg::Max => Func::max(ctx.col(col)),
            Agg::Min => Func::min(ctx.col(col)),
        };
        let query = QuerySelect::expr_as(QuerySelect::select_only(query), call, "value");
        let result = query
            .into_tuple::<Option<String>>()
            .one(conn.db())
            .await;
        drop(scope);
        Ok(result?.flatten())
    }

    /// Eager-load an optional related row (LEFT JOIN, one round trip).
    /// The related entity decrypts under the same key.
    pub fn find_also_related<R>(self, rel: R) -> KeyedSelectTwo<E, R>
    where
        R: EncryptedEntity,
        R::Column: ColumnTrait + Copy,
        E: Related<R>,
    {
        KeyedSelectTwo {
            inner: self.inner.find_also_related(rel),
            key: self.key,
            pending: self.pending,
            rel_pending: Vec::new(),
        }
    }

    /// Eager-load all related rows (one joined round trip, consolidated).
    /// The related entity decrypts under the same key.
    pub fn find_with_related<R>(self, rel: R) -> KeyedSelectTwoMany<E, R>
    where
        R: EncryptedEntity,
        R::Column: ColumnTrait + Copy,
        E: Related<R>,
    {
        KeyedSelectTwoMany {
            inner: self.inner.find_with_related(rel),
            key: self.key,
            pending: self.pending,
            rel_pending: Vec::new(),
        }
    }
}

#[derive(Clone, Copy)]
enum Agg {
    Max,
    Min,
}

/// Keyed form of `SeaORM`'s `SelectTwo` (entity plus optional related row).
#[must_use]
#[derive(Clone, Debug)]
pub struct KeyedSelectTwo<E: EntityTrait, R: EntityTrait> {
    inner: sea_orm::SelectTwo<E, R>,
    key: Option<EncryptionKey>,
    pending: Vec<PendingOp<E>>,
    rel_pending: Vec<PendingOp<R>>,
}

impl<E, R> KeyedSelectTwo<E, R>
where
    E: EncryptedEntity,
    R: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
    R::Column: ColumnTrait + Copy,
{
    /// Exact-match filter on the related entity, with plaintext semantics.
    pub fn filter_related_eq(mut self, col: R::Column, value: impl Into<Value>) -> Self {
        self.rel_pending.push(PendingOp::FilterEq(col, value.into()));
        self
    }

    /// Order by a column of the primary entity.
    pub fn order_by(mut self, col: E::Column, order: Order) -> Self {
        self.pending.push(PendingOp::OrderBy(col, order));
        self
    }

    fn compile(&self, key: Option<&EncryptionKey>) -> sea_orm::SelectTwo<E, R> {
        let ctx = ExprCtx::<E>::new(key);
        let rel_ctx = ExprCtx::<R>::new(key);
        let query = apply_pending(self.inner.clone(), &ctx, &self.pending);
        let query = apply_pending(query, &rel_ctx, &self.rel_pending);
        if E::encrypted_columns().is_empty() && R::encrypted_columns().is_empty() {
            return query;
        }
        // Combined queries hydrate through the A_/B_ column prefixes.
        let query = rewrite_columns(QuerySelect::select_only(query), &ctx, "A_");
        rewrite_columns(query, &rel_ctx, "B_")
    }

    /// Render the statement this handle would execute under its own key.
    pub fn build(&self, backend: DbBackend) -> Statement {
        self.compile(self.key.as_ref()).build(backend)
    }

    /// Fetch all rows with their optional related row in one round trip.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure.
    pub async fn all(
        self,
        conn: &CryptoConn,
    ) -> Result<Vec<(E::Model, Option<R::Model>)>, CryptError>
    where
        E::Model: EncryptedModel,
        R::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        check_entity::<R>()?;
        let scope = conn.key_state().enter(self.key.as_ref());
        let effective = conn.key_state().active_key();
        let result = self.compile(effective.as_ref()).all(conn.db()).await;
        drop(scope);
        let mut rows = result?;
        if let Some(key) = effective {
            for (model, related) in &mut rows {
                model.bind_key(key.clone());
                if let Some(related) = related {
                    related.bind_key(key.clone());
                }
            }
        }
        Ok(rows)
    }

    /// Fetch at most one row with its optional related row.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure.
    pub async fn one(
        self,
        conn: &CryptoConn,
    ) -> Result<Option<(E::Model, Option<R::Model>)>, CryptError>
    where
        E::Model: EncryptedModel,
        R::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        check_entity::<R>()?;
        let scope = conn.key_state().enter(self.key.as_ref());
        let effective = conn.key_state().active_key();
        let result = self.compile(effective.as_ref()).one(conn.db()).await;
        drop(scope);
        let mut row = result?;
        if let (Some(key), Some((model, related))) = (effective, row.as_mut()) {
            model.bind_key(key.clone());
            if let Some(related) = related {
                related.bind_key(key.clone());
            }
        }
        Ok(row)
    }
}

/// Keyed form of `SeaORM`'s `SelectTwoMany` (entity plus all related rows).
#[must_use]
#[derive(Clone, Debug)]
pub struct KeyedSelectTwoMany<E: EntityTrait, R: EntityTrait> {
    inner: sea_orm::SelectTwoMany<E, R>,
    key: Option<EncryptionKey>,
    pending: Vec<PendingOp<E>>,
    rel_pending: Vec<PendingOp<R>>,
}

impl<E, R> KeyedSelectTwoMany<E, R>
where
    E: EncryptedEntity,
    R: EncryptedEntity,
    E::Column: ColumnTrait + Copy,
    R::Column: ColumnTrait + Copy,
{
    /// Exact-match filter on the related entity, with plaintext semantics.
    pub fn filter_related_eq(mut self, col: R::Column, value: impl Into<Value>) -> Self {
        self.rel_pending.push(PendingOp::FilterEq(col, value.into()));
        self
    }

    /// Order by a column of the primary entity.
    pub fn order_by(mut self, col: E::Column, order: Order) -> Self {
        self.pending.push(PendingOp::OrderBy(col, order));
        self
    }

    fn compile(&self, key: Option<&EncryptionKey>) -> sea_orm::SelectTwoMany<E, R> {
        let ctx = ExprCtx::<E>::new(key);
        let rel_ctx = ExprCtx::<R>::new(key);
        let query = apply_pending(self.inner.clone(), &ctx, &self.pending);
        let query = apply_pending(query, &rel_ctx, &self.rel_pending);
        if E::encrypted_columns().is_empty() && R::encrypted_columns().is_empty() {
            return query;
        }
        let query = rewrite_columns(QuerySelect::select_only(query), &ctx, "A_");
        rewrite_columns(query, &rel_ctx, "B_")
    }

    /// Render the statement this handle would execute under its own key.
    pub fn build(&self, backend: DbBackend) -> Statement {
        self.compile(self.key.as_ref()).build(backend)
    }

    /// Fetch all rows, each with its related rows, in one round trip.
    ///
    /// # Errors
    /// Returns [`CryptError::Db`] on query failure.
    pub async fn all(
        self,
        conn: &CryptoConn,
    ) -> Result<Vec<(E::Model, Vec<R::Model>)>, CryptError>
    where
        E::Model: EncryptedModel,
        R::Model: EncryptedModel,
    {
        check_entity::<E>()?;
        check_entity::<R>()?;
        let scope = conn.key_state().enter(self.key.as_ref());
        let effective = conn.key_state().active_key();
        let result = self.compile(effective.as_ref()).all(conn.db()).await;
        drop(scope);
        let mut rows = result?;
        if let Some(key) = effective {
            for (model, related) in &mut rows {
                model.bind_key(key.clone());
                for related in related {
                    related.bind_key(key.clone());
                }
            }
        }
        Ok(rows)
    }
}

/// Related-entity queries from a hydrated model, reusing its remembered key.
///
/// ```ignore
/// let author: author::Model = conn.find::<author::Entity>(key).one(&conn).await?.unwrap();
/// let books = author.find_related_with_key(book::Entity).all(&conn).await?;
/// ```
pub trait FindRelatedKeyExt: EncryptedModel {
    /// Build a keyed select for entities related to this model, bound to
    /// the key this model was hydrated (or constructed) with.
    fn find_related_with_key<R>(&self, rel: R) -> KeyedSelect<R>
    where
        R: EncryptedEntity,
        R::Column: ColumnTrait + Copy,
        Self::Entity: Related<R>;
}

impl<M> FindRelatedKeyExt for M
where
    M: EncryptedModel,
{
    fn find_related_with_key<R>(&self, rel: R) -> KeyedSelect<R>
    where
        R: EncryptedEntity,
        R::Column: ColumnTrait + Copy,
        Self::Entity: Related<R>,
    {
        KeyedSelect::from_parts(self.find_related(rel), self.bound_key().cloned())
    }
}
