//! SQL expression rewriting for encrypted columns.
//!
//! Reads of an encrypted column compile to
//! `pgp_sym_decrypt("table"."col", $key)::<type>`, writes compile to
//! `pgp_sym_encrypt($value::text, $key)`. The plaintext and the key are
//! always bound parameters: keys may contain quotes, backticks, SQL
//! keywords, or format tokens without ever touching the SQL text.
//!
//! [`ExprCtx`] is the compiler context threaded through statement building.
//! It carries the key that is effective for the operation being compiled,
//! so every fragment of one statement (select list, predicates, ordering,
//! write values) resolves column references consistently.

use std::marker::PhantomData;

use sea_orm::sea_query::{Alias, Expr, Func, SimpleExpr};
use sea_orm::{EntityName, Value};

use crate::entity::{is_encrypted, EncryptedEntity};
use crate::key::EncryptionKey;

/// pgcrypto symmetric encryption, `(text, key) -> bytea`.
const ENCRYPT_FN: &str = "pgp_sym_encrypt";
/// pgcrypto symmetric decryption, `(bytea, key) -> text`.
const DECRYPT_FN: &str = "pgp_sym_decrypt";

/// Compiler context for one statement: the effective key plus the entity
/// whose columns are being referenced.
pub struct ExprCtx<'k, E> {
    key: Option<&'k EncryptionKey>,
    _entity: PhantomData<E>,
}

impl<'k, E> ExprCtx<'k, E>
where
    E: EncryptedEntity,
    E::Column: Copy,
{
    pub(crate) fn new(key: Option<&'k EncryptionKey>) -> Self {
        Self {
            key,
            _entity: PhantomData,
        }
    }

    pub(crate) fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// The key as a bound parameter. With no key in scope this binds an
    /// empty string: the SQL stays syntactically valid and the database
    /// rejects the decrypt at execution time.
    fn key_param(&self) -> SimpleExpr {
        let material = self.key.map(EncryptionKey::expose).unwrap_or("");
        Expr::val(material.to_owned()).into()
    }

    /// Table-qualified raw reference to a column, so the substitution stays
    /// unambiguous in joined queries.
    fn raw_col(col: E::Column) -> Expr {
        Expr::col((Alias::new(E::default().table_name()), col))
    }

    /// Read expression for a column: the decrypt call cast back to the
    /// declared logical type for encrypted columns, the plain column
    /// reference otherwise.
    pub fn col(&self, col: E::Column) -> SimpleExpr {
        if is_encrypted::<E>(col) {
            let call = Func::cust(Alias::new(DECRYPT_FN))
                .arg(Self::raw_col(col))
                .arg(self.key_param());
            Expr::expr(call).cast_as(Alias::new(E::cast_type(col)))
        } else {
            Self::raw_col(col).into()
        }
    }

    /// Write expression for a literal value destined for `col`.
    pub(crate) fn write_value(&self, col: E::Column, value: Value) -> SimpleExpr {
        if is_encrypted::<E>(col) {
            EncryptedValue {
                value,
                key: self.key,
            }
            .into_expr()
        } else {
            Expr::val(value).into()
        }
    }

    /// Re-encrypt an arbitrary expression tree for storage into `col`.
    ///
    /// The tree is wrapped, not evaluated: update-by-expression composes
    /// with [`ExprCtx::col`], so an expression referencing the column reads
    /// through decrypt and the whole result is encrypted again.
    pub(crate) fn write_expr(&self, col: E::Column, expr: SimpleExpr) -> SimpleExpr {
        if is_encrypted::<E>(col) {
            Func::cust(Alias::new(ENCRYPT_FN))
                .arg(Expr::expr(expr).cast_as(Alias::new("text")))
                .arg(self.key_param())
                .into()
        } else {
            expr
        }
    }
}

/// Write-time pairing of a plaintext value with the key, rendered as an
/// encrypt call with both operands bound. Understood only by the statement
/// compiler; it never appears on the model.
struct EncryptedValue<'k> {
    value: Value,
    key: Option<&'k EncryptionKey>,
}

impl EncryptedValue<'_> {
    fn into_expr(self) -> SimpleExpr {
        let material = self.key.map(EncryptionKey::expose).unwrap_or("");
        Func::cust(Alias::new(ENCRYPT_FN))
            .arg(Expr::val(self.value).cast_as(Alias::new("text")))
            .arg(Expr::val(material.to_owned()))
            .into()
    }
}
