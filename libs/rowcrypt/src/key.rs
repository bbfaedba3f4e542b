use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// An opaque symmetric encryption key.
///
/// The key material is held in a [`SecretString`], so it is zeroized on drop
/// and redacted from `Debug` output. It only leaves the wrapper at statement
/// build time, as a bound SQL parameter — never interpolated into SQL text,
/// never logged.
#[derive(Clone)]
pub struct EncryptionKey(SecretString);

impl EncryptionKey {
    /// Wrap raw key material.
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    /// Expose the raw key material for binding as a SQL parameter.
    pub(crate) fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for EncryptionKey {}

impl From<&str> for EncryptionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for EncryptionKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl From<&EncryptionKey> for EncryptionKey {
    fn from(key: &EncryptionKey) -> Self {
        key.clone()
    }
}

/// Per-instance key carrier.
///
/// Declared on an encrypted model as a non-persisted field:
///
/// ```ignore
/// #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
/// #[sea_orm(table_name = "books")]
/// pub struct Model {
///     #[sea_orm(primary_key, auto_increment = false)]
///     pub id: Uuid,
///     pub title: String,
///     #[sea_orm(ignore)]
///     pub key: KeySlot,
/// }
/// ```
///
/// The slot starts unbound (`Default`), is filled at construction
/// (`KeySlot::bound`), at hydration time (copied from the key scope active
/// during the fetch that produced the row), or explicitly at save time.
#[derive(Clone, Default)]
pub struct KeySlot(Option<EncryptionKey>);

impl KeySlot {
    /// A slot already carrying a key, for construction-with-key.
    pub fn bound(key: impl Into<EncryptionKey>) -> Self {
        Self(Some(key.into()))
    }

    /// Bind a key, replacing any previous one. Rebinding is idempotent.
    pub fn bind(&mut self, key: EncryptionKey) {
        self.0 = Some(key);
    }

    /// The bound key, if any.
    #[must_use]
    pub fn key(&self) -> Option<&EncryptionKey> {
        self.0.as_ref()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.0.is_some()
    }
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bound() {
            f.write_str("KeySlot(bound)")
        } else {
            f.write_str("KeySlot(unbound)")
        }
    }
}

// The slot is not part of row identity: two models hydrated from the same
// row compare equal regardless of which scope produced them.
impl PartialEq for KeySlot {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for KeySlot {}
