//! Connection-scoped key binding.
//!
//! A [`KeyState`] lives on each connection wrapper and holds the key that is
//! authoritative while a terminal operation runs. Scopes are re-entrant:
//! entering while a key is already bound yields a pass-through guard and the
//! existing key stays authoritative for the nested operation. This is what
//! lets a related-entity fetch or a composite get-or-create run its inner
//! queries under the key of the operation that started them.
//!
//! Release is structural: the key is unbound when the outermost guard drops,
//! on every exit path — normal return, error, or cancellation of the wrapped
//! future. The internal lock is only held for the enter/exit instants, never
//! across an await point.

use std::sync::{Mutex, MutexGuard};

use crate::key::EncryptionKey;

#[derive(Debug, Default)]
pub(crate) struct KeyState {
    slot: Mutex<Option<EncryptionKey>>,
}

impl KeyState {
    fn lock(&self) -> MutexGuard<'_, Option<EncryptionKey>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open a key scope.
    ///
    /// If a key is already bound, the returned guard is a pass-through: it
    /// does nothing on drop and the bound key stays authoritative. A nested
    /// enter with a different key defers to the outer key; this is reported
    /// through a warning because the inner operation's own key is ignored.
    ///
    /// Entering without a key binds nothing, so a later keyed enter on the
    /// same connection may still bind.
    pub(crate) fn enter(&self, key: Option<&EncryptionKey>) -> KeyScope<'_> {
        let mut slot = self.lock();
        if let Some(active) = slot.as_ref() {
            if key.is_some_and(|k| k != active) {
                tracing::warn!(
                    "nested key scope requested with a different key; \
                     the outer key stays authoritative"
                );
            }
            return KeyScope {
                state: self,
                bound: false,
            };
        }
        match key {
            Some(key) => {
                *slot = Some(key.clone());
                KeyScope {
                    state: self,
                    bound: true,
                }
            }
            None => KeyScope {
                state: self,
                bound: false,
            },
        }
    }

    /// The key currently authoritative for this connection, if any.
    pub(crate) fn active_key(&self) -> Option<EncryptionKey> {
        self.lock().clone()
    }
}

/// Guard for an open key scope. Dropping the outermost guard unbinds the key.
#[must_use = "dropping the scope guard unbinds the key"]
pub(crate) struct KeyScope<'a> {
    state: &'a KeyState,
    bound: bool,
}

impl Drop for KeyScope<'_> {
    fn drop(&mut self) {
        if self.bound {
            *self.state.lock() = None;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn enter_binds_and_drop_unbinds() {
        let state = KeyState::default();
        assert!(state.active_key().is_none());

        let scope = state.enter(Some(&EncryptionKey::new("k")));
        assert_eq!(state.active_key().unwrap(), EncryptionKey::new("k"));

        drop(scope);
        assert!(state.active_key().is_none());
    }

    #[test]
    fn reentrant_enter_is_a_pass_through() {
        let state = KeyState::default();
        let outer = state.enter(Some(&EncryptionKey::new("outer")));

        {
            let inner = state.enter(Some(&EncryptionKey::new("outer")));
            assert_eq!(state.active_key().unwrap(), EncryptionKey::new("outer"));
            drop(inner);
        }

        // The inner exit must not have unbound the outer key.
        assert_eq!(state.active_key().unwrap(), EncryptionKey::new("outer"));
        drop(outer);
        assert!(state.active_key().is_none());
    }

    #[test]
    fn nested_enter_with_different_key_defers_to_outer() {
        let state = KeyState::default();
        let outer = state.enter(Some(&EncryptionKey::new("outer")));

        let inner = state.enter(Some(&EncryptionKey::new("inner")));
        assert_eq!(state.active_key().unwrap(), EncryptionKey::new("outer"));
        drop(inner);
        assert_eq!(state.active_key().unwrap(), EncryptionKey::new("outer"));

        drop(outer);
        assert!(state.active_key().is_none());
    }

    #[test]
    fn unkeyed_enter_binds_nothing() {
        let state = KeyState::default();
        let outer = state.enter(None);
        assert!(state.active_key().is_none());

        // A keyed enter nested in an unkeyed one may still bind.
        let inner = state.enter(Some(&EncryptionKey::new("k")));
        assert_eq!(state.active_key().unwrap(), EncryptionKey::new("k"));
        drop(inner);
        assert!(state.active_key().is_none());

        drop(outer);
        assert!(state.active_key().is_none());
    }

    #[test]
    fn scope_releases_on_unwind() {
        let state = KeyState::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = state.enter(Some(&EncryptionKey::new("k")));
            panic!("operation failed mid-scope");
        }));
        assert!(result.is_err());
        assert!(state.active_key().is_none());
    }
}
