//! Session keys and the table that pairs connections.
//!
//! A peer announces a session key `K` and is filed under `reverse(K)`.
//! Frames it sends are looked up under `K` itself, which is where the peer
//! that announced `reverse(K)` was filed. Both sides must agree on the
//! reversed keys out of band; the relay never sees the two keys together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Reverse a session key by character, not by byte.
///
/// Keys are raw bytes. Each byte that is not part of valid UTF-8 counts as
/// one U+FFFD, so a non UTF-8 key reverses into a different byte string
/// than it would byte-wise, and its partner must announce that form.
pub fn reverse_key(key: &[u8]) -> Vec<u8> {
    let mut chars = Vec::with_capacity(key.len());
    for chunk in key.utf8_chunks() {
        chars.extend(chunk.valid().chars());
        chars.extend(chunk.invalid().iter().map(|_| char::REPLACEMENT_CHARACTER));
    }

    chars.into_iter().rev().collect::<String>().into_bytes()
}

/// Concurrent map from registration key to the connection filed under it.
///
/// Clones share the same underlying map. Operations on one key are
/// linearizable; the lock is never held across an await point.
pub struct SessionTable<V> {
    inner: Arc<Mutex<HashMap<Vec<u8>, V>>>,
}

impl<V> Clone for SessionTable<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Default for SessionTable<V> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
        }
    }
}

impl<V: Clone + PartialEq> SessionTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Vec<u8>, V>> {
        // a poisoned map is still structurally valid
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Entry currently stored under `key`.
    pub fn load(&self, key: &[u8]) -> Option<V> {
        self.lock().get(key).cloned()
    }

    /// Store `value` only if `key` is vacant.
    ///
    /// Returns the entry now under `key` and whether it is `value`.
    pub fn load_or_store(&self, key: &[u8], value: V) -> (V, bool) {
        let mut map = self.lock();
        if let Some(existing) = map.get(key) {
            return (existing.clone(), false);
        }
        map.insert(key.to_vec(), value.clone());
        (value, true)
    }

    /// Store `value` unconditionally, returning the entry it displaced.
    pub fn swap(&self, key: &[u8], value: V) -> Option<V> {
        self.lock().insert(key.to_vec(), value)
    }

    /// Remove `key` only while it still maps to `expected`.
    pub fn compare_and_delete(&self, key: &[u8], expected: &V) -> bool {
        let mut map = self.lock();
        match map.get(key) {
            Some(current) if current == expected => {
                map.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
