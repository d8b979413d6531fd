//! In-memory key store for the session engine
//!
//! Keys live under a composite `(application id, keyset number, key number)`
//! tuple. The active application is always passed explicitly; the store holds
//! no ambient "current AID" state.

use std::collections::HashMap;

use crate::key::{DesfireKey, KeyType};

type Slot = (u32, u8, u8);

/// Key material indexed by application, keyset and key number
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    keys: HashMap<Slot, DesfireKey>,
}

impl KeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key. Material length is not validated here.
    pub fn set_key(&mut self, aid: u32, keyset: u8, key_no: u8, key: DesfireKey) {
        self.keys.insert((aid, keyset, key_no), key);
    }

    /// Look up a key, falling back to the all-zero DES factory key when the
    /// slot is unoccupied. Callers can test the result with `is_empty`.
    pub fn get(&self, aid: u32, keyset: u8, key_no: u8) -> DesfireKey {
        self.keys
            .get(&(aid, keyset, key_no))
            .cloned()
            .unwrap_or_else(|| DesfireKey::default_key(KeyType::Des))
    }

    /// Look up a key without the default fallback
    pub fn find(&self, aid: u32, keyset: u8, key_no: u8) -> Option<&DesfireKey> {
        self.keys.get(&(aid, keyset, key_no))
    }

    /// Remove every key. Called before an authentication attempt so no stale
    /// key survives an application switch.
    pub fn clear(&mut self) {
        self.keys.clear();
    }

    /// Set keys `0..nb_keys` of one keyset to copies of `key`
    pub fn fill_keyset(&mut self, aid: u32, keyset: u8, nb_keys: u8, key: &DesfireKey) {
        for key_no in 0..nb_keys {
            self.keys.insert((aid, keyset, key_no), key.clone());
        }
    }

    /// Clone every key of `src_keyset` into `dst_keyset`, preserving per-key
    /// crypto-method overrides. The key count is taken as the highest key
    /// number seen under the source keyset plus one.
    pub fn duplicate_key_set(&mut self, aid: u32, src_keyset: u8, dst_keyset: u8) {
        let max_key_no = self
            .keys
            .keys()
            .filter(|(a, ks, _)| *a == aid && *ks == src_keyset)
            .map(|(_, _, key_no)| *key_no)
            .max();

        let Some(max_key_no) = max_key_no else {
            return;
        };

        for key_no in 0..=max_key_no {
            if let Some(key) = self.keys.get(&(aid, src_keyset, key_no)).cloned() {
                self.keys.insert((aid, dst_keyset, key_no), key);
            }
        }
    }

    /// Retag every key of a keyset with a new crypto method
    pub fn set_keyset_key_type(&mut self, aid: u32, keyset: u8, key_type: KeyType) {
        for ((a, ks, _), key) in self.keys.iter_mut() {
            if *a == aid && *ks == keyset {
                key.set_key_type(key_type);
            }
        }
    }

    /// Number of stored keys, across all applications
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store holds no keys at all
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
