//! The host side of the pairing relationship: one secret per card instance,
//! held in memory and replaced wholesale by the host.

use std::collections::HashMap;

use base64::prelude::*;
use cipher::Key;
use zeroize::Zeroize;

use crate::crypto::CardScp;
use crate::error::{Error, Result};

/// A pairing slot on a card: the derived 32-byte pairing key and the slot
/// index the card assigned.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct Pairing {
    pub key: [u8; 32],
    pub index: u8,
}

impl Pairing {
    pub(crate) fn scp_key(&self) -> &Key<CardScp> {
        Key::<CardScp>::from_slice(&self.key)
    }

    /// Serialized form exchanged with the host: base64(index || key).
    pub fn to_base64(&self) -> String {
        let mut raw = [0u8; 33];
        raw[0] = self.index;
        raw[1..].copy_from_slice(&self.key);
        BASE64_STANDARD.encode(raw)
    }

    pub fn from_base64(encoded: &str) -> Option<Self> {
        let raw = BASE64_STANDARD.decode(encoded).ok()?;
        let (index, key) = raw.split_first()?;
        Some(Self {
            key: key.try_into().ok()?,
            index: *index,
        })
    }
}

impl std::fmt::Debug for Pairing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pairing")
            .field("index", &self.index)
            .field("key", &"[redacted]")
            .finish()
    }
}

/// In-memory pairing table: hex instance UID to base64 pairing secret. At
/// most one entry per instance; `replace_all` discards every prior entry.
#[derive(Debug, Default)]
pub struct PairingStore {
    entries: HashMap<String, String>,
}

impl PairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table. Entries absent from `pairings` are dropped;
    /// there is no merging.
    pub fn replace_all(&mut self, pairings: HashMap<String, String>) {
        self.entries = pairings;
    }

    pub fn insert(&mut self, instance_uid: String, pairing: &Pairing) {
        self.entries.insert(instance_uid, pairing.to_base64());
    }

    pub fn remove(&mut self, instance_uid: &str) {
        self.entries.remove(instance_uid);
    }

    pub fn contains(&self, instance_uid: &str) -> bool {
        self.entries.contains_key(instance_uid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode the pairing for a card. `NoPairing` when the table has no
    /// entry, `InvalidPairingEncoding` when the stored secret is malformed.
    pub fn pairing_for(&self, instance_uid: &str) -> Result<Pairing> {
        let encoded = self.entries.get(instance_uid).ok_or_else(|| Error::NoPairing {
            instance_uid: instance_uid.to_owned(),
        })?;
        Pairing::from_base64(encoded).ok_or_else(|| Error::InvalidPairingEncoding {
            instance_uid: instance_uid.to_owned(),
        })
    }
}
