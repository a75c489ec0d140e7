//! Known parties: names, node endpoints and verifying keys.

use diamondchain_protocols::{KeyRing, SigningError};
use diamondchain_types::PartyName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{OrchestrationError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyEntry {
    pub name: PartyName,
    /// Base URL of the party's node, absent for parties reached in-process
    pub endpoint: Option<String>,
    /// Hex-encoded ed25519 verifying key
    pub verifying_key: String,
}

/// Network map as seen by one node
#[derive(Debug, Clone)]
pub struct PartyDirectory {
    local: PartyName,
    notary: PartyName,
    entries: BTreeMap<PartyName, PartyEntry>,
}

impl PartyDirectory {
    pub fn new(local: PartyName, notary: PartyName) -> Self {
        Self {
            local,
            notary,
            entries: BTreeMap::new(),
        }
    }

    pub fn with_party(mut self, entry: PartyEntry) -> Self {
        self.insert(entry);
        self
    }

    pub fn insert(&mut self, entry: PartyEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn local(&self) -> &PartyName {
        &self.local
    }

    pub fn notary(&self) -> &PartyName {
        &self.notary
    }

    pub fn contains(&self, party: &PartyName) -> bool {
        self.entries.contains_key(party)
    }

    pub fn get(&self, party: &PartyName) -> Option<&PartyEntry> {
        self.entries.get(party)
    }

    pub fn endpoint(&self, party: &PartyName) -> Result<&str> {
        self.entries
            .get(party)
            .and_then(|e| e.endpoint.as_deref())
            .ok_or_else(|| OrchestrationError::UnknownParty(party.clone()))
    }

    /// Counterparties a caller may transact with: everyone except this node
    /// and the notary.
    pub fn known_parties(&self) -> Vec<PartyName> {
        self.entries
            .keys()
            .filter(|p| **p != self.local && **p != self.notary)
            .cloned()
            .collect()
    }

    /// Remote endpoints worth health checking.
    pub fn endpoints(&self) -> Vec<(PartyName, String)> {
        self.entries
            .values()
            .filter(|e| e.name != self.local)
            .filter_map(|e| e.endpoint.clone().map(|url| (e.name.clone(), url)))
            .collect()
    }

    pub fn key_ring(&self) -> std::result::Result<KeyRing, SigningError> {
        let mut ring = KeyRing::new();
        for entry in self.entries.values() {
            ring.insert_hex(entry.name.clone(), &entry.verifying_key)?;
        }
        Ok(ring)
    }
}
