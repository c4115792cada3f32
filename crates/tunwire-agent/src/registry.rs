//! Registry of live tunnels keyed by their one-byte id

use std::collections::BTreeMap;
use thiserror::Error;
use tunwire_proto::{TunnelId, NO_TUNNEL_ID};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tunnel id {0:#04x} is already in use")]
    DuplicateId(TunnelId),

    #[error("Tunnel id {0:#04x} is reserved")]
    ReservedId(TunnelId),
}

/// Ordered collection of live entries, at most one per id
///
/// Owned by the event loop; never shared across tasks.
pub struct Registry<T> {
    entries: BTreeMap<TunnelId, T>,
    /// Last id handed out by `generate_id`
    last_generated: TunnelId,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            last_generated: NO_TUNNEL_ID,
        }
    }

    pub fn lookup(&self, id: TunnelId) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn lookup_mut(&mut self, id: TunnelId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: TunnelId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Register `entry` under `id`
    ///
    /// Refuses ids already present and the reserved sentinel, so two entries
    /// can never share an id.
    pub fn insert(&mut self, id: TunnelId, entry: T) -> Result<(), RegistryError> {
        if id == NO_TUNNEL_ID {
            return Err(RegistryError::ReservedId(id));
        }
        if self.entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn remove(&mut self, id: TunnelId) -> Option<T> {
        self.entries.remove(&id)
    }

    /// Pick an unused id, round-robin from the last one handed out
    ///
    /// Returns `None` (the wire's `0xFF`) only when all 255 usable ids are taken.
    pub fn generate_id(&mut self) -> Option<TunnelId> {
        let mut candidate = self.last_generated;

        for _ in 0..=u8::MAX {
            candidate = candidate.wrapping_add(1);
            if candidate == NO_TUNNEL_ID {
                continue;
            }
            if !self.entries.contains_key(&candidate) {
                self.last_generated = candidate;
                return Some(candidate);
            }
        }

        None
    }

    pub fn ids(&self) -> Vec<TunnelId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TunnelId, &T)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let mut registry = Registry::new();

        registry.insert(0x01, "a").unwrap();
        assert_eq!(registry.lookup(0x01), Some(&"a"));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.remove(0x01), Some("a"));
        assert_eq!(registry.remove(0x01), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_and_reserved_ids_rejected() {
        let mut registry = Registry::new();
        registry.insert(0x05, 1).unwrap();

        assert_eq!(
            registry.insert(0x05, 2),
            Err(RegistryError::DuplicateId(0x05))
        );
        assert_eq!(
            registry.insert(NO_TUNNEL_ID, 3),
            Err(RegistryError::ReservedId(NO_TUNNEL_ID))
        );
        assert_eq!(registry.lookup(0x05), Some(&1));
    }

    #[test]
    fn test_generate_id_is_round_robin() {
        let mut registry = Registry::new();

        let first = registry.generate_id().unwrap();
        assert_eq!(first, 0x00);
        registry.insert(first, ()).unwrap();

        let second = registry.generate_id().unwrap();
        assert_eq!(second, 0x01);

        // freeing the first id does not make it the next choice
        registry.remove(first);
        assert_eq!(registry.generate_id(), Some(0x02));
    }

    #[test]
    fn test_generate_id_skips_live_ids() {
        let mut registry = Registry::new();
        registry.insert(0x00, ()).unwrap();
        registry.insert(0x01, ()).unwrap();
        registry.insert(0x02, ()).unwrap();

        let id = registry.generate_id().unwrap();
        assert_eq!(id, 0x03);
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_generate_id_wraps_and_never_returns_sentinel() {
        let mut registry: Registry<()> = Registry::new();

        for _ in 0..0xFE {
            registry.generate_id().unwrap();
        }
        // last handed out is 0xFD
        assert_eq!(registry.generate_id(), Some(0xFE));
        // next is not 0xFF but wraps around to 0x00
        assert_eq!(registry.generate_id(), Some(0x00));
    }

    #[test]
    fn test_generate_id_exhaustion() {
        let mut registry = Registry::new();
        for id in 0x00..=0xFE {
            registry.insert(id, ()).unwrap();
        }

        assert_eq!(registry.generate_id(), None);

        // a single free id is found wherever it is, even the last one handed out
        registry.remove(0x80);
        assert_eq!(registry.generate_id(), Some(0x80));
        registry.insert(0x80, ()).unwrap();
        registry.remove(0x80);
        assert_eq!(registry.generate_id(), Some(0x80));
    }
}
