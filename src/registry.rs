//! Concurrent index of live blobs.
//!
//! Two sharded maps: object id to payload, and external id to the same
//! payload. A guard from one map is never held while the other is touched,
//! so lookups on unrelated keys never contend and the two maps cannot
//! deadlock against each other.

use crate::error::{Error, Result};
use crate::object_id::{ExternalId, ObjectId};
use crate::payload::Payload;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Object id and external id maps over shared payloads.
#[derive(Debug, Default)]
pub struct Registry {
    objects: DashMap<ObjectId, Arc<Payload>>,
    externals: DashMap<ExternalId, Arc<Payload>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload under its object id and, if it has one, its
    /// external id.
    ///
    /// # Errors
    ///
    /// - [`Error::UserInputError`] if the external id is already taken.
    /// - [`Error::Invalid`] if the object id is already registered.
    ///
    /// Nothing is registered on error.
    pub fn insert(&self, payload: Payload) -> Result<Arc<Payload>> {
        let payload = Arc::new(payload);

        if let Some(external_id) = &payload.external_id {
            match self.externals.entry(external_id.clone()) {
                Entry::Occupied(_) => {
                    return Err(Error::UserInputError(format!(
                        "external id already exists: {external_id}"
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&payload));
                }
            }
        }

        let duplicate = match self.objects.entry(payload.object_id) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&payload));
                false
            }
        };
        if duplicate {
            if let Some(external_id) = &payload.external_id {
                self.externals.remove(external_id);
            }
            return Err(Error::Invalid(format!(
                "object id already exists: {}",
                payload.object_id
            )));
        }

        Ok(payload)
    }

    /// Look up a payload by object id.
    pub fn get(&self, id: ObjectId) -> Option<Arc<Payload>> {
        self.objects.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a payload by external id.
    pub fn get_external(&self, external_id: &ExternalId) -> Option<Arc<Payload>> {
        self.externals
            .get(external_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Is `id` registered?
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Is `external_id` registered?
    pub fn contains_external(&self, external_id: &ExternalId) -> bool {
        self.externals.contains_key(external_id)
    }

    /// Remove a payload and its external id entry.
    ///
    /// Returns `None` if the id was not registered. Concurrent removals of
    /// the same id see exactly one `Some`.
    pub fn remove(&self, id: ObjectId) -> Option<Arc<Payload>> {
        let (_, payload) = self.objects.remove(&id)?;
        if let Some(external_id) = &payload.external_id {
            self.externals
                .remove_if(external_id, |_, owner| owner.object_id == id);
        }
        Some(payload)
    }

    /// Snapshot of every registered object id.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered object ids.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Is nothing registered?
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of registered external ids.
    pub fn external_len(&self) -> usize {
        self.externals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(address: usize, size: usize) -> Payload {
        Payload::standalone(ObjectId::from_address(address), size, address, 3, 1 << 20, address)
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = Registry::new();
        let id = ObjectId::from_address(0x40);
        registry.insert(payload(0x40, 10)).unwrap();

        assert!(registry.contains(id));
        assert_eq!(registry.get(id).unwrap().data_size, 10);
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.object_id, id);
        assert!(!registry.contains(id));
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_external_entries_follow_object() {
        let registry = Registry::new();
        let external = ExternalId::new("ext");
        let id = ObjectId::from_address(0x80);
        registry
            .insert(payload(0x80, 8).with_external(external.clone(), 8))
            .unwrap();

        assert!(registry.contains_external(&external));
        assert_eq!(registry.get_external(&external).unwrap().object_id, id);

        registry.remove(id);
        assert!(!registry.contains_external(&external));
        assert_eq!(registry.external_len(), 0);
    }

    #[test]
    fn test_duplicate_external_rejected() {
        let registry = Registry::new();
        let external = ExternalId::new("dup");
        registry
            .insert(payload(0x40, 8).with_external(external.clone(), 8))
            .unwrap();

        let err = registry
            .insert(payload(0x80, 8).with_external(external.clone(), 8))
            .unwrap_err();
        assert!(matches!(err, Error::UserInputError(_)));
        assert!(!registry.contains(ObjectId::from_address(0x80)));
        assert_eq!(
            registry.get_external(&external).unwrap().object_id,
            ObjectId::from_address(0x40)
        );
    }

    #[test]
    fn test_duplicate_object_rejected_without_leaking_external() {
        let registry = Registry::new();
        registry.insert(payload(0x40, 8)).unwrap();

        let external = ExternalId::new("late");
        let err = registry
            .insert(payload(0x40, 8).with_external(external.clone(), 8))
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(!registry.contains_external(&external));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_snapshot() {
        let registry = Registry::new();
        for address in [0x40, 0x80, 0xc0] {
            registry.insert(payload(address, 1)).unwrap();
        }
        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ObjectId::from_address(0x40),
                ObjectId::from_address(0x80),
                ObjectId::from_address(0xc0),
            ]
        );
    }
}
