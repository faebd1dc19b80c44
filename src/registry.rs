//! The shared, ordered collection of mappings.
//!
//! Readers take an `Arc` snapshot of the whole list, so a resolution in flight
//! keeps seeing the list it started with while admin operations swap in a new
//! one. Mutations are published on a broadcast channel.

use crate::mapping::Mapping;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    MappingAdded(Uuid),
    MappingReplaced(Uuid),
    MappingRemoved(Uuid),
    MappingsReset,
    ScenarioReset(String),
    ScenariosReset,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("mapping {0} is already registered")]
    DuplicateGuid(Uuid),

    #[error("mapping {0} not found")]
    NotFound(Uuid),
}

/// A mapping together with its registration order.
#[derive(Debug, Clone)]
pub struct RegisteredMapping {
    pub mapping: Arc<Mapping>,
    /// Monotonic registration sequence; replacing a mapping keeps its slot.
    pub sequence: u64,
}

#[derive(Debug)]
pub struct MappingRegistry {
    mappings: RwLock<Arc<Vec<RegisteredMapping>>>,
    next_sequence: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for MappingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            mappings: RwLock::new(Arc::new(Vec::new())),
            next_sequence: AtomicU64::new(0),
            events,
        }
    }

    /// Consistent view of every registered mapping, in registration order.
    pub fn snapshot(&self) -> Arc<Vec<RegisteredMapping>> {
        Arc::clone(&self.mappings.read())
    }

    /// Register a new mapping. Fails if the guid is taken.
    pub fn add(&self, mapping: Mapping) -> Result<Arc<Mapping>, RegistryError> {
        let guid = mapping.guid();
        let mapping = Arc::new(mapping);
        {
            let mut guard = self.mappings.write();
            if guard.iter().any(|m| m.mapping.guid() == guid) {
                return Err(RegistryError::DuplicateGuid(guid));
            }
            Arc::make_mut(&mut guard).push(RegisteredMapping {
                mapping: Arc::clone(&mapping),
                sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            });
        }
        debug!(mapping = %guid, priority = mapping.priority(), "Mapping added");
        self.publish(RegistryEvent::MappingAdded(guid));
        Ok(mapping)
    }

    /// Register a mapping, replacing any mapping with the same guid in place.
    pub fn add_or_replace(&self, mapping: Mapping) -> Arc<Mapping> {
        let guid = mapping.guid();
        let mapping = Arc::new(mapping);
        let replaced = {
            let mut guard = self.mappings.write();
            let list = Arc::make_mut(&mut guard);
            match list.iter_mut().find(|m| m.mapping.guid() == guid) {
                Some(existing) => {
                    existing.mapping = Arc::clone(&mapping);
                    true
                }
                None => {
                    list.push(RegisteredMapping {
                        mapping: Arc::clone(&mapping),
                        sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                    });
                    false
                }
            }
        };

        if replaced {
            debug!(mapping = %guid, "Mapping replaced");
            self.publish(RegistryEvent::MappingReplaced(guid));
        } else {
            debug!(mapping = %guid, priority = mapping.priority(), "Mapping added");
            self.publish(RegistryEvent::MappingAdded(guid));
        }
        mapping
    }

    pub fn remove(&self, guid: Uuid) -> Result<Arc<Mapping>, RegistryError> {
        let removed = {
            let mut guard = self.mappings.write();
            let position = guard
                .iter()
                .position(|m| m.mapping.guid() == guid)
                .ok_or(RegistryError::NotFound(guid))?;
            Arc::make_mut(&mut guard).remove(position).mapping
        };
        debug!(mapping = %guid, "Mapping removed");
        self.publish(RegistryEvent::MappingRemoved(guid));
        Ok(removed)
    }

    /// Remove every mapping.
    pub fn reset(&self) {
        *self.mappings.write() = Arc::new(Vec::new());
        debug!("Mappings reset");
        self.publish(RegistryEvent::MappingsReset);
    }

    pub fn get(&self, guid: Uuid) -> Option<Arc<Mapping>> {
        self.mappings
            .read()
            .iter()
            .find(|m| m.mapping.guid() == guid)
            .map(|m| Arc::clone(&m.mapping))
    }

    pub fn get_all(&self) -> Vec<Arc<Mapping>> {
        self.snapshot()
            .iter()
            .map(|m| Arc::clone(&m.mapping))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive every registry change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseDefinition;

    fn mapping(guid: Uuid, priority: i32) -> Mapping {
        Mapping::builder()
            .guid(guid)
            .priority(priority)
            .respond_with(Arc::new(ResponseDefinition::text(200, "ok")))
            .build()
            .unwrap()
    }

    #[test]
    fn test_add_rejects_duplicate_guid() {
        let registry = MappingRegistry::new();
        let guid = Uuid::new_v4();
        registry.add(mapping(guid, 0)).unwrap();
        assert_eq!(
            registry.add(mapping(guid, 1)).unwrap_err(),
            RegistryError::DuplicateGuid(guid)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_replace_keeps_registration_slot() {
        let registry = MappingRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        registry.add(mapping(first, 0)).unwrap();
        registry.add(mapping(second, 0)).unwrap();

        registry.add_or_replace(mapping(first, 5));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].mapping.guid(), first);
        assert_eq!(snapshot[0].mapping.priority(), 5);
        assert_eq!(snapshot[0].sequence, 0);
        assert_eq!(snapshot[1].sequence, 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let registry = MappingRegistry::new();
        let guid = Uuid::new_v4();
        registry.add(mapping(guid, 0)).unwrap();

        let before = registry.snapshot();
        registry.remove(guid).unwrap();

        assert_eq!(before.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.get(guid).is_none());
    }

    #[test]
    fn test_remove_unknown_guid() {
        let registry = MappingRegistry::new();
        let guid = Uuid::new_v4();
        assert_eq!(registry.remove(guid).unwrap_err(), RegistryError::NotFound(guid));
    }

    #[test]
    fn test_reset_and_get_all() {
        let registry = MappingRegistry::new();
        registry.add(mapping(Uuid::new_v4(), 0)).unwrap();
        registry.add(mapping(Uuid::new_v4(), 0)).unwrap();
        assert_eq!(registry.get_all().len(), 2);
        registry.reset();
        assert!(registry.get_all().is_empty());
    }

    #[test]
    fn test_events_are_published() {
        let registry = MappingRegistry::new();
        let mut events = registry.subscribe();
        let guid = Uuid::new_v4();

        registry.add(mapping(guid, 0)).unwrap();
        registry.add_or_replace(mapping(guid, 1));
        registry.remove(guid).unwrap();
        registry.reset();

        let received: Vec<_> = (0..4)
            .map(|_| tokio_test::block_on(events.recv()).unwrap())
            .collect();
        assert_eq!(
            received,
            vec![
                RegistryEvent::MappingAdded(guid),
                RegistryEvent::MappingReplaced(guid),
                RegistryEvent::MappingRemoved(guid),
                RegistryEvent::MappingsReset,
            ]
        );
    }
}
