//! Copy-on-write kit registry
//!
//! The registry maps kit ids to live entries. Readers take a snapshot of the
//! whole map with a single atomic load and iterate it without locking; writers
//! (only the lifecycle coordinator) build a new map and swap it in. A reader
//! therefore sees either the map before an update or the map after it, never
//! a partially applied one.
//!
//! Each entry holds its configuration behind its own `ArcSwap`, so a settings
//! update replaces the configuration without replacing the kit instance.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::KitConfiguration;
use crate::kit::Kit;
use crate::types::{Capability, KitId};

/// One live kit and its current configuration.
pub struct KitEntry {
    id: KitId,
    kit: Arc<dyn Kit>,
    configuration: ArcSwap<KitConfiguration>,
    active: AtomicBool,
}

impl KitEntry {
    pub fn new(kit: Arc<dyn Kit>, configuration: KitConfiguration) -> Self {
        Self {
            id: configuration.id,
            kit,
            configuration: ArcSwap::from_pointee(configuration),
            active: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> KitId {
        self.id
    }

    pub fn kit(&self) -> &Arc<dyn Kit> {
        &self.kit
    }

    pub fn name(&self) -> &str {
        self.kit.name()
    }

    pub fn capabilities(&self) -> Capability {
        self.kit.capabilities()
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.kit.capabilities().contains(capability)
    }

    /// The configuration generation current at the time of the call.
    pub fn configuration(&self) -> Arc<KitConfiguration> {
        self.configuration.load_full()
    }

    /// Swap in a new configuration generation.
    pub fn replace_configuration(&self, configuration: KitConfiguration) {
        self.configuration.store(Arc::new(configuration));
    }

    /// Whether the activation sequence has run.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the entry active. Returns `false` if it already was.
    pub fn mark_active(&self) -> bool {
        !self.active.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for KitEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KitEntry")
            .field("id", &self.id)
            .field("name", &self.kit.name())
            .field("capabilities", &self.kit.capabilities())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Immutable view of the registry at one point in time.
pub type RegistrySnapshot = Arc<BTreeMap<KitId, Arc<KitEntry>>>;

#[derive(Default)]
pub struct KitRegistry {
    entries: ArcSwap<BTreeMap<KitId, Arc<KitEntry>>>,
}

impl KitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.entries.load_full()
    }

    pub fn get(&self, id: KitId) -> Option<Arc<KitEntry>> {
        self.entries.load().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<KitId> {
        self.entries.load().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Insert or replace the entry for its id.
    pub fn insert(&self, entry: Arc<KitEntry>) {
        self.entries.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(entry.id(), Arc::clone(&entry));
            next
        });
    }

    /// Remove an entry, returning it if it was present.
    pub fn remove(&self, id: KitId) -> Option<Arc<KitEntry>> {
        let mut removed = None;
        self.entries.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(&id);
            next
        });
        removed
    }
}
