/// Synthetic heap address space for traced objects.
///
/// Each object id gets a `2 * 0x100000` byte region on first observation.
/// Property accesses resolve to offsets within the object: numeric property
/// names decode as their integer value, named properties draw offsets from a
/// per-object counter starting at `0x100000`.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// First offset handed out for a named heap property.
pub const PROPERTY_BASE_ADDRESS: u32 = 0x10_0000;

/// Address-space span reserved per allocation (two 1 MiB chunks).
pub const ALLOCATION_SPAN: u64 = 2 * 0x10_0000;

/// One traced heap object. Objects seeded by the prefix pass are shared
/// across testcase workers, so the property counter and map must stay safe
/// under concurrent access.
#[derive(Debug)]
pub struct HeapObject {
    address: u64,
    next_property: AtomicU32,
    properties: DashMap<String, u32>,
}

impl HeapObject {
    fn new(address: u64) -> HeapObject {
        HeapObject {
            address,
            next_property: AtomicU32::new(PROPERTY_BASE_ADDRESS),
            properties: DashMap::new(),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Resolves a property name to its offset within the object. Numeric
    /// names decode as their integer value and consume no counter; other
    /// names get the object's next free offset, stable across lookups.
    pub fn property_offset(&self, name: &str) -> u32 {
        if let Ok(index) = name.parse::<u32>() {
            return index;
        }
        if let Some(offset) = self.properties.get(name) {
            return *offset;
        }
        *self
            .properties
            .entry(name.to_owned())
            .or_insert_with(|| self.next_property.fetch_add(1, Ordering::SeqCst))
    }
}

/// Worker-local view of the traced heap: the object overlay plus the
/// allocation cursor, both seeded from the prefix pass.
#[derive(Debug, Default)]
pub struct HeapTracker {
    objects: HashMap<i32, Arc<HeapObject>>,
    next_allocation: u64,
}

impl HeapTracker {
    pub fn new() -> HeapTracker {
        HeapTracker::default()
    }

    pub fn seeded(objects: HashMap<i32, Arc<HeapObject>>, next_allocation: u64) -> HeapTracker {
        HeapTracker {
            objects,
            next_allocation,
        }
    }

    /// Looks up an object id, reserving a fresh address range on first
    /// observation. Returns the object and, for new objects, the address of
    /// the reserved range so the caller can emit an allocation record.
    pub fn get_or_allocate(&mut self, id: i32) -> (Arc<HeapObject>, Option<u64>) {
        if let Some(object) = self.objects.get(&id) {
            return (object.clone(), None);
        }
        let address = self.next_allocation;
        self.next_allocation += ALLOCATION_SPAN;
        let object = Arc::new(HeapObject::new(address));
        self.objects.insert(id, object.clone());
        (object, Some(address))
    }

    pub fn into_seed(self) -> (HashMap<i32, Arc<HeapObject>>, u64) {
        (self.objects, self.next_allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_spaced_and_idempotent() {
        let mut heap = HeapTracker::new();
        let (_, first) = heap.get_or_allocate(42);
        let (_, again) = heap.get_or_allocate(42);
        let (_, second) = heap.get_or_allocate(7);
        assert_eq!(first, Some(0));
        assert_eq!(again, None);
        assert_eq!(second, Some(ALLOCATION_SPAN));
    }

    #[test]
    fn numeric_properties_decode_as_their_value() {
        let mut heap = HeapTracker::new();
        let (object, _) = heap.get_or_allocate(1);
        assert_eq!(object.property_offset("7"), 7);
        assert_eq!(object.property_offset("0"), 0);
        // Numeric names never touch the counter.
        assert_eq!(object.property_offset("length"), PROPERTY_BASE_ADDRESS);
    }

    #[test]
    fn named_properties_get_stable_consecutive_offsets() {
        let mut heap = HeapTracker::new();
        let (object, _) = heap.get_or_allocate(1);
        assert_eq!(object.property_offset("foo"), PROPERTY_BASE_ADDRESS);
        assert_eq!(object.property_offset("foo"), PROPERTY_BASE_ADDRESS);
        assert_eq!(object.property_offset("bar"), PROPERTY_BASE_ADDRESS + 1);
    }

    #[test]
    fn seeded_objects_are_shared_between_trackers() {
        let mut prefix = HeapTracker::new();
        let (object, _) = prefix.get_or_allocate(42);
        assert_eq!(object.property_offset("seeded"), PROPERTY_BASE_ADDRESS);

        let (seed, next) = prefix.into_seed();
        let mut a = HeapTracker::seeded(seed.clone(), next);
        let mut b = HeapTracker::seeded(seed, next);

        // Both trackers observe the same underlying object: offsets stay
        // consistent no matter which worker resolves a property first.
        let (object_a, fresh_a) = a.get_or_allocate(42);
        let (object_b, fresh_b) = b.get_or_allocate(42);
        assert!(fresh_a.is_none() && fresh_b.is_none());
        assert_eq!(object_a.property_offset("p"), PROPERTY_BASE_ADDRESS + 1);
        assert_eq!(object_b.property_offset("p"), PROPERTY_BASE_ADDRESS + 1);

        // New ids allocate from each worker's own cursor, past the seed.
        let (_, addr_a) = a.get_or_allocate(100);
        assert_eq!(addr_a, Some(ALLOCATION_SPAN));
    }
}
