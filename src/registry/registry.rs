use super::descriptor::{ArrayDescriptor, ArrayId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Owns every live array descriptor, keyed by its monotonic id.
///
/// Grounded on spec.md §4.1: `new_id()`, `insert(id, descriptor)`,
/// `get(id)`. The registry is the *only* place a descriptor's fields are
/// read or mutated — aliasing is always by id, never by raw reference
/// (spec.md §9's arena-by-id design note).
pub struct ArrayRegistry {
    next_id: AtomicU64,
    descriptors: HashMap<ArrayId, ArrayDescriptor>,
}

impl ArrayRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            descriptors: HashMap::new(),
        }
    }

    /// Allocate the next identity. Strictly increasing for the lifetime of
    /// the process — property 1 in spec.md §8.
    pub fn new_id(&self) -> ArrayId {
        ArrayId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&mut self, descriptor: ArrayDescriptor) {
        self.descriptors.insert(descriptor.id, descriptor);
    }

    pub fn get(&self, id: ArrayId) -> Option<&ArrayDescriptor> {
        self.descriptors.get(&id)
    }

    pub fn get_mut(&mut self, id: ArrayId) -> Option<&mut ArrayDescriptor> {
        self.descriptors.get_mut(&id)
    }

    pub fn contains(&self, id: ArrayId) -> bool {
        self.descriptors.contains_key(&id)
    }

    /// Remove a descriptor outright. Called once `FREE`/`DISCARD`
    /// processing has dropped its `ref_count` to zero.
    pub fn remove(&mut self, id: ArrayId) -> Option<ArrayDescriptor> {
        self.descriptors.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Resolve any descriptor (base or view) to the id of its owning base.
    pub fn base_of(&self, id: ArrayId) -> Option<ArrayId> {
        self.get(id).map(|d| d.base.unwrap_or(id))
    }
}

impl Default for ArrayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ElemType;

    #[test]
    fn ids_are_monotonic() {
        let registry = ArrayRegistry::new();
        let ids: Vec<_> = (0..100).map(|_| registry.new_id()).collect();
        for window in ids.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let mut registry = ArrayRegistry::new();
        let id = registry.new_id();
        let descriptor = ArrayDescriptor::new_base(id, ElemType::Int32, vec![4]);
        registry.insert(descriptor);
        assert!(registry.contains(id));
        assert_eq!(registry.get(id).unwrap().nelements(), 4);
    }

    #[test]
    fn base_of_resolves_views() {
        let mut registry = ArrayRegistry::new();
        let base_id = registry.new_id();
        registry.insert(ArrayDescriptor::new_base(base_id, ElemType::Float32, vec![8]));
        let view_id = registry.new_id();
        registry.insert(ArrayDescriptor::new_view(
            view_id,
            base_id,
            ElemType::Float32,
            vec![4],
            vec![1],
            0,
        ));
        assert_eq!(registry.base_of(view_id), Some(base_id));
        assert_eq!(registry.base_of(base_id), Some(base_id));
    }

    #[test]
    fn remove_drops_descriptor() {
        let mut registry = ArrayRegistry::new();
        let id = registry.new_id();
        registry.insert(ArrayDescriptor::new_base(id, ElemType::Int32, vec![1]));
        assert!(registry.remove(id).is_some());
        assert!(!registry.contains(id));
    }
}
