//! Bidirectional maps between small integer handles and volume/tree
//! identities.
//!
//! Handles are process-local and re-emitted per segment: every segment is
//! self-describing, which is what lets the recovery engine and the
//! copy-back worker skip over reclaimed segments without replaying them.

use std::collections::HashMap;
use std::hash::Hash;

/// Default capacity at which a registry clears itself rather than growing
/// without bound. A long-lived journal that churns through many distinct
/// volumes/trees within a single segment would otherwise leak handles for
/// the lifetime of the segment.
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct HandleRegistry<D> {
    forward: HashMap<D, u32>,
    backward: HashMap<u32, D>,
    next_handle: u32,
    capacity: usize,
}

impl<D> Default for HandleRegistry<D> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<D: Eq + Hash + Clone> HandleRegistry<D> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            forward: HashMap::new(),
            backward: HashMap::new(),
            next_handle: 0,
            capacity,
        }
    }

    /// Returns the handle for `descriptor`, allocating and installing a new
    /// one if this is the first time it is seen since the last clear.
    ///
    /// The bool is `true` when a new handle was allocated: the caller must
    /// then emit an IV/IT record before using it.
    pub fn handle_for(&mut self, descriptor: D) -> (u32, bool) {
        if let Some(&handle) = self.forward.get(&descriptor) {
            return (handle, false);
        }
        if self.forward.len() >= self.capacity {
            self.clear();
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.forward.insert(descriptor.clone(), handle);
        self.backward.insert(handle, descriptor);
        (handle, true)
    }

    /// Installs a handle assignment recovered from an IV/IT record. Used
    /// only by the recovery engine, which must honor the handles a prior
    /// process chose rather than allocate fresh ones.
    pub fn install(&mut self, handle: u32, descriptor: D) {
        self.forward.insert(descriptor.clone(), handle);
        self.backward.insert(handle, descriptor);
        self.next_handle = self.next_handle.max(handle + 1);
    }

    pub fn resolve(&self, handle: u32) -> Option<&D> {
        self.backward.get(&handle)
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.backward.clear();
        self.next_handle = 0;
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Iterates the `(handle, descriptor)` pairs currently installed, in no
    /// particular order. Used to re-declare every live handle's IV/IT
    /// record into a fresh segment after rollover.
    pub fn pairs(&self) -> impl Iterator<Item = (u32, &D)> {
        self.backward.iter().map(|(&h, d)| (h, d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_allocates_and_reports_new() {
        let mut reg: HandleRegistry<String> = HandleRegistry::default();
        let (h1, new1) = reg.handle_for("a".to_string());
        assert!(new1);
        let (h2, new2) = reg.handle_for("a".to_string());
        assert_eq!(h1, h2);
        assert!(!new2);
        assert_eq!(reg.resolve(h1), Some(&"a".to_string()));
    }

    #[test]
    fn clear_forces_reemission() {
        let mut reg: HandleRegistry<String> = HandleRegistry::default();
        let (h1, _) = reg.handle_for("a".to_string());
        reg.clear();
        assert!(reg.resolve(h1).is_none());
        let (h2, new) = reg.handle_for("a".to_string());
        assert!(new);
        assert_eq!(h2, 0);
    }

    #[test]
    fn capacity_limit_clears_before_overflow() {
        let mut reg: HandleRegistry<u32> = HandleRegistry::with_capacity(2);
        reg.handle_for(1);
        reg.handle_for(2);
        // Third distinct key exceeds capacity: registry clears, then installs.
        let (h, new) = reg.handle_for(3);
        assert!(new);
        assert_eq!(reg.len(), 1);
        assert_eq!(h, 0);
    }

    #[test]
    fn install_advances_counter_past_recovered_handle() {
        let mut reg: HandleRegistry<u32> = HandleRegistry::default();
        reg.install(41, 100);
        let (h, new) = reg.handle_for(200);
        assert!(new);
        assert_eq!(h, 42);
    }
}
