//! Slotted arena storage for scheduler objects.
//!
//! Every long-lived object in the core (entities, queues, groups,
//! requests) lives in an arena and is addressed by a typed index.
//! Cross-references between objects are always indices, never owning
//! pointers, so the parent back-pointers and group/child links of the
//! hierarchy cannot form ownership cycles.
//!
//! Slots are recycled through a free list; an index is only valid
//! until the object it names is removed.

/// A growable arena with slot reuse.
#[derive(Debug, Clone)]
pub(crate) struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Insert a value and return its slot index.
    pub(crate) fn insert(&mut self, value: T) -> u32 {
        if let Some(idx) = self.free.pop() {
            debug_assert!(self.slots[idx as usize].is_none());
            self.slots[idx as usize] = Some(value);
            idx
        } else {
            self.slots.push(Some(value));
            (self.slots.len() - 1) as u32
        }
    }

    /// Remove the value at `idx`, freeing the slot for reuse.
    ///
    /// # Panics
    ///
    /// Panics if the slot is vacant; removing through a stale index is
    /// a logic error in the caller.
    pub(crate) fn remove(&mut self, idx: u32) -> T {
        let value = self.slots[idx as usize]
            .take()
            .expect("arena slot already vacant");
        self.free.push(idx);
        value
    }

    pub(crate) fn get(&self, idx: u32) -> Option<&T> {
        self.slots.get(idx as usize).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, idx: u32) -> Option<&mut T> {
        self.slots.get_mut(idx as usize).and_then(Option::as_mut)
    }

    /// Iterate `(index, &value)` over live slots.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i as u32, v)))
    }

    /// Indices of all live slots, in slot order.
    pub(crate) fn indices(&self) -> Vec<u32> {
        self.iter().map(|(i, _)| i).collect()
    }
}

impl<T> std::ops::Index<u32> for Arena<T> {
    type Output = T;

    fn index(&self, idx: u32) -> &T {
        self.slots[idx as usize]
            .as_ref()
            .expect("stale arena index")
    }
}

impl<T> std::ops::IndexMut<u32> for Arena<T> {
    fn index_mut(&mut self, idx: u32) -> &mut T {
        self.slots[idx as usize]
            .as_mut()
            .expect("stale arena index")
    }
}
