//! # Bounded Slot Storage
//!
//! Fixed-capacity container for replicated data items. One [`SlotStore`]
//! instance backs the durable replica storage and another backs the
//! forwarding buffer; both have identical semantics:
//!
//! - capacity is fixed at construction, overflow is reported to the caller
//! - insertion takes the first empty slot, order is otherwise meaningless
//! - lookup is a linear scan (capacities are small by configuration)
//! - no eviction policy; the protocol decides what to drop and when
//!
//! Items are owned values. Handing an item to the store moves it; reading
//! it back borrows it; [`SlotStore::take_all`] drains every slot, which is
//! how buffer hand-off builds a `Transfer` message.

use crate::messages::DataItem;

/// A bounded array of item slots.
#[derive(Clone, Debug)]
pub struct SlotStore {
    slots: Vec<Option<DataItem>>,
}

impl SlotStore {
    /// Create a store with `capacity` empty slots.
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: vec![None; capacity as usize],
        }
    }

    /// Place `item` into the first empty slot.
    ///
    /// Returns `false` (and drops the item) when every slot is occupied.
    pub fn store(&mut self, item: DataItem) -> bool {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(item);
                true
            }
            None => false,
        }
    }

    /// Borrow the item with the given data id, if present.
    pub fn get(&self, data_id: u64) -> Option<&DataItem> {
        self.slots
            .iter()
            .flatten()
            .find(|item| item.id == data_id)
    }

    /// Whether an item with the given data id is present.
    pub fn contains(&self, data_id: u64) -> bool {
        self.get(data_id).is_some()
    }

    /// Clear the slot holding `data_id`.
    ///
    /// Returns `false` if no slot holds it.
    pub fn remove(&mut self, data_id: u64) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|item| item.id == data_id) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Empty every slot.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Number of empty slots remaining.
    pub fn free_space(&self) -> u32 {
        self.slots.iter().filter(|slot| slot.is_none()).count() as u32
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }

    /// Iterate over the stored items in slot order.
    pub fn all(&self) -> impl Iterator<Item = &DataItem> {
        self.slots.iter().flatten()
    }

    /// Drain every slot, returning the items.
    pub fn take_all(&mut self) -> Vec<DataItem> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}
