//! Index-stable pool for chunks that left the live list.
//!
//! Vacated slots are tracked in an explicit free list and refilled lowest
//! index first, so retiring chunks never shifts the entries already in the
//! pool.

use std::collections::BTreeSet;

use crate::merge::MergeError;

const MIN_GROWTH: usize = 10;

/// Sparse slot map of retired entries awaiting reclamation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RetiredPool<T> {
    slots: Vec<Option<T>>,
    vacant: BTreeSet<usize>,
}

impl<T> Default for RetiredPool<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            vacant: BTreeSet::new(),
        }
    }
}

impl<T> RetiredPool<T> {
    /// Rebuild a pool from persisted slots.
    pub(crate) fn from_slots(slots: Vec<Option<T>>) -> Self {
        let vacant = slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.is_none().then_some(idx))
            .collect();
        Self { slots, vacant }
    }

    /// Total slots, occupied or not.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of vacant slots.
    pub(crate) fn free_slot_count(&self) -> usize {
        self.vacant.len()
    }

    pub(crate) fn slots(&self) -> &[Option<T>] {
        &self.slots
    }

    /// Occupied slots with their indices.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|value| (idx, value)))
    }

    /// Make sure at least `count` slots are vacant. When they are not, the pool
    /// grows by `max(10, len + 2 * count)` slots.
    pub(crate) fn reserve(&mut self, count: usize) -> Result<(), MergeError> {
        if count <= self.vacant.len() {
            return Ok(());
        }
        let growth = MIN_GROWTH.max(self.slots.len() + 2 * count);
        self.slots.try_reserve_exact(growth)?;
        let start = self.slots.len();
        self.slots.resize_with(start + growth, || None);
        self.vacant.extend(start..start + growth);
        Ok(())
    }

    /// Place `value` in the lowest vacant slot and return that slot.
    pub(crate) fn insert(&mut self, value: T) -> Result<usize, MergeError> {
        self.reserve(1)?;
        let slot = self
            .vacant
            .pop_first()
            .ok_or_else(|| MergeError::inconsistent("retired pool has no vacant slot"))?;
        self.slots[slot] = Some(value);
        Ok(slot)
    }

    /// Place every value, growing once up front if the vacancies do not suffice.
    pub(crate) fn insert_all(
        &mut self,
        values: impl ExactSizeIterator<Item = T>,
    ) -> Result<Vec<usize>, MergeError> {
        self.reserve(values.len())?;
        values.map(|value| self.insert(value)).collect()
    }

    /// Vacate `slot`, returning what it held.
    pub(crate) fn remove(&mut self, slot: usize) -> Option<T> {
        let value = self.slots.get_mut(slot)?.take()?;
        self.vacant.insert(slot);
        Some(value)
    }
}
