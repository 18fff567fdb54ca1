//! Entry storage: a slab arena of cache entries plus the clock-order ring.
//!
//! Entries live in a generational arena keyed by a stable [EntryIndex]; every
//! "list" an entry participates in (the key index, the clock ring, the
//! checkpoint-pending set) is a set of indices into the arena, so removal is O(1)
//! index invalidation. A reused slot bumps its generation, which makes stale
//! indices held by in-flight work harmless.

use crate::{kind::SizeInfo, lock::PageLock, Error, PageKey, PageKind};
use futures::channel::oneshot;
use std::sync::Arc;

/// Stable handle to an arena slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct EntryIndex {
    slot: usize,
    generation: u64,
}

/// One cached page plus its metadata.
pub(crate) struct Entry<P: PageKind> {
    pub key: PageKey,
    pub kind: P,
    pub lock: PageLock,
    pub state: EntryState<P>,
    /// Clock (second chance) bit: set on every touch, cleared by the sweep.
    pub referenced: bool,
    /// Set when the sweep has already attempted partial eviction since the last
    /// touch, so the next visit goes straight to full eviction.
    pub tried_partial: bool,
    /// A non-blocking preparation job (partial fetch or checkpoint clone) is
    /// queued for this entry; suppresses duplicate jobs.
    pub prep_queued: bool,
    /// Position in the clock ring while resident.
    pub ring_pos: Option<usize>,
}

/// Lifecycle state of an entry.
pub(crate) enum EntryState<P: PageKind> {
    /// Created on miss; the creator is running the fetch. Concurrent pins of the
    /// same key park here and share the fetch outcome.
    Fetching {
        waiters: Vec<oneshot::Sender<Result<(), Arc<Error>>>>,
    },
    /// The value is resident.
    Resident(Resident<P>),
}

/// Resident-state fields.
pub(crate) struct Resident<P: PageKind> {
    pub value: Arc<P::Page>,
    pub size: SizeInfo,
    pub dirty: bool,
    /// The in-flight checkpoint still needs this entry's pre-checkpoint image.
    pub checkpoint_pending: bool,
    /// Snapshot taken when a writer mutated a checkpoint-pending entry.
    pub frozen: Option<Frozen<P>>,
    /// A write-back is in flight; the value must not be mutated or destroyed.
    pub flushing: bool,
    /// An expensive partial eviction is in flight on the worker pool.
    pub partial_evicting: bool,
}

/// A frozen pre-checkpoint image awaiting write-back.
pub(crate) struct Frozen<P: PageKind> {
    pub value: Arc<P::Page>,
    pub size: SizeInfo,
}

impl<P: PageKind> Entry<P> {
    pub fn fetching(key: PageKey, kind: P) -> Self {
        Self {
            key,
            kind,
            lock: PageLock::new(),
            state: EntryState::Fetching {
                waiters: Vec::new(),
            },
            referenced: true,
            tried_partial: false,
            prep_queued: false,
            ring_pos: None,
        }
    }

    pub fn resident(&self) -> Option<&Resident<P>> {
        match &self.state {
            EntryState::Resident(resident) => Some(resident),
            EntryState::Fetching { .. } => None,
        }
    }

    pub fn resident_mut(&mut self) -> Option<&mut Resident<P>> {
        match &mut self.state {
            EntryState::Resident(resident) => Some(resident),
            EntryState::Fetching { .. } => None,
        }
    }

    /// The entry is in an in-flight state that excludes lock grants, eviction, and
    /// destruction.
    pub fn busy(&self) -> bool {
        match &self.state {
            EntryState::Fetching { .. } => true,
            EntryState::Resident(resident) => resident.flushing || resident.partial_evicting,
        }
    }

    /// Whether the sweep may act on this entry.
    pub fn evictable(&self) -> bool {
        self.resident().is_some()
            && self.lock.is_unlocked()
            && !self.lock.has_waiters()
            && !self.busy()
    }

    /// Mark the entry recently used; also re-arms partial eviction.
    pub fn touch(&mut self) {
        self.referenced = true;
        self.tried_partial = false;
    }
}

/// Generational slab of entries.
pub(crate) struct Arena<P: PageKind> {
    slots: Vec<Slot<P>>,
    free: Vec<usize>,
    len: usize,
}

struct Slot<P: PageKind> {
    generation: u64,
    entry: Option<Entry<P>>,
}

impl<P: PageKind> Arena<P> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, entry: Entry<P>) -> EntryIndex {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot];
            debug_assert!(s.entry.is_none());
            s.entry = Some(entry);
            return EntryIndex {
                slot,
                generation: s.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        EntryIndex {
            slot: self.slots.len() - 1,
            generation: 0,
        }
    }

    pub fn get(&self, index: EntryIndex) -> Option<&Entry<P>> {
        let slot = self.slots.get(index.slot)?;
        if slot.generation != index.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, index: EntryIndex) -> Option<&mut Entry<P>> {
        let slot = self.slots.get_mut(index.slot)?;
        if slot.generation != index.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn remove(&mut self, index: EntryIndex) -> Option<Entry<P>> {
        let slot = self.slots.get_mut(index.slot)?;
        if slot.generation != index.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation += 1;
        self.free.push(index.slot);
        self.len -= 1;
        Some(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryIndex, &Entry<P>)> {
        self.slots.iter().enumerate().filter_map(|(slot, s)| {
            s.entry.as_ref().map(|entry| {
                (
                    EntryIndex {
                        slot,
                        generation: s.generation,
                    },
                    entry,
                )
            })
        })
    }
}

/// The clock ring: resident entries in insertion order with a sweep hand.
pub(crate) struct Ring {
    order: Vec<EntryIndex>,
    hand: usize,
}

impl Ring {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            hand: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Add an entry, returning its position (stored as the entry's `ring_pos`).
    pub fn push(&mut self, index: EntryIndex) -> usize {
        self.order.push(index);
        self.order.len() - 1
    }

    /// The entry under the hand, if any.
    pub fn current(&self) -> Option<EntryIndex> {
        if self.order.is_empty() {
            return None;
        }
        Some(self.order[self.hand % self.order.len()])
    }

    /// Advance the hand one position.
    pub fn advance(&mut self) {
        if self.order.is_empty() {
            self.hand = 0;
            return;
        }
        self.hand = (self.hand + 1) % self.order.len();
    }

    /// Remove the entry at `pos`. Returns the index that was moved into `pos` (its
    /// `ring_pos` must be updated by the caller), if any.
    pub fn swap_remove(&mut self, pos: usize) -> Option<EntryIndex> {
        debug_assert!(pos < self.order.len());
        self.order.swap_remove(pos);
        if self.order.is_empty() {
            self.hand = 0;
            return None;
        }
        if self.hand >= self.order.len() {
            self.hand = 0;
        }
        if pos < self.order.len() {
            return Some(self.order[pos]);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks::MockKind, PageKey};

    fn entry(page: u64) -> Entry<MockKind> {
        Entry::fetching(PageKey::new(0, page), MockKind::default())
    }

    #[test]
    fn test_arena_generations() {
        let mut arena: Arena<MockKind> = Arena::new();
        let a = arena.insert(entry(1));
        let b = arena.insert(entry(2));
        assert_eq!(arena.len(), 2);

        assert!(arena.remove(a).is_some());
        assert_eq!(arena.len(), 1);

        // The stale index no longer resolves, even after the slot is reused.
        assert!(arena.get(a).is_none());
        let c = arena.insert(entry(3));
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(c).unwrap().key.page, 3);
        assert_eq!(arena.get(b).unwrap().key.page, 2);

        // Double remove through the stale index is a no-op.
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_ring_swap_remove_tracks_positions() {
        let mut arena: Arena<MockKind> = Arena::new();
        let mut ring = Ring::new();
        let indices: Vec<EntryIndex> = (0..4).map(|i| arena.insert(entry(i))).collect();
        for &index in &indices {
            let pos = ring.push(index);
            arena.get_mut(index).unwrap().ring_pos = Some(pos);
        }

        // Remove position 1; the tail element moves into it.
        let moved = ring.swap_remove(1).unwrap();
        assert_eq!(moved, indices[3]);
        assert_eq!(ring.len(), 3);

        // Hand stays within bounds after removals at the tail.
        ring.advance();
        ring.advance();
        ring.advance();
        assert!(ring.current().is_some());
        ring.swap_remove(2);
        ring.swap_remove(1);
        ring.swap_remove(0);
        assert!(ring.current().is_none());
    }
}
