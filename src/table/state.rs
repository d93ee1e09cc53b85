//! # Index & MRU State
//!
//! The in-memory bookkeeping of one image table: which entity sits in which
//! slot, which source image it was rendered from, which slots are occupied,
//! the recency order used to pick eviction victims, and the multiset of
//! entities currently pinned by outstanding reader images.
//!
//! ## Structures
//!
//! ```text
//! index:        entity id -> entry index        (injective)
//! sources:      entity id -> source-image id
//! occupied:     set of entry indexes            (= value set of index)
//! mru:          entity ids, front = most recent
//! in_use:       entity id -> outstanding image count
//! pinned_slots: entry index -> outstanding image count
//! writing:      entry indexes with an in-flight draw
//! ```
//!
//! A fetch pins both the entity (gates MRU eviction) and the slot the
//! entity occupied at fetch time (gates slot reuse). The two can diverge:
//! re-rendering an in-use entity moves it to a fresh slot while its old
//! bytes stay pinned by the readers still aliasing them, and deleting an
//! in-use entity frees its index map entry but not the pinned slot.
//!
//! ## Allocation & Eviction
//!
//! [`IndexState::allocate`] hands out the lowest slot that is free,
//! unpinned, and not mid-draw, or the current entry count when no such slot
//! exists (the caller grows the file). When the candidate lands at or
//! beyond the effective maximum, the MRU list is walked from its tail and
//! the oldest entity without outstanding readers or an in-flight draw is
//! evicted, freeing its slot for reuse. Entities with readers are never
//! victims; their images alias mapped memory that a reuse would overwrite.
//! If every resident entity is pinned, allocation reports pressure and
//! returns the over-limit candidate anyway; growing the file is preferred
//! over invalidating a reader.
//!
//! Because an evicted victim's slot is by construction neither pinned nor
//! mid-draw, an eviction always leaves a slot the very next candidate scan
//! can hand out: allocation never both evicts and asks the caller to grow.
//!
//! All mutation happens under the table lock held by the orchestrator.

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;
use uuid::Uuid;

/// Result of a slot allocation.
#[derive(Debug)]
pub struct Allocation {
    /// Slot to write into. May equal the current entry count (grow) and may
    /// exceed the effective maximum under pressure.
    pub index: u32,
    /// Entities evicted to free the slot, oldest first.
    pub evicted: SmallVec<[Uuid; 4]>,
    /// True when no evictable entity was left and the candidate exceeds the
    /// effective maximum.
    pub pressure: bool,
}

/// In-memory index, recency, and pin state of one table.
#[derive(Debug, Default)]
pub struct IndexState {
    index: HashMap<Uuid, u32>,
    sources: HashMap<Uuid, Uuid>,
    occupied: HashSet<u32>,
    mru: Vec<Uuid>,
    in_use: HashMap<Uuid, u32>,
    pinned_slots: HashMap<u32, u32>,
    writing: HashSet<u32>,
}

impl IndexState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index_of(&self, entity: &Uuid) -> Option<u32> {
        self.index.get(entity).copied()
    }

    pub fn source_of(&self, entity: &Uuid) -> Option<Uuid> {
        self.sources.get(entity).copied()
    }

    /// Records `entity` at `slot` and promotes it to the MRU head. Replaces
    /// any previous slot assignment for the entity.
    pub fn insert(&mut self, entity: Uuid, source: Uuid, slot: u32) {
        if let Some(previous) = self.index.insert(entity, slot) {
            if previous != slot {
                self.occupied.remove(&previous);
            }
        }
        self.occupied.insert(slot);
        self.sources.insert(entity, source);
        self.touch(entity);
    }

    /// Removes `entity` from every structure. Returns its slot, now free for
    /// reuse. The slot bytes are not touched.
    pub fn remove(&mut self, entity: &Uuid) -> Option<u32> {
        let slot = self.index.remove(entity)?;
        self.occupied.remove(&slot);
        self.sources.remove(entity);
        if let Some(pos) = self.mru.iter().position(|e| e == entity) {
            self.mru.remove(pos);
        }
        Some(slot)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.sources.clear();
        self.occupied.clear();
        self.mru.clear();
        self.in_use.clear();
        self.pinned_slots.clear();
        self.writing.clear();
    }

    /// Promotes `entity` to the MRU head, inserting it if absent.
    pub fn touch(&mut self, entity: Uuid) {
        if let Some(pos) = self.mru.iter().position(|e| *e == entity) {
            self.mru.remove(pos);
        }
        self.mru.insert(0, entity);
    }

    /// Records one more outstanding reader image for `entity`, aliasing
    /// `slot`. A pinned slot is withheld from allocation until released.
    pub fn pin(&mut self, entity: Uuid, slot: u32) {
        *self.in_use.entry(entity).or_insert(0) += 1;
        *self.pinned_slots.entry(slot).or_insert(0) += 1;
    }

    /// Releases one outstanding reader image. Pins vanish wholesale on
    /// [`Self::clear`], so a release arriving after a reset is a no-op.
    pub fn unpin(&mut self, entity: &Uuid, slot: u32) {
        match self.in_use.get_mut(entity) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.in_use.remove(entity);
            }
            None => {}
        }
        match self.pinned_slots.get_mut(&slot) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.pinned_slots.remove(&slot);
            }
            None => {}
        }
    }

    pub fn is_in_use(&self, entity: &Uuid) -> bool {
        self.in_use.contains_key(entity)
    }

    /// Whether any outstanding image aliases `slot`.
    pub fn slot_pinned(&self, slot: u32) -> bool {
        self.pinned_slots.contains_key(&slot)
    }

    /// Marks `slot` as having an in-flight draw. Such slots are withheld
    /// from allocation and their entities from eviction until the draw
    /// completes.
    pub fn begin_write(&mut self, slot: u32) {
        self.writing.insert(slot);
    }

    pub fn end_write(&mut self, slot: u32) {
        self.writing.remove(&slot);
    }

    /// MRU order, most recent first.
    pub fn mru_order(&self) -> &[Uuid] {
        &self.mru
    }

    /// MRU position of an entity (0 = most recent).
    pub fn mru_position(&self, entity: &Uuid) -> Option<usize> {
        self.mru.iter().position(|e| e == entity)
    }

    fn first_free_slot(&self, entry_count: u32) -> u32 {
        (0..entry_count)
            .find(|slot| {
                !self.occupied.contains(slot)
                    && !self.pinned_slots.contains_key(slot)
                    && !self.writing.contains(slot)
            })
            .unwrap_or(entry_count)
    }

    fn oldest_evictable(&self) -> Option<Uuid> {
        self.mru
            .iter()
            .rev()
            .find(|entity| {
                !self.in_use.contains_key(*entity)
                    && self
                        .index
                        .get(*entity)
                        .map_or(true, |slot| !self.writing.contains(slot))
            })
            .copied()
    }

    /// Picks the slot for a new entry, evicting old entries if the table is
    /// at capacity. See the module docs for the policy.
    pub fn allocate(&mut self, entry_count: u32, effective_maximum: u32) -> Allocation {
        let mut evicted = SmallVec::new();

        loop {
            let candidate = self.first_free_slot(entry_count);
            if candidate < effective_maximum {
                return Allocation {
                    index: candidate,
                    evicted,
                    pressure: false,
                };
            }

            match self.oldest_evictable() {
                Some(victim) => {
                    self.remove(&victim);
                    evicted.push(victim);
                }
                None => {
                    return Allocation {
                        index: candidate,
                        evicted,
                        pressure: true,
                    };
                }
            }
        }
    }

    /// Iterates the resident entries as (entity, slot, source).
    pub fn entries(&self) -> impl Iterator<Item = (Uuid, u32, Uuid)> + '_ {
        self.index.iter().map(|(entity, slot)| {
            let source = self
                .sources
                .get(entity)
                .copied()
                .unwrap_or_else(Uuid::nil);
            (*entity, *slot, source)
        })
    }

    /// Rebuilds the state from persisted records. Entities are placed at
    /// their recorded MRU positions (compacted over gaps); records without a
    /// position go to the tail, oldest, ordered by slot for determinism.
    pub fn restore(&mut self, records: &[RestoredEntry]) {
        self.clear();

        for record in records {
            self.index.insert(record.entity, record.slot);
            self.sources.insert(record.entity, record.source);
            self.occupied.insert(record.slot);
        }

        let mut placed: Vec<(usize, Uuid)> = records
            .iter()
            .filter_map(|r| r.mru_position.map(|pos| (pos, r.entity)))
            .collect();
        placed.sort_by_key(|(pos, _)| *pos);
        self.mru.extend(placed.into_iter().map(|(_, e)| e));

        let mut unplaced: Vec<(u32, Uuid)> = records
            .iter()
            .filter(|r| r.mru_position.is_none())
            .map(|r| (r.slot, r.entity))
            .collect();
        unplaced.sort_by_key(|(slot, _)| *slot);
        self.mru.extend(unplaced.into_iter().map(|(_, e)| e));
    }

    /// Debug check of the cross-structure invariants.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        assert_eq!(self.index.len(), self.sources.len());
        assert_eq!(self.index.len(), self.occupied.len());
        assert_eq!(self.index.len(), self.mru.len());

        let values: HashSet<u32> = self.index.values().copied().collect();
        assert_eq!(values, self.occupied);

        for entity in &self.mru {
            assert!(self.index.contains_key(entity));
        }
    }
}

/// One persisted entry, as handed back by the metadata loader.
#[derive(Debug, Clone, Copy)]
pub struct RestoredEntry {
    pub entity: Uuid,
    pub source: Uuid,
    pub slot: u32,
    pub mru_position: Option<usize>,
}
