//! # Image Table End-to-End Scenarios
//!
//! This module exercises the full store/fetch/evict/persist lifecycle of an
//! image table through its public API.
//!
//! ## Test Coverage
//!
//! 1. Store & Fetch
//!    - Pixel round-trip through the mapped file
//!    - Entry-at-a-time file growth
//!    - MRU promotion on store and fetch
//!
//! 2. Eviction & Aliasing
//!    - Oldest not-in-use entry evicted at capacity, slot reused
//!    - Held images pin their entity against eviction
//!    - All-pinned pressure grows the file instead of evicting
//!    - Overwriting a held entity renders into a fresh slot; the held
//!      image keeps its bytes and its slot until dropped
//!
//! 3. Header Verification
//!    - Source replacement invalidates the stale entry on fetch and exists
//!    - Re-store after invalidation works
//!
//! 4. Persistence
//!    - Reopen with the same format restores entries and MRU order
//!    - Reopen with a changed format discards both files
//!    - Missing metadata / missing data file reconciliation
//!
//! 5. Concurrency
//!    - Parallel stores and fetches of distinct entities
//!    - Held reads stable across concurrent overwrites of the same entity

use pixcache::{ImageFormat, ImageTable};
use tempfile::tempdir;
use uuid::Uuid;

const RED: [u8; 4] = [255, 0, 0, 255];
const GREEN: [u8; 4] = [0, 255, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];
const YELLOW: [u8; 4] = [255, 255, 0, 255];

/// 128x128 RGBA. Entries are small, so one chunk holds many and the
/// effective maximum is well above the configured two.
fn thumb_format() -> ImageFormat {
    ImageFormat::rgba8("thumb-128", 128, 128, 2).unwrap()
}

/// 512x512 RGBA with capacity four. One entry exceeds half the chunk
/// target, so a chunk holds the minimum of four entries, the effective
/// maximum equals the configured four, and storing a fifth entity evicts.
fn evicting_format() -> ImageFormat {
    ImageFormat::rgba8("thumb-512", 512, 512, 4).unwrap()
}

fn assert_solid(table: &ImageTable, entity: Uuid, source: Uuid, pixel: [u8; 4]) {
    let image = table
        .new_image_for(entity, source, false)
        .expect("image should be retrievable");
    for y in [0, image.height() / 2, image.height() - 1] {
        for px in image.row(y).chunks_exact(4) {
            assert_eq!(px, pixel);
        }
    }
}

// ============================================================================
// Store & Fetch
// ============================================================================

#[test]
fn store_two_fetch_one_tracks_size_and_recency() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
    let (e1, e2, s1) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    table.set_entry(e1, s1, |buf| buf.fill(&RED));
    table.set_entry(e2, s1, |buf| buf.fill(&BLUE));

    assert_eq!(table.file_length(), 2 * table.layout().entry_length() as u64);
    assert_eq!(table.mru_order(), vec![e2, e1]);

    assert_solid(&table, e1, s1, RED);
    assert_eq!(table.mru_order(), vec![e1, e2]);
}

#[test]
fn overwriting_same_entity_keeps_the_slot() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
    let (entity, source) = (Uuid::new_v4(), Uuid::new_v4());

    table.set_entry(entity, source, |buf| buf.fill(&RED));
    let slot = table.index_of(entity).unwrap();

    table.set_entry(entity, source, |buf| buf.fill(&BLUE));

    assert_eq!(table.index_of(entity), Some(slot));
    assert_eq!(table.file_length(), table.layout().entry_length() as u64);
    assert_solid(&table, entity, source, BLUE);
}

#[test]
fn preheated_fetch_returns_the_same_pixels() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
    let (entity, source) = (Uuid::new_v4(), Uuid::new_v4());

    table.set_entry(entity, source, |buf| buf.fill(&GREEN));

    let image = table.new_image_for(entity, source, true).unwrap();
    assert_eq!(&image.row(0)[..4], &GREEN);
    assert_eq!(image.row_stride(), table.layout().row_stride());
}

// ============================================================================
// Eviction
// ============================================================================

#[test]
fn storing_past_capacity_evicts_the_oldest_and_reuses_its_slot() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), evicting_format()).unwrap();
    let source = Uuid::new_v4();
    let entities: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

    for entity in &entities[..4] {
        table.set_entry(*entity, source, |buf| buf.fill(&RED));
    }
    assert_eq!(table.len(), 4);
    let oldest_slot = table.index_of(entities[0]).unwrap();

    table.set_entry(entities[4], source, |buf| buf.fill(&GREEN));

    assert_eq!(table.len(), 4);
    assert!(table.new_image_for(entities[0], source, false).is_none());
    assert_eq!(table.index_of(entities[4]), Some(oldest_slot));
    assert_eq!(table.file_length(), 4 * table.layout().entry_length() as u64);
    assert_solid(&table, entities[4], source, GREEN);
}

#[test]
fn held_image_is_never_evicted() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), evicting_format()).unwrap();
    let source = Uuid::new_v4();
    let entities: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

    for entity in &entities[..4] {
        table.set_entry(*entity, source, |buf| buf.fill(&RED));
    }

    // Fetch the oldest entity; holding its image pins it.
    let held = table.new_image_for(entities[0], source, false).unwrap();

    table.set_entry(entities[4], source, |buf| buf.fill(&YELLOW));

    // The pinned entity survives; the oldest unpinned one went instead.
    assert!(table.index_of(entities[0]).is_some());
    assert!(table.index_of(entities[1]).is_none());
    assert_eq!(&held.row(0)[..4], &RED);

    drop(held);

    // Recency is now [e4, e0, e3, e2]; the next victim is the tail, e2.
    // The pin on e0 no longer matters but its fetch-promotion does.
    table.set_entry(Uuid::new_v4(), source, |buf| buf.fill(&BLUE));
    assert!(table.index_of(entities[2]).is_none());
    assert!(table.index_of(entities[0]).is_some());
}

#[test]
fn overwriting_a_held_entity_renders_into_a_fresh_slot() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
    let (entity, source) = (Uuid::new_v4(), Uuid::new_v4());

    table.set_entry(entity, source, |buf| buf.fill(&RED));
    let old_slot = table.index_of(entity).unwrap();
    let held = table.new_image_for(entity, source, false).unwrap();

    table.set_entry(entity, source, |buf| buf.fill(&BLUE));

    // The held image keeps reading the old, untouched bytes...
    assert_eq!(&held.row(0)[..4], &RED);
    // ...while the entity moved to a new slot holding the new render.
    let new_slot = table.index_of(entity).unwrap();
    assert_ne!(new_slot, old_slot);
    assert_solid(&table, entity, source, BLUE);

    // The old slot stays out of the free pool while the image lives.
    let other = Uuid::new_v4();
    table.set_entry(other, source, |buf| buf.fill(&GREEN));
    assert_ne!(table.index_of(other).unwrap(), old_slot);

    drop(held);

    let third = Uuid::new_v4();
    table.set_entry(third, source, |buf| buf.fill(&YELLOW));
    assert_eq!(table.index_of(third).unwrap(), old_slot);
    assert_solid(&table, third, source, YELLOW);
}

#[test]
fn all_entries_pinned_grows_instead_of_evicting() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), evicting_format()).unwrap();
    let source = Uuid::new_v4();
    let entities: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

    for entity in &entities {
        table.set_entry(*entity, source, |buf| buf.fill(&RED));
    }
    let held: Vec<_> = entities
        .iter()
        .map(|e| table.new_image_for(*e, source, false).unwrap())
        .collect();

    let extra = Uuid::new_v4();
    table.set_entry(extra, source, |buf| buf.fill(&BLUE));

    assert_eq!(table.len(), 5);
    assert_eq!(table.entry_count(), 5);
    for entity in &entities {
        assert!(table.index_of(*entity).is_some());
    }
    assert_solid(&table, extra, source, BLUE);

    for image in &held {
        assert_eq!(&image.row(0)[..4], &RED);
    }
}

// ============================================================================
// Header Verification
// ============================================================================

#[test]
fn replacing_the_source_invalidates_the_stale_entry() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
    let entity = Uuid::new_v4();
    let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());

    table.set_entry(entity, s1, |buf| buf.fill(&RED));
    let slot = table.index_of(entity).unwrap();

    // Re-render from a new source: same slot, header now names s2.
    table.set_entry(entity, s2, |buf| buf.fill(&BLUE));
    assert_eq!(table.index_of(entity), Some(slot));

    // Fetching with the old source is a mismatch that deletes the entry...
    assert!(table.new_image_for(entity, s1, false).is_none());
    // ...so even the current source now misses.
    assert!(table.new_image_for(entity, s2, false).is_none());

    // A fresh store works again.
    table.set_entry(entity, s2, |buf| buf.fill(&BLUE));
    assert_solid(&table, entity, s2, BLUE);
}

#[test]
fn exists_mirrors_fetch_verification() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
    let entity = Uuid::new_v4();
    let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());

    table.set_entry(entity, s1, |buf| buf.fill(&RED));
    assert!(table.entry_exists(entity, s1));

    // Mismatch deletes, exactly like a fetch would.
    assert!(!table.entry_exists(entity, s2));
    assert!(!table.entry_exists(entity, s1));
    assert!(table.is_empty());
}

#[test]
fn delete_makes_fetch_miss() {
    let dir = tempdir().unwrap();
    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
    let (entity, source) = (Uuid::new_v4(), Uuid::new_v4());

    table.set_entry(entity, source, |buf| buf.fill(&RED));
    table.delete_entry(entity);

    assert!(table.new_image_for(entity, source, false).is_none());
    assert!(table.is_empty());
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn reopen_with_same_format_restores_entries_and_recency() {
    let dir = tempdir().unwrap();
    let source = Uuid::new_v4();
    let entities: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

    let mru_before = {
        let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
        table.set_entry(entities[0], source, |buf| buf.fill(&RED));
        table.set_entry(entities[1], source, |buf| buf.fill(&GREEN));
        table.set_entry(entities[2], source, |buf| buf.fill(&BLUE));
        // A fetch reorders recency; the order must survive the reopen.
        table.new_image_for(entities[0], source, false).unwrap();
        table.delete_entry(entities[1]);
        table.flush_metadata();
        table.mru_order()
    };

    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();

    assert_eq!(table.mru_order(), mru_before);
    assert_solid(&table, entities[0], source, RED);
    assert_solid(&table, entities[2], source, BLUE);
    assert!(table.new_image_for(entities[1], source, false).is_none());
}

#[test]
fn reopen_with_changed_format_discards_both_files() {
    let dir = tempdir().unwrap();
    let (entity, source) = (Uuid::new_v4(), Uuid::new_v4());

    {
        let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
        table.set_entry(entity, source, |buf| buf.fill(&RED));
        table.flush_metadata();
    }

    // Same name, different pixel geometry: the fingerprint changes.
    let changed = ImageFormat::rgba8("thumb-128", 64, 64, 2).unwrap();
    let table = ImageTable::open_in(dir.path(), changed).unwrap();

    assert!(table.is_empty());
    assert_eq!(table.file_length(), 0);
    assert!(table.new_image_for(entity, source, false).is_none());
}

#[test]
fn missing_metadata_opens_with_empty_index() {
    let dir = tempdir().unwrap();
    let (entity, source) = (Uuid::new_v4(), Uuid::new_v4());

    {
        let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
        table.set_entry(entity, source, |buf| buf.fill(&RED));
        table.flush_metadata();
    }

    std::fs::remove_file(dir.path().join("thumb-128.metadata")).unwrap();

    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
    assert!(table.is_empty());
    assert!(table.new_image_for(entity, source, false).is_none());
    // The data file itself was left alone.
    assert!(table.file_length() > 0);
}

#[test]
fn missing_data_file_resets_stale_metadata() {
    let dir = tempdir().unwrap();
    let (entity, source) = (Uuid::new_v4(), Uuid::new_v4());

    {
        let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
        table.set_entry(entity, source, |buf| buf.fill(&RED));
        table.flush_metadata();
    }

    std::fs::remove_file(dir.path().join("thumb-128.imageTable")).unwrap();

    let table = ImageTable::open_in(dir.path(), thumb_format()).unwrap();
    assert!(table.is_empty());
    assert_eq!(table.file_length(), 0);
    assert!(table.new_image_for(entity, source, false).is_none());

    // The reconciled table is fully usable.
    table.set_entry(entity, source, |buf| buf.fill(&GREEN));
    assert_solid(&table, entity, source, GREEN);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn parallel_stores_and_fetches_stay_consistent() {
    let dir = tempdir().unwrap();
    let format = ImageFormat::rgba8("thumb-par", 64, 64, 256).unwrap();
    let table = std::sync::Arc::new(ImageTable::open_in(dir.path(), format).unwrap());
    let source = Uuid::new_v4();

    let handles: Vec<_> = (0..8u8)
        .map(|worker| {
            let table = std::sync::Arc::clone(&table);
            std::thread::spawn(move || {
                let entity = Uuid::new_v4();
                let pixel = [worker, worker, worker, 255];
                for _ in 0..16 {
                    table.set_entry(entity, source, |buf| buf.fill(&pixel));
                    let image = table.new_image_for(entity, source, false).unwrap();
                    assert_eq!(&image.row(0)[..4], &pixel);
                }
                entity
            })
        })
        .collect();

    let entities: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(table.len(), 8);
    for entity in entities {
        assert!(table.entry_exists(entity, source));
    }
}

#[test]
fn held_read_is_stable_across_concurrent_overwrites() {
    let dir = tempdir().unwrap();
    let format = ImageFormat::rgba8("thumb-hold", 64, 64, 128).unwrap();
    let table = std::sync::Arc::new(ImageTable::open_in(dir.path(), format).unwrap());
    let (entity, source) = (Uuid::new_v4(), Uuid::new_v4());

    table.set_entry(entity, source, |buf| buf.fill(&RED));
    let held = table.new_image_for(entity, source, false).unwrap();

    let writer = {
        let table = std::sync::Arc::clone(&table);
        std::thread::spawn(move || {
            for round in 0..32u8 {
                table.set_entry(entity, source, |buf| buf.fill(&[round, round, round, 255]));
            }
        })
    };

    // These reads race the overwrites. The held image's slot is pinned, so
    // every overwrite lands in a fresh slot and every read here observes
    // the original render, never a torn frame.
    for _ in 0..64 {
        assert_eq!(&held.row(0)[..4], &RED);
        assert!(held.pixels().iter().step_by(4).all(|&b| b == 255));
    }

    writer.join().unwrap();

    let image = table.new_image_for(entity, source, false).unwrap();
    assert_eq!(&image.row(0)[..4], &[31, 31, 31, 255]);
}
