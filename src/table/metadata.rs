//! # Metadata Persistence
//!
//! Serializes the index/MRU state of one table to `<format>.metadata` and
//! loads it back at open. The format is a compact, deterministic
//! little-endian encoding.
//!
//! ## File Format
//!
//! ```text
//! Offset  Size  Description
//! 0       16    Magic: "pixcache meta v1"
//! 16      4     Version: 1 (u32 little-endian)
//! 20      4     Fingerprint length F (u32)
//! 24      4     Record count N (u32)
//! 28      4     Reserved
//! 32      F     Format fingerprint bytes
//! 32+F    48*N  Entry records
//! ```
//!
//! ### Record Format (48 bytes each)
//!
//! ```text
//! Offset  Size  Description
//! 0       16    Entity id
//! 16      16    Source-image id
//! 32      4     Table index (u32)
//! 36      4     MRU-present flag (u32, 0 or 1)
//! 40      4     MRU index (u32, 0 = most recent; valid when flag is 1)
//! 44      4     Reserved
//! ```
//!
//! ## Write Path
//!
//! Mutations snapshot the state under the table lock and hand the snapshot
//! to a dedicated writer thread through a single-slot mailbox. The mailbox
//! coalesces: a snapshot submitted while an older one is still waiting
//! replaces it, so only the newest state ever reaches disk: equivalent to a
//! serial queue that never runs a stale job. Writes are plain overwrites; a
//! write torn by a crash is detected and discarded by the next open's
//! reconciliation.
//!
//! If the worker thread cannot be spawned, the writer degrades to
//! synchronous writes on the submitting thread (logged). Metadata is
//! best-effort either way, so a degraded writer never blocks a table from
//! opening.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{ensure, Result};
use parking_lot::{Condvar, Mutex};
use tracing::warn;
use uuid::Uuid;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::state::RestoredEntry;
use crate::config::{METADATA_MAGIC, METADATA_VERSION};

pub const METADATA_HEADER_SIZE: usize = 32;
pub const METADATA_RECORD_SIZE: usize = 48;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetadataHeader {
    magic: [u8; 16],
    version: U32,
    fingerprint_len: U32,
    record_count: U32,
    reserved: U32,
}

const _: () = assert!(std::mem::size_of::<MetadataHeader>() == METADATA_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetadataRecord {
    entity_id: [u8; 16],
    source_id: [u8; 16],
    table_index: U32,
    has_mru: U32,
    mru_index: U32,
    reserved: U32,
}

const _: () = assert!(std::mem::size_of::<MetadataRecord>() == METADATA_RECORD_SIZE);

/// A point-in-time copy of the persistable table state.
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    pub fingerprint: Vec<u8>,
    pub entries: Vec<RestoredEntry>,
}

impl MetadataSnapshot {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            METADATA_HEADER_SIZE + self.fingerprint.len() + self.entries.len() * METADATA_RECORD_SIZE,
        );

        let header = MetadataHeader {
            magic: *METADATA_MAGIC,
            version: U32::new(METADATA_VERSION),
            fingerprint_len: U32::new(self.fingerprint.len() as u32),
            record_count: U32::new(self.entries.len() as u32),
            reserved: U32::new(0),
        };
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.fingerprint);

        for entry in &self.entries {
            let record = MetadataRecord {
                entity_id: *entry.entity.as_bytes(),
                source_id: *entry.source.as_bytes(),
                table_index: U32::new(entry.slot),
                has_mru: U32::new(entry.mru_position.is_some() as u32),
                mru_index: U32::new(entry.mru_position.unwrap_or(0) as u32),
                reserved: U32::new(0),
            };
            buf.extend_from_slice(record.as_bytes());
        }

        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= METADATA_HEADER_SIZE,
            "metadata file truncated: {} bytes",
            bytes.len()
        );

        let header = MetadataHeader::ref_from_bytes(&bytes[..METADATA_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse metadata header: {:?}", e))?;

        ensure!(
            &header.magic == METADATA_MAGIC,
            "invalid magic bytes in metadata file"
        );
        ensure!(
            header.version.get() == METADATA_VERSION,
            "unsupported metadata version: {} (expected {})",
            header.version.get(),
            METADATA_VERSION
        );

        let fingerprint_len = header.fingerprint_len.get() as usize;
        let record_count = header.record_count.get() as usize;
        let expected = METADATA_HEADER_SIZE + fingerprint_len + record_count * METADATA_RECORD_SIZE;
        ensure!(
            bytes.len() >= expected,
            "metadata file truncated: {} bytes, expected {}",
            bytes.len(),
            expected
        );

        let fingerprint = bytes[METADATA_HEADER_SIZE..METADATA_HEADER_SIZE + fingerprint_len].to_vec();

        let mut entries = Vec::with_capacity(record_count);
        let mut offset = METADATA_HEADER_SIZE + fingerprint_len;
        for _ in 0..record_count {
            let record = MetadataRecord::ref_from_bytes(&bytes[offset..offset + METADATA_RECORD_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse metadata record: {:?}", e))?;

            entries.push(RestoredEntry {
                entity: Uuid::from_bytes(record.entity_id),
                source: Uuid::from_bytes(record.source_id),
                slot: record.table_index.get(),
                mru_position: (record.has_mru.get() != 0).then(|| record.mru_index.get() as usize),
            });
            offset += METADATA_RECORD_SIZE;
        }

        Ok(Self {
            fingerprint,
            entries,
        })
    }
}

#[derive(Default)]
struct Mailbox {
    pending: Option<MetadataSnapshot>,
    submitted: u64,
    written: u64,
    shutdown: bool,
}

struct WriterShared {
    path: PathBuf,
    mailbox: Mutex<Mailbox>,
    wakeup: Condvar,
}

/// Dedicated writer thread for one table's metadata file.
pub struct MetadataWriter {
    shared: Arc<WriterShared>,
    worker: Option<JoinHandle<()>>,
}

impl MetadataWriter {
    /// Starts the writer for one table. Construction never fails: if the
    /// worker thread cannot be spawned, the writer runs in degraded mode
    /// and [`Self::submit`] writes synchronously instead.
    pub fn spawn(path: PathBuf) -> Self {
        let shared = Arc::new(WriterShared {
            path,
            mailbox: Mutex::new(Mailbox::default()),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = match std::thread::Builder::new()
            .name("pixcache-metadata".into())
            .spawn(move || Self::run(worker_shared))
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(
                    path = %shared.path.display(),
                    error = %err,
                    "failed to spawn metadata writer thread; falling back to synchronous writes"
                );
                None
            }
        };

        Self { shared, worker }
    }

    fn write_file(path: &Path, snapshot: &MetadataSnapshot) {
        let bytes = snapshot.encode();
        if let Err(err) = fs::write(path, &bytes) {
            warn!(
                path = %path.display(),
                error = %err,
                "metadata write failed; state will be re-emitted on the next save"
            );
        }
    }

    fn run(shared: Arc<WriterShared>) {
        loop {
            let (snapshot, seq) = {
                let mut mailbox = shared.mailbox.lock();
                loop {
                    if let Some(snapshot) = mailbox.pending.take() {
                        break (snapshot, mailbox.submitted);
                    }
                    if mailbox.shutdown {
                        return;
                    }
                    shared.wakeup.wait(&mut mailbox);
                }
            };

            Self::write_file(&shared.path, &snapshot);

            let mut mailbox = shared.mailbox.lock();
            mailbox.written = seq;
            shared.wakeup.notify_all();
        }
    }

    /// Queues a snapshot for writing, replacing any not-yet-written one.
    /// Never blocks on I/O unless the writer is degraded (no worker
    /// thread), in which case the write happens here.
    pub fn submit(&self, snapshot: MetadataSnapshot) {
        if self.worker.is_none() {
            Self::write_file(&self.shared.path, &snapshot);
            return;
        }

        let mut mailbox = self.shared.mailbox.lock();
        mailbox.pending = Some(snapshot);
        mailbox.submitted += 1;
        self.shared.wakeup.notify_all();
    }

    /// Blocks until every snapshot submitted so far has been written (or the
    /// writer shut down). In degraded mode every submit already wrote.
    pub fn flush(&self) {
        if self.worker.is_none() {
            return;
        }

        let mut mailbox = self.shared.mailbox.lock();
        let target = mailbox.submitted;
        while mailbox.written < target && !mailbox.shutdown {
            self.shared.wakeup.wait(&mut mailbox);
        }
    }
}

impl Drop for MetadataWriter {
    fn drop(&mut self) {
        {
            let mut mailbox = self.shared.mailbox.lock();
            mailbox.shutdown = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
