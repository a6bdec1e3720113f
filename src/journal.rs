// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The journal façade: one queue's on-disk state.
//!
//! A [`Journal`] owns a queue's directory entries (writer segments and
//! reader state files) plus the id index and the reader registry. The
//! collaborating in-memory queue drives it:
//! - [`append`](Journal::append) persists enqueued items (ids come
//!   from the collaborator)
//! - [`reader`](Journal::reader) opens or revives named readers
//! - [`rotate`](Journal::rotate) / [`truncate`](Journal::truncate)
//!   manage the segment chain ([`archive_size`](Journal::archive_size)
//!   informs the trigger decision, which is the collaborator's)
//! - [`checkpoint`](Journal::checkpoint) durably snapshots every reader
//!
//! ## Concurrency
//!
//! The reader map and the id index are copy-on-write snapshots behind
//! `ArcSwap`: lookups are lock-free loads, mutations (reader creation,
//! rotation, truncation) build a replacement map under a mutex and
//! publish it wholesale. A background thread fsyncs the active segment
//! every sync interval; appends only touch the OS page cache.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use chrono::Utc;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use snafu::ensure;
use tracing::{debug, error, info, warn};

use crate::{
    Result,
    config::JournalConfig,
    error::{InvalidPathSnafu, ItemTooLargeSnafu, ProtocolMisuseSnafu},
    index::IdIndex,
    path::{
        is_valid_queue_name, is_valid_reader_name, list_reader_files, list_segment_files,
        queue_names_from_dir, reader_path, remove_rewrite_temps, segment_path,
    },
    reader::Reader,
    record::{Item, Record},
    segment::{SegmentReader, SegmentWriter},
};

/// The active writer segment and the append bookkeeping around it.
#[derive(Debug)]
struct ActiveSegment {
    writer:   SegmentWriter,
    stamp:    u64,
    /// First item id in this segment, once known; joining the id index
    /// is deferred until then.
    first_id: Option<u64>,
    /// Last id appended to the queue, across all segments.
    last_id:  Option<u64>,
}

/// A durable, file-backed queue journal.
#[derive(Debug)]
pub struct Journal {
    config:      Arc<JournalConfig>,
    index:       Arc<ArcSwap<IdIndex>>,
    readers:     ArcSwap<HashMap<String, Arc<Reader>>>,
    reader_lock: Mutex<()>,
    writer:      Arc<Mutex<ActiveSegment>>,
    flusher:     Option<JoinHandle<()>>,
    flusher_tx:  Option<Sender<()>>,
}

impl Journal {
    /// Open (or create) the journal for `config.queue_name` inside
    /// `config.dir`.
    ///
    /// Enumerates writer segments and reader state files, builds the
    /// id index, replays each reader, and opens the newest segment for
    /// appending. Corrupt files are logged and skipped; they never
    /// prevent the journal from opening. Stray `~~` rewrite files are
    /// deleted first.
    ///
    /// The queue name must match `[^.~]+`; every file this journal
    /// writes starts with `<queue_name>.`, and a name outside that
    /// grammar would be misparsed (or swept as a rewrite temp) on the
    /// next open.
    pub fn open(config: JournalConfig) -> Result<Self> {
        ensure!(
            is_valid_queue_name(&config.queue_name),
            InvalidPathSnafu {
                path: config.dir.join(&config.queue_name),
            }
        );

        let config = Arc::new(config);
        std::fs::create_dir_all(&config.dir)?;

        let swept = remove_rewrite_temps(&config.dir, &config.queue_name)?;
        if swept > 0 {
            info!(queue = %config.queue_name, swept, "Removed stale rewrite files");
        }

        let segments = list_segment_files(&config.dir, &config.queue_name)?;
        let index = IdIndex::build(&segments);
        let active = Self::open_active_segment(&config, &segments, &index)?;

        let index = Arc::new(ArcSwap::from_pointee(index));

        let mut readers = HashMap::new();
        for (name, path) in list_reader_files(&config.dir, &config.queue_name)? {
            let reader = Reader::new(name.clone(), path, Arc::clone(&index), 0);
            match reader.read_state() {
                Ok(()) => {
                    readers.insert(name, Arc::new(reader));
                }
                Err(e) => {
                    warn!(reader = %name, error = %e, "Skipping reader with unreadable state");
                }
            }
        }

        let writer = Arc::new(Mutex::new(active));
        let (flusher, flusher_tx) = Self::spawn_flusher(&config, &writer)?;

        info!(
            queue = %config.queue_name,
            dir = ?config.dir,
            segments = segments.len(),
            readers = readers.len(),
            "Journal opened"
        );

        Ok(Self {
            config,
            index,
            readers: ArcSwap::from_pointee(readers),
            reader_lock: Mutex::new(()),
            writer,
            flusher,
            flusher_tx,
        })
    }

    /// Open the newest segment for appending, or mint the first one.
    /// An unreadable newest segment is left frozen (the index already
    /// skipped it) and a fresh segment takes over.
    fn open_active_segment(
        config: &JournalConfig,
        segments: &[(u64, PathBuf)],
        index: &IdIndex,
    ) -> Result<ActiveSegment> {
        if let Some((stamp, path)) = segments.last() {
            match SegmentWriter::open(path, config.sync_policy) {
                Ok(writer) => {
                    let first_id = index
                        .entries()
                        .find(|(_, p)| p.as_path() == path.as_path())
                        .map(|(id, _)| id);
                    let last_id = writer
                        .last_put_id()
                        .or_else(|| last_put_id_before(index, path));
                    return Ok(ActiveSegment {
                        writer,
                        stamp: *stamp,
                        first_id,
                        last_id,
                    });
                }
                Err(e) if e.is_corruption() => {
                    warn!(path = ?path, error = %e, "Newest segment is unreadable, starting a fresh one");
                }
                Err(e) => return Err(e),
            }
        }

        let prev_stamp = segments.last().map(|(stamp, _)| *stamp);
        let stamp = mint_stamp(prev_stamp);
        let path = segment_path(&config.dir, &config.queue_name, stamp);
        let writer = SegmentWriter::open(&path, config.sync_policy)?;
        let last_id = index
            .entries()
            .last()
            .and_then(|(_, path)| last_put_id_in(path));
        Ok(ActiveSegment {
            writer,
            stamp,
            first_id: None,
            last_id,
        })
    }

    fn spawn_flusher(
        config: &JournalConfig,
        writer: &Arc<Mutex<ActiveSegment>>,
    ) -> Result<(Option<JoinHandle<()>>, Option<Sender<()>>)> {
        let Some(interval) = config.sync_policy.interval() else {
            return Ok((None, None));
        };

        let (tx, rx) = channel::bounded::<()>(0);
        let writer = Arc::clone(writer);
        let handle = thread::Builder::new()
            .name("qjournal-sync".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = writer.lock().writer.flush() {
                                error!(error = %e, "Timed segment sync failed");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                if let Err(e) = writer.lock().writer.flush() {
                    error!(error = %e, "Final segment sync failed");
                }
            })?;

        Ok((Some(handle), Some(tx)))
    }

    /// Persist one item into the active segment.
    ///
    /// Ids are assigned by the collaborator; the journal only enforces
    /// that they keep increasing. The first item of a fresh segment
    /// publishes that segment into the id index.
    pub fn append(&self, item: Item) -> Result<()> {
        ensure!(
            item.data.len() <= self.config.max_item_size,
            ItemTooLargeSnafu {
                len: item.data.len(),
                max: self.config.max_item_size,
            }
        );

        let mut active = self.writer.lock();
        if let Some(last) = active.last_id {
            ensure!(
                item.id > last,
                ProtocolMisuseSnafu {
                    reason: format!("item id {} not above last appended id {last}", item.id),
                }
            );
        }

        let id = item.id;
        active.writer.append(&Record::Put(item))?;
        active.last_id = Some(id);

        if active.first_id.is_none() {
            active.first_id = Some(id);
            let path = active.writer.path().to_path_buf();
            self.index
                .store(Arc::new(self.index.load().with_segment(id, path)));
            debug!(queue = %self.config.queue_name, first_id = id, "Segment joined the id index");
        }

        Ok(())
    }

    /// Freeze the active segment and start a new one.
    ///
    /// No-op while the active segment holds no items. The frozen
    /// segment keeps its id-index entry; the new one joins on its
    /// first append.
    pub fn rotate(&self) -> Result<()> {
        let mut active = self.writer.lock();
        if active.first_id.is_none() {
            debug!(queue = %self.config.queue_name, "Skipping rotation of an empty segment");
            return Ok(());
        }
        active.writer.flush()?;

        let stamp = mint_stamp(Some(active.stamp));
        let path = segment_path(&self.config.dir, &self.config.queue_name, stamp);
        let writer = SegmentWriter::open(&path, self.config.sync_policy)?;

        info!(queue = %self.config.queue_name, from = active.stamp, to = stamp, "Rotated segment");
        let last_id = active.last_id;
        *active = ActiveSegment {
            writer,
            stamp,
            first_id: None,
            last_id,
        };
        Ok(())
    }

    /// Delete leading frozen segments no live reader still needs.
    ///
    /// A segment whose successor starts at id `g` goes once every
    /// reader's head is `≥ g - 1`; the scan stops at the first segment
    /// that must stay, and the active segment always stays. Returns
    /// how many segments were deleted.
    pub fn truncate(&self) -> Result<usize> {
        let active = self.writer.lock();
        let readers = self.readers.load();
        let min_head = readers.values().map(|r| r.head()).min();

        let snapshot = self.index.load_full();
        let entries: Vec<(u64, PathBuf)> = snapshot
            .entries()
            .map(|(id, path)| (id, path.clone()))
            .collect();

        let mut next = (*snapshot).clone();
        let mut removed = 0;
        for pair in entries.windows(2) {
            let (first_id, path) = &pair[0];
            let (successor_first, _) = &pair[1];
            if path.as_path() == active.writer.path() {
                break;
            }
            if min_head.is_some_and(|head| head < successor_first - 1) {
                break;
            }
            std::fs::remove_file(path)?;
            next = next.without_segment(*first_id);
            removed += 1;
            info!(queue = %self.config.queue_name, segment = ?path, "Truncated segment");
        }

        if removed > 0 {
            self.index.store(Arc::new(next));
        }
        Ok(removed)
    }

    /// Look up or create the reader named `name`.
    ///
    /// The uncontended path is a lock-free map load. Creation takes
    /// the registry mutex, re-checks, replays the reader's state file
    /// when one exists (the file wins over `initial_head`), and
    /// publishes a new map snapshot.
    pub fn reader(&self, name: &str, initial_head: u64) -> Result<Arc<Reader>> {
        if let Some(reader) = self.readers.load().get(name) {
            return Ok(Arc::clone(reader));
        }

        ensure!(
            is_valid_reader_name(name),
            ProtocolMisuseSnafu {
                reason: format!("invalid reader name {name:?}"),
            }
        );

        let _guard = self.reader_lock.lock();
        if let Some(reader) = self.readers.load().get(name) {
            return Ok(Arc::clone(reader));
        }

        let path = reader_path(&self.config.dir, &self.config.queue_name, name);
        let reader = Reader::new(
            name.to_string(),
            path.clone(),
            Arc::clone(&self.index),
            initial_head,
        );
        if path.exists() {
            reader.read_state()?;
        }

        let reader = Arc::new(reader);
        let mut map = (*self.readers.load_full()).clone();
        map.insert(name.to_string(), Arc::clone(&reader));
        self.readers.store(Arc::new(map));

        info!(queue = %self.config.queue_name, reader = %name, head = reader.head(), "Opened reader");
        Ok(reader)
    }

    /// Drop the reader and delete its state file.
    pub fn remove_reader(&self, name: &str) -> Result<()> {
        let _guard = self.reader_lock.lock();
        let mut map = (*self.readers.load_full()).clone();
        let Some(reader) = map.remove(name) else {
            return Ok(());
        };
        self.readers.store(Arc::new(map));

        match std::fs::remove_file(reader.state_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(queue = %self.config.queue_name, reader = %name, "Removed reader");
        Ok(())
    }

    /// The segment containing `id`, if any.
    pub fn file_for_id(&self, id: u64) -> Option<PathBuf> {
        self.index.load().file_for_id(id).cloned()
    }

    /// Total bytes across all writer segments.
    pub fn archive_size(&self) -> Result<u64> {
        let active = self.writer.lock();
        let mut total = active.writer.len();
        for (_, path) in list_segment_files(&self.config.dir, &self.config.queue_name)? {
            if path.as_path() != active.writer.path() {
                total += std::fs::metadata(&path)?.len();
            }
        }
        Ok(total)
    }

    /// Durably checkpoint every reader. Readers are independent; the
    /// order is unspecified.
    pub fn checkpoint(&self) -> Result<()> {
        for reader in self.readers.load().values() {
            reader.checkpoint()?;
        }
        Ok(())
    }

    /// Fsync the active segment now.
    pub fn flush(&self) -> Result<()> { self.writer.lock().writer.flush() }

    /// Stop the sync thread, flush, and close all open segment files.
    /// Deletes nothing.
    pub fn close(mut self) -> Result<()> { self.shutdown() }

    fn shutdown(&mut self) -> Result<()> {
        self.flusher_tx.take();
        if let Some(handle) = self.flusher.take()
            && handle.join().is_err()
        {
            error!(queue = %self.config.queue_name, "Sync thread panicked");
        }
        self.writer.lock().writer.flush()?;
        info!(queue = %self.config.queue_name, "Journal closed");
        Ok(())
    }

    pub fn config(&self) -> &JournalConfig { &self.config }

    /// Queue names present in `dir`: the prefix before the first `.`
    /// of each file name, rewrite temps ignored.
    pub fn queue_names_from_dir<P: AsRef<Path>>(dir: P) -> Result<BTreeSet<String>> {
        queue_names_from_dir(dir)
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if self.flusher.is_some() || self.flusher_tx.is_some() {
            let _ = self.shutdown();
        }
    }
}

/// Millisecond stamp for a new segment, strictly above the previous
/// segment's stamp even when the clock has not advanced.
fn mint_stamp(prev: Option<u64>) -> u64 {
    let now = Utc::now().timestamp_millis() as u64;
    match prev {
        Some(prev) if now <= prev => prev + 1,
        _ => now,
    }
}

/// Last `Put` id in the newest indexed segment other than `active`.
fn last_put_id_before(index: &IdIndex, active: &Path) -> Option<u64> {
    let (_, path) = index
        .entries()
        .filter(|(_, path)| path.as_path() != active)
        .last()?;
    last_put_id_in(path)
}

/// Scan a segment for its final `Put` id, stopping quietly at
/// corruption.
fn last_put_id_in(path: &Path) -> Option<u64> {
    let mut reader = match SegmentReader::open(path) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(path = ?path, error = %e, "Cannot scan segment for its last id");
            return None;
        }
    };

    let mut last = None;
    loop {
        match reader.next() {
            Ok(Some(Record::Put(item))) => last = Some(item.id),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                warn!(path = ?path, error = %e, "Stopping last-id scan at corrupt record");
                break;
            }
        }
    }
    last
}
