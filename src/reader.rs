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

//! Per-reader consumption state.
//!
//! A [`Reader`] tracks how far one named consumer has progressed
//! through the queue:
//! - `head`: every id `≤ head` has been consumed
//! - the done-set: ids `> head + 1` acknowledged out of order
//! - an optional read-behind cursor streaming items straight from the
//!   segment files when the consumer has fallen out of the in-memory
//!   tail
//!
//! State survives restarts through the reader's state file,
//! checkpointed by writing a `~~` sibling and renaming it over the
//! original, so a crash at any point leaves the previous valid file.
//!
//! ## Concurrency
//!
//! `commit`, `set_head` and the read-behind calls are serialised by
//! the consumer that owns the reader. `checkpoint` may run concurrently
//! with commits: it locks the commit state only long enough to copy
//! `(head, done-set)` and does its file I/O unlocked.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use snafu::{OptionExt, ensure};
use tracing::{debug, warn};

use crate::{
    Result,
    error::{ProtocolMisuseSnafu, UnknownIdSnafu},
    index::IdIndex,
    path::REWRITE_SUFFIX,
    record::{self, Item, Record},
    segment::SegmentReader,
};

#[derive(Debug, Default)]
struct CommitState {
    head: u64,
    done: BTreeSet<u64>,
}

impl CommitState {
    /// Restore the invariants after a bulk change to `head` or `done`:
    /// drop done ids `≤ head`, then absorb the contiguous run starting
    /// at `head + 1`.
    fn normalize(&mut self) {
        self.done = self.done.split_off(&(self.head + 1));
        while self.done.remove(&(self.head + 1)) {
            self.head += 1;
        }
    }
}

#[derive(Debug)]
struct ReadBehind {
    segment:      SegmentReader,
    last_yielded: u64,
}

/// One named reader of the queue.
#[derive(Debug)]
pub struct Reader {
    name:        String,
    path:        PathBuf,
    state:       Mutex<CommitState>,
    read_behind: Mutex<Option<ReadBehind>>,
    index:       Arc<ArcSwap<IdIndex>>,
}

impl Reader {
    pub(crate) fn new(
        name: String,
        path: PathBuf,
        index: Arc<ArcSwap<IdIndex>>,
        initial_head: u64,
    ) -> Self {
        Self {
            name,
            path,
            state: Mutex::new(CommitState {
                head: initial_head,
                done: BTreeSet::new(),
            }),
            read_behind: Mutex::new(None),
            index,
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub(crate) fn state_path(&self) -> &Path { &self.path }

    /// Greatest id below which everything has been consumed.
    pub fn head(&self) -> u64 { self.state.lock().head }

    /// Sorted snapshot of the out-of-order acknowledgements.
    pub fn done_set(&self) -> Vec<u64> { self.state.lock().done.iter().copied().collect() }

    /// Force the head forward to `id` (never backwards), dropping done
    /// ids the new head covers.
    pub fn set_head(&self, id: u64) {
        let mut state = self.state.lock();
        if id > state.head {
            state.head = id;
        }
        state.normalize();
    }

    /// Acknowledge `id`.
    ///
    /// `head + 1` advances the head and absorbs any contiguous run
    /// waiting in the done-set; anything further ahead parks in the
    /// done-set. Ids at or below the head, or already acknowledged,
    /// are contract violations.
    pub fn commit(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(
            id > state.head,
            ProtocolMisuseSnafu {
                reason: format!(
                    "reader {}: commit of id {id} at or below head {}",
                    self.name, state.head
                ),
            }
        );

        if id == state.head + 1 {
            state.head = id;
            loop {
                let next = state.head + 1;
                if !state.done.remove(&next) {
                    break;
                }
                state.head += 1;
            }
        } else {
            ensure!(
                !state.done.contains(&id),
                ProtocolMisuseSnafu {
                    reason: format!("reader {}: id {id} acknowledged twice", self.name),
                }
            );
            state.done.insert(id);
        }
        Ok(())
    }

    /// Replay the reader state file, if it exists.
    ///
    /// `ReadHead` records apply absolutely (last wins) and `ReadDone`
    /// records accumulate. Replay is lenient: a torn tail ends it
    /// normally and a corrupt record ends it with a warning, keeping
    /// the prefix replayed so far.
    pub(crate) fn read_state(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let mut reader = match SegmentReader::open(&self.path) {
            Ok(reader) => reader,
            Err(e) if e.is_corruption() => {
                warn!(reader = %self.name, error = %e, "Ignoring unreadable reader state file");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut head = 0u64;
        let mut done = BTreeSet::new();
        loop {
            match reader.next() {
                Ok(Some(Record::ReadHead(id))) => head = id,
                Ok(Some(Record::ReadDone(ids))) => done.extend(ids),
                Ok(Some(record)) => {
                    warn!(reader = %self.name, ?record, "Ignoring foreign record in reader state file");
                }
                Ok(None) => break,
                Err(e) if e.is_corruption() => {
                    warn!(reader = %self.name, error = %e, "Stopping reader state replay at corrupt record");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let mut state = self.state.lock();
        state.head = head;
        state.done = done;
        state.normalize();
        debug!(reader = %self.name, head = state.head, done = state.done.len(), "Replayed reader state");
        Ok(())
    }

    /// Durably snapshot `(head, done-set)` into the state file.
    ///
    /// The snapshot is written to a `~~` sibling, fsynced, and renamed
    /// over the original; a crash anywhere in between leaves the
    /// previous file untouched.
    pub fn checkpoint(&self) -> Result<()> {
        let (head, done) = {
            let state = self.state.lock();
            (state.head, state.done.iter().copied().collect::<Vec<_>>())
        };

        let mut buf = Vec::new();
        record::write_header(&mut buf);
        Record::ReadHead(head).encode_into(&mut buf)?;
        Record::ReadDone(done).encode_into(&mut buf)?;

        let tmp = rewrite_sibling(&self.path);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        drop(file);

        std::fs::rename(&tmp, &self.path)?;
        debug!(reader = %self.name, head, "Checkpointed reader");
        Ok(())
    }

    /// Switch to streaming from disk, positioned on the `Put` whose id
    /// is exactly `id`.
    pub fn start_read_behind(&self, id: u64) -> Result<()> {
        let mut slot = self.read_behind.lock();
        ensure!(
            slot.is_none(),
            ProtocolMisuseSnafu {
                reason: format!("reader {} is already in read-behind", self.name),
            }
        );

        let index = self.index.load();
        let path = index
            .file_for_id(id)
            .cloned()
            .context(UnknownIdSnafu { id })?;

        let mut segment = SegmentReader::open(&path)?;
        loop {
            match segment.next()? {
                Some(Record::Put(item)) if item.id == id => break,
                Some(Record::Put(item)) if item.id > id => {
                    return UnknownIdSnafu { id }.fail();
                }
                Some(_) => {}
                None => return UnknownIdSnafu { id }.fail(),
            }
        }

        debug!(reader = %self.name, id, segment = ?path, "Entered read-behind");
        *slot = Some(ReadBehind {
            segment,
            last_yielded: id,
        });
        Ok(())
    }

    /// Yield the next item from disk, crossing into the next segment
    /// when the current one is exhausted.
    ///
    /// [`UnknownId`](crate::Error::UnknownId) carrying
    /// `last yielded + 1` means no segment holds that id yet: the
    /// reader has caught up and should leave read-behind.
    pub fn next_read_behind(&self) -> Result<Item> {
        let mut slot = self.read_behind.lock();
        let cursor = slot.as_mut().context(ProtocolMisuseSnafu {
            reason: format!("reader {} is not in read-behind", self.name),
        })?;

        loop {
            match cursor.segment.next()? {
                Some(Record::Put(item)) if item.id > cursor.last_yielded => {
                    cursor.last_yielded = item.id;
                    return Ok(item);
                }
                Some(_) => {}
                None => {
                    let target = cursor.last_yielded + 1;
                    let index = self.index.load();
                    match index.file_for_id(target).cloned() {
                        Some(path) if path != *cursor.segment.path() => {
                            debug!(reader = %self.name, segment = ?path, "Read-behind crossing into next segment");
                            cursor.segment = SegmentReader::open(&path)?;
                        }
                        _ => return UnknownIdSnafu { id: target }.fail(),
                    }
                }
            }
        }
    }

    /// Leave read-behind, closing the open segment.
    pub fn end_read_behind(&self) {
        if self.read_behind.lock().take().is_some() {
            debug!(reader = %self.name, "Left read-behind");
        }
    }

    pub fn in_read_behind(&self) -> bool { self.read_behind.lock().is_some() }
}

fn rewrite_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(REWRITE_SUFFIX);
    PathBuf::from(name)
}
