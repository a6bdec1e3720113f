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

//! One journal file as a forward-only record stream.
//!
//! [`SegmentWriter`] appends records to a file, creating it with the
//! format header or recovering the valid end of an existing file.
//! [`SegmentReader`] streams records back out, reporting a torn tail
//! write as end-of-stream and anything unreadable before that as
//! corruption at a named offset.
//!
//! Durability: an append returns once the bytes reach the OS page
//! cache. They become durable at the next [`flush`](SegmentWriter::flush),
//! which the journal drives from its sync timer (or immediately, under
//! [`SyncPolicy::Immediate`]).

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    Result, SyncPolicy,
    error::CorruptionSnafu,
    record::{self, DecodeError, HEADER_LEN, Record},
};

/// Append handle for one writer segment or reader state file.
#[derive(Debug)]
pub struct SegmentWriter {
    path:        PathBuf,
    file:        File,
    len:         u64,
    last_put_id: Option<u64>,
    dirty:       bool,
    sync_policy: SyncPolicy,
}

impl SegmentWriter {
    /// Open a segment for appending.
    ///
    /// Creates the file with the format header when absent. When the
    /// file exists, validates the header and scans to the last intact
    /// record: a torn tail write is cut off (a reader would have
    /// ignored it, and appending after it would bury it mid-file where
    /// it poisons the whole stream). The scan also recovers the id of
    /// the last `Put` so id monotonicity survives restarts.
    pub fn open<P: AsRef<Path>>(path: P, sync_policy: SyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let mut header = Vec::with_capacity(HEADER_LEN as usize);
            record::write_header(&mut header);

            let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
            file.write_all(&header)?;
            file.sync_data()?;

            debug!(path = ?path, "Created segment");
            return Ok(Self {
                path,
                file,
                len: HEADER_LEN,
                last_put_id: None,
                dirty: false,
                sync_policy,
            });
        }

        let (end, last_put_id) = scan_valid_end(&path)?;

        let mut file = OpenOptions::new().write(true).read(true).open(&path)?;
        if file.metadata()?.len() != end {
            warn!(path = ?path, end, "Discarding unreadable segment tail");
            file.set_len(end)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(end))?;

        debug!(path = ?path, len = end, last_put_id, "Opened segment for append");
        Ok(Self {
            path,
            file,
            len: end,
            last_put_id,
            dirty: false,
            sync_policy,
        })
    }

    /// Append one record.
    ///
    /// Returns once the bytes are handed to the OS; durability follows
    /// at the next flush.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let mut buf = Vec::with_capacity(record.encoded_len() as usize);
        record.encode_into(&mut buf)?;

        self.file.write_all(&buf)?;
        self.len += buf.len() as u64;
        self.dirty = true;

        if let Record::Put(item) = record {
            self.last_put_id = Some(item.id);
        }

        if self.sync_policy == SyncPolicy::Immediate {
            self.flush()?;
        }

        Ok(())
    }

    /// Fsync outstanding writes. No-op when nothing is dirty.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Current byte length, appended records included.
    pub const fn len(&self) -> u64 { self.len }

    pub const fn is_empty(&self) -> bool { self.len == HEADER_LEN }

    /// True if appends since the last flush await an fsync.
    pub const fn is_dirty(&self) -> bool { self.dirty }

    /// Id of the most recent `Put`, surviving reopen.
    pub const fn last_put_id(&self) -> Option<u64> { self.last_put_id }

    pub fn path(&self) -> &Path { &self.path }
}

/// Scan a segment to the end of its last intact record.
///
/// Returns the valid end offset and the last `Put` id seen before it.
/// Corruption mid-file truncates the recovered stream at that point,
/// with a warning.
fn scan_valid_end(path: &Path) -> Result<(u64, Option<u64>)> {
    let mut reader = SegmentReader::open(path)?;
    let mut last_put_id = None;

    loop {
        match reader.next() {
            Ok(Some(Record::Put(item))) => last_put_id = Some(item.id),
            Ok(Some(_)) => {}
            Ok(None) => return Ok((reader.offset(), last_put_id)),
            Err(e) => {
                warn!(path = ?path, error = %e, "Stopping segment scan at corrupt record");
                return Ok((reader.offset(), last_put_id));
            }
        }
    }
}

/// Streaming reader over one journal file.
#[derive(Debug)]
pub struct SegmentReader {
    path:   PathBuf,
    reader: BufReader<File>,
    offset: u64,
}

impl SegmentReader {
    /// Open a file and validate its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);

        match record::read_header(&mut reader) {
            Ok(()) => {}
            Err(DecodeError::Io(e)) => return Err(e.into()),
            Err(DecodeError::Truncated) => {
                return CorruptionSnafu {
                    path,
                    offset: 0u64,
                    reason: "file shorter than the format header".to_string(),
                }
                .fail();
            }
            Err(DecodeError::Bad(reason)) => {
                return CorruptionSnafu {
                    path,
                    offset: 0u64,
                    reason,
                }
                .fail();
            }
        }

        Ok(Self {
            path,
            reader,
            offset: HEADER_LEN,
        })
    }

    /// Read the next record.
    ///
    /// `Ok(None)` at a clean EOF and at a torn tail write. A record
    /// that is unreadable for any other reason is corruption, reported
    /// with the offset where it starts.
    pub fn next(&mut self) -> Result<Option<Record>> {
        match record::read_record(&mut self.reader) {
            Ok(Some(record)) => {
                self.offset += record.encoded_len();
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(DecodeError::Truncated) => Ok(None),
            Err(DecodeError::Io(e)) => Err(e.into()),
            Err(DecodeError::Bad(reason)) => CorruptionSnafu {
                path:   self.path.clone(),
                offset: self.offset,
                reason,
            }
            .fail(),
        }
    }

    /// Byte offset just past the last successfully read record.
    pub const fn offset(&self) -> u64 { self.offset }

    pub fn path(&self) -> &Path { &self.path }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::record::Item;

    fn put(id: u64) -> Record {
        Record::Put(Item {
            id,
            add_time: 1_700_000_000_000 + id as i64,
            expire_time: None,
            data: Bytes::from(format!("item-{id}")),
        })
    }

    fn read_all(path: &Path) -> Vec<Record> {
        let mut reader = SegmentReader::open(path).unwrap();
        let mut records = Vec::new();
        while let Some(record) = reader.next().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_write_then_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");

        let mut writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
        for id in 1..=5 {
            writer.append(&put(id)).unwrap();
        }

        let records = read_all(&path);
        assert_eq!(records.len(), 5);
        assert_eq!(records[0], put(1));
        assert_eq!(records[4], put(5));
    }

    #[test]
    fn test_reopen_continues_appending() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");

        {
            let mut writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
            writer.append(&put(1)).unwrap();
            writer.append(&put(2)).unwrap();
        }

        let mut writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
        assert_eq!(writer.last_put_id(), Some(2));
        writer.append(&put(3)).unwrap();

        let ids: Vec<u64> = read_all(&path)
            .into_iter()
            .map(|r| match r {
                Record::Put(item) => item.id,
                other => panic!("unexpected record {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_truncated_tail_is_end_of_stream() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");

        let mut writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
        for id in 1..=3 {
            writer.append(&put(id)).unwrap();
        }
        let full_len = writer.len();
        drop(writer);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 1).unwrap();

        let records = read_all(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], put(2));
    }

    #[test]
    fn test_reopen_discards_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");

        let mut writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
        writer.append(&put(1)).unwrap();
        let valid_end = writer.len();
        writer.append(&put(2)).unwrap();
        drop(writer);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(valid_end + 3).unwrap();

        let mut writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
        assert_eq!(writer.len(), valid_end);
        assert_eq!(writer.last_put_id(), Some(1));
        writer.append(&put(3)).unwrap();

        let records = read_all(&path);
        assert_eq!(records, vec![put(1), put(3)]);
    }

    #[test]
    fn test_mid_file_corruption_names_offset() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");

        let mut writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
        writer.append(&put(1)).unwrap();
        let second_offset = writer.len();
        writer.append(&put(2)).unwrap();
        writer.append(&put(3)).unwrap();
        drop(writer);

        // Clobber the second record's tag.
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(second_offset)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let mut reader = SegmentReader::open(&path).unwrap();
        assert_eq!(reader.next().unwrap(), Some(put(1)));
        match reader.next().unwrap_err() {
            crate::Error::Corruption { offset, .. } => assert_eq!(offset, second_offset),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_open_rejects_bad_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");
        std::fs::write(&path, b"not a journal file").unwrap();

        let err = SegmentReader::open(&path).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_flush_clears_dirty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");

        let mut writer = SegmentWriter::open(
            &path,
            SyncPolicy::Interval(std::time::Duration::from_secs(1)),
        )
        .unwrap();
        assert!(!writer.is_dirty());

        writer.append(&put(1)).unwrap();
        assert!(writer.is_dirty());

        writer.flush().unwrap();
        assert!(!writer.is_dirty());
    }

    #[test]
    fn test_empty_segment_reads_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");

        let writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
        assert!(writer.is_empty());
        drop(writer);

        assert!(read_all(&path).is_empty());
    }
}
