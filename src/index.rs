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

//! Ordered map from a segment's first item id to its file.
//!
//! Built at journal open by reading the first record of every writer
//! segment. For any live id `x`, the greatest key `≤ x` names the
//! segment containing `x` (until that segment is truncated). The index
//! is an immutable snapshot: rotation, truncation and the first append
//! into a fresh segment each publish a replacement.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::{record::Record, segment::SegmentReader};

/// Immutable snapshot of the first-id → segment mapping.
#[derive(Debug, Default, Clone)]
pub struct IdIndex {
    map: BTreeMap<u64, PathBuf>,
}

impl IdIndex {
    /// Build an index from segment files, in timestamp order.
    ///
    /// Unreadable files and files whose first record is not a `Put`
    /// are skipped with a warning; an empty segment (the active one,
    /// typically) is simply absent until its first item arrives.
    pub fn build(segments: &[(u64, PathBuf)]) -> Self {
        let mut map = BTreeMap::new();

        for (stamp, path) in segments {
            let mut reader = match SegmentReader::open(path) {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping unreadable segment");
                    continue;
                }
            };
            match reader.next() {
                Ok(Some(Record::Put(item))) => {
                    debug!(path = ?path, stamp, first_id = item.id, "Indexed segment");
                    map.insert(item.id, path.clone());
                }
                Ok(Some(record)) => {
                    warn!(path = ?path, ?record, "Skipping segment whose first record is not a put");
                }
                Ok(None) => {
                    debug!(path = ?path, "Segment holds no items yet");
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping segment with corrupt first record");
                }
            }
        }

        Self { map }
    }

    /// The segment containing `id`: greatest first-id `≤ id`.
    pub fn file_for_id(&self, id: u64) -> Option<&PathBuf> {
        self.map.range(..=id).next_back().map(|(_, path)| path)
    }

    /// Copy-on-write insert, yielding the successor snapshot.
    #[must_use]
    pub fn with_segment(&self, first_id: u64, path: PathBuf) -> Self {
        let mut map = self.map.clone();
        map.insert(first_id, path);
        Self { map }
    }

    /// Copy-on-write removal, yielding the successor snapshot.
    #[must_use]
    pub fn without_segment(&self, first_id: u64) -> Self {
        let mut map = self.map.clone();
        map.remove(&first_id);
        Self { map }
    }

    /// Entries in first-id order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &PathBuf)> {
        self.map.iter().map(|(&id, path)| (id, path))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize { self.map.len() }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use bytes::Bytes;
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;
    use crate::{
        SyncPolicy,
        record::Item,
        segment::SegmentWriter,
    };

    fn write_segment(dir: &Path, name: &str, ids: std::ops::RangeInclusive<u64>) -> PathBuf {
        let path = dir.join(name);
        let mut writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
        for id in ids {
            writer
                .append(&Record::Put(Item {
                    id,
                    add_time: 0,
                    expire_time: None,
                    data: Bytes::from("x"),
                }))
                .unwrap();
        }
        path
    }

    fn two_segment_index(dir: &Path) -> IdIndex {
        let first = write_segment(dir, "q.100", 1..=5);
        let second = write_segment(dir, "q.200", 6..=10);
        IdIndex::build(&[(100, first), (200, second)])
    }

    #[test_case(0, None ; "before all segments")]
    #[test_case(1, Some("q.100") ; "first id of first segment")]
    #[test_case(5, Some("q.100") ; "last id of first segment")]
    #[test_case(6, Some("q.200") ; "first id of second segment")]
    #[test_case(7, Some("q.200") ; "inside second segment")]
    #[test_case(10_000, Some("q.200") ; "beyond the tail")]
    fn test_file_for_id(id: u64, expected: Option<&str>) {
        let temp_dir = TempDir::new().unwrap();
        let index = two_segment_index(temp_dir.path());

        let found = index
            .file_for_id(id)
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(str::to_string);
        assert_eq!(found.as_deref(), expected);
    }

    #[test]
    fn test_bad_magic_segment_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let good = write_segment(temp_dir.path(), "q.100", 1..=3);
        let bad = temp_dir.path().join("q.200");
        std::fs::write(&bad, b"garbage").unwrap();

        let index = IdIndex::build(&[(100, good.clone()), (200, bad)]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.file_for_id(2), Some(&good));
    }

    #[test]
    fn test_non_put_first_record_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");
        let mut writer = SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap();
        writer.append(&Record::ReadHead(3)).unwrap();
        drop(writer);

        let index = IdIndex::build(&[(100, path)]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_empty_segment_absent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.100");
        drop(SegmentWriter::open(&path, SyncPolicy::Immediate).unwrap());

        let index = IdIndex::build(&[(100, path)]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_copy_on_write_snapshots() {
        let temp_dir = TempDir::new().unwrap();
        let index = two_segment_index(temp_dir.path());

        let grown = index.with_segment(11, temp_dir.path().join("q.300"));
        assert_eq!(index.len(), 2);
        assert_eq!(grown.len(), 3);
        assert_eq!(
            grown.file_for_id(11),
            Some(&temp_dir.path().join("q.300"))
        );

        let shrunk = grown.without_segment(1);
        assert_eq!(grown.len(), 3);
        assert_eq!(shrunk.len(), 2);
        assert!(shrunk.file_for_id(0).is_none());
        assert!(shrunk.file_for_id(3).is_none());
    }
}
