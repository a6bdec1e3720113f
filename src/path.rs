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

//! File naming for the journal directory.
//!
//! For a queue named `Q` the directory holds:
//! - `Q.<decimal-ms-timestamp>`: writer segments
//! - `Q.read.<name>`: reader state files, `name` matching `[^.~]+`
//! - `*~~`: transient rewrite files, deleted on recovery

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::Result;

/// Suffix of transient rewrite files.
pub(crate) const REWRITE_SUFFIX: &str = "~~";

const READ_INFIX: &str = "read.";

/// Generates a writer segment name: `Q.<ms>`.
pub(crate) fn segment_file_name(queue: &str, stamp_ms: u64) -> String {
    format!("{queue}.{stamp_ms}")
}

/// Returns the full path of a writer segment.
pub(crate) fn segment_path<P: AsRef<Path>>(dir: P, queue: &str, stamp_ms: u64) -> PathBuf {
    dir.as_ref().join(segment_file_name(queue, stamp_ms))
}

/// Returns the full path of a reader state file: `Q.read.<name>`.
pub(crate) fn reader_path<P: AsRef<Path>>(dir: P, queue: &str, reader: &str) -> PathBuf {
    dir.as_ref().join(format!("{queue}.{READ_INFIX}{reader}"))
}

/// True if `name` is a transient rewrite file.
pub(crate) fn is_rewrite_temp(name: &str) -> bool { name.contains(REWRITE_SUFFIX) }

/// Valid reader names match `[^.~]+`.
pub(crate) fn is_valid_reader_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['.', '~'])
}

/// Queue names share the reader-name grammar: a `.` would shift the
/// prefix every parser here splits on, and a `~` can collide with the
/// rewrite-temp suffix.
pub(crate) fn is_valid_queue_name(name: &str) -> bool { is_valid_reader_name(name) }

/// Parses a segment file name, returning its timestamp. Matches
/// `^<queue>\.\d+$` only.
pub(crate) fn parse_segment_stamp(queue: &str, file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(queue)?.strip_prefix('.')?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

/// Parses a reader state file name, returning the reader name. Matches
/// `^<queue>\.read\..+$` only.
pub(crate) fn parse_reader_name<'a>(queue: &str, file_name: &'a str) -> Option<&'a str> {
    let rest = file_name
        .strip_prefix(queue)?
        .strip_prefix('.')?
        .strip_prefix(READ_INFIX)?;
    if !is_valid_reader_name(rest) {
        return None;
    }
    Some(rest)
}

/// Lists the queue's writer segments, sorted by timestamp.
pub(crate) fn list_segment_files<P: AsRef<Path>>(
    dir: P,
    queue: &str,
) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_rewrite_temp(name) {
            continue;
        }
        if let Some(stamp) = parse_segment_stamp(queue, name) {
            segments.push((stamp, entry.path()));
        }
    }
    segments.sort();
    Ok(segments)
}

/// Lists the queue's reader state files.
pub(crate) fn list_reader_files<P: AsRef<Path>>(
    dir: P,
    queue: &str,
) -> Result<Vec<(String, PathBuf)>> {
    let mut readers = Vec::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_rewrite_temp(name) {
            continue;
        }
        if let Some(reader) = parse_reader_name(queue, name) {
            readers.push((reader.to_string(), entry.path()));
        }
    }
    readers.sort();
    Ok(readers)
}

/// Deletes transient rewrite files left behind for this queue by an
/// interrupted checkpoint. Returns how many were removed.
pub(crate) fn remove_rewrite_temps<P: AsRef<Path>>(dir: P, queue: &str) -> Result<usize> {
    let prefix = format!("{queue}.");
    let mut removed = 0;
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) && is_rewrite_temp(name) {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Returns the queue names present in a directory, identified by the
/// prefix before the first `.` of each file name. Rewrite temps are
/// ignored.
pub(crate) fn queue_names_from_dir<P: AsRef<Path>>(dir: P) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_rewrite_temp(name) {
            continue;
        }
        if let Some((queue, _)) = name.split_once('.')
            && !queue.is_empty()
        {
            names.insert(queue.to_string());
        }
    }
    Ok(names)
}
