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

//! Record types and the on-disk journal format.
//!
//! This module defines the records persisted by the journal:
//! - [`Record::Put`]: an enqueued [`Item`], written to writer segments
//! - [`Record::ReadHead`] / [`Record::ReadDone`]: reader checkpoint
//!   records, written to reader state files
//!
//! ## On-Disk Format
//!
//! Every journal file starts with a 5-byte header, followed by records
//! stored contiguously:
//!
//! ```text
//! ┌──────────────────┬──────────────────┐
//! │  Magic "QJNL" 4B │  Version (1B)    │
//! └──────────────────┴──────────────────┘
//! ┌──────────┬───────────────────────────────────────────────────────┐
//! │ Tag (1B) │ Body (variable, little-endian)                        │
//! └──────────┴───────────────────────────────────────────────────────┘
//! ```
//!
//! Bodies per tag:
//! - `Put`: `id u64 | add_time i64 | expire_time i64 (0 = none) |
//!   data_len u32 | data`
//! - `ReadHead`: `id u64`
//! - `ReadDone`: `count u32 | id u64 * count` (strictly ascending)
//!
//! Length prefixes make the stream self-delimiting: a reader can skip
//! to the next record without understanding the payload, and a record
//! cut short by EOF is distinguishable from one with a garbage length.

use std::io::Read;

use bytes::Bytes;

use crate::{Result, error::ItemTooLargeSnafu};

/// Magic bytes at the start of every journal file: "QJNL".
pub const MAGIC: [u8; 4] = *b"QJNL";

/// Current journal format version.
pub const VERSION: u8 = 1;

/// Size of the file header in bytes (magic + version).
pub const HEADER_LEN: u64 = 5;

/// Maximum item payload size. Items above this fail to encode.
pub const MAX_DATA_LEN: usize = 8 * 1024 * 1024;

/// Maximum number of ids in one `ReadDone` record. A larger count in a
/// file is treated as an impossible length.
pub(crate) const MAX_DONE_IDS: u32 = 1 << 24;

const TAG_PUT: u8 = 0;
const TAG_READ_HEAD: u8 = 1;
const TAG_READ_DONE: u8 = 2;

/// One enqueued item.
///
/// Ids are assigned by the collaborating in-memory queue and are
/// strictly monotonically increasing over the life of a queue; the
/// journal never reuses or reorders them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Monotonic item id, unique within a queue.
    pub id:          u64,
    /// Enqueue time, milliseconds since the Unix epoch.
    pub add_time:    i64,
    /// Optional expiry, milliseconds since the Unix epoch.
    pub expire_time: Option<i64>,
    /// Opaque payload.
    pub data:        Bytes,
}

/// A single journal record.
///
/// Writer segments hold only `Put` records; reader state files hold
/// only `ReadHead` and `ReadDone` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Put(Item),
    ReadHead(u64),
    ReadDone(Vec<u64>),
}

impl Record {
    /// Encoded size in bytes, tag included.
    pub fn encoded_len(&self) -> u64 {
        match self {
            Self::Put(item) => 1 + 8 + 8 + 8 + 4 + item.data.len() as u64,
            Self::ReadHead(_) => 1 + 8,
            Self::ReadDone(ids) => 1 + 4 + 8 * ids.len() as u64,
        }
    }

    /// Encode the record into `buf`.
    ///
    /// Fails with [`ItemTooLarge`](crate::Error::ItemTooLarge) if a
    /// `Put` payload exceeds [`MAX_DATA_LEN`].
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Put(item) => {
                snafu::ensure!(
                    item.data.len() <= MAX_DATA_LEN,
                    ItemTooLargeSnafu {
                        len: item.data.len(),
                        max: MAX_DATA_LEN,
                    }
                );
                buf.push(TAG_PUT);
                buf.extend_from_slice(&item.id.to_le_bytes());
                buf.extend_from_slice(&item.add_time.to_le_bytes());
                buf.extend_from_slice(&item.expire_time.unwrap_or(0).to_le_bytes());
                buf.extend_from_slice(&(item.data.len() as u32).to_le_bytes());
                buf.extend_from_slice(&item.data);
            }
            Self::ReadHead(id) => {
                buf.push(TAG_READ_HEAD);
                buf.extend_from_slice(&id.to_le_bytes());
            }
            Self::ReadDone(ids) => {
                debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));
                buf.push(TAG_READ_DONE);
                buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
                for id in ids {
                    buf.extend_from_slice(&id.to_le_bytes());
                }
            }
        }
        Ok(())
    }
}

/// How decoding a record from a byte stream can fail.
///
/// Callers turn `Truncated` into end-of-stream and `Bad` into a
/// [`Corruption`](crate::Error::Corruption) error carrying the file
/// path and record offset, which only they know.
#[derive(Debug)]
pub(crate) enum DecodeError {
    /// EOF inside a record: the tail write was torn.
    Truncated,
    /// The bytes cannot describe a record (bad tag, impossible length).
    Bad(String),
    /// Underlying read failure other than EOF.
    Io(std::io::Error),
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::Truncated,
            _ => Self::Io(e),
        }
    }
}

pub(crate) type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Write the file header.
pub(crate) fn write_header(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
}

/// Read and validate the file header.
pub(crate) fn read_header<R: Read>(r: &mut R) -> DecodeResult<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    r.read_exact(&mut header)?;

    if header[..4] != MAGIC {
        return Err(DecodeError::Bad(format!(
            "bad magic {:02x?}, expected {:02x?}",
            &header[..4],
            MAGIC
        )));
    }
    if header[4] != VERSION {
        return Err(DecodeError::Bad(format!(
            "unsupported version {}, expected {VERSION}",
            header[4]
        )));
    }
    Ok(())
}

/// Read the next record from a byte stream.
///
/// Returns `Ok(None)` on a clean EOF (no tag byte left). EOF anywhere
/// inside a record surfaces as [`DecodeError::Truncated`].
pub(crate) fn read_record<R: Read>(r: &mut R) -> DecodeResult<Option<Record>> {
    let mut tag = [0u8; 1];
    match r.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DecodeError::Io(e)),
    }

    match tag[0] {
        TAG_PUT => {
            let id = read_u64(r)?;
            let add_time = read_i64(r)?;
            let expire_time = match read_i64(r)? {
                0 => None,
                t => Some(t),
            };
            let data_len = read_u32(r)?;
            if data_len as usize > MAX_DATA_LEN {
                return Err(DecodeError::Bad(format!(
                    "put data length {data_len} exceeds limit {MAX_DATA_LEN}"
                )));
            }
            let mut data = vec![0u8; data_len as usize];
            r.read_exact(&mut data)?;
            Ok(Some(Record::Put(Item {
                id,
                add_time,
                expire_time,
                data: Bytes::from(data),
            })))
        }
        TAG_READ_HEAD => Ok(Some(Record::ReadHead(read_u64(r)?))),
        TAG_READ_DONE => {
            let count = read_u32(r)?;
            if count > MAX_DONE_IDS {
                return Err(DecodeError::Bad(format!(
                    "read-done count {count} exceeds limit {MAX_DONE_IDS}"
                )));
            }
            let mut ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let id = read_u64(r)?;
                if let Some(&last) = ids.last()
                    && id <= last
                {
                    return Err(DecodeError::Bad(format!(
                        "read-done ids not strictly ascending: {id} after {last}"
                    )));
                }
                ids.push(id);
            }
            Ok(Some(Record::ReadDone(ids)))
        }
        tag => Err(DecodeError::Bad(format!("unknown record tag {tag:#04x}"))),
    }
}

fn read_u32<R: Read>(r: &mut R) -> DecodeResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> DecodeResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> DecodeResult<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn roundtrip(record: &Record) -> Record {
        let mut buf = Vec::new();
        record.encode_into(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, record.encoded_len());
        read_record(&mut Cursor::new(buf)).unwrap().unwrap()
    }

    #[test]
    fn test_put_roundtrip() {
        let item = Item {
            id:          42,
            add_time:    1_700_000_000_123,
            expire_time: Some(1_700_000_060_000),
            data:        Bytes::from("payload"),
        };
        assert_eq!(roundtrip(&Record::Put(item.clone())), Record::Put(item));
    }

    #[test]
    fn test_put_roundtrip_no_expiry() {
        let item = Item {
            id:          1,
            add_time:    7,
            expire_time: None,
            data:        Bytes::new(),
        };
        assert_eq!(roundtrip(&Record::Put(item.clone())), Record::Put(item));
    }

    #[test]
    fn test_read_head_roundtrip() {
        assert_eq!(roundtrip(&Record::ReadHead(99)), Record::ReadHead(99));
    }

    #[test]
    fn test_read_done_roundtrip() {
        let record = Record::ReadDone(vec![3, 5, 9]);
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn test_oversized_payload_fails_to_encode() {
        let item = Item {
            id:          1,
            add_time:    0,
            expire_time: None,
            data:        Bytes::from(vec![0u8; MAX_DATA_LEN + 1]),
        };
        let mut buf = Vec::new();
        let err = Record::Put(item).encode_into(&mut buf).unwrap_err();
        assert!(matches!(err, crate::Error::ItemTooLarge { .. }));
    }

    #[test]
    fn test_unknown_tag_is_bad() {
        let err = read_record(&mut Cursor::new(vec![0xFFu8])).unwrap_err();
        assert!(matches!(err, DecodeError::Bad(_)));
    }

    #[test]
    fn test_impossible_put_length_is_bad() {
        let mut buf = Vec::new();
        Record::Put(Item {
            id:          1,
            add_time:    0,
            expire_time: None,
            data:        Bytes::from("x"),
        })
        .encode_into(&mut buf)
        .unwrap();
        // Overwrite data_len with a value above the limit.
        buf[25..29].copy_from_slice(&u32::MAX.to_le_bytes());

        let err = read_record(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, DecodeError::Bad(_)));
    }

    #[test]
    fn test_truncated_record_is_truncated() {
        let mut buf = Vec::new();
        Record::Put(Item {
            id:          1,
            add_time:    0,
            expire_time: None,
            data:        Bytes::from("hello"),
        })
        .encode_into(&mut buf)
        .unwrap();
        buf.pop();

        let err = read_record(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated));
    }

    #[test]
    fn test_clean_eof_is_none() {
        assert!(read_record(&mut Cursor::new(Vec::new())).unwrap().is_none());
    }

    #[test]
    fn test_unsorted_read_done_is_bad() {
        let mut buf = vec![2u8]; // TAG_READ_DONE
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&9u64.to_le_bytes());
        buf.extend_from_slice(&3u64.to_le_bytes());

        let err = read_record(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, DecodeError::Bad(_)));
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf);
        assert_eq!(buf.len() as u64, HEADER_LEN);
        read_header(&mut Cursor::new(buf)).unwrap();
    }

    #[test]
    fn test_bad_magic_rejected() {
        let err = read_header(&mut Cursor::new(b"XXXX\x01".to_vec())).unwrap_err();
        assert!(matches!(err, DecodeError::Bad(_)));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut buf = Vec::new();
        write_header(&mut buf);
        buf[4] = 0xEE;
        let err = read_header(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, DecodeError::Bad(_)));
    }
}
