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

//! Journal of a durable, file-backed message queue.
//!
//! A queue's journal is a directory of append-only segment files plus
//! one compact checkpoint file per named reader, which together let a
//! queue survive restarts and let independent readers consume the same
//! stream at their own pace with out-of-order acknowledgement.
//!
//! Features:
//! - Self-framed little-endian record format shared by segments and
//!   reader state files
//! - Torn tail writes recovered on both the read and the append path
//! - Ordered id index locating any item's segment in O(log n)
//! - Per-reader head + done-set with atomic write-and-rename
//!   checkpoints
//! - Read-behind: cold readers stream items straight from the segment
//!   files until they catch up with the in-memory tail
//! - Timer-driven group fsync of the active segment

mod index;
mod journal;
mod path;
mod reader;
mod record;
mod segment;

pub mod builder;
pub mod config;
pub mod error;

pub use builder::JournalBuilder;
pub use config::{JournalConfig, SyncPolicy};
pub use error::{Error, Result};
pub use journal::Journal;
pub use reader::Reader;
pub use record::{Item, MAX_DATA_LEN, Record};
pub use segment::{SegmentReader, SegmentWriter};
