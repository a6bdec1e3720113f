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

use std::path::PathBuf;
use std::time::Duration;

use crate::record::MAX_DATA_LEN;

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub dir: PathBuf,
    pub queue_name: String,
    pub sync_policy: SyncPolicy,
    pub max_item_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./journal_data"),
            queue_name: "queue".to_string(),
            sync_policy: SyncPolicy::Interval(Duration::from_millis(100)),
            max_item_size: MAX_DATA_LEN,
        }
    }
}

/// When appended records become durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Fsync after every append.
    Immediate,
    /// Dirty segments are fsynced no later than this long after the
    /// first unsynced write.
    Interval(Duration),
}

impl SyncPolicy {
    pub const fn interval(&self) -> Option<Duration> {
        match self {
            Self::Immediate => None,
            Self::Interval(d) => Some(*d),
        }
    }
}
