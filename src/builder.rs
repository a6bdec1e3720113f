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

use crate::{Journal, JournalConfig, Result, SyncPolicy};

pub struct JournalBuilder {
    config: JournalConfig,
}

impl JournalBuilder {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            config: JournalConfig {
                dir: dir.into(),
                ..Default::default()
            },
        }
    }

    pub fn queue_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.queue_name = name.into();
        self
    }

    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.config.sync_policy = policy;
        self
    }

    pub fn max_item_size(mut self, size: usize) -> Self {
        self.config.max_item_size = size;
        self
    }

    pub fn build(self) -> Result<Journal> {
        Journal::open(self.config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_builder_default_config() {
        let builder = JournalBuilder::new("/tmp/test_journal");
        assert_eq!(builder.config.dir, PathBuf::from("/tmp/test_journal"));
        assert_eq!(builder.config.queue_name, "queue");
    }

    #[test]
    fn test_builder_custom_config() {
        let builder = JournalBuilder::new("/tmp/test_journal")
            .queue_name("jobs")
            .sync_policy(SyncPolicy::Interval(Duration::from_millis(25)))
            .max_item_size(1024);

        assert_eq!(builder.config.queue_name, "jobs");
        assert_eq!(
            builder.config.sync_policy,
            SyncPolicy::Interval(Duration::from_millis(25))
        );
        assert_eq!(builder.config.max_item_size, 1024);
    }

    #[test]
    fn test_builder_opens_journal() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let journal = JournalBuilder::new(temp_dir.path())
            .queue_name("jobs")
            .sync_policy(SyncPolicy::Immediate)
            .build()
            .unwrap();
        assert_eq!(journal.config().queue_name, "jobs");
    }
}
