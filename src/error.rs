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

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("IO error"), context(false))]
    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Corrupt record in {} at offset {offset}: {reason}", path.display()))]
    Corruption {
        path:   PathBuf,
        offset: u64,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("No segment holds item id {id}"))]
    UnknownId {
        id: u64,
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display("Protocol misuse: {reason}"))]
    ProtocolMisuse {
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Item payload of {len} bytes exceeds the {max} byte limit"))]
    ItemTooLarge {
        len: usize,
        max: usize,
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display("Invalid file path: {}", path.display()))]
    InvalidPath {
        path: PathBuf,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },
}

impl Error {
    /// True for errors that signal an unreadable record rather than an
    /// environmental failure.
    pub const fn is_corruption(&self) -> bool { matches!(self, Self::Corruption { .. }) }
}
