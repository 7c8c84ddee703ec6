// Copyright 2026 Rowferry Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in the source's binary log.
///
/// Binlog files carry a shared basename and a zero-padded numeric suffix
/// (`mysql-bin.000042`), so lexicographic order on the file name followed by
/// numeric order on the offset is a total order over the log. The derived
/// `Ord` relies on field declaration order.
///
/// The default value (`{Name: "", Pos: 0}`) is the zero coordinate a fresh
/// tracker dumps before the first binlog write lands.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BinlogPosition {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Pos")]
    pub pos: u64,
}

impl BinlogPosition {
    pub fn new(name: impl Into<String>, pos: u64) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.name.is_empty() && self.pos == 0
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.pos)
    }
}
