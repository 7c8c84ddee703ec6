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

//! Replication-log side of the engine: coordinates, decoded row events, and
//! the streamer that tails the source as a replica.

pub mod event;
pub mod position;
pub mod streamer;

pub use event::{ReplicatedEvent, RowChange, TableDml, TableFilter};
pub use position::BinlogPosition;
pub use streamer::BinlogStreamer;
