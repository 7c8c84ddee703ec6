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

//! Online MySQL data migration engine.
//!
//! rowferry copies tables between two live MySQL instances by primary-key
//! range while tailing the source's binlog from a coordinate captured
//! before the first row is read. Both streams apply to the target with
//! replace-by-PK semantics, so the engine can be killed at any moment and
//! resumed from its serialized state without losing or duplicating rows.
//! When the copy finishes, the tail is drained to the source's current
//! coordinate and the run cuts over.
//!
//! The entry point is [`Ferry`], configured by [`FerryConfig`]; the resume
//! token is [`SerializableState`].

pub mod binlog;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod ferry;
pub mod state;
pub mod writer;

mod util;

pub use binlog::position::BinlogPosition;
pub use catalog::{ColumnDef, SchemaCache, TableIdentity, TableSchema};
pub use config::{EndpointConfig, FerryConfig};
pub use error::{FerryError, Result};
pub use ferry::Ferry;
pub use state::{SerializableState, StateTracker};

/// Version stamped into every state dump. Read once from the build and
/// passed explicitly to the state tracker.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
