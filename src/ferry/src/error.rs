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

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = FerryError> = std::result::Result<T, E>;

/// ER_LOCK_WAIT_TIMEOUT, ER_LOCK_DEADLOCK, and the client-side "server went
/// away" family. Statements failing with these are safe to retry because all
/// writes are replace-by-PK.
const RETRYABLE_SERVER_CODES: &[u16] = &[1205, 1213, 2002, 2003, 2006, 2013];

#[derive(Error, Debug)]
pub enum FerryError {
    #[error("database error: {0}")]
    Database(#[from] mysql_async::Error),

    #[error("operation exceeded deadline of {0:?}")]
    Deadline(Duration),

    #[error("binlog decode error: {0}")]
    BinlogDecode(#[from] std::io::Error),

    #[error("schema change on replicated table {table}: {query}")]
    SchemaDrift { table: String, query: String },

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed state dump: {0}")]
    MalformedState(#[from] serde_json::Error),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FerryError {
    /// Whether the failed operation may be reissued. Only transport-level
    /// failures qualify; everything else either halts the run or is a bug.
    pub fn retryable(&self) -> bool {
        match self {
            FerryError::Database(e) => match e {
                mysql_async::Error::Io(_) => true,
                mysql_async::Error::Server(server)
                    if RETRYABLE_SERVER_CODES.contains(&server.code) =>
                {
                    true
                }
                _ => false,
            },
            FerryError::Deadline(_) => true,
            _ => false,
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        FerryError::Invariant(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        FerryError::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_retryable() {
        assert!(FerryError::Deadline(Duration::from_secs(1)).retryable());
    }

    #[test]
    fn config_and_invariant_are_fatal() {
        assert!(!FerryError::config("missing table").retryable());
        assert!(!FerryError::invariant("pk went backwards").retryable());
        assert!(!FerryError::Cancelled.retryable());
    }

    #[test]
    fn io_database_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = FerryError::Database(mysql_async::Error::Io(io.into()));
        assert!(err.retryable());
    }
}
