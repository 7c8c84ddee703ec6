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

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use mysql_async::{Opts, OptsBuilder};
use serde::Deserialize;

use crate::catalog::TableIdentity;
use crate::error::{FerryError, Result};
use crate::state::SerializableState;

fn default_port() -> u16 {
    3306
}

fn default_batch_size() -> usize {
    200
}

fn default_worker_count() -> usize {
    4
}

fn default_speed_log_entries() -> i32 {
    60
}

fn default_server_id() -> u32 {
    // Well above the range operators hand-assign to real replicas.
    u32::MAX - 473
}

fn default_db_deadline_secs() -> u64 {
    60
}

fn default_max_table_retries() -> u32 {
    5
}

fn default_max_write_retries() -> u32 {
    5
}

fn default_progress_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl EndpointConfig {
    pub(crate) fn opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .into()
    }
}

/// Run configuration. Deserializable from JSON; every field with a sensible
/// default has one, the rest are required.
#[derive(Debug, Clone, Deserialize)]
pub struct FerryConfig {
    pub source: EndpointConfig,
    pub target: EndpointConfig,

    /// Tables in scope for both the copy and the binlog filter, as
    /// `"schema.table"` pairs.
    pub included_tables: Vec<String>,

    /// Rows per copy batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Copier parallelism.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Size of the throughput ring; non-positive disables it.
    #[serde(default = "default_speed_log_entries")]
    pub speed_log_entries: i32,

    /// Source schema names remapped on the target.
    #[serde(default)]
    pub database_rewrites: HashMap<String, String>,

    /// Source table names remapped on the target.
    #[serde(default)]
    pub table_rewrites: HashMap<String, String>,

    /// Replica server id used when tailing the binlog. Must be unique in
    /// the source's replication topology and non-zero.
    #[serde(default = "default_server_id")]
    pub server_id: u32,

    /// Deadline applied to every database operation.
    #[serde(default = "default_db_deadline_secs")]
    pub db_deadline_secs: u64,

    /// Consecutive per-table copy failures tolerated before the run halts.
    #[serde(default = "default_max_table_retries")]
    pub max_table_retries: u32,

    /// Attempts per target write before a transient error escalates.
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,

    /// Treat DDL against an in-scope table as survivable instead of fatal.
    #[serde(default)]
    pub allow_schema_changes: bool,

    /// Progress log cadence; zero disables the reporter.
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,

    /// Where to write the final state dump, in addition to returning it.
    #[serde(default)]
    pub state_dump_path: Option<PathBuf>,

    /// Resume token from a previous interrupted run.
    #[serde(default)]
    pub resume_state: Option<SerializableState>,
}

impl FerryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.included_tables.is_empty() {
            return Err(FerryError::config("included_tables must not be empty"));
        }
        self.included_identities()?;
        if self.batch_size == 0 {
            return Err(FerryError::config("batch_size must be positive"));
        }
        if self.worker_count == 0 {
            return Err(FerryError::config("worker_count must be positive"));
        }
        if self.server_id == 0 {
            return Err(FerryError::config(
                "server_id 0 is reserved; pick a unique non-zero replica id",
            ));
        }
        Ok(())
    }

    /// The configured table set, parsed, deduplicated, in stable order.
    pub fn included_identities(&self) -> Result<Vec<TableIdentity>> {
        let mut identities = BTreeSet::new();
        for dotted in &self.included_tables {
            identities.insert(TableIdentity::from_dotted(dotted)?);
        }
        Ok(identities.into_iter().collect())
    }

    pub fn db_deadline(&self) -> Duration {
        Duration::from_secs(self.db_deadline_secs)
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0)
            .then(|| Duration::from_secs(self.progress_interval_secs))
    }

    pub fn speed_log_capacity(&self) -> usize {
        usize::try_from(self.speed_log_entries).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn minimal() -> FerryConfig {
        serde_json::from_value(serde_json::json!({
            "source": {"host": "src.db", "user": "ferry"},
            "target": {"host": "dst.db", "user": "ferry", "password": "s3cret"},
            "included_tables": ["shop.orders", "shop.customers", "shop.orders"],
        }))
        .unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let config = minimal();
        assert_eq!(config.source.port, 3306);
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.speed_log_entries, 60);
        assert_eq!(config.db_deadline(), Duration::from_secs(60));
        assert!(!config.allow_schema_changes);
        assert!(config.resume_state.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn identities_are_deduplicated_and_ordered() {
        let identities = minimal().included_identities().unwrap();
        assert_eq!(
            identities,
            vec![
                TableIdentity::new("shop", "customers"),
                TableIdentity::new("shop", "orders"),
            ]
        );
    }

    #[test]
    fn rejects_bad_scope_and_sizes() {
        let mut config = minimal();
        config.included_tables.clear();
        assert_matches!(config.validate(), Err(FerryError::Config(_)));

        let mut config = minimal();
        config.included_tables = vec!["no-dot".into()];
        assert_matches!(config.validate(), Err(FerryError::Config(_)));

        let mut config = minimal();
        config.batch_size = 0;
        assert_matches!(config.validate(), Err(FerryError::Config(_)));

        let mut config = minimal();
        config.server_id = 0;
        assert_matches!(config.validate(), Err(FerryError::Config(_)));
    }

    #[test]
    fn negative_speed_log_disables_the_ring() {
        let mut config = minimal();
        config.speed_log_entries = -1;
        assert_eq!(config.speed_log_capacity(), 0);
        config.speed_log_entries = 16;
        assert_eq!(config.speed_log_capacity(), 16);
    }
}
