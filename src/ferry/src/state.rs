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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::binlog::position::BinlogPosition;
use crate::catalog::{SchemaCache, TableIdentity, TableSchema};
use crate::error::Result;

/// The resume token. Serialized as JSON with the exact field names below;
/// unknown top-level fields are ignored on load, missing ones are fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableState {
    #[serde(rename = "GhostferryVersion")]
    pub version: String,
    #[serde(rename = "LastKnownTableSchemaCache")]
    pub schema_cache: BTreeMap<String, TableSchema>,
    #[serde(rename = "LastSuccessfulPrimaryKeys")]
    pub last_successful_pks: BTreeMap<String, u64>,
    #[serde(rename = "CompletedTables")]
    pub completed_tables: BTreeMap<String, bool>,
    #[serde(rename = "LastWrittenBinlogPosition")]
    pub last_written_binlog_position: BinlogPosition,
}

impl SerializableState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Rebuilds the typed schema cache embedded in the dump.
    pub fn restore_schema_cache(&self) -> Result<SchemaCache> {
        let mut tables = HashMap::with_capacity(self.schema_cache.len());
        for (dotted, schema) in &self.schema_cache {
            tables.insert(TableIdentity::from_dotted(dotted)?, schema.clone());
        }
        Ok(SchemaCache::new(tables))
    }
}

#[derive(Debug, Clone, Copy)]
struct PkPosition {
    position: u64,
    at: Instant,
}

/// Fixed-capacity ring of cumulative PK positions, used solely to estimate
/// the instantaneous copy rate. Slots carry an explicit occupancy marker
/// instead of the zero-position sentinel, which keeps "never written"
/// distinct from a legitimate zero.
#[derive(Debug)]
struct SpeedLog {
    slots: Vec<Option<PkPosition>>,
    /// Next slot to overwrite; entries are replaced in insertion order.
    next: usize,
}

impl SpeedLog {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            next: 0,
        }
    }

    fn disabled(&self) -> bool {
        self.slots.is_empty()
    }

    fn newest_index(&self) -> usize {
        (self.next + self.slots.len() - 1) % self.slots.len()
    }

    fn record(&mut self, delta: u64, at: Instant) {
        if self.disabled() {
            return;
        }
        let previous = self.slots[self.newest_index()].map_or(0, |p| p.position);
        self.slots[self.next] = Some(PkPosition {
            position: previous + delta,
            at,
        });
        self.next = (self.next + 1) % self.slots.len();
    }

    /// Walks backwards from the newest entry until the ring is exhausted or
    /// an unoccupied slot appears, then averages over the covered window.
    /// An empty or single-entry ring yields 0.
    fn rate(&self) -> f64 {
        if self.disabled() {
            return 0.0;
        }
        let newest_index = self.newest_index();
        let Some(newest) = self.slots[newest_index] else {
            return 0.0;
        };

        let mut earliest = newest;
        let mut index = newest_index;
        for _ in 1..self.slots.len() {
            index = (index + self.slots.len() - 1) % self.slots.len();
            match self.slots[index] {
                Some(entry) => earliest = entry,
                None => break,
            }
        }

        let elapsed = newest.at.saturating_duration_since(earliest.at);
        if elapsed.is_zero() {
            return 0.0;
        }
        (newest.position - earliest.position) as f64 / elapsed.as_secs_f64()
    }
}

#[derive(Debug)]
struct CopyProgress {
    last_pks: HashMap<TableIdentity, u64>,
    completed: HashSet<TableIdentity>,
    speed_log: SpeedLog,
}

/// Concurrent-safe progress bookkeeping shared by the copier workers and the
/// binlog applier. Two independent reader-writer locks: one for the binlog
/// coordinate, one for copy progress (PK map, completion set, speed ring).
/// Serialization takes both as readers, binlog first; writers take their
/// single lock only.
#[derive(Debug)]
pub struct StateTracker {
    version: String,
    binlog: RwLock<BinlogPosition>,
    copy: RwLock<CopyProgress>,
}

impl StateTracker {
    pub fn new(version: impl Into<String>, speed_log_entries: usize) -> Self {
        Self {
            version: version.into(),
            binlog: RwLock::new(BinlogPosition::default()),
            copy: RwLock::new(CopyProgress {
                last_pks: HashMap::new(),
                completed: HashSet::new(),
                speed_log: SpeedLog::new(speed_log_entries),
            }),
        }
    }

    /// Restores a tracker from a dump produced by [`StateTracker::serialize`].
    /// The stored coordinate and per-table progress become the resume point;
    /// the speed ring always starts empty.
    pub fn from_serialized(
        state: &SerializableState,
        version: impl Into<String>,
        speed_log_entries: usize,
    ) -> Result<Self> {
        let version = version.into();
        if state.version != version {
            tracing::warn!(
                dump_version = %state.version,
                tool_version = %version,
                "resuming from a state dump written by a different build",
            );
        }

        let mut last_pks = HashMap::with_capacity(state.last_successful_pks.len());
        for (dotted, pk) in &state.last_successful_pks {
            last_pks.insert(TableIdentity::from_dotted(dotted)?, *pk);
        }
        let mut completed = HashSet::new();
        for (dotted, done) in &state.completed_tables {
            if *done {
                completed.insert(TableIdentity::from_dotted(dotted)?);
            }
        }

        Ok(Self {
            version,
            binlog: RwLock::new(state.last_written_binlog_position.clone()),
            copy: RwLock::new(CopyProgress {
                last_pks,
                completed,
                speed_log: SpeedLog::new(speed_log_entries),
            }),
        })
    }

    /// Advances the last written binlog coordinate. Coordinates not greater
    /// than the current one are ignored, so reads never observe a regression.
    pub fn update_last_binlog_coordinate(&self, position: BinlogPosition) {
        let mut current = self.binlog.write();
        if position > *current {
            *current = position;
        }
    }

    pub fn last_binlog_coordinate(&self) -> BinlogPosition {
        self.binlog.read().clone()
    }

    /// Records a successful copy batch. `pk` must be strictly greater than
    /// the previous value for the table; anything else is a bug in the
    /// caller.
    pub fn update_last_pk(&self, table: &TableIdentity, pk: u64) {
        self.update_last_pk_at(table, pk, Instant::now());
    }

    fn update_last_pk_at(&self, table: &TableIdentity, pk: u64, at: Instant) {
        let mut copy = self.copy.write();
        let previous = copy.last_pks.get(table).copied().unwrap_or(0);
        assert!(
            pk > previous,
            "per-table PK must advance: table {table}, {pk} <= {previous}"
        );
        copy.last_pks.insert(table.clone(), pk);
        copy.speed_log.record(pk - previous, at);
    }

    /// The PK a fresh iterator resumes after. Completed tables absorb to ⊤
    /// (`u64::MAX`); untouched tables start from 0.
    pub fn last_pk(&self, table: &TableIdentity) -> u64 {
        let copy = self.copy.read();
        if copy.completed.contains(table) {
            return u64::MAX;
        }
        copy.last_pks.get(table).copied().unwrap_or(0)
    }

    pub fn mark_completed(&self, table: &TableIdentity) {
        self.copy.write().completed.insert(table.clone());
    }

    pub fn is_completed(&self, table: &TableIdentity) -> bool {
        self.copy.read().completed.contains(table)
    }

    pub fn completed_table_count(&self) -> usize {
        self.copy.read().completed.len()
    }

    /// Copy rate over the speed ring's window, in PKs per second. Zero when
    /// the ring is disabled or holds fewer than two samples.
    pub fn estimated_pk_per_second(&self) -> f64 {
        self.copy.read().speed_log.rate()
    }

    /// Produces a consistent snapshot of the run. Both read locks are held
    /// for the duration of the copy (binlog first, then copy), and the
    /// returned maps are deep copies that never alias tracker internals.
    pub fn serialize(&self, schema_cache: &SchemaCache) -> SerializableState {
        let binlog = self.binlog.read();
        let copy = self.copy.read();

        let schema_cache = schema_cache
            .tables()
            .iter()
            .map(|(identity, schema)| (identity.dotted(), schema.clone()))
            .collect();
        let last_successful_pks = copy
            .last_pks
            .iter()
            .map(|(identity, pk)| (identity.dotted(), *pk))
            .collect();
        let completed_tables = copy
            .completed
            .iter()
            .map(|identity| (identity.dotted(), true))
            .collect();

        SerializableState {
            version: self.version.clone(),
            schema_cache,
            last_successful_pks,
            completed_tables,
            last_written_binlog_position: binlog.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::catalog::ColumnDef;

    const TEST_VERSION: &str = "0.4.0-test";

    fn table(name: &str) -> TableIdentity {
        TableIdentity::new("s", name)
    }

    fn test_schema_cache() -> SchemaCache {
        let schema = TableSchema {
            columns: vec![ColumnDef {
                name: "id".into(),
                column_type: "bigint(20) unsigned".into(),
                nullable: false,
            }],
            pk_ordinal: 0,
        };
        let mut tables = HashMap::new();
        tables.insert(table("t"), schema);
        SchemaCache::new(tables)
    }

    #[test]
    fn last_pk_tracks_the_latest_update() {
        let tracker = StateTracker::new(TEST_VERSION, 0);
        let t = table("t");
        assert_eq!(tracker.last_pk(&t), 0);

        let mut seen = vec![];
        for pk in [3u64, 10, 11, 500] {
            tracker.update_last_pk(&t, pk);
            seen.push(tracker.last_pk(&t));
        }
        assert_eq!(seen, vec![3, 10, 11, 500]);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    #[should_panic(expected = "per-table PK must advance")]
    fn non_monotonic_pk_is_a_bug() {
        let tracker = StateTracker::new(TEST_VERSION, 0);
        tracker.update_last_pk(&table("t"), 10);
        tracker.update_last_pk(&table("t"), 10);
    }

    #[test]
    fn completion_absorbs_the_pk_cursor() {
        let tracker = StateTracker::new(TEST_VERSION, 0);
        let t = table("t");
        tracker.update_last_pk(&t, 10);
        tracker.mark_completed(&t);
        tracker.mark_completed(&t); // idempotent

        assert!(tracker.is_completed(&t));
        assert_eq!(tracker.last_pk(&t), u64::MAX);

        // The dump still records the real PK alongside the completion flag.
        let state = tracker.serialize(&test_schema_cache());
        assert_eq!(state.last_successful_pks.get("s.t"), Some(&10));
        assert_eq!(state.completed_tables.get("s.t"), Some(&true));
    }

    #[test]
    fn empty_tracker_serializes_to_zero_state() {
        let tracker = StateTracker::new(TEST_VERSION, 0);
        let state = tracker.serialize(&SchemaCache::default());

        assert_eq!(state.version, TEST_VERSION);
        assert!(state.last_successful_pks.is_empty());
        assert!(state.completed_tables.is_empty());
        assert!(state.last_written_binlog_position.is_zero());

        let json: serde_json::Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();
        assert_eq!(json["GhostferryVersion"], TEST_VERSION);
        assert_eq!(json["LastSuccessfulPrimaryKeys"], serde_json::json!({}));
        assert_eq!(json["CompletedTables"], serde_json::json!({}));
        assert_eq!(
            json["LastWrittenBinlogPosition"],
            serde_json::json!({"Name": "", "Pos": 0})
        );
    }

    #[test]
    fn serialized_state_is_a_deep_copy() {
        let tracker = StateTracker::new(TEST_VERSION, 0);
        let t = table("t");
        tracker.update_last_pk(&t, 10);
        tracker.update_last_binlog_coordinate(BinlogPosition::new("bin.0001", 100));

        let state = tracker.serialize(&test_schema_cache());
        tracker.update_last_pk(&t, 999);
        tracker.mark_completed(&t);
        tracker.update_last_binlog_coordinate(BinlogPosition::new("bin.0002", 4));

        assert_eq!(state.last_successful_pks.get("s.t"), Some(&10));
        assert!(state.completed_tables.is_empty());
        assert_eq!(
            state.last_written_binlog_position,
            BinlogPosition::new("bin.0001", 100)
        );
    }

    #[test]
    fn binlog_coordinate_is_monotonic_under_concurrency() {
        let tracker = Arc::new(StateTracker::new(TEST_VERSION, 0));
        let earlier = BinlogPosition::new("bin.0001", 100);
        let later = BinlogPosition::new("bin.0001", 200);

        let handles: Vec<_> = [earlier, later.clone()]
            .into_iter()
            .map(|pos| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || tracker.update_last_binlog_coordinate(pos))
            })
            .collect();

        let reader = {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                let mut observed = BinlogPosition::default();
                for _ in 0..1000 {
                    let now = tracker.last_binlog_coordinate();
                    assert!(now >= observed, "coordinate regressed: {now} < {observed}");
                    observed = now;
                }
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(tracker.last_binlog_coordinate(), later);
    }

    #[test]
    fn speed_log_rate_spans_the_ring_window() {
        let tracker = StateTracker::new(TEST_VERSION, 3);
        let t = table("t");
        assert_eq!(tracker.estimated_pk_per_second(), 0.0);

        let base = Instant::now();
        tracker.update_last_pk_at(&t, 10, base);
        // A single sample covers no time window.
        assert_eq!(tracker.estimated_pk_per_second(), 0.0);

        for (pk, secs) in [(20u64, 1u64), (30, 2), (40, 3)] {
            tracker.update_last_pk_at(&t, pk, base + Duration::from_secs(secs));
        }

        // Ring capacity 3: the 10-position sample fell off, window is
        // positions 20..40 over seconds 1..3.
        assert_eq!(tracker.estimated_pk_per_second(), 10.0);
    }

    #[test]
    fn disabled_speed_log_reports_zero() {
        let tracker = StateTracker::new(TEST_VERSION, 0);
        let t = table("t");
        tracker.update_last_pk(&t, 10);
        tracker.update_last_pk(&t, 20);
        assert_eq!(tracker.estimated_pk_per_second(), 0.0);
    }

    #[test]
    fn dump_round_trips_through_json() {
        let tracker = StateTracker::new(TEST_VERSION, 0);
        tracker.update_last_pk(&table("t"), 42);
        tracker.mark_completed(&table("done"));
        tracker.update_last_binlog_coordinate(BinlogPosition::new("bin.0009", 77));

        let state = tracker.serialize(&test_schema_cache());
        let restored = SerializableState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(restored, state);

        let reloaded = StateTracker::from_serialized(&restored, TEST_VERSION, 0).unwrap();
        assert_eq!(reloaded.last_pk(&table("t")), 42);
        assert_eq!(reloaded.last_pk(&table("done")), u64::MAX);
        assert!(reloaded.is_completed(&table("done")));
        assert_eq!(
            reloaded.last_binlog_coordinate(),
            BinlogPosition::new("bin.0009", 77)
        );
    }

    #[test]
    fn loader_ignores_unknown_fields_and_rejects_missing_ones() {
        let full = serde_json::json!({
            "GhostferryVersion": "x",
            "LastKnownTableSchemaCache": {},
            "LastSuccessfulPrimaryKeys": {"s.t": 5},
            "CompletedTables": {},
            "LastWrittenBinlogPosition": {"Name": "bin.0001", "Pos": 4},
            "LastVerifiedBinlogPosition": {"Name": "bin.0001", "Pos": 4}
        });
        let state = SerializableState::from_json(&full.to_string()).unwrap();
        assert_eq!(state.last_successful_pks.get("s.t"), Some(&5));

        let missing = serde_json::json!({
            "GhostferryVersion": "x",
            "LastSuccessfulPrimaryKeys": {},
            "CompletedTables": {},
            "LastWrittenBinlogPosition": {"Name": "", "Pos": 0}
        });
        assert!(SerializableState::from_json(&missing.to_string()).is_err());
    }

    #[test]
    fn false_completion_entries_do_not_complete() {
        let mut state = StateTracker::new(TEST_VERSION, 0).serialize(&SchemaCache::default());
        state.completed_tables.insert("s.t".into(), false);
        state.last_successful_pks.insert("s.t".into(), 7);

        let tracker = StateTracker::from_serialized(&state, TEST_VERSION, 0).unwrap();
        assert!(!tracker.is_completed(&table("t")));
        assert_eq!(tracker.last_pk(&table("t")), 7);
    }
}
