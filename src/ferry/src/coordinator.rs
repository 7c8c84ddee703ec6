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

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use mysql_async::Pool;
use parking_lot::Mutex;
use thiserror_ext::AsReport;
use tokio::task::JoinSet;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;

use crate::binlog::event::TableFilter;
use crate::catalog::{SchemaCache, TableIdentity};
use crate::cursor::TableCursor;
use crate::error::{FerryError, Result};
use crate::state::StateTracker;
use crate::util::with_deadline;
use crate::writer::BatchWriter;

fn table_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(500)
        .factor(2)
        .max_delay(Duration::from_secs(30))
        .map(jitter)
}

/// Schedules table copies across a fixed worker pool. Each incomplete table
/// is iterated from its resume PK in batches; exhaustion marks it completed.
/// Returning `Ok` is the copy-complete signal the ferry cuts over on.
#[derive(Clone)]
pub struct CopyCoordinator {
    source_pool: Pool,
    writer: Arc<BatchWriter>,
    tracker: Arc<StateTracker>,
    schema_cache: Arc<SchemaCache>,
    filter: TableFilter,
    batch_size: usize,
    worker_count: usize,
    max_table_retries: u32,
    deadline: Duration,
    cancel: CancellationToken,
}

impl CopyCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_pool: Pool,
        writer: Arc<BatchWriter>,
        tracker: Arc<StateTracker>,
        schema_cache: Arc<SchemaCache>,
        filter: TableFilter,
        batch_size: usize,
        worker_count: usize,
        max_table_retries: u32,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source_pool,
            writer,
            tracker,
            schema_cache,
            filter,
            batch_size,
            worker_count,
            max_table_retries,
            deadline,
            cancel,
        }
    }

    /// Copies every incomplete in-scope table, then returns. A fatal worker
    /// error cancels the remaining workers and propagates.
    pub async fn run(&self) -> Result<()> {
        let work_list = work_list(&self.tracker, &self.schema_cache);
        tracing::info!(
            tables = work_list.len(),
            workers = self.worker_count,
            "starting copy phase",
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(work_list)));
        let mut workers = JoinSet::new();
        for worker in 0..self.worker_count {
            let coordinator = self.clone();
            let queue = Arc::clone(&queue);
            workers.spawn(async move { coordinator.worker_loop(worker, queue).await });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(|e| FerryError::Internal(e.into()))?;
            if let Err(e) = result {
                // Stop the rest of the pool; keep the first fatal error.
                self.cancel.cancel();
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn worker_loop(
        &self,
        worker: usize,
        queue: Arc<Mutex<VecDeque<TableIdentity>>>,
    ) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let Some(table) = queue.lock().pop_front() else {
                tracing::debug!(worker, "copy queue empty; worker idle");
                return Ok(());
            };
            self.copy_table_with_retries(worker, &table).await?;
        }
    }

    async fn copy_table_with_retries(&self, worker: usize, table: &TableIdentity) -> Result<()> {
        let mut failures = 0u32;
        let mut backoff = table_backoff();
        loop {
            match self.copy_table(table).await {
                Ok(CopyOutcome::Finished) => {
                    self.tracker.mark_completed(table);
                    tracing::info!(worker, table = %table, "table copy complete");
                    return Ok(());
                }
                Ok(CopyOutcome::Interrupted) => return Ok(()),
                Err(e) if e.retryable() && failures + 1 < self.max_table_retries => {
                    failures += 1;
                    let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                    tracing::warn!(
                        worker,
                        table = %table,
                        failures,
                        delay = ?delay,
                        error = %e.as_report(),
                        "table copy failed; will resume from last written pk",
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(
                        worker,
                        table = %table,
                        failures,
                        error = %e.as_report(),
                        "table copy failed fatally",
                    );
                    return Err(e);
                }
            }
        }
    }

    /// One copy attempt: open a snapshot cursor past the tracker's resume
    /// PK and stream batches to the writer. Progress committed by earlier
    /// attempts is never repeated.
    async fn copy_table(&self, table: &TableIdentity) -> Result<CopyOutcome> {
        let resume_pk = self.tracker.last_pk(table);
        if resume_pk == u64::MAX {
            return Ok(CopyOutcome::Finished);
        }
        let schema = self.schema_cache.get(table).ok_or_else(|| {
            FerryError::invariant(format!("table {table} missing from the schema cache"))
        })?;

        let conn = with_deadline(self.deadline, async {
            Ok(self.source_pool.get_conn().await?)
        })
        .await?;
        let cursor = TableCursor::open(
            conn,
            table.clone(),
            schema,
            resume_pk,
            self.batch_size,
            self.deadline,
        )
        .await?;
        let Some(mut cursor) = cursor else {
            return Ok(CopyOutcome::Finished);
        };

        let target = self.filter.rewrite(table);
        while let Some(batch) = cursor.next_batch().await? {
            self.writer
                .write_copy_batch(table, &target, schema, &batch)
                .await?;
            if self.cancel.is_cancelled() {
                let _ = cursor.close().await;
                return Ok(CopyOutcome::Interrupted);
            }
        }
        cursor.close().await?;
        Ok(CopyOutcome::Finished)
    }
}

enum CopyOutcome {
    Finished,
    /// Cancelled mid-table; progress is persisted but the table stays
    /// incomplete for the next run.
    Interrupted,
}

/// Every in-scope table not yet completed, in stable order.
pub fn work_list(tracker: &StateTracker, schema_cache: &SchemaCache) -> Vec<TableIdentity> {
    schema_cache
        .identities()
        .filter(|table| !tracker.is_completed(table))
        .cloned()
        .sorted()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::catalog::{ColumnDef, TableSchema};
    use crate::state::SerializableState;

    fn schema() -> TableSchema {
        TableSchema {
            columns: vec![ColumnDef {
                name: "id".into(),
                column_type: "int unsigned".into(),
                nullable: false,
            }],
            pk_ordinal: 0,
        }
    }

    fn cache(names: &[&str]) -> SchemaCache {
        let mut tables = HashMap::new();
        for name in names {
            tables.insert(TableIdentity::new("s", *name), schema());
        }
        SchemaCache::new(tables)
    }

    #[test]
    fn work_list_skips_completed_tables() {
        let tracker = StateTracker::new("test", 0);
        tracker.mark_completed(&TableIdentity::new("s", "t1"));

        let list = work_list(&tracker, &cache(&["t1", "t2", "t3"]));
        assert_eq!(
            list,
            vec![TableIdentity::new("s", "t2"), TableIdentity::new("s", "t3")]
        );
    }

    #[test]
    fn resumed_state_drives_the_work_list_and_resume_pk() {
        // A dump with one completed table and one mid-flight table: the
        // completed one is never enqueued, the other resumes past its pk.
        let dump = serde_json::json!({
            "GhostferryVersion": "test",
            "LastKnownTableSchemaCache": {},
            "LastSuccessfulPrimaryKeys": {"s.t2": 500},
            "CompletedTables": {"s.t1": true},
            "LastWrittenBinlogPosition": {"Name": "bin.0003", "Pos": 1000}
        });
        let state = SerializableState::from_json(&dump.to_string()).unwrap();
        let tracker = StateTracker::from_serialized(&state, "test", 0).unwrap();

        let list = work_list(&tracker, &cache(&["t1", "t2"]));
        assert_eq!(list, vec![TableIdentity::new("s", "t2")]);
        assert_eq!(tracker.last_pk(&TableIdentity::new("s", "t2")), 500);
        assert_eq!(tracker.last_pk(&TableIdentity::new("s", "t1")), u64::MAX);
    }
}
