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

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mysql_async::{Conn, Pool};
use thiserror_ext::AsReport;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::binlog::event::TableFilter;
use crate::binlog::position::BinlogPosition;
use crate::binlog::streamer::BinlogStreamer;
use crate::catalog::{SchemaCache, TableIdentity};
use crate::config::FerryConfig;
use crate::coordinator::CopyCoordinator;
use crate::error::{FerryError, Result};
use crate::state::{SerializableState, StateTracker};
use crate::util::with_deadline;
use crate::writer::{BatchWriter, BinlogApplier};
use crate::TOOL_VERSION;

/// Depth of the streamer-to-applier queue. Bounded so a stalled target
/// backpressures the binlog read instead of buffering it.
const EVENT_QUEUE_DEPTH: usize = 512;

/// Assembles and drives one migration run: snapshot copy and binlog tail in
/// parallel, then a cutover that drains the tail to the source's final
/// coordinate.
///
/// A run can be killed at any point; the state dump it leaves behind (and
/// the one it writes on every terminal path when `state_dump_path` is set)
/// restarts it with no row loss or duplication.
pub struct Ferry {
    config: FerryConfig,
    cancel: CancellationToken,
}

impl Ferry {
    pub fn new(config: FerryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// The broadcast cancellation signal. Cancelling makes every component
    /// drain to the state tracker and return; the run then finishes with
    /// [`FerryError::Cancelled`] and a valid resume dump.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the migration to completion, cancellation, or failure. The
    /// final state is returned on success and, whenever it can be produced,
    /// written to `state_dump_path` on every exit path.
    pub async fn run(&self) -> Result<SerializableState> {
        let identities = self.config.included_identities()?;
        let source_pool = Pool::new(self.config.source.opts());
        let target_pool = Pool::new(self.config.target.opts());

        let (schema_cache, tracker) = self.bootstrap(&source_pool, &identities).await?;
        let schema_cache = Arc::new(schema_cache);
        let tracker = Arc::new(tracker);

        let outcome = self
            .drive(
                &source_pool,
                &target_pool,
                identities,
                Arc::clone(&schema_cache),
                Arc::clone(&tracker),
            )
            .await;

        let state = tracker.serialize(&schema_cache);
        self.write_state_dump(&state).await;

        if let Err(e) = source_pool.disconnect().await {
            tracing::warn!(error = %e.as_report(), "source pool teardown failed");
        }
        if let Err(e) = target_pool.disconnect().await {
            tracing::warn!(error = %e.as_report(), "target pool teardown failed");
        }

        match outcome {
            Ok(()) => {
                tracing::info!(
                    position = %state.last_written_binlog_position,
                    "migration complete",
                );
                Ok(state)
            }
            Err(e) => {
                tracing::error!(
                    error = %e.as_report(),
                    "migration halted; dumped state is a valid resume point",
                );
                Err(e)
            }
        }
    }

    /// Builds the tracker and schema cache, fresh or from a resume dump.
    /// On a fresh run the source coordinate is captured before anything
    /// reads a row, so the binlog replays from no later than every
    /// snapshot.
    async fn bootstrap(
        &self,
        source_pool: &Pool,
        identities: &[TableIdentity],
    ) -> Result<(SchemaCache, StateTracker)> {
        let ring_capacity = self.config.speed_log_capacity();

        if let Some(resume) = &self.config.resume_state {
            let tracker = StateTracker::from_serialized(resume, TOOL_VERSION, ring_capacity)?;
            if tracker.last_binlog_coordinate().is_zero() {
                return Err(FerryError::config(
                    "resume state carries no binlog coordinate",
                ));
            }
            let schema_cache = resume.restore_schema_cache()?;
            for identity in identities {
                if !schema_cache.contains(identity) {
                    return Err(FerryError::config(format!(
                        "resume state has no schema snapshot for {identity}"
                    )));
                }
            }
            tracing::info!(
                position = %tracker.last_binlog_coordinate(),
                completed_tables = tracker.completed_table_count(),
                "resuming from state dump",
            );
            return Ok((schema_cache, tracker));
        }

        let mut conn = self.get_conn(source_pool).await?;
        let start = read_source_position(&mut conn).await?;
        let schema_cache = with_deadline(
            self.config.db_deadline(),
            SchemaCache::load(&mut conn, identities),
        )
        .await?;
        drop(conn);

        let tracker = StateTracker::new(TOOL_VERSION, ring_capacity);
        tracker.update_last_binlog_coordinate(start.clone());
        tracing::info!(
            position = %start,
            tables = schema_cache.len(),
            "captured source coordinate and schema snapshot",
        );
        Ok((schema_cache, tracker))
    }

    async fn drive(
        &self,
        source_pool: &Pool,
        target_pool: &Pool,
        identities: Vec<TableIdentity>,
        schema_cache: Arc<SchemaCache>,
        tracker: Arc<StateTracker>,
    ) -> Result<()> {
        let deadline = self.config.db_deadline();
        let filter = TableFilter::new(
            identities,
            self.config.database_rewrites.clone(),
            self.config.table_rewrites.clone(),
        );
        let writer = Arc::new(BatchWriter::new(
            target_pool.clone(),
            Arc::clone(&tracker),
            deadline,
            self.config.max_write_retries,
        ));

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(None);

        let streamer = BinlogStreamer::new(
            self.config.source.opts(),
            self.config.server_id,
            filter.clone(),
            Arc::clone(&schema_cache),
            self.config.allow_schema_changes,
            deadline,
            events_tx,
            stop_rx,
            self.cancel.clone(),
        );
        let streamer_task =
            self.spawn_guarded(streamer.run(tracker.last_binlog_coordinate()));

        let applier = BinlogApplier::new(events_rx, Arc::clone(&writer), Arc::clone(&schema_cache));
        let applier_task = self.spawn_guarded(applier.run());

        let reporter = self.config.progress_interval().map(|interval| {
            tokio::spawn(progress_loop(
                interval,
                Arc::clone(&tracker),
                Arc::clone(&schema_cache),
            ))
        });

        let coordinator = CopyCoordinator::new(
            source_pool.clone(),
            writer,
            Arc::clone(&tracker),
            Arc::clone(&schema_cache),
            filter,
            self.config.batch_size,
            self.config.worker_count,
            self.config.max_table_retries,
            deadline,
            self.cancel.clone(),
        );

        // Copy phase. A fatal error in any tail task cancels the token and
        // the workers wind down at their next batch boundary.
        let copy_result = coordinator.run().await;

        // Cutover: stop the streamer at the source's current coordinate and
        // let it drain. Skipped when the copy failed or the run was
        // cancelled; the token then shuts the tail down instead.
        let cutover_result = if copy_result.is_ok() && !self.cancel.is_cancelled() {
            self.signal_cutover(source_pool, &stop_tx).await
        } else {
            Ok(())
        };
        if copy_result.is_err() || cutover_result.is_err() {
            self.cancel.cancel();
        }

        let streamer_result = join_task(streamer_task).await;
        let applier_result = join_task(applier_task).await;
        if let Some(reporter) = reporter {
            reporter.abort();
        }

        // The first fatal error wins; plain cancellation is reported as
        // such only when nothing worse happened.
        for result in [copy_result, cutover_result, streamer_result, applier_result] {
            match result {
                Err(FerryError::Cancelled) | Ok(()) => {}
                Err(e) => return Err(e),
            }
        }
        if self.cancel.is_cancelled() {
            return Err(FerryError::Cancelled);
        }
        Ok(())
    }

    /// Reads the cutover coordinate and tells the streamer to drain up to
    /// it. The streamer exits once its boundary passes the coordinate; the
    /// applier follows when the queue closes.
    async fn signal_cutover(
        &self,
        source_pool: &Pool,
        stop_tx: &watch::Sender<Option<BinlogPosition>>,
    ) -> Result<()> {
        let mut conn = self.get_conn(source_pool).await?;
        let cutover = read_source_position(&mut conn).await?;
        drop(conn);
        tracing::info!(position = %cutover, "copy complete; draining binlog to cutover coordinate");
        stop_tx
            .send(Some(cutover))
            .map_err(|_| FerryError::invariant("binlog streamer gone before cutover"))?;
        Ok(())
    }

    /// Spawns a tail task that trips the shared cancellation token when it
    /// fails, so the copy phase never outlives a dead tail.
    fn spawn_guarded(
        &self,
        fut: impl Future<Output = Result<()>> + Send + 'static,
    ) -> JoinHandle<Result<()>> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = fut.await;
            if let Err(e) = &result {
                if !matches!(e, FerryError::Cancelled) {
                    cancel.cancel();
                }
            }
            result
        })
    }

    async fn get_conn(&self, pool: &Pool) -> Result<Conn> {
        with_deadline(self.config.db_deadline(), async {
            Ok(pool.get_conn().await?)
        })
        .await
    }

    async fn write_state_dump(&self, state: &SerializableState) {
        let Some(path) = &self.config.state_dump_path else {
            return;
        };
        let json = match state.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e.as_report(), "state dump serialization failed");
                return;
            }
        };
        match tokio::fs::write(path, json).await {
            Ok(()) => tracing::info!(path = %path.display(), "state dump written"),
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "state dump write failed",
                );
            }
        }
    }
}

async fn join_task(task: JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(FerryError::Internal(anyhow::anyhow!("task panicked: {e}"))),
    }
}

async fn read_source_position(conn: &mut Conn) -> Result<BinlogPosition> {
    use mysql_async::prelude::*;

    let row: Option<mysql_async::Row> = conn.query_first("SHOW MASTER STATUS").await?;
    let mut row = row.ok_or_else(|| {
        FerryError::config("source has no binary log; enable binary logging with ROW format")
    })?;
    let name: String = row
        .take("File")
        .ok_or_else(|| FerryError::invariant("SHOW MASTER STATUS returned no File"))?;
    let pos: u64 = row
        .take("Position")
        .ok_or_else(|| FerryError::invariant("SHOW MASTER STATUS returned no Position"))?;
    Ok(BinlogPosition::new(name, pos))
}

/// Periodic one-line progress report, driven by the throughput ring.
async fn progress_loop(
    interval: Duration,
    tracker: Arc<StateTracker>,
    schema_cache: Arc<SchemaCache>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        tracing::info!(
            tables_completed = tracker.completed_table_count(),
            tables_total = schema_cache.len(),
            pk_per_second = format!("{:.1}", tracker.estimated_pk_per_second()),
            position = %tracker.last_binlog_coordinate(),
            "migration progress",
        );
    }
}
