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

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts};
use mysql_common::binlog::events::{Event, EventData, RowsEventData, TableMapEvent};
use mysql_common::binlog::row::BinlogRow;
use thiserror_ext::AsReport;
use tokio::sync::{mpsc, watch};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;

use crate::binlog::event::{
    binlog_row_values, ReplicatedEvent, RowChange, TableDml, TableFilter,
};
use crate::binlog::position::BinlogPosition;
use crate::catalog::{SchemaCache, TableIdentity, TableSchema};
use crate::error::{FerryError, Result};
use crate::util::with_deadline;

fn connect_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(1000)
        .factor(2)
        .max_delay(Duration::from_secs(60))
        .map(jitter)
}

/// Tails the source binlog as a replica, rewrites in-scope row events to
/// their destination identity, and forwards them into the applier queue.
///
/// The written coordinate only ever advances to event-group boundaries
/// (rotate, query, xid), never into the middle of a statement's
/// table-map/rows sequence, so any persisted coordinate is a valid place to
/// request a new dump from.
pub struct BinlogStreamer {
    opts: Opts,
    server_id: u32,
    filter: TableFilter,
    schema_cache: Arc<SchemaCache>,
    allow_schema_changes: bool,
    deadline: Duration,
    events_tx: mpsc::Sender<ReplicatedEvent>,
    stop_at: watch::Receiver<Option<BinlogPosition>>,
    cancel: CancellationToken,
}

impl BinlogStreamer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opts: Opts,
        server_id: u32,
        filter: TableFilter,
        schema_cache: Arc<SchemaCache>,
        allow_schema_changes: bool,
        deadline: Duration,
        events_tx: mpsc::Sender<ReplicatedEvent>,
        stop_at: watch::Receiver<Option<BinlogPosition>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            opts,
            server_id,
            filter,
            schema_cache,
            allow_schema_changes,
            deadline,
            events_tx,
            stop_at,
            cancel,
        }
    }

    /// Runs until cancelled, stopped at a coordinate, or failed fatally.
    /// Transient transport errors reconnect from the last boundary.
    pub async fn run(mut self, start: BinlogPosition) -> Result<()> {
        if start.is_zero() {
            return Err(FerryError::invariant(
                "binlog streamer started without a source coordinate",
            ));
        }
        let mut current = start;

        'stream: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let mut stream = self.open_stream(&current).await?;
            tracing::info!(position = %current, "binlog tail connected");

            loop {
                if self.reached_stop(&current) {
                    break 'stream;
                }
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'stream,
                    changed = self.stop_at.changed() => {
                        if changed.is_err() {
                            break 'stream;
                        }
                        continue;
                    }
                    next = stream.next() => next,
                };
                match next {
                    None => {
                        return Err(FerryError::invariant(
                            "binlog stream ended before the stop coordinate",
                        ))
                    }
                    Some(Err(e)) => {
                        let e = FerryError::from(e);
                        if !e.retryable() {
                            return Err(e);
                        }
                        tracing::warn!(
                            position = %current,
                            error = %e.as_report(),
                            "binlog tail dropped; reconnecting",
                        );
                        continue 'stream;
                    }
                    Some(Ok(event)) => {
                        current = self
                            .process_event(stream.as_ref().get_ref(), event, current)
                            .await?;
                    }
                }
            }
        }

        tracing::info!(position = %current, "binlog streamer stopped");
        Ok(())
    }

    fn reached_stop(&self, current: &BinlogPosition) -> bool {
        self.stop_at
            .borrow()
            .as_ref()
            .is_some_and(|target| current >= target)
    }

    /// Handles one event and returns the new boundary coordinate. `current`
    /// moves only on rotate/query/xid events; rows events ride between
    /// boundaries and carry the previous one as their resume point.
    async fn process_event(
        &self,
        stream: &BinlogStream,
        event: Event,
        current: BinlogPosition,
    ) -> Result<BinlogPosition> {
        let log_pos = u64::from(event.header().log_pos());
        let mut current = current;

        match event.read_data()? {
            Some(EventData::RotateEvent(rotate)) => {
                current = BinlogPosition::new(rotate.name().to_string(), rotate.position());
                self.forward(ReplicatedEvent::position_only(current.clone()))
                    .await?;
            }
            Some(EventData::XidEvent(_)) => {
                if log_pos > 0 {
                    current.pos = log_pos;
                    self.forward(ReplicatedEvent::position_only(current.clone()))
                        .await?;
                }
            }
            Some(EventData::QueryEvent(query)) => {
                let statement = query.query();
                if let Some(table) = self.filter.ddl_target(&statement, &query.schema()) {
                    if self.allow_schema_changes {
                        tracing::warn!(
                            table = %table,
                            query = %statement,
                            "schema change on replicated table tolerated by policy",
                        );
                    } else {
                        return Err(FerryError::SchemaDrift {
                            table: table.dotted(),
                            query: statement.into_owned(),
                        });
                    }
                }
                if log_pos > 0 {
                    current.pos = log_pos;
                    self.forward(ReplicatedEvent::position_only(current.clone()))
                        .await?;
                }
            }
            Some(EventData::RowsEvent(rows)) => {
                let Some(tme) = stream.get_tme(rows.table_id()) else {
                    return Err(FerryError::invariant(format!(
                        "rows event for table id {} without a preceding table map",
                        rows.table_id()
                    )));
                };
                let source = TableIdentity::new(
                    tme.database_name().into_owned(),
                    tme.table_name().into_owned(),
                );
                if self.filter.includes(&source) {
                    let schema = self.schema_cache.get(&source).ok_or_else(|| {
                        FerryError::invariant(format!(
                            "replicated table {source} has no cached schema"
                        ))
                    })?;
                    let changes = decode_changes(&rows, tme, &source, schema)?;
                    if !changes.is_empty() {
                        self.forward(ReplicatedEvent {
                            end_position: current.clone(),
                            dml: Some(TableDml {
                                target: self.filter.rewrite(&source),
                                source,
                                changes,
                            }),
                        })
                        .await?;
                    }
                }
            }
            // Table maps, format descriptions, GTIDs and the rest carry no
            // replicated payload and are not resume boundaries.
            Some(_) | None => {}
        }

        Ok(current)
    }

    async fn forward(&self, event: ReplicatedEvent) -> Result<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| FerryError::Cancelled)
    }

    async fn open_stream(&self, from: &BinlogPosition) -> Result<Pin<Box<BinlogStream>>> {
        let mut backoff = connect_backoff();
        loop {
            match self.try_open(from).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.retryable() && !self.cancel.is_cancelled() => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(60));
                    tracing::warn!(
                        position = %from,
                        delay = ?delay,
                        error = %e.as_report(),
                        "binlog connect failed; backing off",
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(FerryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Registers as a replica and requests the dump from `from`. The
    /// checksum variable must be set before the request, as a real replica
    /// would.
    async fn try_open(&self, from: &BinlogPosition) -> Result<Pin<Box<BinlogStream>>> {
        with_deadline(self.deadline, async {
            let mut conn = Conn::new(self.opts.clone()).await?;
            conn.query_drop("SET @master_binlog_checksum = 'CRC32'")
                .await?;
            let stream = conn
                .get_binlog_stream(
                    BinlogStreamRequest::new(self.server_id)
                        .with_filename(from.name.as_bytes())
                        .with_pos(from.pos),
                )
                .await?;
            Ok(Box::pin(stream))
        })
        .await
    }
}

fn decode_changes(
    rows: &RowsEventData<'_>,
    tme: &TableMapEvent<'_>,
    source: &TableIdentity,
    schema: &TableSchema,
) -> Result<Vec<RowChange>> {
    let mut changes = vec![];
    for row in rows.rows(tme) {
        let (before, after) = row?;
        let change = match rows {
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                RowChange::Insert {
                    after: image(after, "after", source, schema)?,
                }
            }
            RowsEventData::UpdateRowsEvent(_) | RowsEventData::UpdateRowsEventV1(_) => {
                RowChange::Update {
                    before: image(before, "before", source, schema)?,
                    after: image(after, "after", source, schema)?,
                }
            }
            RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                RowChange::Delete {
                    before: image(before, "before", source, schema)?,
                }
            }
            _ => {
                return Err(FerryError::invariant(format!(
                    "unsupported rows event kind for replicated table {source}"
                )))
            }
        };
        changes.push(change);
    }
    Ok(changes)
}

fn image(
    row: Option<BinlogRow>,
    which: &str,
    source: &TableIdentity,
    schema: &TableSchema,
) -> Result<Vec<mysql_async::Value>> {
    let row = row.ok_or_else(|| {
        FerryError::invariant(format!("rows event for {source} is missing its {which} image"))
    })?;
    let values = binlog_row_values(&row)?;
    if values.len() != schema.columns.len() {
        return Err(FerryError::invariant(format!(
            "row image for {source} has {} columns, schema snapshot has {}; \
             undetected schema drift",
            values.len(),
            schema.columns.len()
        )));
    }
    Ok(values)
}
