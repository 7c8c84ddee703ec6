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

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use mysql_async::prelude::*;
use mysql_async::{Params, Pool, TxOpts, Value};
use thiserror_ext::AsReport;
use tokio::sync::mpsc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

use crate::binlog::event::{ReplicatedEvent, RowChange};
use crate::catalog::{quote_ident, SchemaCache, TableIdentity, TableSchema};
use crate::cursor::RowBatch;
use crate::error::{FerryError, Result};
use crate::state::StateTracker;
use crate::util::{pk_value, with_deadline};

/// How many queued binlog events are folded into one target transaction.
const EVENT_GROUP_LIMIT: usize = 100;

fn write_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(100)
        .factor(2)
        .max_delay(Duration::from_secs(10))
        .map(jitter)
}

/// Applies batches to the target, one transaction per batch, and reports
/// committed progress to the state tracker. All writes use replace-by-PK
/// semantics, so replaying a batch against a partially applied target
/// converges to the same final state.
pub struct BatchWriter {
    pool: Pool,
    tracker: Arc<StateTracker>,
    deadline: Duration,
    max_retries: u32,
}

impl BatchWriter {
    pub fn new(pool: Pool, tracker: Arc<StateTracker>, deadline: Duration, max_retries: u32) -> Self {
        Self {
            pool,
            tracker,
            deadline,
            max_retries,
        }
    }

    /// Writes one copy batch. On commit the table's PK cursor advances to
    /// the batch maximum. Batches for one table are issued by a single
    /// worker, preserving ascending PK order.
    pub async fn write_copy_batch(
        &self,
        source: &TableIdentity,
        target: &TableIdentity,
        schema: &TableSchema,
        batch: &RowBatch,
    ) -> Result<()> {
        let sql = replace_sql(target, schema, batch.rows.len());
        let params: Vec<Value> = batch.rows.iter().flatten().cloned().collect();
        let statements = vec![(sql, params)];

        self.apply_transaction(&statements).await?;
        self.tracker.update_last_pk(source, batch.max_pk);
        Ok(())
    }

    /// Applies a group of binlog events in stream order inside one
    /// transaction, then advances the written coordinate to the group's
    /// last end-coordinate. Position-only events contribute no statements
    /// but still move the coordinate.
    pub async fn write_replicated_events(
        &self,
        events: &[ReplicatedEvent],
        schemas: &SchemaCache,
    ) -> Result<()> {
        let Some(last) = events.last() else {
            return Ok(());
        };

        let mut statements = vec![];
        for event in events {
            let Some(dml) = &event.dml else { continue };
            let schema = schemas.get(&dml.source).ok_or_else(|| {
                FerryError::invariant(format!(
                    "binlog event for {} which has no cached schema",
                    dml.source
                ))
            })?;
            for change in &dml.changes {
                statements.extend(statements_for_change(&dml.target, schema, change)?);
            }
        }

        if !statements.is_empty() {
            self.apply_transaction(&statements).await?;
        }
        self.tracker
            .update_last_binlog_coordinate(last.end_position.clone());
        Ok(())
    }

    /// One transaction, retried whole on transient failure. Safe because
    /// every statement is replace-by-PK idempotent.
    async fn apply_transaction(&self, statements: &[(String, Vec<Value>)]) -> Result<()> {
        let mut attempt = 0u32;
        let mut backoff = write_backoff();
        loop {
            match self.try_apply(statements).await {
                Ok(()) => return Ok(()),
                Err(e) if e.retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        error = %e.as_report(),
                        "target write failed; retrying",
                    );
                    if let Some(delay) = backoff.next() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_apply(&self, statements: &[(String, Vec<Value>)]) -> Result<()> {
        with_deadline(self.deadline, async {
            let mut conn = self.pool.get_conn().await?;
            let mut tx = conn.start_transaction(TxOpts::default()).await?;
            for (sql, params) in statements {
                tx.exec_drop(sql.as_str(), Params::Positional(params.clone()))
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }
}

/// Consumes the streamer's queue and applies events through the writer, in
/// source order, as the single binlog writer. Exits when the queue closes
/// (streamer stopped), after draining what was already enqueued.
pub struct BinlogApplier {
    rx: mpsc::Receiver<ReplicatedEvent>,
    writer: Arc<BatchWriter>,
    schema_cache: Arc<SchemaCache>,
}

impl BinlogApplier {
    pub fn new(
        rx: mpsc::Receiver<ReplicatedEvent>,
        writer: Arc<BatchWriter>,
        schema_cache: Arc<SchemaCache>,
    ) -> Self {
        Self {
            rx,
            writer,
            schema_cache,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(first) = self.rx.recv().await {
            let mut group = vec![first];
            while group.len() < EVENT_GROUP_LIMIT {
                match self.rx.try_recv() {
                    Ok(event) => group.push(event),
                    Err(_) => break,
                }
            }
            self.writer
                .write_replicated_events(&group, &self.schema_cache)
                .await?;
        }
        tracing::info!("binlog event queue drained");
        Ok(())
    }
}

fn replace_sql(target: &TableIdentity, schema: &TableSchema, row_count: usize) -> String {
    let columns = schema.column_names().map(quote_ident).join(", ");
    let row = format!("({})", schema.columns.iter().map(|_| "?").join(", "));
    let rows = itertools::repeat_n(row.as_str(), row_count).join(", ");
    format!(
        "REPLACE INTO {table} ({columns}) VALUES {rows}",
        table = target.quoted(),
    )
}

fn delete_sql(target: &TableIdentity, schema: &TableSchema) -> String {
    format!(
        "DELETE FROM {table} WHERE {pk} = ?",
        table = target.quoted(),
        pk = quote_ident(&schema.pk_column().name),
    )
}

/// Plans the statements for one row change. Updates that move a row to a
/// new PK first remove the old row, otherwise the stale copy would survive
/// the replace.
fn statements_for_change(
    target: &TableIdentity,
    schema: &TableSchema,
    change: &RowChange,
) -> Result<Vec<(String, Vec<Value>)>> {
    let statements = match change {
        RowChange::Insert { after } => {
            vec![(replace_sql(target, schema, 1), after.clone())]
        }
        RowChange::Update { before, after } => {
            let old_pk = pk_value(&before[schema.pk_ordinal])?;
            let new_pk = pk_value(&after[schema.pk_ordinal])?;
            let mut statements = vec![];
            if old_pk != new_pk {
                statements.push((delete_sql(target, schema), vec![Value::UInt(old_pk)]));
            }
            statements.push((replace_sql(target, schema, 1), after.clone()));
            statements
        }
        RowChange::Delete { before } => {
            let pk = pk_value(&before[schema.pk_ordinal])?;
            vec![(delete_sql(target, schema), vec![Value::UInt(pk)])]
        }
    };
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnDef;

    fn orders() -> (TableIdentity, TableSchema) {
        let schema = TableSchema {
            columns: vec![
                ColumnDef {
                    name: "id".into(),
                    column_type: "bigint(20) unsigned".into(),
                    nullable: false,
                },
                ColumnDef {
                    name: "status".into(),
                    column_type: "varchar(16)".into(),
                    nullable: true,
                },
            ],
            pk_ordinal: 0,
        };
        (TableIdentity::new("shop", "orders"), schema)
    }

    fn row(pk: u64, status: &str) -> Vec<Value> {
        vec![Value::UInt(pk), Value::Bytes(status.as_bytes().to_vec())]
    }

    #[test]
    fn replace_sql_covers_all_rows() {
        let (target, schema) = orders();
        assert_eq!(
            replace_sql(&target, &schema, 2),
            "REPLACE INTO `shop`.`orders` (`id`, `status`) VALUES (?, ?), (?, ?)"
        );
    }

    #[test]
    fn delete_sql_is_pk_addressed() {
        let (target, schema) = orders();
        assert_eq!(
            delete_sql(&target, &schema),
            "DELETE FROM `shop`.`orders` WHERE `id` = ?"
        );
    }

    #[test]
    fn insert_plans_one_replace() {
        let (target, schema) = orders();
        let change = RowChange::Insert {
            after: row(7, "new"),
        };
        let statements = statements_for_change(&target, &schema, &change).unwrap();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].0.starts_with("REPLACE INTO"));
        assert_eq!(statements[0].1, row(7, "new"));
    }

    #[test]
    fn update_in_place_plans_one_replace() {
        let (target, schema) = orders();
        let change = RowChange::Update {
            before: row(7, "a"),
            after: row(7, "b"),
        };
        let statements = statements_for_change(&target, &schema, &change).unwrap();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].0.starts_with("REPLACE INTO"));
    }

    #[test]
    fn pk_moving_update_deletes_the_old_row_first() {
        let (target, schema) = orders();
        let change = RowChange::Update {
            before: row(7, "a"),
            after: row(8, "a"),
        };
        let statements = statements_for_change(&target, &schema, &change).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].0.starts_with("DELETE FROM"));
        assert_eq!(statements[0].1, vec![Value::UInt(7)]);
        assert!(statements[1].0.starts_with("REPLACE INTO"));
    }

    #[test]
    fn delete_plans_one_pk_delete() {
        let (target, schema) = orders();
        let change = RowChange::Delete {
            before: row(9, "gone"),
        };
        let statements = statements_for_change(&target, &schema, &change).unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].0, delete_sql(&target, &schema));
        assert_eq!(statements[0].1, vec![Value::UInt(9)]);
    }
}
