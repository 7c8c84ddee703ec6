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

use itertools::Itertools;
use mysql_async::prelude::*;
use mysql_async::{Conn, Row};

use crate::catalog::{quote_ident, TableIdentity, TableSchema};
use crate::error::{FerryError, Result};
use crate::util::{pk_value, with_deadline};

/// One PK-ordered slice of a table. Rows are in source order; values are in
/// schema column order.
#[derive(Debug, Clone)]
pub struct RowBatch {
    pub rows: Vec<Vec<mysql_async::Value>>,
    /// Largest PK in the batch; becomes the table's new resume point once
    /// the batch commits on the target.
    pub max_pk: u64,
}

/// Iterates a table in ascending PK order over `(resume_pk, max_pk]`.
///
/// The cursor owns a dedicated connection with an open
/// `REPEATABLE READ` consistent snapshot, so rows inserted after the cursor
/// opened are invisible to it; they reach the target through the binlog
/// stream instead. `max_pk` is resolved once, inside the snapshot, when the
/// cursor opens.
pub struct TableCursor {
    conn: Conn,
    source: TableIdentity,
    select_sql: String,
    pk_ordinal: usize,
    last_pk: u64,
    max_pk: u64,
    batch_size: usize,
    deadline: Duration,
    exhausted: bool,
}

impl TableCursor {
    /// Opens the snapshot and resolves the PK range. Returns `None` when the
    /// table holds nothing past `resume_pk`, in which case the connection is
    /// released immediately.
    pub async fn open(
        mut conn: Conn,
        source: TableIdentity,
        schema: &TableSchema,
        resume_pk: u64,
        batch_size: usize,
        deadline: Duration,
    ) -> Result<Option<Self>> {
        with_deadline(deadline, async {
            conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                .await?;
            conn.query_drop("START TRANSACTION WITH CONSISTENT SNAPSHOT, READ ONLY")
                .await?;
            Ok(())
        })
        .await?;

        let max_pk_sql = format!(
            "SELECT MAX({pk}) FROM {table}",
            pk = quote_ident(&schema.pk_column().name),
            table = source.quoted(),
        );
        let max_pk: Option<Option<u64>> =
            with_deadline(deadline, async { Ok(conn.query_first(max_pk_sql).await?) }).await?;

        let Some(max_pk) = max_pk.flatten().filter(|max| *max > resume_pk) else {
            conn.query_drop("ROLLBACK").await?;
            return Ok(None);
        };

        tracing::debug!(
            table = %source,
            resume_pk,
            max_pk,
            "opened snapshot cursor",
        );

        Ok(Some(Self {
            select_sql: select_batch_sql(&source, schema),
            pk_ordinal: schema.pk_ordinal,
            conn,
            source,
            last_pk: resume_pk,
            max_pk,
            batch_size,
            deadline,
            exhausted: false,
        }))
    }

    /// Fetches the next batch, or `None` once the range is drained. Any
    /// transport error terminates the cursor; the caller restarts the table
    /// from its last successfully written PK.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.exhausted {
            return Ok(None);
        }

        let params = (self.last_pk, self.max_pk, self.batch_size as u64);
        let rows: Vec<Row> = with_deadline(self.deadline, async {
            Ok(self.conn.exec(self.select_sql.as_str(), params).await?)
        })
        .await?;

        if rows.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        if rows.len() < self.batch_size {
            self.exhausted = true;
        }

        let mut batch_max = self.last_pk;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let values = row.unwrap();
            let pk = pk_value(&values[self.pk_ordinal])?;
            if pk <= batch_max {
                return Err(FerryError::invariant(format!(
                    "cursor on {} returned out-of-order pk {pk} after {batch_max}",
                    self.source
                )));
            }
            batch_max = pk;
            out.push(values);
        }

        self.last_pk = batch_max;
        if self.last_pk >= self.max_pk {
            self.exhausted = true;
        }

        Ok(Some(RowBatch {
            rows: out,
            max_pk: batch_max,
        }))
    }

    /// Ends the snapshot and returns the connection to the pool.
    pub async fn close(mut self) -> Result<()> {
        self.conn.query_drop("ROLLBACK").await?;
        Ok(())
    }
}

fn select_batch_sql(source: &TableIdentity, schema: &TableSchema) -> String {
    let columns = schema.column_names().map(quote_ident).join(", ");
    let pk = quote_ident(&schema.pk_column().name);
    format!(
        "SELECT {columns} FROM {table} WHERE {pk} > ? AND {pk} <= ? ORDER BY {pk} LIMIT ?",
        table = source.quoted(),
    )
}
