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

use std::collections::HashMap;
use std::fmt;

use mysql_async::prelude::*;
use mysql_async::Conn;
use serde::{Deserialize, Serialize};

use crate::error::{FerryError, Result};

/// Integer families that can back the copy cursor. The column must
/// additionally be `unsigned`.
const INTEGER_DATA_TYPES: &[&str] = &["tinyint", "smallint", "mediumint", "int", "bigint"];

/// A `(schema, table)` pair as received from the source catalog,
/// case-sensitive. This struct, not the dotted string, is the map key
/// everywhere inside the engine; the textual `"schema.table"` form exists
/// only at the JSON boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdentity {
    pub schema: String,
    pub table: String,
}

impl TableIdentity {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parses the `"schema.table"` wire form. MySQL forbids `.` in database
    /// names, so splitting at the first dot is unambiguous.
    pub fn from_dotted(s: &str) -> Result<Self> {
        let (schema, table) = s
            .split_once('.')
            .ok_or_else(|| FerryError::config(format!("not a schema.table pair: {s:?}")))?;
        if schema.is_empty() || table.is_empty() {
            return Err(FerryError::config(format!(
                "not a schema.table pair: {s:?}"
            )));
        }
        Ok(Self::new(schema, table))
    }

    pub fn dotted(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Backtick-quoted `` `schema`.`table` `` for embedding in SQL text.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Applies the configured identity rewrites. Values pass through the
    /// engine untouched; only the addressed table changes.
    pub fn rewritten(
        &self,
        database_rewrites: &HashMap<String, String>,
        table_rewrites: &HashMap<String, String>,
    ) -> TableIdentity {
        TableIdentity {
            schema: database_rewrites
                .get(&self.schema)
                .cloned()
                .unwrap_or_else(|| self.schema.clone()),
            table: table_rewrites
                .get(&self.table)
                .cloned()
                .unwrap_or_else(|| self.table.clone()),
        }
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Full type as reported by the catalog, e.g. `bigint(20) unsigned`.
    pub column_type: String,
    pub nullable: bool,
}

/// Snapshot of one table's metadata. Column order matches the source
/// catalog's ordinal order and is the order rows travel in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    /// Index into `columns` of the single-column unsigned integer PK.
    pub pk_ordinal: usize,
}

impl TableSchema {
    pub fn pk_column(&self) -> &ColumnDef {
        &self.columns[self.pk_ordinal]
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Immutable snapshot of all in-scope table schemas, loaded once at startup
/// (or restored from a resume dump) and shared by reference afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaCache {
    tables: HashMap<TableIdentity, TableSchema>,
}

impl SchemaCache {
    pub fn new(tables: HashMap<TableIdentity, TableSchema>) -> Self {
        Self { tables }
    }

    /// Reads column metadata for every requested table from
    /// `information_schema`. A missing table or an unsupported primary key
    /// is a configuration error, surfaced before any data moves.
    pub async fn load(conn: &mut Conn, tables: &[TableIdentity]) -> Result<Self> {
        let mut out = HashMap::with_capacity(tables.len());
        for identity in tables {
            let rows: Vec<(String, String, String, String)> = conn
                .exec(
                    "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY \
                     FROM information_schema.COLUMNS \
                     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                     ORDER BY ORDINAL_POSITION",
                    (identity.schema.as_str(), identity.table.as_str()),
                )
                .await?;
            if rows.is_empty() {
                return Err(FerryError::config(format!(
                    "table {identity} does not exist on the source"
                )));
            }

            let mut columns = Vec::with_capacity(rows.len());
            let mut pk_ordinals = vec![];
            for (ordinal, (name, column_type, is_nullable, column_key)) in
                rows.into_iter().enumerate()
            {
                if column_key == "PRI" {
                    pk_ordinals.push(ordinal);
                }
                columns.push(ColumnDef {
                    name,
                    column_type,
                    nullable: is_nullable.eq_ignore_ascii_case("YES"),
                });
            }

            let schema = build_table_schema(identity, columns, &pk_ordinals)?;
            out.insert(identity.clone(), schema);
        }
        Ok(Self::new(out))
    }

    pub fn get(&self, identity: &TableIdentity) -> Option<&TableSchema> {
        self.tables.get(identity)
    }

    pub fn contains(&self, identity: &TableIdentity) -> bool {
        self.tables.contains_key(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &TableIdentity> {
        self.tables.keys()
    }

    pub fn tables(&self) -> &HashMap<TableIdentity, TableSchema> {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn build_table_schema(
    identity: &TableIdentity,
    columns: Vec<ColumnDef>,
    pk_ordinals: &[usize],
) -> Result<TableSchema> {
    let pk_ordinal = match pk_ordinals {
        [single] => *single,
        [] => {
            return Err(FerryError::config(format!(
                "table {identity} has no primary key"
            )))
        }
        _ => {
            return Err(FerryError::config(format!(
                "table {identity} has a compound primary key; only single-column \
                 unsigned integer keys are supported"
            )))
        }
    };

    let pk = &columns[pk_ordinal];
    if !is_unsigned_integer(&pk.column_type) {
        return Err(FerryError::config(format!(
            "table {identity} primary key {} has type {:?}; only single-column \
             unsigned integer keys are supported",
            pk.name, pk.column_type
        )));
    }

    Ok(TableSchema {
        columns,
        pk_ordinal,
    })
}

fn is_unsigned_integer(column_type: &str) -> bool {
    let lowered = column_type.to_ascii_lowercase();
    let base = lowered
        .split(|c: char| c == '(' || c.is_ascii_whitespace())
        .next()
        .unwrap_or("");
    INTEGER_DATA_TYPES.contains(&base) && lowered.contains("unsigned")
}
