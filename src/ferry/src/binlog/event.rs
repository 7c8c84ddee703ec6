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

use std::collections::{HashMap, HashSet};

use mysql_async::Value;
use mysql_common::binlog::row::BinlogRow;
use mysql_common::binlog::value::BinlogValue;
use regex::Regex;

use crate::binlog::position::BinlogPosition;
use crate::catalog::TableIdentity;
use crate::error::{FerryError, Result};

/// One row mutation decoded from a rows event. Images are full rows in
/// schema column order (`binlog_row_image = FULL` is required).
#[derive(Debug, Clone)]
pub enum RowChange {
    Insert { after: Vec<Value> },
    Update { before: Vec<Value>, after: Vec<Value> },
    Delete { before: Vec<Value> },
}

/// The mutations one binlog event carries for one table, already remapped to
/// its destination identity.
#[derive(Debug, Clone)]
pub struct TableDml {
    pub source: TableIdentity,
    pub target: TableIdentity,
    pub changes: Vec<RowChange>,
}

/// The unit handed from the streamer to the applier. Events for tables
/// outside the replicated set travel as position-only markers (`dml: None`)
/// so the written coordinate keeps advancing through them, strictly in
/// stream order behind any pending writes.
#[derive(Debug, Clone)]
pub struct ReplicatedEvent {
    pub end_position: BinlogPosition,
    pub dml: Option<TableDml>,
}

impl ReplicatedEvent {
    pub fn position_only(end_position: BinlogPosition) -> Self {
        Self {
            end_position,
            dml: None,
        }
    }
}

/// Decides which binlog events are replicated and where they land on the
/// target. Also owns the DDL classifier: a statement is fatal schema drift
/// when it both starts with a DDL verb and names an in-scope table.
#[derive(Debug, Clone)]
pub struct TableFilter {
    included: HashSet<TableIdentity>,
    database_rewrites: HashMap<String, String>,
    table_rewrites: HashMap<String, String>,
    ddl_verb: Regex,
    ddl_matchers: Vec<(TableIdentity, Regex, Regex)>,
}

impl TableFilter {
    pub fn new(
        included: impl IntoIterator<Item = TableIdentity>,
        database_rewrites: HashMap<String, String>,
        table_rewrites: HashMap<String, String>,
    ) -> Self {
        let included: HashSet<_> = included.into_iter().collect();
        let ddl_matchers = included
            .iter()
            .map(|identity| {
                let qualified = Regex::new(&format!(
                    r"(?i)(^|[^0-9a-z_$]){}\s*\.\s*{}($|[^0-9a-z_$])",
                    regex::escape(&identity.schema),
                    regex::escape(&identity.table),
                ))
                .expect("escaped identifier regex");
                let bare = Regex::new(&format!(
                    r"(?i)(^|[^0-9a-z_$.]){}($|[^0-9a-z_$])",
                    regex::escape(&identity.table),
                ))
                .expect("escaped identifier regex");
                (identity.clone(), qualified, bare)
            })
            .collect();
        Self {
            included,
            database_rewrites,
            table_rewrites,
            ddl_verb: Regex::new(r"(?i)^\s*(ALTER|DROP|TRUNCATE|RENAME|CREATE)\b")
                .expect("static regex"),
            ddl_matchers,
        }
    }

    pub fn includes(&self, identity: &TableIdentity) -> bool {
        self.included.contains(identity)
    }

    pub fn included(&self) -> &HashSet<TableIdentity> {
        &self.included
    }

    pub fn rewrite(&self, identity: &TableIdentity) -> TableIdentity {
        identity.rewritten(&self.database_rewrites, &self.table_rewrites)
    }

    /// Returns the in-scope table a DDL statement touches, if any.
    /// `default_schema` qualifies bare table names, mirroring how the
    /// server resolves them for the issuing session.
    pub fn ddl_target(&self, query: &str, default_schema: &str) -> Option<&TableIdentity> {
        if !self.ddl_verb.is_match(query) {
            return None;
        }
        let normalized = query.replace('`', "");
        self.ddl_matchers
            .iter()
            .find(|(identity, qualified, bare)| {
                qualified.is_match(&normalized)
                    || (identity.schema == default_schema && bare.is_match(&normalized))
            })
            .map(|(identity, _, _)| identity)
    }
}

/// Converts a binlog row image into wire values, one per schema column.
/// JSON columns arrive in the binary jsonb encoding and are re-rendered as
/// text; everything else passes through bit-exact.
pub(crate) fn binlog_row_values(row: &BinlogRow) -> Result<Vec<Value>> {
    (0..row.len())
        .map(|index| match row.as_ref(index) {
            Some(BinlogValue::Value(value)) => Ok(value.clone()),
            Some(BinlogValue::Jsonb(jsonb)) => {
                let json: serde_json::Value = jsonb.clone().try_into().map_err(|e| {
                    FerryError::invariant(format!("undecodable JSON column {index}: {e}"))
                })?;
                Ok(Value::Bytes(json.to_string().into_bytes()))
            }
            Some(BinlogValue::JsonDiff(_)) => Err(FerryError::invariant(
                "partial JSON row images are unsupported; \
                 set binlog_row_value_options = '' on the source",
            )),
            None => Err(FerryError::invariant(format!(
                "row image is missing column {index}; \
                 binlog_row_image = FULL is required"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use maplit::hashmap;

    use super::*;

    fn filter() -> TableFilter {
        TableFilter::new(
            [
                TableIdentity::new("shop", "orders"),
                TableIdentity::new("shop", "customers"),
            ],
            hashmap! {"shop".to_owned() => "shop_copy".to_owned()},
            hashmap! {"orders".to_owned() => "orders_v2".to_owned()},
        )
    }

    #[test]
    fn includes_only_configured_tables() {
        let filter = filter();
        assert!(filter.includes(&TableIdentity::new("shop", "orders")));
        assert!(!filter.includes(&TableIdentity::new("shop", "invoices")));
        assert!(!filter.includes(&TableIdentity::new("other", "orders")));
    }

    #[test]
    fn rewrite_remaps_both_halves() {
        let filter = filter();
        assert_eq!(
            filter.rewrite(&TableIdentity::new("shop", "orders")),
            TableIdentity::new("shop_copy", "orders_v2")
        );
        assert_eq!(
            filter.rewrite(&TableIdentity::new("shop", "customers")),
            TableIdentity::new("shop_copy", "customers")
        );
    }

    #[test]
    fn ddl_on_in_scope_table_is_flagged() {
        let filter = filter();

        let hit = filter.ddl_target("ALTER TABLE `shop`.`orders` ADD COLUMN x INT", "");
        assert_eq!(hit, Some(&TableIdentity::new("shop", "orders")));

        // Bare names resolve through the statement's default schema.
        let hit = filter.ddl_target("alter table orders drop column x", "shop");
        assert_eq!(hit, Some(&TableIdentity::new("shop", "orders")));
        assert_eq!(filter.ddl_target("alter table orders drop column x", "other"), None);

        assert_eq!(
            filter.ddl_target("TRUNCATE TABLE shop.invoices", "shop"),
            None
        );
        assert_eq!(
            filter.ddl_target("DROP TABLE reporting.orders_v2", ""),
            None
        );
    }

    #[test]
    fn non_ddl_statements_pass() {
        let filter = filter();
        assert_eq!(filter.ddl_target("BEGIN", "shop"), None);
        assert_eq!(filter.ddl_target("COMMIT", "shop"), None);
        assert_eq!(
            filter.ddl_target("INSERT INTO shop.orders VALUES (1)", "shop"),
            None
        );
    }

    #[test]
    fn similar_names_do_not_match() {
        let filter = filter();
        assert_eq!(
            filter.ddl_target("ALTER TABLE shop.orders_archive ADD COLUMN x INT", ""),
            None
        );
        assert_eq!(
            filter.ddl_target("ALTER TABLE bigshop.orders ADD COLUMN x INT", ""),
            None
        );
    }
}
