//! Scripted binlog sessions.

use std::ops::Range;

use binwatch_binlog::decoder::ColumnType;
use binwatch_binlog::testing::{Cell, EventEncoder, ScriptedConnector};
use binwatch_cdc_pipeline::RuleLoader;
use binwatch_core::rule::AlertRule;
use bytes::Bytes;

pub const FILE: &str = "mysql-bin.000001";
const ORDERS: u64 = 70;

/// Connector whose single session inserts `ids` into `shop.orders` in one
/// transaction, then idles.
pub fn orders_session(ids: Range<i64>) -> ScriptedConnector {
    let mut enc = EventEncoder::new(FILE);
    let rows: Vec<Vec<Cell>> = ids.map(|id| vec![Cell::Int(id), Cell::from("new")]).collect();
    let events: Vec<Bytes> = vec![
        enc.fake_rotate(FILE, 4),
        enc.format_description(),
        enc.begin(),
        enc.table_map(
            ORDERS,
            "shop",
            "orders",
            &[(ColumnType::Long, 0), (ColumnType::Varchar, 255)],
            Some(&["id", "status"]),
        ),
        enc.write_rows(ORDERS, &rows),
        enc.xid(1),
    ];
    ScriptedConnector::new().with_session(events)
}

/// Stateless rule firing on every `shop.orders` change.
pub fn orders_rule() -> AlertRule {
    RuleLoader::parse_yaml(
        r#"
id: orders_touched
title: Change on orders
severity: medium
detection:
  conditions:
    - field: qualified_table
      value: shop.orders
"#,
        "inline",
    )
    .expect("rule parses")
}
