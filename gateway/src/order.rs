//! Order and order-book tracking.
//!
//! `ORIGINAL_ORDER_ID` is the permanent key for an order's whole life; a
//! freshly submitted order is tracked under its temporary `CLIENT_ORDER_ID`
//! until the upstream assigns one. Status text handed to downstream clients
//! is derived from `CURRENT_STATUS` crossed with `TYPE`, mirroring
//! `API_Order.render()`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::FieldMap;

/// Requested order type, as distinguished by `submit_order`'s `order_type`
/// argument. Spelled out as an enum so the stoplimit branch can't repeat the
/// original's `type`-vs-`order_type` mixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub sub_order_id: String,
    pub kind: String,
    pub fields: FieldMap,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Order {
    pub oid: String,
    pub fields: FieldMap,
    suborders: HashMap<String, FieldMap>,
    pub updates: Vec<OrderUpdate>,
    /// Registered by the caller that submitted this order; fired once, on
    /// the update that first promotes it out of `OrderBook::pending`.
    callback_id: Option<u64>,
}

/// The result of applying one inbound order row: the fully rendered field
/// map, plus the submitting caller's callback id if this row is what
/// promoted the order out of `pending` (`None` on every later update).
pub struct AppliedOrder {
    pub fields: FieldMap,
    pub fired_callback: Option<u64>,
}

fn field_str<'a>(fields: &'a FieldMap, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

impl Order {
    pub fn new(oid: impl Into<String>) -> Self { Self { oid: oid.into(), ..Default::default() } }

    /// Applies one inbound order row. Returns `true` if the order's
    /// rendered status should be re-broadcast to downstream clients.
    pub fn update(&mut self, data: FieldMap) -> bool {
        let before = self.fields.clone();

        let Some(order_id) = field_str(&data, "ORDER_ID").map(str::to_string) else {
            warn!(oid = %self.oid, "order update without ORDER_ID");
            return false;
        };

        let is_new_or_changed = match self.suborders.get(&order_id) {
            Some(existing) if *existing == data => false,
            _ => true,
        };
        self.suborders.insert(order_id.clone(), data.clone());

        if is_new_or_changed {
            let mut changes = BTreeMap::new();
            for (k, v) in data.iter() {
                let prior = self.fields.get(k);
                if prior != Some(v) {
                    changes.insert(k.clone(), v.clone());
                }
                self.fields.insert(k.clone(), v.clone());
            }
            if !changes.is_empty() && order_id != self.oid {
                let kind = changes
                    .get("TYPE")
                    .and_then(Value::as_str)
                    .unwrap_or("Undefined")
                    .to_string();
                self.updates.push(OrderUpdate { sub_order_id: order_id, kind, fields: changes, time: Utc::now() });
            }
        }

        self.fields != before
    }

    fn update_fill_fields(&mut self) {
        let matches_fill_type = matches!(
            field_str(&self.fields, "TYPE"),
            Some("UserSubmitOrder") | Some("ExchangeTradeOrder")
        );
        if !matches_fill_type {
            return;
        }
        if let Some(v) = self.fields.get("VOLUME_TRADED").cloned() {
            self.fields.insert("filled".into(), v);
        }
        if let Some(v) = self.fields.get("ORDER_RESIDUAL").cloned() {
            self.fields.insert("remaining".into(), v);
        }
        if let Some(v) = self.fields.get("AVG_PRICE").cloned() {
            self.fields.insert("avgfillprice".into(), v);
        }
    }

    fn has_fill_type(&self) -> bool {
        if field_str(&self.fields, "TYPE") == Some("ExchangeTradeOrder") {
            return true;
        }
        self.updates.iter().any(|u| u.kind == "ExchangeTradeOrder")
    }

    fn is_filled(&self) -> bool {
        field_str(&self.fields, "CURRENT_STATUS") == Some("COMPLETED")
            && self.has_fill_type()
            && self.fields.get("ORIGINAL_VOLUME").is_some()
            && self.fields.get("ORIGINAL_VOLUME") == self.fields.get("VOLUME_TRADED")
    }

    /// Renders the downstream-facing status string plus the fully merged
    /// field map, per the `CURRENT_STATUS`/`TYPE` status table.
    pub fn render(&mut self) -> FieldMap {
        self.fields.insert("permid".into(), Value::String(self.oid.clone()));
        if let Some(symbol) = field_str(&self.fields, "DISP_NAME").map(str::to_string) {
            self.fields.insert("symbol".into(), Value::String(symbol));
        }
        let account = make_account(&self.fields);
        self.fields.insert("account".into(), Value::String(account));

        let status = field_str(&self.fields, "CURRENT_STATUS").unwrap_or("UNDEFINED").to_string();
        let otype = field_str(&self.fields, "TYPE").unwrap_or("Undefined").to_string();

        let rendered = match status.as_str() {
            "PENDING" => "Submitted".to_string(),
            "LIVE" => {
                self.update_fill_fields();
                "Pending".to_string()
            }
            "COMPLETED" => {
                if self.is_filled() {
                    if otype == "ExchangeTradeOrder" {
                        self.update_fill_fields();
                    }
                    "Filled".to_string()
                } else {
                    match otype.as_str() {
                        "UserSubmitOrder" | "UserSubmitStagedOrder" | "UserSubmitStatus" | "ExchangeReportStatus" => {
                            self.update_fill_fields();
                            "Submitted".to_string()
                        }
                        "UserSubmitCancel" => "Cancelled".to_string(),
                        "UserSubmitChange" => "Changed".to_string(),
                        "ExchangeAcceptOrder" => "Accepted".to_string(),
                        "ExchangeTradeOrder" => {
                            self.update_fill_fields();
                            "Filled".to_string()
                        }
                        "ClerkReject" | "ExchangeKillOrder" => "Error".to_string(),
                        other => {
                            warn!(oid = %self.oid, r#type = other, "unknown order type for COMPLETED status");
                            "Error".to_string()
                        }
                    }
                }
            }
            "CANCELLED" => "Cancelled".to_string(),
            "DELETED" => "Error".to_string(),
            other => {
                warn!(oid = %self.oid, status = other, "unknown CURRENT_STATUS");
                "Error".to_string()
            }
        };

        self.fields.insert("status".into(), Value::String(rendered));
        self.fields.insert(
            "updates".into(),
            Value::Array(
                self.updates
                    .iter()
                    .map(|u| {
                        serde_json::json!({
                            "id": u.sub_order_id,
                            "type": u.kind,
                            "fields": u.fields,
                            "time": u.time.to_rfc3339(),
                        })
                    })
                    .collect(),
            ),
        );
        self.fields.clone()
    }
}

fn make_account(fields: &FieldMap) -> String {
    let part = |key: &str| field_str(fields, key).unwrap_or_default();
    format!("{}.{}.{}.{}", part("BANK"), part("BRANCH"), part("CUSTOMER"), part("DEPOSIT"))
}

/// Tracks every order known to the gateway, keyed by `ORIGINAL_ORDER_ID`
/// once assigned and by the submitting client's temporary id before then.
#[derive(Debug, Default)]
pub struct OrderBook {
    orders: HashMap<String, Order>,
    pending: HashMap<String, Order>,
}

impl OrderBook {
    pub fn new() -> Self { Self::default() }

    /// Registers a freshly submitted order under its client-assigned id,
    /// to be promoted once the upstream reports `ORIGINAL_ORDER_ID`.
    /// `callback_id`, if given, is the submitting caller's registered
    /// callback, fired by `Self::apply` on the promotion that follows.
    pub fn track_pending(&mut self, client_order_id: impl Into<String>, callback_id: Option<u64>) {
        let key = client_order_id.into();
        self.pending.entry(key.clone()).or_insert_with(|| {
            let mut order = Order::new(key);
            order.callback_id = callback_id;
            order
        });
    }

    /// Applies one inbound order row, promoting a pending order or updating
    /// an existing one. Returns the rendered fields plus the submitting
    /// caller's callback id if this row is what promoted the order.
    pub fn apply(&mut self, mut data: FieldMap) -> Option<AppliedOrder> {
        let oid = field_str(&data, "ORIGINAL_ORDER_ID")?.to_string();
        let client_order_id = field_str(&data, "CLIENT_ORDER_ID").map(str::to_string);

        if let Some(coid) = client_order_id.filter(|c| self.pending.contains_key(c)) {
            let mut order = self.pending.remove(&coid).unwrap();
            let fired_callback = order.callback_id.take();
            order.oid = oid.clone();
            order.update(std::mem::take(&mut data));
            let fields = order.render();
            self.orders.insert(oid, order);
            return Some(AppliedOrder { fields, fired_callback });
        }
        if self.pending.contains_key(&oid) {
            let mut order = self.pending.remove(&oid).unwrap();
            let fired_callback = order.callback_id.take();
            order.update(std::mem::take(&mut data));
            let fields = order.render();
            self.orders.insert(oid, order);
            return Some(AppliedOrder { fields, fired_callback });
        }
        let order = self.orders.entry(oid.clone()).or_insert_with(|| Order::new(oid));
        if order.update(data) {
            return Some(AppliedOrder { fields: order.render(), fired_callback: None });
        }
        None
    }

    pub fn get(&self, oid: &str) -> Option<&Order> { self.orders.get(oid) }

    pub fn len(&self) -> usize { self.orders.len() }

    pub fn is_empty(&self) -> bool { self.orders.is_empty() }

    /// Live/pending orders eligible for a global cancel sweep.
    pub fn cancellable(&self) -> Vec<String> {
        self.orders
            .iter()
            .filter(|(_, o)| matches!(field_str(&o.fields, "CURRENT_STATUS"), Some("LIVE") | Some("PENDING")))
            .map(|(oid, _)| oid.clone())
            .collect()
    }

    /// Executions: orders that have fully filled.
    pub fn executions(&self) -> Vec<&Order> {
        self.orders
            .values()
            .filter(|o| field_str(&o.fields, "status") == Some("Filled"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> FieldMap {
        pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
    }

    #[test]
    fn promotes_pending_order_on_first_update() {
        let mut book = OrderBook::new();
        book.track_pending("CLIENT1", Some(7));
        let applied = book
            .apply(row(&[
                ("ORDER_ID", "S1"),
                ("ORIGINAL_ORDER_ID", "O1"),
                ("CLIENT_ORDER_ID", "CLIENT1"),
                ("CURRENT_STATUS", "PENDING"),
                ("TYPE", "UserSubmitOrder"),
                ("BANK", "b"),
                ("BRANCH", "br"),
                ("CUSTOMER", "c"),
                ("DEPOSIT", "d"),
            ]))
            .unwrap();
        assert_eq!(applied.fields.get("status").unwrap(), "Submitted");
        assert_eq!(applied.fields.get("permid").unwrap(), "O1");
        assert_eq!(applied.fields.get("account").unwrap(), "b.br.c.d");
        assert_eq!(applied.fired_callback, Some(7));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn later_updates_do_not_refire_the_creation_callback() {
        let mut book = OrderBook::new();
        book.track_pending("CLIENT1", Some(7));
        book.apply(row(&[
            ("ORDER_ID", "S1"),
            ("ORIGINAL_ORDER_ID", "O1"),
            ("CLIENT_ORDER_ID", "CLIENT1"),
            ("CURRENT_STATUS", "PENDING"),
            ("TYPE", "UserSubmitOrder"),
            ("BANK", "b"),
            ("BRANCH", "br"),
            ("CUSTOMER", "c"),
            ("DEPOSIT", "d"),
        ]));
        let applied = book
            .apply(row(&[
                ("ORDER_ID", "S2"),
                ("ORIGINAL_ORDER_ID", "O1"),
                ("CURRENT_STATUS", "LIVE"),
                ("TYPE", "ExchangeAcceptOrder"),
                ("BANK", "b"),
                ("BRANCH", "br"),
                ("CUSTOMER", "c"),
                ("DEPOSIT", "d"),
            ]))
            .unwrap();
        assert_eq!(applied.fired_callback, None);
    }

    #[test]
    fn filled_status_requires_matching_volumes() {
        let mut book = OrderBook::new();
        book.apply(row(&[
            ("ORDER_ID", "S1"),
            ("ORIGINAL_ORDER_ID", "O1"),
            ("CURRENT_STATUS", "COMPLETED"),
            ("TYPE", "ExchangeTradeOrder"),
            ("ORIGINAL_VOLUME", "100"),
            ("VOLUME_TRADED", "100"),
            ("BANK", "b"),
            ("BRANCH", "br"),
            ("CUSTOMER", "c"),
            ("DEPOSIT", "d"),
        ]));
        let fields = book.get("O1").unwrap().fields.clone();
        assert_eq!(fields.get("status").unwrap(), "Filled");
    }

    #[test]
    fn duplicate_suborder_does_not_rebroadcast() {
        let mut book = OrderBook::new();
        let data = row(&[
            ("ORDER_ID", "S1"),
            ("ORIGINAL_ORDER_ID", "O1"),
            ("CURRENT_STATUS", "LIVE"),
            ("TYPE", "UserSubmitOrder"),
            ("BANK", "b"),
            ("BRANCH", "br"),
            ("CUSTOMER", "c"),
            ("DEPOSIT", "d"),
        ]);
        assert!(book.apply(data.clone()).is_some());
        assert!(book.apply(data).is_none());
    }
}
