//! Position tracking.
//!
//! One upstream `POSITION` row per account/symbol carries four size fields;
//! together they make up the net position: `LONGPOS`/`LONGPOS0` (settled and
//! today's long quantity) add, `SHORTPOS`/`SHORTPOS0` subtract.

use std::collections::BTreeMap;

use crate::field::parse_float;
use crate::FieldMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub account: String,
    pub symbol: String,
    pub quantity: f64,
}

#[derive(Debug, Default)]
pub struct PositionBook {
    positions: BTreeMap<(String, String), Position>,
}

impl PositionBook {
    pub fn new() -> Self { Self::default() }

    /// Folds one `POSITION` row into the book, returning the updated entry.
    /// `None` if the row is missing the account or symbol key.
    pub fn apply(&mut self, row: &FieldMap) -> Option<&Position> {
        let account = row.get("ACCOUNT").and_then(|v| v.as_str()).map(str::to_string)?;
        let symbol = row
            .get("DISP_NAME")
            .or_else(|| row.get("SYMBOL"))
            .and_then(|v| v.as_str())
            .map(str::to_string)?;

        let long = row.get("LONGPOS").map(parse_float).unwrap_or(0.0) + row.get("LONGPOS0").map(parse_float).unwrap_or(0.0);
        let short = row.get("SHORTPOS").map(parse_float).unwrap_or(0.0) + row.get("SHORTPOS0").map(parse_float).unwrap_or(0.0);
        let quantity = ((long - short) * 100.0).round() / 100.0;

        let key = (account.clone(), symbol.clone());
        self.positions.insert(key.clone(), Position { account, symbol, quantity });
        self.positions.get(&key)
    }

    pub fn get(&self, account: &str, symbol: &str) -> Option<&Position> {
        self.positions.get(&(account.to_string(), symbol.to_string()))
    }

    pub fn for_account(&self, account: &str) -> Vec<&Position> {
        self.positions.values().filter(|p| p.account == account).collect()
    }

    pub fn len(&self) -> usize { self.positions.len() }

    pub fn is_empty(&self) -> bool { self.positions.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn long_and_short_legs_net_out() {
        let mut book = PositionBook::new();
        let row = FieldMap::from([
            ("ACCOUNT".to_string(), json!("B.BR.C.D1")),
            ("DISP_NAME".to_string(), json!("AAPL")),
            ("LONGPOS".to_string(), json!("150")),
            ("LONGPOS0".to_string(), json!("50")),
            ("SHORTPOS".to_string(), json!("25")),
            ("SHORTPOS0".to_string(), json!("0")),
        ]);
        let pos = book.apply(&row).unwrap();
        assert_eq!(pos.quantity, 175.0);
    }

    #[test]
    fn missing_account_is_ignored() {
        let mut book = PositionBook::new();
        let row = FieldMap::from([("DISP_NAME".to_string(), json!("AAPL"))]);
        assert!(book.apply(&row).is_none());
        assert!(book.is_empty());
    }

    #[test]
    fn for_account_filters_other_accounts() {
        let mut book = PositionBook::new();
        book.apply(&FieldMap::from([
            ("ACCOUNT".to_string(), json!("B.BR.C.D1")),
            ("DISP_NAME".to_string(), json!("AAPL")),
            ("LONGPOS".to_string(), json!("10")),
        ]));
        book.apply(&FieldMap::from([
            ("ACCOUNT".to_string(), json!("B.BR.C.D2")),
            ("DISP_NAME".to_string(), json!("MSFT")),
            ("LONGPOS".to_string(), json!("5")),
        ]));
        assert_eq!(book.for_account("B.BR.C.D1").len(), 1);
        assert_eq!(book.len(), 2);
    }
}
