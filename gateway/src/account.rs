//! Account list and current-account selection.
//!
//! Accounts only become known once the upstream answers the startup
//! `ACCOUNT` request; until then `set_account` has to queue rather than
//! reject the caller, since the request is often still in flight. Mirrors
//! `RTX.accounts`/`current_account`/`account_request_pending`.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::GatewayError;
use crate::{FieldMap, Result};

#[derive(Debug, Default)]
pub struct AccountModel {
    accounts: Vec<String>,
    current: Option<String>,
    request_pending: bool,
    data_cache: BTreeMap<String, Value>,
}

pub fn make_account_code(row: &FieldMap) -> String {
    let field = |key: &str| row.get(key).and_then(Value::as_str).unwrap_or_default();
    format!("{}.{}.{}.{}", field("BANK"), field("BRANCH"), field("CUSTOMER"), field("DEPOSIT"))
}

impl AccountModel {
    pub fn new() -> Self { Self { request_pending: true, ..Default::default() } }

    /// Applies the sorted, deduplicated set of accounts reported at startup.
    pub fn set_accounts(&mut self, rows: &[FieldMap]) {
        let mut accounts: Vec<String> = rows.iter().map(make_account_code).collect();
        accounts.sort();
        accounts.dedup();
        self.accounts = accounts;
        self.request_pending = false;
    }

    pub fn accounts(&self) -> &[String] { &self.accounts }

    pub fn request_pending(&self) -> bool { self.request_pending }

    pub fn current(&self) -> Option<&str> { self.current.as_deref() }

    /// Matches `verify_account`: true only once the account list is known
    /// and contains this name.
    pub fn contains(&self, account: &str) -> bool { self.accounts.iter().any(|a| a == account) }

    /// Selects the current account. `Ok(false)` means the caller should
    /// queue this for when the account list arrives; `Err` means the
    /// account list is in and the name just isn't in it.
    pub fn set_account(&mut self, account: &str) -> Result<bool> {
        if !self.accounts.is_empty() {
            if self.accounts.iter().any(|a| a == account) {
                self.current = Some(account.to_string());
                Ok(true)
            } else {
                Err(GatewayError::Validation(format!("account {account} not found")))
            }
        } else if self.request_pending {
            Ok(false)
        } else {
            Err(GatewayError::Validation("no accounts and no request pending".into()))
        }
    }

    /// Caches the latest account-data snapshot for `account`, adding the
    /// derived `_cash` field from `EXCESS_EQ` the way `format_account_data`
    /// does.
    pub fn cache_account_data(&mut self, account: &str, mut row: Value) {
        if let Some(excess_eq) = row.get("EXCESS_EQ").and_then(Value::as_str) {
            if let Ok(parsed) = excess_eq.parse::<f64>() {
                row["_cash"] = Value::from((parsed * 100.0).round() / 100.0);
            }
        }
        self.data_cache.insert(account.to_string(), row);
    }

    pub fn account_data(&self, account: &str) -> Option<&Value> { self.data_cache.get(account) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account_row(bank: &str) -> FieldMap {
        FieldMap::from([
            ("BANK".into(), json!(bank)),
            ("BRANCH".into(), json!("B1")),
            ("CUSTOMER".into(), json!("C1")),
            ("DEPOSIT".into(), json!("D1")),
        ])
    }

    #[test]
    fn accounts_are_sorted_and_deduped() {
        let mut model = AccountModel::new();
        model.set_accounts(&[account_row("Z"), account_row("A"), account_row("A")]);
        assert_eq!(model.accounts(), &["A.B1.C1.D1".to_string(), "Z.B1.C1.D1".to_string()]);
        assert!(!model.request_pending());
    }

    #[test]
    fn set_account_before_accounts_known_queues() {
        let mut model = AccountModel::new();
        assert_eq!(model.set_account("A.B1.C1.D1").unwrap(), false);
    }

    #[test]
    fn set_account_rejects_unknown_name() {
        let mut model = AccountModel::new();
        model.set_accounts(&[account_row("A")]);
        assert!(model.set_account("nope").is_err());
    }

    #[test]
    fn account_data_gets_derived_cash_field() {
        let mut model = AccountModel::new();
        model.cache_account_data("A.B1.C1.D1", json!({"EXCESS_EQ": "1234.567"}));
        let cached = model.account_data("A.B1.C1.D1").unwrap();
        assert_eq!(cached["_cash"], json!(1234.57));
    }
}
