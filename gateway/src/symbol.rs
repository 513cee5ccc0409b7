//! Symbol subscriptions and market data state.
//!
//! A [`Symbol`] is shared by every downstream client watching it; the table
//! ref-counts subscribers so the upstream `LIVEQUOTE` advise is only dropped
//! once the last client loses interest. Quote lines are only re-broadcast
//! when they actually change; trade lines go out unconditionally, mirroring
//! `API_Symbol.update_quote`/`update_trade`.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::field::{parse_float, parse_int, parse_string};
use crate::FieldMap;

#[derive(Debug, Clone, Default)]
pub struct Symbol {
    pub name: String,
    pub clients: HashSet<u64>,
    pub fullname: String,
    pub bid: f64,
    pub bid_size: i64,
    pub ask: f64,
    pub ask_size: i64,
    pub last: f64,
    pub size: i64,
    pub volume: i64,
    pub close: f64,
    pub vwap: f64,
    pub high: f64,
    pub low: f64,
    last_quote_line: String,
    pub initialized: bool,
}

pub struct QuoteUpdate {
    pub quote_line: Option<String>,
    pub trade_line: Option<String>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, client: u64) -> Self {
        Self { name: name.into(), clients: HashSet::from([client]), ..Default::default() }
    }

    pub fn add_client(&mut self, client: u64) { self.clients.insert(client); }

    pub fn del_client(&mut self, client: u64) { self.clients.remove(&client); }

    pub fn has_clients(&self) -> bool { !self.clients.is_empty() }

    /// Applies one LIVEQUOTE advise row, producing the quote/trade lines to
    /// broadcast if anything observable changed. Honors `enable_ticker` and
    /// `enable_high_low` the way `API_Symbol.export` gates those fields.
    pub fn apply_update(&mut self, data: &FieldMap, enable_ticker: bool, enable_high_low: bool) -> QuoteUpdate {
        let mut trade_flag = false;
        let mut quote_flag = false;

        if let Some(v) = data.get("TRDPRC_1") {
            self.last = parse_float(v);
            trade_flag = true;
        }
        if enable_high_low {
            if let Some(v) = data.get("HIGH_1") {
                self.high = parse_float(v);
                trade_flag = true;
            }
            if let Some(v) = data.get("LOW_1") {
                self.low = parse_float(v);
                trade_flag = true;
            }
        }
        if let Some(v) = data.get("TRDVOL_1") {
            self.size = parse_int(v);
            trade_flag = true;
        }
        if let Some(v) = data.get("ACVOL_1") {
            self.volume = parse_int(v);
            trade_flag = true;
        }
        if let Some(v) = data.get("BID") {
            self.bid = parse_float(v);
            self.bid_size = if self.bid != 0.0 { data.get("BIDSIZE").map(parse_int).unwrap_or(0) } else { 0 };
            quote_flag = true;
        }
        if let Some(v) = data.get("ASK") {
            self.ask = parse_float(v);
            self.ask_size = if self.ask != 0.0 { data.get("ASKSIZE").map(parse_int).unwrap_or(0) } else { 0 };
            quote_flag = true;
        }
        if let Some(v) = data.get("COMPANY_NAME") {
            self.fullname = parse_string(v);
        }
        if let Some(v) = data.get("HST_CLOSE") {
            self.close = parse_float(v);
        }
        if let Some(v) = data.get("VWAP") {
            self.vwap = parse_float(v);
        }

        let mut quote_line = None;
        let mut trade_line = None;
        if enable_ticker {
            if quote_flag {
                let line = format!("quote.{}:{} {} {} {}", self.name, self.bid, self.bid_size, self.ask, self.ask_size);
                if line != self.last_quote_line {
                    self.last_quote_line = line.clone();
                    quote_line = Some(line);
                }
            }
            if trade_flag {
                trade_line = Some(format!("trade.{}:{} {} {}", self.name, self.last, self.size, self.volume));
            }
        }
        QuoteUpdate { quote_line, trade_line }
    }

    /// The JSON projection returned by symbol queries, gated the same way
    /// as `API_Symbol.export`.
    pub fn export(&self, enable_ticker: bool, enable_high_low: bool) -> Value {
        let mut out = serde_json::json!({
            "symbol": self.name,
            "last": self.last,
            "size": self.size,
            "volume": self.volume,
            "close": self.close,
            "vwap": self.vwap,
            "fullname": self.fullname,
        });
        if enable_high_low {
            out["high"] = serde_json::json!(self.high);
            out["low"] = serde_json::json!(self.low);
        }
        if enable_ticker {
            out["bid"] = serde_json::json!(self.bid);
            out["bid_size"] = serde_json::json!(self.bid_size);
            out["ask"] = serde_json::json!(self.ask);
            out["ask_size"] = serde_json::json!(self.ask_size);
        }
        out
    }
}

/// Whether disabling a symbol should unadvise the upstream feed immediately
/// or just stop forwarding to clients. The original leaves this a TODO; we
/// unadvise outright since nothing else holds the subscription open once the
/// client set is empty.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

pub enum Subscribe {
    /// Symbol already existed; no upstream request needed.
    AlreadyWatched,
    /// Symbol is new; caller should send the LIVEQUOTE init request.
    NeedsInit,
}

pub enum Unsubscribe {
    /// Other clients still watch it.
    StillWatched,
    /// Last client left; caller should unadvise upstream and drop it.
    ShouldRemove,
}

impl SymbolTable {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe(&mut self, symbol: &str, client: u64) -> Subscribe {
        if let Some(existing) = self.symbols.get_mut(symbol) {
            existing.add_client(client);
            Subscribe::AlreadyWatched
        } else {
            self.symbols.insert(symbol.to_string(), Symbol::new(symbol, client));
            Subscribe::NeedsInit
        }
    }

    pub fn unsubscribe(&mut self, symbol: &str, client: u64) -> Unsubscribe {
        let Some(existing) = self.symbols.get_mut(symbol) else { return Unsubscribe::ShouldRemove };
        existing.del_client(client);
        if existing.has_clients() {
            Unsubscribe::StillWatched
        } else {
            self.symbols.remove(symbol);
            Unsubscribe::ShouldRemove
        }
    }

    /// Drops a client from every symbol it watches, for client-close cleanup.
    pub fn drop_client(&mut self, client: u64) -> Vec<String> {
        let mut removed = Vec::new();
        self.symbols.retain(|name, symbol| {
            symbol.del_client(client);
            if symbol.has_clients() {
                true
            } else {
                removed.push(name.clone());
                false
            }
        });
        removed
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Symbol> { self.symbols.get_mut(symbol) }

    pub fn get(&self, symbol: &str) -> Option<&Symbol> { self.symbols.get(symbol) }

    pub fn len(&self) -> usize { self.symbols.len() }

    pub fn is_empty(&self) -> bool { self.symbols.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> FieldMap {
        pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
    }

    #[test]
    fn quote_only_rebroadcasts_on_change() {
        let mut symbol = Symbol::new("AAPL", 1);
        let update = symbol.apply_update(&row(&[("BID", "10.0"), ("BIDSIZE", "5"), ("ASK", "10.1"), ("ASKSIZE", "3")]), true, true);
        assert!(update.quote_line.is_some());
        let repeat = symbol.apply_update(&row(&[("BID", "10.0"), ("BIDSIZE", "5"), ("ASK", "10.1"), ("ASKSIZE", "3")]), true, true);
        assert!(repeat.quote_line.is_none());
    }

    #[test]
    fn trade_always_rebroadcasts() {
        let mut symbol = Symbol::new("AAPL", 1);
        let first = symbol.apply_update(&row(&[("TRDPRC_1", "100.0"), ("TRDVOL_1", "10"), ("ACVOL_1", "1000")]), true, true);
        assert!(first.trade_line.is_some());
        let second = symbol.apply_update(&row(&[("TRDPRC_1", "100.0"), ("TRDVOL_1", "10"), ("ACVOL_1", "1000")]), true, true);
        assert!(second.trade_line.is_some());
    }

    #[test]
    fn subscription_ref_counts_clients() {
        let mut table = SymbolTable::new();
        assert!(matches!(table.subscribe("AAPL", 1), Subscribe::NeedsInit));
        assert!(matches!(table.subscribe("AAPL", 2), Subscribe::AlreadyWatched));
        assert!(matches!(table.unsubscribe("AAPL", 1), Unsubscribe::StillWatched));
        assert!(matches!(table.unsubscribe("AAPL", 2), Unsubscribe::ShouldRemove));
        assert!(table.is_empty());
    }
}
