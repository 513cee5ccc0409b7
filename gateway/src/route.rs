//! Order route configuration and order field-map construction.
//!
//! The route is a single named exit vehicle plus an optional bag of
//! strategy parameters; `STRAT_PARAMETERS`/`STRAT_REDUNDANT_DATA` get
//! encoded into the upstream's `\x1F`/`\x01`-delimited key-value format
//! before being attached to the order.

use std::collections::BTreeMap;

use crate::error::GatewayError;
use crate::order::OrderType;
use crate::Result;

const STYPE: &str = "1";
const DEFAULT_EXCHANGE: &str = "NYS";

/// A route parameter value: a plain scalar, or (for `STRAT_PARAMETERS` and
/// `STRAT_REDUNDANT_DATA`) a nested key-value bag that gets delimiter-encoded
/// when attached to an order.
#[derive(Debug, Clone)]
pub enum RouteParam {
    Scalar(String),
    Bag(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default)]
pub struct OrderRoute {
    pub name: String,
    pub parameters: BTreeMap<String, RouteParam>,
}

impl OrderRoute {
    /// Parses the `name` or `name:KEY1=V1,KEY2=V2;STRAT_PARAMETERS=a:1,b:2;...`
    /// shape accepted by `set_order_route`, matching the original's loose
    /// string format. A group with `k:v` pairs becomes a `Bag`; a bare
    /// `KEY=VALUE` group becomes a `Scalar`.
    pub fn parse(spec: &str) -> Self {
        let Some((name, rest)) = spec.split_once(':') else {
            return Self { name: spec.to_string(), parameters: BTreeMap::new() };
        };
        let mut parameters = BTreeMap::new();
        for group in rest.split(';').filter(|g| !g.is_empty()) {
            let Some((param_name, kvs)) = group.split_once('=') else { continue };
            if kvs.contains(':') {
                let mut inner = BTreeMap::new();
                for pair in kvs.split(',').filter(|p| !p.is_empty()) {
                    if let Some((k, v)) = pair.split_once(':') {
                        inner.insert(k.to_string(), v.to_string());
                    }
                }
                parameters.insert(param_name.to_string(), RouteParam::Bag(inner));
            } else {
                parameters.insert(param_name.to_string(), RouteParam::Scalar(kvs.to_string()));
            }
        }
        Self { name: name.to_string(), parameters }
    }

    fn encode_strat(map: &BTreeMap<String, String>) -> String {
        map.iter().map(|(k, v)| format!("{k}\u{1F}{v}\u{1}")).collect()
    }

    /// Fields contributed by the route to every order built against it, in
    /// insertion order: `EXIT_VEHICLE` first, then any route parameters with
    /// `STRAT_PARAMETERS`/`STRAT_REDUNDANT_DATA` delimiter-encoded.
    pub fn order_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![("EXIT_VEHICLE".to_string(), self.name.clone())];
        for (key, value) in &self.parameters {
            let encoded = match value {
                RouteParam::Bag(map) if key == "STRAT_PARAMETERS" || key == "STRAT_REDUNDANT_DATA" => {
                    Self::encode_strat(map)
                }
                RouteParam::Bag(map) => Self::encode_strat(map),
                RouteParam::Scalar(v) => v.clone(),
            };
            fields.push((key.clone(), encoded));
        }
        fields
    }
}

pub struct OrderTicketRequest<'a> {
    pub account: &'a str,
    pub route: &'a OrderRoute,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub symbol: &'a str,
    pub quantity: i64,
    pub client_order_id: &'a str,
    pub staged_tag: Option<&'a str>,
    pub refers_to_id: Option<&'a str>,
    pub primary_exchange: Option<&'a str>,
}

/// Builds the ordered field list for a `poke` to `ORDERS`, matching
/// `submit_order`'s field order exactly so wire captures stay comparable.
pub fn build_order_fields(account: &str, req: &OrderTicketRequest<'_>) -> Result<Vec<(String, String)>> {
    let mut parts = account.splitn(4, '.');
    let (Some(bank), Some(branch), Some(customer), Some(deposit)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(GatewayError::Validation(format!("malformed account code: {account}")));
    };

    let mut fields = vec![
        ("BANK".to_string(), bank.to_string()),
        ("BRANCH".to_string(), branch.to_string()),
        ("CUSTOMER".to_string(), customer.to_string()),
        ("DEPOSIT".to_string(), deposit.to_string()),
        ("BUYORSELL".to_string(), if req.quantity > 0 { "Buy".to_string() } else { "Sell".to_string() }),
        ("GOOD_UNTIL".to_string(), "DAY".to_string()),
    ];
    fields.extend(req.route.order_fields());
    fields.push(("DISP_NAME".to_string(), req.symbol.to_string()));
    fields.push(("STYP".to_string(), STYPE.to_string()));
    fields.push(("EXCHANGE".to_string(), req.primary_exchange.unwrap_or(DEFAULT_EXCHANGE).to_string()));

    match req.order_type {
        OrderType::Market => fields.push(("PRICE_TYPE".to_string(), "Market".to_string())),
        OrderType::Limit => {
            fields.push(("PRICE_TYPE".to_string(), "AsEntered".to_string()));
            fields.push(("PRICE".to_string(), price_str(req.price, "limit")?));
        }
        OrderType::Stop => {
            fields.push(("PRICE_TYPE".to_string(), "Stop".to_string()));
            fields.push(("STOP_PRICE".to_string(), price_str(req.stop_price, "stop")?));
        }
        OrderType::StopLimit => {
            fields.push(("PRICE_TYPE".to_string(), "StopLimit".to_string()));
            fields.push(("STOP_PRICE".to_string(), price_str(req.stop_price, "stoplimit")?));
            fields.push(("PRICE".to_string(), price_str(req.price, "stoplimit")?));
        }
    }

    fields.push(("VOLUME_TYPE".to_string(), "AsEntered".to_string()));
    fields.push(("VOLUME".to_string(), req.quantity.unsigned_abs().to_string()));

    let staging = if req.staged_tag.is_some() { "Staged" } else { "" };
    if let Some(tag) = req.staged_tag {
        fields.push(("ORDER_TAG".to_string(), tag.to_string()));
    }
    let submission = if let Some(refers_to) = req.refers_to_id {
        fields.push(("REFERS_TO_ID".to_string(), refers_to.to_string()));
        "Change"
    } else {
        fields.push(("CLIENT_ORDER_ID".to_string(), req.client_order_id.to_string()));
        "Order"
    };
    fields.push(("TYPE".to_string(), format!("UserSubmit{staging}{submission}")));

    Ok(fields)
}

fn price_str(price: Option<f64>, order_type: &str) -> Result<String> {
    price
        .map(|p| p.to_string())
        .ok_or_else(|| GatewayError::Validation(format!("{order_type} order requires a price")))
}

/// Encodes an ordered field list into the `poke` payload grammar:
/// `KEY1=VAL1,KEY2=VAL2`.
pub fn encode_poke_data(fields: &[(String, String)]) -> String {
    fields.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stoplimit_checks_order_type_not_builtin_type() {
        let route = OrderRoute { name: "DEMO".into(), parameters: BTreeMap::new() };
        let req = OrderTicketRequest {
            account: "b.br.c.d",
            route: &route,
            order_type: OrderType::StopLimit,
            price: Some(10.5),
            stop_price: Some(10.0),
            symbol: "AAPL",
            quantity: 100,
            client_order_id: "C1",
            staged_tag: None,
            refers_to_id: None,
            primary_exchange: None,
        };
        let fields = build_order_fields(req.account, &req).unwrap();
        assert!(fields.iter().any(|(k, v)| k == "PRICE_TYPE" && v == "StopLimit"));
        assert!(fields.iter().any(|(k, _)| k == "STOP_PRICE"));
        assert!(fields.iter().any(|(k, _)| k == "PRICE"));
    }

    #[test]
    fn route_encodes_strategy_parameters_with_delimiters() {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "STRAT_PARAMETERS".to_string(),
            RouteParam::Bag(BTreeMap::from([("PARTICIPATION".to_string(), "10".to_string())])),
        );
        let route = OrderRoute { name: "VWAP".into(), parameters };
        let fields = route.order_fields();
        let (_, encoded) = fields.iter().find(|(k, _)| k == "STRAT_PARAMETERS").unwrap();
        assert_eq!(encoded, "PARTICIPATION\u{1F}10\u{1}");
    }

    #[test]
    fn account_must_have_four_parts() {
        let route = OrderRoute::default();
        let req = OrderTicketRequest {
            account: "bad",
            route: &route,
            order_type: OrderType::Market,
            price: None,
            stop_price: None,
            symbol: "AAPL",
            quantity: 1,
            client_order_id: "C1",
            staged_tag: None,
            refers_to_id: None,
            primary_exchange: None,
        };
        assert!(build_order_fields(req.account, &req).is_err());
    }
}
