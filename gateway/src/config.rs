//! Runtime configuration.
//!
//! Loading itself is a thin wrapper around the `config` crate (environment
//! source only, prefix `GATEWAY_`); the shape of [`GatewayConfig`] is the
//! part that matters, naming every tunable the gateway reads at startup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{callback::CallbackLabel, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub api_host: String,
    pub api_port: u16,
    pub username: String,
    pub password: String,
    pub http_port: u16,
    pub tcp_port: u16,
    pub enable_ticker: bool,
    pub enable_high_low: bool,
    pub enable_seconds_tick: bool,
    pub log_api_messages: bool,
    pub debug_api_messages: bool,
    pub log_client_messages: bool,
    pub log_order_updates: bool,
    pub api_timezone: String,
    pub api_route: String,
    pub timeout_default: u64,
    pub timeout_account: u64,
    pub timeout_addsymbol: u64,
    pub timeout_order: u64,
    pub timeout_orderstatus: u64,
    pub timeout_position: u64,
    pub timeout_timer: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_host: "localhost".into(),
            api_port: 11099,
            username: String::new(),
            password: String::new(),
            http_port: 50080,
            tcp_port: 50090,
            enable_ticker: true,
            enable_high_low: true,
            enable_seconds_tick: true,
            log_api_messages: false,
            debug_api_messages: false,
            log_client_messages: false,
            log_order_updates: false,
            api_timezone: "America/New_York".into(),
            api_route: "DEMO".into(),
            timeout_default: 5,
            timeout_account: 5,
            timeout_addsymbol: 5,
            timeout_order: 5,
            timeout_orderstatus: 5,
            timeout_position: 5,
            timeout_timer: 2,
        }
    }
}

impl GatewayConfig {
    /// Load from `GATEWAY_*` environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::Environment::with_prefix("GATEWAY"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn callback_timeouts(&self) -> HashMap<CallbackLabel, u64> {
        use CallbackLabel::*;
        HashMap::from([
            (Default, self.timeout_default),
            (Account, self.timeout_account),
            (AddSymbol, self.timeout_addsymbol),
            (Order, self.timeout_order),
            (OrderStatus, self.timeout_orderstatus),
            (Position, self.timeout_position),
            (Timer, self.timeout_timer),
        ])
    }
}
