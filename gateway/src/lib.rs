#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_import_braces,
    unused_qualifications
)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

pub mod account;
pub mod callback;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod downstream;
pub mod engine;
pub mod error;
pub mod field;
pub mod frame;
pub mod listener;
pub mod order;
pub mod pool;
pub mod position;
pub mod route;
pub mod symbol;
pub mod ticket;
pub mod watchdog;
pub mod wire;

/// Upstream channel/connection identifier; a stringified UUID.
pub type ChannelId = String;
/// Channel ids double as request ids wherever the error taxonomy needs to
/// name the connection a failure happened on.
pub type RequestId = ChannelId;
/// Handle assigned to a downstream trading client on accept.
pub type ClientId = u64;
/// `BANK.BRANCH.CUSTOMER.DEPOSIT`.
pub type AccountCode = String;
pub type TimeStamp = DateTime<Utc>;
/// A decoded upstream row: field name to JSON value, since upstream fields
/// are strings but already-parsed responses may carry numbers or nulls.
pub type FieldMap = BTreeMap<String, Value>;

pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        account::*, callback::*, channel::*, config::*, downstream::*, engine::*, error::*,
        field::*, frame::*, order::*, pool::*, position::*, route::*, symbol::*, ticket::*,
        AccountCode, ChannelId, ClientId, FieldMap, RequestId, Result, TimeStamp,
    };
}

pub use error::{GatewayError, Result};
