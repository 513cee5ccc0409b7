//! Inbound/outbound wire frames.
//!
//! The upstream gateway speaks newline-delimited JSON objects
//! `{type, id, data}`. Encoding outbound commands is plain string
//! formatting — there is no binary framing to get right, only the command
//! grammar.

use serde::Deserialize;
use serde_json::Value;

use crate::{ChannelId, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Option<ChannelId>,
    pub data: Value,
}

impl InboundFrame {
    pub fn parse(line: &str) -> Result<Self> { Ok(serde_json::from_str(line)?) }
}

#[derive(Debug, Clone)]
pub struct SystemData {
    pub msg: String,
    pub item: Option<String>,
}

impl SystemData {
    pub fn from_value(data: &Value) -> Option<Self> {
        Some(Self {
            msg: data.get("msg")?.as_str()?.to_string(),
            item: data
                .get("item")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResponseData {
    pub row: Value,
    pub complete: bool,
}

impl ResponseData {
    pub fn from_value(data: &Value) -> Option<Self> {
        Some(Self {
            row: data.get("row")?.clone(),
            complete: data.get("complete").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StatusData {
    pub msg: String,
    pub status: String,
}

impl StatusData {
    pub fn from_value(data: &Value) -> Option<Self> {
        Some(Self {
            msg: data.get("msg")?.as_str()?.to_string(),
            status: data.get("status")?.as_str()?.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct UpdateData {
    pub row: Option<Value>,
}

impl UpdateData {
    /// `None` data signals `OnTerminate` delivered to an advise handler.
    pub fn from_value(data: &Value) -> Self {
        Self {
            row: data.get("row").cloned().filter(|v| !v.is_null()),
        }
    }
}

/// Outbound command verbs, built as plain strings.
pub mod outbound {
    use crate::ChannelId;

    pub fn connect(id: &ChannelId, key: &str) -> String { format!("connect {id} {key}") }

    fn tql(table: &str, what: &str, r#where: &str) -> String {
        format!("{table};{what};{}", r#where)
    }

    pub fn request(id: &ChannelId, table: &str, what: &str, r#where: &str) -> String {
        format!("request {id} {}", tql(table, what, r#where))
    }

    pub fn advise(id: &ChannelId, table: &str, what: &str, r#where: &str) -> String {
        format!("advise {id} {}", tql(table, what, r#where))
    }

    pub fn adviserequest(id: &ChannelId, table: &str, what: &str, r#where: &str) -> String {
        format!("adviserequest {id} {}", tql(table, what, r#where))
    }

    pub fn unadvise(id: &ChannelId, table: &str, what: &str, r#where: &str) -> String {
        format!("unadvise {id} {}", tql(table, what, r#where))
    }

    pub fn poke(id: &ChannelId, table: &str, what: &str, r#where: &str, data: &str) -> String {
        format!("poke {id} {}!{data}", tql(table, what, r#where))
    }

    pub fn execute(id: &ChannelId, command: &str) -> String { format!("execute {id} {command}") }

    pub fn terminate(id: &ChannelId, code: i32) -> String { format!("terminate {id} {code}") }
}
