//! Per-(service,topic) request/response state machine.
//!
//! A [`Channel`] is the Rust analogue of `RTX_Connection`: each one opens its
//! own upstream `connect` session and then serializes ack → response/status →
//! update through it. A channel is "ready" for the next command only once
//! every pending slot from the previous one has cleared, exactly mirroring
//! `update_ready()` in the original client. Requests issued while the
//! channel is still finishing its handshake (or mid-command) are queued as
//! the single `on_connect_action` and replayed once the channel frees up.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};

use crate::error::GatewayError;
use crate::frame::{ResponseData, StatusData};
use crate::{ChannelId, Result};

/// A command queued for the channel and the callbacks it will eventually
/// resolve. Held either as the "currently outstanding" command or, while the
/// channel isn't ready yet, as `on_connect_action`.
struct PendingSend {
    cmd: &'static str,
    args: String,
    ack_expect: Option<&'static str>,
    ack_tx: Option<oneshot::Sender<Result<String>>>,
    response_expect: bool,
    response_tx: Option<oneshot::Sender<Result<Vec<Value>>>>,
    response_rows: Vec<Value>,
    status_expect: Option<&'static str>,
    status_tx: Option<oneshot::Sender<Result<StatusData>>>,
    update_tx: Option<oneshot::Sender<Result<Value>>>,
    update_handler: Option<mpsc::UnboundedSender<Option<Value>>>,
}

impl PendingSend {
    fn fail(self, err: GatewayError) {
        if let Some(tx) = self.ack_tx {
            let _ = tx.send(Err(clone_err(&err)));
        }
        if let Some(tx) = self.response_tx {
            let _ = tx.send(Err(clone_err(&err)));
        }
        if let Some(tx) = self.status_tx {
            let _ = tx.send(Err(clone_err(&err)));
        }
        if let Some(tx) = self.update_tx {
            let _ = tx.send(Err(err));
        }
    }
}

fn clone_err(err: &GatewayError) -> GatewayError { GatewayError::Validation(err.to_string()) }

/// What feeding one inbound frame to a channel produced: a line to replay
/// upstream (a queued `on_connect_action` unblocked), a protocol error to
/// surface to downstream clients, or both/neither.
#[derive(Default)]
pub struct ChannelReceived {
    pub replay: Option<String>,
    pub error: Option<GatewayError>,
}

pub struct Channel {
    pub id: ChannelId,
    pub service: String,
    pub topic: String,
    pub connected: bool,
    ack_pending: Option<&'static str>,
    ack_tx: Option<oneshot::Sender<Result<String>>>,
    response_pending: bool,
    response_tx: Option<oneshot::Sender<Result<Vec<Value>>>>,
    response_rows: Vec<Value>,
    status_pending: Option<&'static str>,
    status_tx: Option<oneshot::Sender<Result<StatusData>>>,
    update_tx: Option<oneshot::Sender<Result<Value>>>,
    update_handler: Option<mpsc::UnboundedSender<Option<Value>>>,
    on_connect_action: Option<PendingSend>,
}

impl Channel {
    /// Builds a new channel and the `connect` line to send for it.
    pub fn new(id: ChannelId, service: impl Into<String>, topic: impl Into<String>) -> (Self, String) {
        let service = service.into();
        let topic = topic.into();
        let line = crate::frame::outbound::connect(&id, &format!("{service};{topic}"));
        let cxn = Self {
            id,
            service,
            topic,
            connected: false,
            ack_pending: Some("CONNECTION PENDING"),
            ack_tx: None,
            response_pending: false,
            response_tx: None,
            response_rows: Vec::new(),
            status_pending: Some("OnInitAck"),
            status_tx: None,
            update_tx: None,
            update_handler: None,
            on_connect_action: None,
        };
        (cxn, line)
    }

    pub fn is_ready(&self) -> bool {
        self.ack_pending.is_none()
            && !self.response_pending
            && self.status_pending.is_none()
            && self.status_tx.is_none()
            && self.update_tx.is_none()
            && self.update_handler.is_none()
    }

    fn dispatch(&mut self, pending: PendingSend) -> Option<String> {
        if self.is_ready() {
            let line = format!("{} {} {}", pending.cmd, self.id, pending.args);
            self.ack_pending = pending.ack_expect;
            self.ack_tx = pending.ack_tx;
            self.response_pending = pending.response_expect;
            self.response_tx = pending.response_tx;
            self.response_rows = Vec::new();
            self.status_pending = pending.status_expect;
            self.status_tx = pending.status_tx;
            self.update_tx = pending.update_tx;
            self.update_handler = pending.update_handler;
            Some(line)
        } else if self.on_connect_action.is_some() {
            pending.fail(GatewayError::Validation(format!(
                "channel {} already has a queued on-connect action",
                self.id
            )));
            None
        } else {
            self.on_connect_action = Some(pending);
            None
        }
    }

    fn tql(table: &str, what: &str, r#where: &str) -> String { format!("{table};{what};{}", r#where) }

    pub fn request(&mut self, table: &str, what: &str, r#where: &str) -> (oneshot::Receiver<Result<Vec<Value>>>, Option<String>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingSend {
            cmd: "request",
            args: Self::tql(table, what, r#where),
            ack_expect: Some("REQUEST_OK"),
            ack_tx: None,
            response_expect: true,
            response_tx: Some(tx),
            response_rows: Vec::new(),
            status_expect: None,
            status_tx: None,
            update_tx: None,
            update_handler: None,
        };
        let line = self.dispatch(pending);
        (rx, line)
    }

    pub fn advise(&mut self, table: &str, what: &str, r#where: &str) -> (mpsc::UnboundedReceiver<Option<Value>>, Option<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = PendingSend {
            cmd: "advise",
            args: Self::tql(table, what, r#where),
            ack_expect: Some("ADVISE_OK"),
            ack_tx: None,
            response_expect: false,
            response_tx: None,
            response_rows: Vec::new(),
            status_expect: Some("OnOtherAck"),
            status_tx: None,
            update_tx: None,
            update_handler: Some(tx),
        };
        let line = self.dispatch(pending);
        (rx, line)
    }

    pub fn adviserequest(
        &mut self,
        table: &str,
        what: &str,
        r#where: &str,
    ) -> (oneshot::Receiver<Result<Vec<Value>>>, mpsc::UnboundedReceiver<Option<Value>>, Option<String>) {
        let (resp_tx, resp_rx) = oneshot::channel();
        let (upd_tx, upd_rx) = mpsc::unbounded_channel();
        let pending = PendingSend {
            cmd: "adviserequest",
            args: Self::tql(table, what, r#where),
            ack_expect: Some("ADVISEREQUEST_OK"),
            ack_tx: None,
            response_expect: true,
            response_tx: Some(resp_tx),
            response_rows: Vec::new(),
            status_expect: Some("OnOtherAck"),
            status_tx: None,
            update_tx: None,
            update_handler: Some(upd_tx),
        };
        let line = self.dispatch(pending);
        (resp_rx, upd_rx, line)
    }

    pub fn unadvise(&mut self, table: &str, what: &str, r#where: &str) -> (oneshot::Receiver<Result<StatusData>>, Option<String>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingSend {
            cmd: "unadvise",
            args: Self::tql(table, what, r#where),
            ack_expect: Some("UNADVISE_OK"),
            ack_tx: None,
            response_expect: false,
            response_tx: None,
            response_rows: Vec::new(),
            status_expect: Some("OnOtherAck"),
            status_tx: Some(tx),
            update_tx: None,
            update_handler: None,
        };
        let line = self.dispatch(pending);
        (rx, line)
    }

    pub fn poke(&mut self, table: &str, what: &str, r#where: &str, data: &str) -> (oneshot::Receiver<Result<StatusData>>, Option<String>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingSend {
            cmd: "poke",
            args: format!("{}!{data}", Self::tql(table, what, r#where)),
            ack_expect: Some("POKE_OK"),
            ack_tx: None,
            response_expect: false,
            response_tx: None,
            response_rows: Vec::new(),
            status_expect: Some("OnOtherAck"),
            status_tx: Some(tx),
            update_tx: None,
            update_handler: None,
        };
        let line = self.dispatch(pending);
        (rx, line)
    }

    pub fn execute(&mut self, command: &str) -> (oneshot::Receiver<Result<String>>, Option<String>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingSend {
            cmd: "execute",
            args: command.to_string(),
            ack_expect: Some("EXECUTE_OK"),
            ack_tx: Some(tx),
            response_expect: false,
            response_tx: None,
            response_rows: Vec::new(),
            status_expect: None,
            status_tx: None,
            update_tx: None,
            update_handler: None,
        };
        let line = self.dispatch(pending);
        (rx, line)
    }

    pub fn terminate(&mut self, code: i32) -> (oneshot::Receiver<Result<String>>, Option<String>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingSend {
            cmd: "terminate",
            args: code.to_string(),
            ack_expect: Some("TERMINATE_OK"),
            ack_tx: Some(tx),
            response_expect: false,
            response_tx: None,
            response_rows: Vec::new(),
            status_expect: None,
            status_tx: None,
            update_tx: None,
            update_handler: None,
        };
        let line = self.dispatch(pending);
        (rx, line)
    }

    fn handle_ack(&mut self, data: &Value) -> Option<GatewayError> {
        let Some(expected) = self.ack_pending else {
            warn!(cxn = %self.id, ?data, "unexpected ack");
            return Some(GatewayError::Protocol { cxn_id: self.id.clone(), message: "unexpected ack".into() });
        };
        let got = data.as_str().unwrap_or_default();
        if got == expected {
            self.ack_pending = None;
            if let Some(tx) = self.ack_tx.take() {
                let _ = tx.send(Ok(got.to_string()));
            }
            None
        } else {
            let message = format!("ack mismatch: expected {expected}, got {got}");
            let err = GatewayError::Protocol { cxn_id: self.id.clone(), message };
            if let Some(tx) = self.ack_tx.take() {
                let _ = tx.send(Err(clone_err(&err)));
            }
            self.fail_response(clone_err(&err));
            Some(err)
        }
    }

    fn fail_response(&mut self, err: GatewayError) {
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(Err(clone_err(&err)));
        }
        self.response_pending = false;
    }

    fn handle_response(&mut self, data: &ResponseData) -> Option<GatewayError> {
        if !self.response_pending {
            warn!(cxn = %self.id, "unexpected response frame");
            return Some(GatewayError::Protocol { cxn_id: self.id.clone(), message: "unexpected response frame".into() });
        }
        self.response_rows.push(data.row.clone());
        if data.complete {
            if let Some(tx) = self.response_tx.take() {
                let _ = tx.send(Ok(std::mem::take(&mut self.response_rows)));
            }
            self.response_pending = false;
        }
        None
    }

    /// Returns a line to send if clearing `status_pending` unblocks a queued
    /// `on_connect_action`, plus a protocol error if this status frame was
    /// unexpected or carried a non-OK status. `OnTerminate` arriving while no
    /// status is pending (an advise the upstream tore down on its own) also
    /// nulls out the update handler so the caller observes end-of-stream.
    fn handle_status(&mut self, data: &StatusData) -> (Option<String>, Option<GatewayError>) {
        let Some(expected) = self.status_pending else {
            warn!(cxn = %self.id, ?data, "unexpected status frame");
            if data.msg == "OnTerminate" {
                if let Some(tx) = self.update_handler.take() {
                    let _ = tx.send(None);
                }
            }
            let err = GatewayError::Protocol {
                cxn_id: self.id.clone(),
                message: format!("unexpected status {}", data.msg),
            };
            self.fail_response(clone_err(&err));
            return (None, Some(err));
        };
        if data.msg != expected {
            warn!(cxn = %self.id, expected, got = %data.msg, "status mismatch");
            let err = GatewayError::Protocol {
                cxn_id: self.id.clone(),
                message: format!("status mismatch: expected {expected}, got {}", data.msg),
            };
            return (None, Some(err));
        }
        if self.update_handler.is_none() {
            self.status_pending = None;
        }
        if data.status != "1" {
            warn!(cxn = %self.id, msg = %data.msg, status = %data.status, "status error");
            let err = GatewayError::Protocol {
                cxn_id: self.id.clone(),
                message: format!("{} returned status {}", data.msg, data.status),
            };
            return (None, Some(err));
        }
        let mut replay = None;
        if data.msg == "OnInitAck" {
            self.connected = true;
            if let Some(action) = self.on_connect_action.take() {
                replay = Some(format!("{} {} {}", action.cmd, self.id, action.args));
                self.ack_pending = action.ack_expect;
                self.ack_tx = action.ack_tx;
                self.response_pending = action.response_expect;
                self.response_tx = action.response_tx;
                self.status_pending = action.status_expect;
                self.status_tx = action.status_tx;
                self.update_tx = action.update_tx;
                self.update_handler = action.update_handler;
            }
        }
        if let Some(tx) = self.status_tx.take() {
            let _ = tx.send(Ok(data.clone()));
        }
        (replay, None)
    }

    fn handle_update(&mut self, row: Option<Value>) -> Option<GatewayError> {
        if let Some(tx) = self.update_tx.take() {
            if let Some(row) = row {
                let _ = tx.send(Ok(row));
            }
            return None;
        }
        match (&self.update_handler, &row) {
            (Some(handler), _) => {
                let _ = handler.send(row);
                None
            }
            (None, _) => {
                warn!(cxn = %self.id, "unexpected update frame");
                Some(GatewayError::Protocol { cxn_id: self.id.clone(), message: "unexpected update frame".into() })
            }
        }
    }

    /// Feeds one inbound frame to the channel. The returned
    /// [`ChannelReceived`] carries a replay line if this unblocked a queued
    /// `on_connect_action`, and a `GatewayError` if the frame was a protocol
    /// mismatch the caller should surface to downstream clients as an
    /// `error:` line (spec'd error-handling behavior, not just a local log).
    #[instrument(level = "trace", skip(self, data), fields(cxn = %self.id))]
    pub fn receive(&mut self, kind: &str, data: &Value) -> ChannelReceived {
        match kind {
            "ack" => ChannelReceived { replay: None, error: self.handle_ack(data) },
            "response" => {
                let error = ResponseData::from_value(data).and_then(|r| self.handle_response(&r));
                ChannelReceived { replay: None, error }
            }
            "status" => match StatusData::from_value(data) {
                Some(s) => {
                    let (replay, error) = self.handle_status(&s);
                    ChannelReceived { replay, error }
                }
                None => ChannelReceived::default(),
            },
            "update" => {
                let update = crate::frame::UpdateData::from_value(data);
                ChannelReceived { replay: None, error: self.handle_update(update.row) }
            }
            other => {
                warn!(cxn = %self.id, kind = other, "unexpected frame type");
                ChannelReceived {
                    replay: None,
                    error: Some(GatewayError::Protocol { cxn_id: self.id.clone(), message: format!("unexpected frame type {other}") }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_channel_is_not_ready_until_init_ack() {
        let (mut cxn, line) = Channel::new("c1".to_string(), "LOGIN", "rtx");
        assert_eq!(line, "connect c1 LOGIN;rtx");
        assert!(!cxn.is_ready());
        cxn.receive("ack", &json!("CONNECTION PENDING"));
        assert!(!cxn.is_ready());
        cxn.receive("status", &json!({"msg": "OnInitAck", "status": "1"}));
        assert!(cxn.is_ready());
        assert!(cxn.connected);
    }

    #[tokio::test]
    async fn request_resolves_on_complete_response() {
        let (mut cxn, _) = Channel::new("c1".to_string(), "LOGIN", "rtx");
        cxn.receive("ack", &json!("CONNECTION PENDING"));
        cxn.receive("status", &json!({"msg": "OnInitAck", "status": "1"}));

        let (rx, line) = cxn.request("ORDERS", "*", "");
        assert_eq!(line, Some("request c1 ORDERS;*;".to_string()));
        cxn.receive("ack", &json!("REQUEST_OK"));
        cxn.receive("response", &json!({"row": {"ORIGINAL_ORDER_ID": "O1"}, "complete": false}));
        cxn.receive("response", &json!({"row": {"ORIGINAL_ORDER_ID": "O2"}, "complete": true}));

        let rows = rx.await.unwrap().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(cxn.is_ready());
    }

    #[test]
    fn queued_action_replays_after_init_ack() {
        let (mut cxn, _) = Channel::new("c1".to_string(), "LOGIN", "rtx");
        let (_rx, line) = cxn.request("ORDERS", "*", "");
        assert_eq!(line, None, "channel isn't ready yet, action should queue");
        cxn.receive("ack", &json!("CONNECTION PENDING"));
        let replay = cxn.receive("status", &json!({"msg": "OnInitAck", "status": "1"}));
        assert_eq!(replay.replay, Some("request c1 ORDERS;*;".to_string()));
    }

    #[test]
    fn unexpected_status_surfaces_protocol_error() {
        let (mut cxn, _) = Channel::new("c1".to_string(), "LOGIN", "rtx");
        cxn.receive("ack", &json!("CONNECTION PENDING"));
        cxn.receive("status", &json!({"msg": "OnInitAck", "status": "1"}));
        let received = cxn.receive("status", &json!({"msg": "OnTerminate", "status": "1"}));
        assert!(matches!(received.error, Some(GatewayError::Protocol { .. })));
    }

    #[test]
    fn ack_mismatch_surfaces_protocol_error() {
        let (mut cxn, _) = Channel::new("c1".to_string(), "LOGIN", "rtx");
        let received = cxn.receive("ack", &json!("SOMETHING ELSE"));
        assert!(matches!(received.error, Some(GatewayError::Protocol { .. })));
    }
}
