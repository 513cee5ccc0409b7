//! Inbound frame routing.
//!
//! Every frame off the wire carries a channel id except `system` frames,
//! which are gateway-wide (the login banner, shutdown notices). Everything
//! else gets handed to the channel it names; a frame for an unknown id is
//! logged and dropped rather than treated as fatal, since a channel can be
//! torn down while a frame for it is still in flight.

use tracing::warn;

use crate::error::GatewayError;
use crate::frame::{InboundFrame, SystemData};
use crate::pool::ChannelPool;

pub enum RoutedEvent {
    System(SystemData),
    /// A queued `on_connect_action` unblocked; this line must be sent
    /// upstream.
    ChannelReplay(String),
    /// A protocol mismatch the caller should surface to downstream clients
    /// as an `error: <id> ...` line, scoped to the channel/frame id it came
    /// from (`"0"` when there was none to scope it to).
    ProtocolError(String, GatewayError),
    Unrouted,
}

pub fn route_frame(pool: &mut ChannelPool, frame: &InboundFrame) -> RoutedEvent {
    if frame.kind == "system" {
        return match SystemData::from_value(&frame.data) {
            Some(sys) => RoutedEvent::System(sys),
            None => {
                warn!(?frame.data, "malformed system frame");
                RoutedEvent::ProtocolError("0".into(), GatewayError::Protocol { cxn_id: "0".into(), message: "malformed system frame".into() })
            }
        };
    }

    let Some(id) = &frame.id else {
        warn!(kind = %frame.kind, "frame missing channel id");
        return RoutedEvent::ProtocolError("0".into(), GatewayError::Protocol { cxn_id: "0".into(), message: format!("{} frame missing channel id", frame.kind) });
    };
    let Some(channel) = pool.get_mut(id) else {
        warn!(id, kind = %frame.kind, "frame for unknown channel");
        return RoutedEvent::ProtocolError(id.clone(), GatewayError::Protocol { cxn_id: id.clone(), message: format!("frame for unknown channel ({})", frame.kind) });
    };
    let received = channel.receive(&frame.kind, &frame.data);
    if let Some(err) = received.error {
        return RoutedEvent::ProtocolError(id.clone(), err);
    }
    match received.replay {
        Some(line) => RoutedEvent::ChannelReplay(line),
        None => RoutedEvent::Unrouted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_frame_routes_without_a_channel() {
        let mut pool = ChannelPool::new();
        let frame = InboundFrame { kind: "system".into(), id: None, data: json!({"msg": "startup", "item": "rtx"}) };
        match route_frame(&mut pool, &frame) {
            RoutedEvent::System(sys) => assert_eq!(sys.msg, "startup"),
            _ => panic!("expected system event"),
        }
    }

    #[test]
    fn unknown_channel_id_is_a_protocol_error() {
        let mut pool = ChannelPool::new();
        let frame = InboundFrame { kind: "ack".into(), id: Some("missing".into()), data: json!("x") };
        assert!(matches!(route_frame(&mut pool, &frame), RoutedEvent::ProtocolError(id, _) if id == "missing"));
    }
}
