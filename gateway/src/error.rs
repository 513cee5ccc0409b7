//! Crate-wide error taxonomy.
//!
//! Protocol mismatches and field-parse failures are recoverable and stay
//! local to the callback or row that triggered them; `Fatal` invalidates
//! shared state and propagates out of [`crate::engine::Engine::run`],
//! ending the process.

use crate::RequestId;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol mismatch on cxn {cxn_id}: {message}")]
    Protocol { cxn_id: RequestId, message: String },

    #[error("field parse error: {field}={raw} ({reason})")]
    FieldParse {
        field: String,
        raw: String,
        reason: String,
    },

    #[error("callback {label} expired after {elapsed_ms}ms")]
    Timeout { label: String, elapsed_ms: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

impl GatewayError {
    /// The `error:` line to broadcast to downstream clients. `id` is the
    /// channel or order id the error is scoped to, `0` when there is none.
    pub fn downstream_line(&self, id: &str) -> String { format!("error: {id} {self}") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_line_scopes_message_to_id() {
        let err = GatewayError::Protocol { cxn_id: "c1".into(), message: "unexpected ack".into() };
        assert_eq!(err.downstream_line("c1"), "error: c1 protocol mismatch on cxn c1: unexpected ack");
    }
}
