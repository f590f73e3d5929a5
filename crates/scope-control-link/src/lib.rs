//! Control Link (C2): a request/reply channel to one scanner with strict
//! turn discipline, grounded on `connection_manager.py`'s `zmq.REQ` usage —
//! reworked from a queue-draining worker thread into a synchronous
//! `send`/`receive` pair the orchestrator drives from its own thread.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scope_core::error::TransportError;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ControlLinkError {
    /// `send()` called while a request is outstanding.
    #[error("send called while a reply is still outstanding")]
    Busy,
    /// `receive()` called with nothing sent since the last reply.
    #[error("receive called with no request pending")]
    NoRequestPending,
    /// The reply's `original_type` (or `type`) did not match the most
    /// recent outstanding request. The link is reset before this is
    /// returned to the caller.
    #[error("out-of-order reply: expected '{expected}', got '{got}'")]
    OutOfOrderReply { expected: String, got: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Idle,
    AwaitingReply,
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub original_type: String,
    pub status: ReplyStatus,
    pub message: Option<String>,
    /// Command-specific fields beyond `original_type`/`status`/`message`.
    pub fields: Map<String, Value>,
}

/// A duplex REQ/REP channel to one scanner. See module docs for the turn
/// discipline this enforces (P3).
pub struct ControlLink {
    ctx: zmq::Context,
    socket: Option<zmq::Socket>,
    endpoint: Option<String>,
    state: LinkState,
    pending_request_type: Option<String>,
}

impl Default for ControlLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlLink {
    pub fn new() -> Self {
        Self {
            ctx: zmq::Context::new(),
            socket: None,
            endpoint: None,
            state: LinkState::Disconnected,
            pending_request_type: None,
        }
    }

    /// Establishes the channel. Idempotent if already connected to the
    /// same endpoint.
    pub fn connect(&mut self, endpoint: &str) -> Result<(), ControlLinkError> {
        if self.state != LinkState::Disconnected && self.endpoint.as_deref() == Some(endpoint) {
            return Ok(());
        }
        let socket = self
            .ctx
            .socket(zmq::REQ)
            .map_err(|e| TransportError::ProtocolViolation(format!("socket create failed: {e}")))?;
        socket
            .connect(endpoint)
            .map_err(|e| TransportError::ProtocolViolation(format!("connect failed: {e}")))?;
        self.socket = Some(socket);
        self.endpoint = Some(endpoint.to_string());
        self.state = LinkState::Idle;
        self.pending_request_type = None;
        Ok(())
    }

    /// Serialises `{type, timestamp, ...payload}` and transmits it. `type`
    /// and `command` keys in `payload` are silently dropped (with a
    /// warning) since `command_type` already supplies `type`.
    pub fn send(
        &mut self,
        command_type: &str,
        mut payload: Map<String, Value>,
        timeout: Duration,
    ) -> Result<(), ControlLinkError> {
        match self.state {
            LinkState::AwaitingReply => return Err(ControlLinkError::Busy),
            LinkState::Disconnected | LinkState::Broken => {
                return Err(TransportError::Disconnected.into())
            }
            LinkState::Idle => {}
        }

        if payload.remove("type").is_some() || payload.remove("command").is_some() {
            warn!(
                command_type,
                "payload carried a reserved 'type'/'command' key; dropped"
            );
        }

        let mut record = payload;
        record.insert("type".to_string(), Value::String(command_type.to_string()));
        record.insert(
            "timestamp".to_string(),
            Value::from(now_seconds()),
        );

        let bytes = serde_json::to_vec(&Value::Object(record))
            .map_err(|e| TransportError::ProtocolViolation(format!("encode failed: {e}")))?;

        let socket = self.socket.as_ref().ok_or(TransportError::Disconnected)?;
        socket
            .set_sndtimeo(timeout.as_millis() as i32)
            .map_err(|e| TransportError::ProtocolViolation(format!("set_sndtimeo: {e}")))?;

        match socket.send(bytes, 0) {
            Ok(()) => {
                self.state = LinkState::AwaitingReply;
                self.pending_request_type = Some(command_type.to_string());
                Ok(())
            }
            Err(zmq::Error::EAGAIN) => Err(TransportError::Timeout.into()),
            Err(e) => {
                self.state = LinkState::Broken;
                Err(TransportError::ProtocolViolation(format!("send failed: {e}")).into())
            }
        }
    }

    /// Waits for the matching reply. A reply whose `original_type` (or
    /// `type`, if `original_type` is absent) does not match the most
    /// recent outstanding request is reported as `OutOfOrderReply` and the
    /// transport is rebuilt before returning.
    pub fn receive(&mut self, timeout: Duration) -> Result<Reply, ControlLinkError> {
        let expected = match &self.pending_request_type {
            Some(t) => t.clone(),
            None => return Err(ControlLinkError::NoRequestPending),
        };

        let socket = self.socket.as_ref().ok_or(TransportError::Disconnected)?;
        socket
            .set_rcvtimeo(timeout.as_millis() as i32)
            .map_err(|e| TransportError::ProtocolViolation(format!("set_rcvtimeo: {e}")))?;

        let bytes = match socket.recv_bytes(0) {
            Ok(b) => b,
            Err(zmq::Error::EAGAIN) => return Err(TransportError::Timeout.into()),
            Err(e) => {
                self.state = LinkState::Broken;
                return Err(TransportError::ProtocolViolation(format!("recv failed: {e}")).into());
            }
        };

        let mut value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::ProtocolViolation(format!("malformed reply: {e}")))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| TransportError::ProtocolViolation("reply is not an object".to_string()))?;

        let got = obj
            .remove("original_type")
            .or_else(|| obj.get("type").cloned())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        if got != expected {
            let _ = self.reset();
            return Err(ControlLinkError::OutOfOrderReply { expected, got });
        }

        let status = match obj.remove("status").and_then(|v| v.as_str().map(str::to_string)) {
            Some(s) if s == "ok" => ReplyStatus::Ok,
            _ => ReplyStatus::Error,
        };
        let message = obj.remove("message").and_then(|v| v.as_str().map(str::to_string));

        self.state = LinkState::Idle;
        self.pending_request_type = None;

        Ok(Reply {
            original_type: got,
            status,
            message,
            fields: obj.clone(),
        })
    }

    /// Closes and rebuilds the transport against the last-known endpoint.
    /// Used after `OutOfOrderReply` or repeated timeouts.
    pub fn reset(&mut self) -> Result<(), ControlLinkError> {
        self.socket = None;
        self.pending_request_type = None;
        match self.endpoint.clone() {
            Some(endpoint) => {
                self.state = LinkState::Disconnected;
                self.connect(&endpoint)
            }
            None => {
                self.state = LinkState::Disconnected;
                Ok(())
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Idle | LinkState::AwaitingReply)
    }

    pub fn is_broken(&self) -> bool {
        self.state == LinkState::Broken
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_before_connect_reports_disconnected() {
        let mut link = ControlLink::new();
        let err = link
            .send("PING", Map::new(), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(
            err,
            ControlLinkError::Transport(TransportError::Disconnected)
        ));
    }

    #[test]
    fn receive_without_pending_request_is_an_error() {
        let mut link = ControlLink::new();
        let err = link.receive(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, ControlLinkError::NoRequestPending));
    }

    #[test]
    fn is_connected_reflects_state_transitions() {
        let link = ControlLink::new();
        assert!(!link.is_connected());
        assert!(!link.is_broken());
    }
}
