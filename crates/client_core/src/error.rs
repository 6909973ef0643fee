use shared::{
    domain::{FormId, MessageHash, WidgetId},
    error::ProtocolError,
    widget::WidgetKind,
};
use thiserror::Error;

use crate::connection::ConnectionState;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("transport closed by peer")]
    Closed,
    #[error("transport failure: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("cannot send while connection is {0:?}")]
    NotConnected(ConnectionState),
    #[error("connection driver has stopped")]
    DriverStopped,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("{0} consecutive frames failed to decode")]
    RepeatedDecodeFailures(u32),
    #[error("reorder window exceeded: waiting for seq {expected}, {buffered} frames buffered")]
    ReorderWindowExceeded { expected: u64, buffered: usize },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<TransportError> for ConnectionError {
    fn from(value: TransportError) -> Self {
        ConnectionError::Transport(value.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("failed to fetch cached message {hash}: {reason}")]
    FetchFailed { hash: MessageHash, reason: String },
    #[error("fetching cached message {hash} timed out after {timeout_ms}ms")]
    FetchTimeout { hash: MessageHash, timeout_ms: u64 },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WidgetStateError {
    #[error("unknown widget {0}")]
    UnknownWidget(WidgetId),
    #[error("unknown form {0}")]
    UnknownForm(FormId),
    #[error("widget {widget_id} expects a {expected} value, got {actual}")]
    KindMismatch {
        widget_id: WidgetId,
        expected: WidgetKind,
        actual: WidgetKind,
    },
    #[error("invalid value for widget {widget_id}: {reason}")]
    InvalidValue { widget_id: WidgetId, reason: String },
    #[error("failed to submit form {form_id}: {source}")]
    SubmitFailed {
        form_id: FormId,
        source: ConnectionError,
    },
}

/// Non-fatal condition surfaced to the user through the session event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    DecodeFailed { reason: String },
    CacheFetchFailed { hash: MessageHash, reason: String },
    InvalidWidgetValue { widget_id: WidgetId, reason: String },
    MissingSubmitButton { form_id: FormId },
    SendFailed { reason: String },
}

impl Diagnostic {
    pub fn message(&self) -> String {
        match self {
            Diagnostic::DecodeFailed { reason } => format!("dropped undecodable message: {reason}"),
            Diagnostic::CacheFetchFailed { hash, reason } => {
                format!("could not load message {hash}: {reason}")
            }
            Diagnostic::InvalidWidgetValue { widget_id, reason } => {
                format!("rejected value for widget {widget_id}: {reason}")
            }
            Diagnostic::MissingSubmitButton { form_id } => format!(
                "form {form_id} has no submit button; its values are never sent to the script"
            ),
            Diagnostic::SendFailed { reason } => format!("could not reach the host: {reason}"),
        }
    }
}

impl From<&WidgetStateError> for Diagnostic {
    fn from(value: &WidgetStateError) -> Self {
        match value {
            WidgetStateError::KindMismatch { widget_id, .. }
            | WidgetStateError::InvalidValue { widget_id, .. }
            | WidgetStateError::UnknownWidget(widget_id) => Diagnostic::InvalidWidgetValue {
                widget_id: widget_id.clone(),
                reason: value.to_string(),
            },
            WidgetStateError::UnknownForm(_) | WidgetStateError::SubmitFailed { .. } => {
                Diagnostic::SendFailed {
                    reason: value.to_string(),
                }
            }
        }
    }
}

impl From<&CacheError> for Diagnostic {
    fn from(value: &CacheError) -> Self {
        let hash = match value {
            CacheError::FetchFailed { hash, .. } | CacheError::FetchTimeout { hash, .. } => {
                hash.clone()
            }
        };
        Diagnostic::CacheFetchFailed {
            hash,
            reason: value.to_string(),
        }
    }
}
