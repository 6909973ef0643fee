use serde::{Deserialize, Serialize};

use crate::{
    domain::{FormId, MessageHash, SessionId},
    error::ProtocolError,
    widget::{WidgetDeclaration, WidgetState},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFinishStatus {
    #[default]
    Success,
    Error,
    InterruptedForRerun,
}

impl ScriptFinishStatus {
    /// Whether the run reached its end, i.e. marks a cache generation boundary.
    pub fn is_completed(self) -> bool {
        matches!(self, ScriptFinishStatus::Success | ScriptFinishStatus::Error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub cacheable: bool,
    /// Location of the rendered element in the page tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delta_path: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HostMessage {
    SessionReady {
        session_id: SessionId,
        #[serde(default)]
        widget_states_invalid: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_cached_message_age: Option<u32>,
    },
    ScriptStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    Render {
        element: serde_json::Value,
    },
    WidgetDeclared(WidgetDeclaration),
    FormDeclared {
        form_id: FormId,
        #[serde(default)]
        clear_on_submit: bool,
        #[serde(default)]
        has_submit_button: bool,
    },
    ScriptFinished {
        #[serde(default)]
        status: ScriptFinishStatus,
    },
    SessionShutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HostBody {
    Message(HostMessage),
    Reference(MessageHash),
}

/// One framed host→client unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEnvelope {
    pub seq: u64,
    #[serde(default)]
    pub metadata: MessageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<MessageHash>,
    pub body: HostBody,
}

impl HostEnvelope {
    pub fn message(seq: u64, message: HostMessage) -> Self {
        Self {
            seq,
            metadata: MessageMetadata::default(),
            hash: None,
            body: HostBody::Message(message),
        }
    }

    pub fn cacheable(seq: u64, hash: MessageHash, message: HostMessage) -> Self {
        Self {
            seq,
            metadata: MessageMetadata {
                cacheable: true,
                delta_path: Vec::new(),
            },
            hash: Some(hash),
            body: HostBody::Message(message),
        }
    }

    pub fn reference(seq: u64, hash: MessageHash) -> Self {
        Self {
            seq,
            metadata: MessageMetadata::default(),
            hash: None,
            body: HostBody::Reference(hash),
        }
    }

    pub fn with_delta_path(mut self, delta_path: Vec<u32>) -> Self {
        self.metadata.delta_path = delta_path;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_session_id: Option<SessionId>,
    },
    CachedHashes {
        hashes: Vec<MessageHash>,
    },
    WidgetStatesChanged {
        widgets: Vec<WidgetState>,
    },
    FormSubmitted {
        form_id: FormId,
        widgets: Vec<WidgetState>,
    },
}

#[derive(Deserialize)]
struct SequenceOnly {
    seq: u64,
}

pub fn decode_host_frame(bytes: &[u8]) -> Result<HostEnvelope, ProtocolError> {
    serde_json::from_slice::<HostEnvelope>(bytes).map_err(|err| ProtocolError::Decode {
        // Frames that are otherwise unreadable may still expose their slot.
        seq: serde_json::from_slice::<SequenceOnly>(bytes)
            .ok()
            .map(|header| header.seq),
        reason: err.to_string(),
    })
}

pub fn encode_host_frame(envelope: &HostEnvelope) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(envelope).map_err(|err| ProtocolError::Encode(err.to_string()))
}

pub fn decode_client_frame(bytes: &[u8]) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|err| ProtocolError::Decode {
        seq: None,
        reason: err.to_string(),
    })
}

pub fn encode_client_frame(message: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(message).map_err(|err| ProtocolError::Encode(err.to_string()))
}
