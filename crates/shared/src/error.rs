use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("failed to decode frame (seq {seq:?}): {reason}")]
    Decode { seq: Option<u64>, reason: String },
    #[error("failed to encode frame: {0}")]
    Encode(String),
}
