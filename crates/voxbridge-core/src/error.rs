use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoxBridgeError {
    #[error("Config error: {0}")]
    Config(String),

    /// Malformed envelope or payload encoding. Never retried.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Publish, consume, or acknowledgement failure on the broker.
    #[error("Transport error: {0}")]
    Transport(String),

    /// External recognition/synthesis call failed or returned a non-success status.
    #[error("Endpoint error: {0}")]
    Endpoint(String),

    #[error("Wait cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxBridgeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for VoxBridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<base64::DecodeError> for VoxBridgeError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Codec(format!("invalid base64: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, VoxBridgeError>;
