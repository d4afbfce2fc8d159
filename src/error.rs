//! Error types for the relay and the participant core.

use thiserror::Error;

/// Failures of the server-side room directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory is shut down")]
    ShutDown,

    #[error("connection {0} is already registered")]
    DuplicateConnection(String),
}

/// Failures while acquiring or composing local media.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture is not supported: {0}")]
    NotSupported(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no other cameras available to switch to ({available} found)")]
    NoAlternateCamera { available: usize },

    #[error("screen sharing was denied")]
    ScreenShareDenied,

    #[error("no microphone found")]
    NoMicrophone,

    #[error("unable to capture the video: {0}")]
    CaptureFailed(String),
}

/// Failures on a single peer link. Any of these tears that link down.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("malformed negotiation payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Failures of the WebSocket signaling client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("signaling connection closed")]
    Closed,

    #[error("unexpected handshake message: {0}")]
    Handshake(String),
}
