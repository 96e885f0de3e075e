use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),
    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Recording error: {0}")]
    Recording(#[from] webrtc::media::Error),
    #[error("Media device error: {0}")]
    Device(String),
    #[error("Signaling channel closed")]
    ChannelClosed,
    #[error("Room session is not active")]
    NotJoined,
    #[error("Unsupported session description type: {0}")]
    UnsupportedDescription(String),
    #[error("Upload rejected with status {status}: {body}")]
    UploadRejected { status: u16, body: String },
    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
