use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::media::{MediaConstraints, VideoConstraints};

const DEFAULT_ICE_SERVERS: [&str; 4] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
];

/// Command line / environment configuration for the headless client.
#[derive(Debug, Clone, Parser)]
#[command(name = "study-room-client", version, about = "Join a peer-to-peer study room")]
pub struct ClientConfig {
    /// Rendezvous server websocket URL
    #[arg(long, env = "STUDY_SIGNALING_URL", default_value = "wss://localhost/ws")]
    pub signaling_url: String,

    /// Base URL of the REST API used for recording uploads
    #[arg(long, env = "STUDY_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    #[arg(long, env = "STUDY_ROOM_ID")]
    pub room_id: String,

    /// Persisted user identity; a random id is generated when absent
    #[arg(long, env = "STUDY_USER_ID")]
    pub user_id: Option<String>,

    #[arg(long, env = "STUDY_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Directory holding the persisted room sessions
    #[arg(long, env = "STUDY_STATE_DIR", default_value = ".study-room")]
    pub state_dir: PathBuf,

    #[arg(long)]
    pub no_video: bool,

    #[arg(long)]
    pub no_recording: bool,
}

impl ClientConfig {
    pub fn room_settings(&self) -> RoomSettings {
        let mut settings = RoomSettings::default();
        if self.no_video {
            settings.constraints.video = None;
        }
        settings.recording = !self.no_recording;
        settings
    }
}

#[derive(Debug, Clone)]
pub struct SignalingSettings {
    /// Reconnect attempts after a transport failure; 0 disables reconnection.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect, doubled on every further attempt.
    pub reconnect_base_delay: Duration,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(1000),
        }
    }
}

impl SignalingSettings {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.reconnect_base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Timing of the reload-recovery attempts.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Upper bound (inclusive) of the random delay before each attempt.
    pub jitter: Duration,
    /// Poll interval while waiting for the coordinator to become ready.
    pub retry_interval: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            jitter: Duration::from_millis(1000),
            retry_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub ice_servers: Vec<String>,
    pub ice_candidate_pool_size: u8,
    pub constraints: MediaConstraints,
    pub recording: bool,
    pub signaling: SignalingSettings,
    pub reconnect: ReconnectSettings,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|url| url.to_string()).collect(),
            ice_candidate_pool_size: 10,
            constraints: MediaConstraints {
                audio: true,
                video: Some(VideoConstraints::default()),
            },
            recording: true,
            signaling: SignalingSettings::default(),
            reconnect: ReconnectSettings::default(),
        }
    }
}
