pub mod api;
pub mod config;
pub mod connection;
pub mod devices;
pub mod error;
pub mod media;
pub mod peer;
pub mod recording;
pub mod room;
pub mod rtc;
pub mod session_store;
pub mod signaling;
pub mod telemetry;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{AppError, Result};
pub use peer::{CoordinatorEvent, PeerConnectionCoordinator, TrackCleanup};
pub use room::{LeaveReport, RoomPhase, RoomServices, RoomSessionController, UploadOutcome};
pub use signaling::{Signal, SignalMessage, SignalingChannel};
