use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use study_room_client::api::{ApiClient, SessionUploader};
use study_room_client::config::ClientConfig;
use study_room_client::devices::MediaDevices;
use study_room_client::room::{resolve_self_id, Participants, RoomServices, RoomSessionController};
use study_room_client::rtc::RtcLinkFactory;
use study_room_client::session_store::FileSessionStore;
use study_room_client::signaling::WsConnector;
use study_room_client::telemetry;

#[cfg(feature = "capture")]
fn media_devices() -> Arc<dyn MediaDevices> {
    Arc::new(study_room_client::devices::CpalDevices)
}

#[cfg(not(feature = "capture"))]
fn media_devices() -> Arc<dyn MediaDevices> {
    Arc::new(study_room_client::devices::SyntheticDevices)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::parse();
    telemetry::init("study-room-client");

    let settings = config.room_settings();
    let api = Arc::new(
        ApiClient::init(config.api_url.as_str(), config.token.clone())
            .context("failed to build api client")?,
    );
    let links = RtcLinkFactory::new(&settings).context("failed to set up webrtc")?;
    let self_id = resolve_self_id(config.user_id.clone());

    let services = RoomServices {
        connector: Arc::new(WsConnector),
        links: Arc::new(links),
        devices: media_devices(),
        store: Arc::new(FileSessionStore::new(config.state_dir.clone())),
        uploader: Arc::clone(&api) as Arc<dyn SessionUploader>,
    };
    let mut room = RoomSessionController::new(
        config.room_id.as_str(),
        self_id.as_str(),
        config.signaling_url.as_str(),
        settings,
        services,
    );

    room.mount(None)
        .await
        .with_context(|| format!("failed to join room {}", config.room_id))?;
    let watcher = tokio::spawn(log_participants(room.participants()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("leaving room");
    room.on_before_unload();

    let report = room.leave().await?;
    watcher.abort();
    api.teardown();
    info!(
        upload = ?report.upload,
        detached = report.tracks.detached,
        failed = report.tracks.failed,
        connections = report.connections_closed,
        "session finished"
    );
    if report.tracks.failed > 0 {
        warn!(failed = report.tracks.failed, "some local tracks did not detach cleanly");
    }
    Ok(())
}

async fn log_participants(mut participants: watch::Receiver<Participants>) {
    while participants.changed().await.is_ok() {
        let (total, streaming) = {
            let current = participants.borrow();
            let streaming = current.remotes().filter(|p| p.stream.is_some()).count();
            (current.len(), streaming)
        };
        info!(total, streaming, "participants changed");
    }
}
