pub mod reconnect;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::SessionUploader;
use crate::config::RoomSettings;
use crate::devices::MediaDevices;
use crate::error::{AppError, Result};
use crate::media::{MediaStream, TrackKind};
use crate::peer::{CoordinatorEvent, PeerConnectionCoordinator, TrackCleanup};
use crate::recording::Recorder;
use crate::rtc::LinkFactory;
use crate::session_store::{PersistedParticipant, SessionStore};
use crate::signaling::{
    ChannelState, Connector, Signal, SignalMessage, SignalSender, SignalingChannel,
};

pub use self::state::{Participant, Participants};

const CHANNEL_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Idle,
    Acquiring,
    Joined,
    Leaving,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// Recording was disabled or captured nothing.
    Skipped,
    Failed(String),
}

/// What [`RoomSessionController::leave`] managed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveReport {
    pub upload: UploadOutcome,
    pub tracks: TrackCleanup,
    pub connections_closed: usize,
}

/// External collaborators of a room visit.
pub struct RoomServices {
    pub connector: Arc<dyn Connector>,
    pub links: Arc<dyn LinkFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub store: Arc<dyn SessionStore>,
    pub uploader: Arc<dyn SessionUploader>,
}

/// The persisted user id, or a random guest id when there is none.
pub fn resolve_self_id(user_id: Option<String>) -> String {
    match user_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => format!("guest-{}", Uuid::new_v4().simple()),
    }
}

#[derive(Clone)]
struct RoomContext {
    room_id: String,
    self_id: String,
    store: Arc<dyn SessionStore>,
    participants: Arc<watch::Sender<Participants>>,
}

impl RoomContext {
    fn persist(&self) {
        let snapshot: Vec<PersistedParticipant> = self.participants.borrow().to_persisted();
        match self.store.save(&self.room_id, &snapshot) {
            Ok(()) => debug!(room_id = %self.room_id, count = snapshot.len(), "participants persisted"),
            Err(e) => warn!(room_id = %self.room_id, error = %e, "failed to persist participants"),
        }
    }
}

struct ActiveSession {
    channel: Arc<SignalingChannel>,
    coordinator: Arc<PeerConnectionCoordinator>,
    local: MediaStream,
    recorder: Option<Recorder>,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSession {
    fn stop_tasks(&mut self) {
        self.cancel.send_replace(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// One visit to one room: local media, signaling, peer connections,
/// persistence and recording bound into a single lifecycle.
pub struct RoomSessionController {
    ctx: RoomContext,
    signaling_url: String,
    settings: RoomSettings,
    connector: Arc<dyn Connector>,
    links: Arc<dyn LinkFactory>,
    devices: Arc<dyn MediaDevices>,
    uploader: Arc<dyn SessionUploader>,
    phase: watch::Sender<RoomPhase>,
    session: Option<ActiveSession>,
}

impl RoomSessionController {
    pub fn new(
        room_id: impl Into<String>,
        self_id: impl Into<String>,
        signaling_url: impl Into<String>,
        settings: RoomSettings,
        services: RoomServices,
    ) -> Self {
        let (participants, _) = watch::channel(Participants::new());
        let (phase, _) = watch::channel(RoomPhase::Idle);
        Self {
            ctx: RoomContext {
                room_id: room_id.into(),
                self_id: self_id.into(),
                store: services.store,
                participants: Arc::new(participants),
            },
            signaling_url: signaling_url.into(),
            settings,
            connector: services.connector,
            links: services.links,
            devices: services.devices,
            uploader: services.uploader,
            phase,
            session: None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.ctx.room_id
    }

    pub fn self_id(&self) -> &str {
        &self.ctx.self_id
    }

    pub fn phase(&self) -> RoomPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RoomPhase> {
        self.phase.subscribe()
    }

    /// Live view of the participant set.
    pub fn participants(&self) -> watch::Receiver<Participants> {
        self.ctx.participants.subscribe()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.session.as_ref().map(|s| s.local.clone())
    }

    pub fn coordinator(&self) -> Option<Arc<PeerConnectionCoordinator>> {
        self.session.as_ref().map(|s| Arc::clone(&s.coordinator))
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.session.as_ref().map(|s| s.channel.state())
    }

    /// Enters the room. `provisioned` is a stream acquired by an earlier
    /// setup step; without one, devices are asked for a fresh stream. A
    /// device failure leaves the controller idle and is returned as is.
    pub async fn mount(&mut self, provisioned: Option<MediaStream>) -> Result<()> {
        if self.session.is_some() {
            debug!(room_id = %self.ctx.room_id, "room already mounted");
            return Ok(());
        }
        let room_id = self.ctx.room_id.clone();
        let self_id = self.ctx.self_id.clone();
        self.phase.send_replace(RoomPhase::Acquiring);

        let remembered = match self.ctx.store.load(&room_id) {
            Ok(saved) => saved.unwrap_or_default(),
            Err(e) => {
                warn!(%room_id, error = %e, "ignoring unreadable saved session");
                Vec::new()
            }
        };

        let local = match provisioned {
            Some(stream) => {
                debug!(stream = stream.id(), "using provisioned stream");
                stream
            }
            None => match self.devices.acquire(&self.settings.constraints).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%room_id, error = %e, "failed to acquire local media");
                    self.phase.send_replace(RoomPhase::Idle);
                    return Err(e);
                }
            },
        };

        // remembered peers stay listed until they leave or the room is left
        let attempts = reconnect::plan(
            &remembered,
            &self_id,
            self.settings.reconnect.jitter,
            &mut rand::thread_rng(),
        );
        self.ctx.participants.send_modify(|p| {
            p.upsert(Participant::local(self_id.as_str(), local.clone()));
            for attempt in &attempts {
                p.insert_remote(&attempt.peer_id);
            }
        });
        self.ctx.persist();

        let recorder = self
            .settings
            .recording
            .then(|| Recorder::start(&local, self.settings.constraints.video));

        let (channel, inbound) = SignalingChannel::open(
            Arc::clone(&self.connector),
            self.signaling_url.as_str(),
            self_id.as_str(),
            self.settings.signaling.clone(),
        );
        let channel = Arc::new(channel);
        let (coordinator, events) = PeerConnectionCoordinator::new(
            self_id.as_str(),
            Arc::clone(&channel) as Arc<dyn SignalSender>,
            Arc::clone(&self.links),
        );
        let coordinator = Arc::new(coordinator);
        coordinator.set_local_stream(local.clone());

        let (cancel, cancel_rx) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(run_event_loop(
            self.ctx.clone(),
            Arc::clone(&coordinator),
            inbound,
            events,
        ))];

        if let Err(e) = channel.send(SignalMessage::broadcast(self_id.as_str(), Signal::Join)) {
            warn!(%room_id, error = %e, "failed to queue join");
        }

        tasks.extend(reconnect::spawn(
            attempts,
            Arc::clone(&coordinator),
            self.settings.reconnect.retry_interval,
            cancel_rx,
        ));

        self.session = Some(ActiveSession {
            channel,
            coordinator,
            local,
            recorder,
            cancel,
            tasks,
        });
        self.phase.send_replace(RoomPhase::Joined);
        info!(%room_id, %self_id, "joined room");
        Ok(())
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Video, enabled);
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(session) = &self.session {
            session.local.set_enabled(kind, enabled);
            debug!(?kind, enabled, "local track toggled");
        }
    }

    pub fn on_before_unload(&self) {
        self.ctx.persist();
    }

    pub fn on_visibility_hidden(&self) {
        self.ctx.persist();
    }

    /// Leaves the room and releases everything the visit acquired. Upload
    /// failures are reported in the result, never returned as errors.
    pub async fn leave(&mut self) -> Result<LeaveReport> {
        let Some(mut session) = self.session.take() else {
            return Err(AppError::NotJoined);
        };
        let room_id = self.ctx.room_id.clone();
        self.phase.send_replace(RoomPhase::Leaving);
        session.stop_tasks();

        let upload = match session.recorder.take() {
            Some(recorder) => match recorder.stop().await {
                Some(artifact) => match self.uploader.upload(&room_id, artifact).await {
                    Ok(()) => UploadOutcome::Uploaded,
                    Err(e) => {
                        warn!(%room_id, error = %e, "recording upload failed");
                        UploadOutcome::Failed(e.to_string())
                    }
                },
                None => UploadOutcome::Skipped,
            },
            None => UploadOutcome::Skipped,
        };

        let tracks = session.coordinator.remove_local_tracks().await;
        session.local.stop_all();
        self.ctx.participants.send_modify(Participants::clear);
        let connections_closed = session.coordinator.close_all_connections().await;

        let leave = SignalMessage::broadcast(self.ctx.self_id.as_str(), Signal::Leave);
        if let Err(e) = session.channel.send(leave) {
            warn!(%room_id, error = %e, "failed to send leave");
        }
        session.channel.close();
        if tokio::time::timeout(CHANNEL_CLOSE_TIMEOUT, session.channel.closed())
            .await
            .is_err()
        {
            warn!(%room_id, "signaling channel did not close in time");
        }

        if let Err(e) = self.ctx.store.remove(&room_id) {
            warn!(%room_id, error = %e, "failed to clear saved session");
        }

        self.phase.send_replace(RoomPhase::Idle);
        info!(%room_id, ?upload, connections_closed, "left room");
        Ok(LeaveReport {
            upload,
            tracks,
            connections_closed,
        })
    }
}

impl Drop for RoomSessionController {
    fn drop(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.stop_tasks();
        }
    }
}

async fn run_event_loop(
    ctx: RoomContext,
    coordinator: Arc<PeerConnectionCoordinator>,
    mut inbound: mpsc::UnboundedReceiver<SignalMessage>,
    mut events: mpsc::UnboundedReceiver<CoordinatorEvent>,
) {
    loop {
        tokio::select! {
            Some(message) = inbound.recv() => handle_inbound(&ctx, &coordinator, message).await,
            Some(event) = events.recv() => handle_event(&ctx, event),
            else => break,
        }
    }
    debug!(room_id = %ctx.room_id, "room event loop finished");
}

async fn handle_inbound(
    ctx: &RoomContext,
    coordinator: &PeerConnectionCoordinator,
    message: SignalMessage,
) {
    if message.is_addressed_to(&ctx.self_id) {
        let peer_id = message.sender_id.as_str();
        let changed = match message.signal {
            Signal::Join | Signal::Offer { .. } => {
                ctx.participants.send_if_modified(|p| p.insert_remote(peer_id))
            }
            Signal::Leave => ctx.participants.send_if_modified(|p| p.remove(peer_id).is_some()),
            Signal::Answer { .. } | Signal::Ice { .. } => false,
        };
        if changed {
            ctx.persist();
        }
    }

    let kind = message.signal.name();
    let sender = message.sender_id.clone();
    if let Err(e) = coordinator.handle_signal(message).await {
        warn!(peer_id = %sender, kind, error = %e, "failed to handle signal");
    }
}

fn handle_event(ctx: &RoomContext, event: CoordinatorEvent) {
    match event {
        CoordinatorEvent::RemoteStream { peer_id, stream } => {
            if !ctx.participants.borrow().contains(&peer_id) {
                debug!(%peer_id, "dropping stream of a departed peer");
                return;
            }
            debug!(%peer_id, tracks = stream.track_count(), "remote stream updated");
            if ctx.participants.send_if_modified(|p| p.set_stream(&peer_id, stream)) {
                ctx.persist();
            } else {
                // same container, new tracks: still notify watchers
                ctx.participants.send_modify(|_| {});
            }
        }
        CoordinatorEvent::StateChanged { peer_id, state } => {
            debug!(%peer_id, %state, "peer connection state");
        }
    }
}
