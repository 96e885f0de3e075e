//! In-process doubles for the transport, link, device and upload seams.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as frames;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::api::SessionUploader;
use crate::connection::ConnectionState;
use crate::devices::MediaDevices;
use crate::error::{AppError, Result};
use crate::media::{MediaConstraints, MediaStream, MediaTrack, TrackKind};
use crate::recording::RecordingArtifact;
use crate::rtc::{LinkEvent, LinkFactory, PeerLink, Role};
use crate::signaling::{
    Connector, FrameSink, FrameStream, IceCandidate, SdpKind, SessionDescription, SignalMessage,
    SignalSender,
};

/// A connector whose connections are held until the server starts accepting.
pub fn mock_transport() -> (MockConnector, MockServer) {
    let (accepting_tx, accepting_rx) = watch::channel(false);
    let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();
    (
        MockConnector {
            accepting: accepting_rx,
            sockets: sockets_tx,
        },
        MockServer {
            accepting: accepting_tx,
            sockets: tokio::sync::Mutex::new(sockets_rx),
        },
    )
}

pub struct MockConnector {
    accepting: watch::Receiver<bool>,
    sockets: mpsc::UnboundedSender<MockSocket>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<(FrameSink, FrameStream)> {
        let mut accepting = self.accepting.clone();
        while !*accepting.borrow() {
            accepting
                .changed()
                .await
                .map_err(|_| AppError::ChannelClosed)?;
        }

        let (client_tx, server_rx) = frames::unbounded::<String>();
        let (server_tx, client_rx) = frames::unbounded::<Result<String>>();
        self.sockets
            .send(MockSocket {
                incoming: server_rx,
                outgoing: server_tx,
            })
            .map_err(|_| AppError::ChannelClosed)?;

        let sink = client_tx.sink_map_err(|_| AppError::ChannelClosed);
        Ok((Box::pin(sink), Box::pin(client_rx)))
    }
}

pub struct MockServer {
    accepting: watch::Sender<bool>,
    sockets: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockSocket>>,
}

impl MockServer {
    pub fn accept_connections(&self) {
        self.accepting.send_replace(true);
    }

    /// Waits for the next client connection.
    pub async fn connection(&self) -> MockSocket {
        self.sockets
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }
}

/// Server end of one mock connection.
pub struct MockSocket {
    incoming: frames::UnboundedReceiver<String>,
    outgoing: frames::UnboundedSender<Result<String>>,
}

impl MockSocket {
    /// Next message sent by the client, `None` once it closed the connection.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        let text = self.incoming.next().await?;
        Some(serde_json::from_str(&text).expect("client sent malformed frame"))
    }

    pub fn push(&self, message: &SignalMessage) {
        let text = serde_json::to_string(message).expect("serializable message");
        self.push_raw(&text);
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.outgoing.unbounded_send(Ok(text.to_owned()));
    }

    /// Delivers a transport error to the client.
    pub fn fail(&self, reason: &str) {
        let error = AppError::Other(anyhow::anyhow!("{reason}"));
        let _ = self.outgoing.unbounded_send(Err(error));
    }
}

/// Captures outbound signals instead of sending them anywhere.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SignalMessage>>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }
}

impl SignalSender for RecordingSender {
    fn send(&self, message: SignalMessage) -> Result<()> {
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Hands out [`FakeLink`]s and remembers every one it created.
#[derive(Default)]
pub struct FakeLinkFactory {
    links: Mutex<Vec<Arc<FakeLink>>>,
    failing_detach: Mutex<HashSet<String>>,
}

impl FakeLinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Links created for `peer_id` from now on fail to detach tracks.
    pub fn fail_detach_for(&self, peer_id: &str) {
        self.failing_detach.lock().insert(peer_id.to_owned());
    }

    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().clone()
    }

    pub fn links_to(&self, peer_id: &str) -> Vec<Arc<FakeLink>> {
        self.links
            .lock()
            .iter()
            .filter(|link| link.peer_id == peer_id)
            .cloned()
            .collect()
    }

    pub fn count(&self, peer_id: &str, role: Role) -> usize {
        self.links_to(peer_id)
            .iter()
            .filter(|link| link.role == role)
            .count()
    }

    pub fn latest(&self, peer_id: &str) -> Option<Arc<FakeLink>> {
        self.links_to(peer_id).pop()
    }
}

#[async_trait]
impl LinkFactory for FakeLinkFactory {
    async fn create(
        &self,
        peer_id: &str,
        role: Role,
        local: Option<&MediaStream>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let tracks = local
            .map(|stream| stream.tracks().iter().map(|t| t.id().to_owned()).collect())
            .unwrap_or_default();
        let link = Arc::new(FakeLink {
            peer_id: peer_id.to_owned(),
            role,
            fail_detach: self.failing_detach.lock().contains(peer_id),
            tracks: Mutex::new(tracks),
            events,
            closed: AtomicBool::new(false),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
        });
        self.links.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

pub struct FakeLink {
    pub peer_id: String,
    pub role: Role,
    fail_detach: bool,
    tracks: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    closed: AtomicBool,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
}

impl FakeLink {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn attached_tracks(&self) -> Vec<String> {
        self.tracks.lock().clone()
    }

    pub fn emit_track(&self, track: MediaTrack) {
        let _ = self.events.send(LinkEvent::RemoteTrack(track));
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(LinkEvent::LocalCandidate(candidate));
    }

    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.events.send(LinkEvent::StateChanged(state));
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("offer-to-{}", self.peer_id),
        })
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.remote_descriptions.lock().push(offer);
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("answer-to-{}", self.peer_id),
        })
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        self.remote_descriptions.lock().push(answer);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn outgoing_tracks(&self) -> Vec<String> {
        self.tracks.lock().clone()
    }

    async fn detach_track(&self, track_id: &str) -> Result<()> {
        if self.fail_detach {
            return Err(AppError::Other(anyhow::anyhow!(
                "sender for {track_id} already gone"
            )));
        }
        self.tracks.lock().retain(|id| id != track_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Devices producing detached tracks; optionally refuses every request.
#[derive(Default)]
pub struct FakeDevices {
    fail: bool,
    acquisitions: AtomicUsize,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AppError::Device("camera permission denied".into()));
        }
        let stream = MediaStream::new("local");
        if constraints.audio {
            stream.add_track(MediaTrack::new("local-audio", TrackKind::Audio));
        }
        if constraints.video.is_some() {
            stream.add_track(MediaTrack::new("local-video", TrackKind::Video));
        }
        Ok(stream)
    }
}

/// Remembers `(room_id, content_type)` for every upload.
#[derive(Default)]
pub struct RecordingUploader {
    fail: bool,
    uploads: Mutex<Vec<(String, &'static str)>>,
}

impl RecordingUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn uploads(&self) -> Vec<(String, &'static str)> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl SessionUploader for RecordingUploader {
    async fn upload(&self, room_id: &str, artifact: RecordingArtifact) -> Result<()> {
        self.uploads
            .lock()
            .push((room_id.to_owned(), artifact.content_type));
        if self.fail {
            return Err(AppError::UploadRejected {
                status: 503,
                body: "storage unavailable".into(),
            });
        }
        Ok(())
    }
}

/// Polls `check` until it holds, panicking after roughly five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
