use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionMonitor, ConnectionState, ConnectionStatus};
use crate::error::Result;
use crate::media::MediaStream;
use crate::rtc::{LinkEvent, LinkFactory, PeerLink, Role};
use crate::signaling::{IceCandidate, SessionDescription, Signal, SignalMessage, SignalSender};

/// Notifications for the room layer.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// New tracks arrived for `peer_id`. `stream` is the same container on
    /// every notification for that peer and accumulates all of its tracks.
    RemoteStream { peer_id: String, stream: MediaStream },
    StateChanged {
        peer_id: String,
        state: ConnectionState,
    },
}

/// Outcome of [`PeerConnectionCoordinator::remove_local_tracks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackCleanup {
    pub detached: usize,
    pub failed: usize,
}

struct PeerEntry {
    role: Role,
    link: Arc<dyn PeerLink>,
    remote: MediaStream,
    monitor: ConnectionMonitor,
    /// The remote description has been applied.
    negotiated: bool,
    pump: JoinHandle<()>,
}

impl PeerEntry {
    async fn shutdown(self, peer_id: &str) {
        self.remote.stop_all();
        if let Err(e) = self.link.close().await {
            warn!(peer_id, error = %e, "failed to close peer connection");
        }
    }
}

impl Drop for PeerEntry {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Owns one media connection per remote peer, keyed by peer id.
///
/// The table lock is held for the whole of each operation, so negotiation
/// steps for the same peer never interleave and at most one entry exists
/// per peer.
pub struct PeerConnectionCoordinator {
    self_id: String,
    signaling: Arc<dyn SignalSender>,
    factory: Arc<dyn LinkFactory>,
    local: RwLock<Option<MediaStream>>,
    peers: Mutex<HashMap<String, PeerEntry>>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl PeerConnectionCoordinator {
    pub fn new(
        self_id: impl Into<String>,
        signaling: Arc<dyn SignalSender>,
        factory: Arc<dyn LinkFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            self_id: self_id.into(),
            signaling,
            factory,
            local: RwLock::new(None),
            peers: Mutex::new(HashMap::new()),
            events,
        };
        (coordinator, events_rx)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Stream attached to connections created from now on. Existing
    /// connections keep whatever they were created with.
    pub fn set_local_stream(&self, stream: MediaStream) {
        debug!(stream = stream.id(), "local stream set");
        *self.local.write() = Some(stream);
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local.read().clone()
    }

    /// Ready once a local stream is available to attach.
    pub fn is_ready(&self) -> bool {
        self.local.read().is_some()
    }

    /// Opens an offering connection to `peer_id` unless one already exists.
    pub async fn create_connection_with(&self, peer_id: &str) -> Result<()> {
        if peer_id == self.self_id {
            return Ok(());
        }
        let mut peers = self.peers.lock().await;
        if peers.contains_key(peer_id) {
            trace!(peer_id, "connection already exists");
            return Ok(());
        }

        let entry = self.open_entry(peer_id, Role::Offerer).await?;
        let link = Arc::clone(&entry.link);
        peers.insert(peer_id.to_owned(), entry);

        if let Err(e) = self.send_offer(peer_id, link.as_ref()).await {
            if let Some(entry) = peers.remove(peer_id) {
                entry.shutdown(peer_id).await;
            }
            return Err(e);
        }
        info!(peer_id, "offer sent");
        Ok(())
    }

    async fn send_offer(&self, peer_id: &str, link: &dyn PeerLink) -> Result<()> {
        let offer = link.create_offer().await?;
        self.signaling.send(SignalMessage::to(
            self.self_id.as_str(),
            peer_id,
            Signal::Offer { offer },
        ))
    }

    /// Applies one inbound signaling message.
    pub async fn handle_signal(&self, message: SignalMessage) -> Result<()> {
        if message.sender_id == self.self_id {
            return Ok(());
        }
        if !message.is_addressed_to(&self.self_id) {
            trace!(
                sender = %message.sender_id,
                target = ?message.target_id,
                "signal addressed to another peer"
            );
            return Ok(());
        }

        let peer_id = message.sender_id;
        debug!(%peer_id, kind = message.signal.name(), "handling signal");
        match message.signal {
            Signal::Join => self.create_connection_with(&peer_id).await,
            Signal::Offer { offer } => self.answer_offer(&peer_id, offer).await,
            Signal::Answer { answer } => self.complete_negotiation(&peer_id, answer).await,
            Signal::Ice { candidate } => self.add_remote_candidate(&peer_id, candidate).await,
            Signal::Leave => {
                self.remove_connection(&peer_id).await;
                Ok(())
            }
        }
    }

    async fn answer_offer(&self, peer_id: &str, offer: SessionDescription) -> Result<()> {
        let mut peers = self.peers.lock().await;

        let glare = matches!(
            peers.get(peer_id),
            Some(entry) if entry.role == Role::Offerer && !entry.negotiated
        );
        if glare {
            if self.self_id.as_str() < peer_id {
                debug!(peer_id, "simultaneous offers, keeping ours");
                return Ok(());
            }
            debug!(peer_id, "simultaneous offers, yielding to theirs");
            if let Some(entry) = peers.remove(peer_id) {
                entry.shutdown(peer_id).await;
            }
        }

        let created = !peers.contains_key(peer_id);
        if created {
            let entry = self.open_entry(peer_id, Role::Answerer).await?;
            peers.insert(peer_id.to_owned(), entry);
        }
        let Some(entry) = peers.get_mut(peer_id) else {
            return Ok(());
        };
        let link = Arc::clone(&entry.link);

        let result = async {
            let answer = link.accept_offer(offer).await?;
            self.signaling.send(SignalMessage::to(
                self.self_id.as_str(),
                peer_id,
                Signal::Answer { answer },
            ))
        }
        .await;

        match result {
            Ok(()) => {
                entry.negotiated = true;
                info!(peer_id, "answer sent");
                Ok(())
            }
            Err(e) => {
                if created {
                    if let Some(entry) = peers.remove(peer_id) {
                        entry.shutdown(peer_id).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn complete_negotiation(&self, peer_id: &str, answer: SessionDescription) -> Result<()> {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(peer_id) {
            Some(entry) if entry.role == Role::Offerer => {
                entry.link.accept_answer(answer).await?;
                entry.negotiated = true;
                info!(peer_id, "negotiation complete");
            }
            Some(_) => debug!(peer_id, "ignoring answer for a connection we did not offer"),
            None => debug!(peer_id, "ignoring answer from unknown peer"),
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        let peers = self.peers.lock().await;
        match peers.get(peer_id) {
            Some(entry) => entry.link.add_ice_candidate(candidate).await,
            None => {
                debug!(peer_id, "dropping candidate from unknown peer");
                Ok(())
            }
        }
    }

    /// Tears down the connection to `peer_id`. Returns whether one existed.
    pub async fn remove_connection(&self, peer_id: &str) -> bool {
        let entry = self.peers.lock().await.remove(peer_id);
        match entry {
            Some(entry) => {
                entry.shutdown(peer_id).await;
                info!(peer_id, "peer connection removed");
                true
            }
            None => false,
        }
    }

    pub async fn close_all_connections(&self) -> usize {
        let drained: Vec<_> = self.peers.lock().await.drain().collect();
        let count = drained.len();
        for (peer_id, entry) in drained {
            entry.shutdown(&peer_id).await;
        }
        info!(count, "all peer connections closed");
        count
    }

    /// Detaches and stops the local tracks sent on every connection. A track
    /// that fails to detach is logged and counted, never propagated.
    pub async fn remove_local_tracks(&self) -> TrackCleanup {
        let peers = self.peers.lock().await;
        let mut cleanup = TrackCleanup::default();
        for (peer_id, entry) in peers.iter() {
            for track_id in entry.link.outgoing_tracks().await {
                match entry.link.detach_track(&track_id).await {
                    Ok(()) => cleanup.detached += 1,
                    Err(e) => {
                        warn!(%peer_id, %track_id, error = %e, "failed to detach local track");
                        cleanup.failed += 1;
                    }
                }
            }
        }
        debug!(
            detached = cleanup.detached,
            failed = cleanup.failed,
            "local tracks removed"
        );
        cleanup
    }

    pub async fn connection_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn has_connection(&self, peer_id: &str) -> bool {
        self.peers.lock().await.contains_key(peer_id)
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.peers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn role_of(&self, peer_id: &str) -> Option<Role> {
        self.peers.lock().await.get(peer_id).map(|entry| entry.role)
    }

    pub async fn remote_stream(&self, peer_id: &str) -> Option<MediaStream> {
        self.peers
            .lock()
            .await
            .get(peer_id)
            .map(|entry| entry.remote.clone())
    }

    /// Remote streams that have received at least one track.
    pub async fn remote_streams(&self) -> HashMap<String, MediaStream> {
        self.peers
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.remote.track_count() > 0)
            .map(|(id, entry)| (id.clone(), entry.remote.clone()))
            .collect()
    }

    pub async fn connection_status(&self, peer_id: &str) -> Option<ConnectionStatus> {
        self.peers
            .lock()
            .await
            .get(peer_id)
            .map(|entry| entry.monitor.current())
    }

    async fn open_entry(&self, peer_id: &str, role: Role) -> Result<PeerEntry> {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let local = self.local_stream();
        let link = self
            .factory
            .create(peer_id, role, local.as_ref(), link_tx)
            .await?;

        let remote = MediaStream::new(format!("remote-{peer_id}"));
        let monitor = ConnectionMonitor::new();
        let pump = tokio::spawn(pump_link_events(
            LinkContext {
                self_id: self.self_id.clone(),
                peer_id: peer_id.to_owned(),
                signaling: Arc::clone(&self.signaling),
                remote: remote.clone(),
                monitor: monitor.clone(),
                events: self.events.clone(),
            },
            link_rx,
        ));

        debug!(peer_id, ?role, with_local = local.is_some(), "peer entry created");
        Ok(PeerEntry {
            role,
            link,
            remote,
            monitor,
            negotiated: false,
            pump,
        })
    }
}

struct LinkContext {
    self_id: String,
    peer_id: String,
    signaling: Arc<dyn SignalSender>,
    remote: MediaStream,
    monitor: ConnectionMonitor,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

async fn pump_link_events(ctx: LinkContext, mut link_events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = link_events.recv().await {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let message = SignalMessage::to(
                    ctx.self_id.as_str(),
                    ctx.peer_id.as_str(),
                    Signal::Ice { candidate },
                );
                if let Err(e) = ctx.signaling.send(message) {
                    warn!(peer_id = %ctx.peer_id, error = %e, "failed to send local candidate");
                }
            }
            LinkEvent::RemoteTrack(track) => {
                let kind = track.kind();
                if ctx.remote.add_track(track) {
                    debug!(peer_id = %ctx.peer_id, ?kind, "remote track added");
                    let _ = ctx.events.send(CoordinatorEvent::RemoteStream {
                        peer_id: ctx.peer_id.clone(),
                        stream: ctx.remote.clone(),
                    });
                }
            }
            LinkEvent::StateChanged(state) => {
                if state == ConnectionState::Failed {
                    ctx.monitor.set_error(format!("connection to {} failed", ctx.peer_id));
                } else {
                    ctx.monitor.update_state(state);
                }
                let _ = ctx.events.send(CoordinatorEvent::StateChanged {
                    peer_id: ctx.peer_id.clone(),
                    state,
                });
            }
        }
    }
    trace!(peer_id = %ctx.peer_id, "link event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use crate::signaling::SdpKind;
    use crate::testing::{eventually, FakeLinkFactory, RecordingSender};

    struct Harness {
        coordinator: PeerConnectionCoordinator,
        events: mpsc::UnboundedReceiver<CoordinatorEvent>,
        sender: Arc<RecordingSender>,
        factory: Arc<FakeLinkFactory>,
    }

    fn harness(self_id: &str) -> Harness {
        let sender = RecordingSender::new();
        let factory = FakeLinkFactory::new();
        let (coordinator, events) =
            PeerConnectionCoordinator::new(self_id, sender.clone(), factory.clone());
        coordinator.set_local_stream(MediaStream::with_tracks(
            "local",
            vec![
                MediaTrack::new("mic", TrackKind::Audio),
                MediaTrack::new("cam", TrackKind::Video),
            ],
        ));
        Harness {
            coordinator,
            events,
            sender,
            factory,
        }
    }

    fn description(kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: "v=0".into(),
        }
    }

    fn from(sender: &str, signal: Signal) -> SignalMessage {
        SignalMessage::broadcast(sender, signal)
    }

    #[tokio::test]
    async fn repeated_create_and_join_keep_one_connection() {
        let h = harness("a");
        h.coordinator.create_connection_with("b").await.unwrap();
        h.coordinator.create_connection_with("b").await.unwrap();
        h.coordinator.handle_signal(from("b", Signal::Join)).await.unwrap();
        h.coordinator.handle_signal(from("b", Signal::Join)).await.unwrap();

        assert_eq!(h.coordinator.connection_count().await, 1);
        assert_eq!(h.factory.links().len(), 1);

        let sent = h.sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target_id.as_deref(), Some("b"));
        assert!(matches!(sent[0].signal, Signal::Offer { .. }));
    }

    #[tokio::test]
    async fn offer_creates_answering_connection() {
        let h = harness("a");
        h.coordinator
            .handle_signal(from("b", Signal::Offer { offer: description(SdpKind::Offer) }))
            .await
            .unwrap();

        assert_eq!(h.coordinator.role_of("b").await, Some(Role::Answerer));
        let link = h.factory.latest("b").unwrap();
        assert_eq!(link.remote_descriptions().len(), 1);
        assert_eq!(link.attached_tracks(), ["mic", "cam"]);

        let sent = h.sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target_id.as_deref(), Some("b"));
        assert!(matches!(
            &sent[0].signal,
            Signal::Answer { answer } if answer.kind == SdpKind::Answer
        ));
    }

    #[tokio::test]
    async fn answers_only_complete_our_own_offers() {
        let h = harness("a");
        let answer = || Signal::Answer {
            answer: description(SdpKind::Answer),
        };

        h.coordinator.handle_signal(from("ghost", answer())).await.unwrap();
        assert_eq!(h.coordinator.connection_count().await, 0);

        h.coordinator.create_connection_with("b").await.unwrap();
        h.coordinator.handle_signal(from("b", answer())).await.unwrap();
        let link = h.factory.latest("b").unwrap();
        assert_eq!(link.remote_descriptions().len(), 1);
    }

    #[tokio::test]
    async fn candidates_reach_known_peers_only() {
        let h = harness("a");
        let ice = || Signal::Ice {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.2 4000 typ host".into(),
                ..Default::default()
            },
        };

        h.coordinator.handle_signal(from("ghost", ice())).await.unwrap();
        assert!(!h.coordinator.has_connection("ghost").await);
        assert!(h.factory.links().is_empty());

        h.coordinator.create_connection_with("b").await.unwrap();
        h.coordinator.handle_signal(from("b", ice())).await.unwrap();
        assert_eq!(h.factory.latest("b").unwrap().candidates().len(), 1);
    }

    #[tokio::test]
    async fn signals_for_other_peers_are_ignored() {
        let h = harness("a");
        h.coordinator
            .handle_signal(SignalMessage::to("b", "c", Signal::Join))
            .await
            .unwrap();
        assert_eq!(h.coordinator.connection_count().await, 0);
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn glare_lower_id_keeps_offering() {
        let h = harness("a");
        h.coordinator.create_connection_with("b").await.unwrap();
        h.sender.take();

        h.coordinator
            .handle_signal(from("b", Signal::Offer { offer: description(SdpKind::Offer) }))
            .await
            .unwrap();

        assert_eq!(h.coordinator.role_of("b").await, Some(Role::Offerer));
        assert!(h.sender.sent().is_empty());
        assert_eq!(h.factory.links().len(), 1);
    }

    #[tokio::test]
    async fn glare_higher_id_yields_and_answers() {
        let h = harness("c");
        h.coordinator.create_connection_with("b").await.unwrap();
        h.sender.take();
        let first = h.factory.latest("b").unwrap();

        h.coordinator
            .handle_signal(from("b", Signal::Offer { offer: description(SdpKind::Offer) }))
            .await
            .unwrap();

        assert!(first.is_closed());
        assert_eq!(h.coordinator.role_of("b").await, Some(Role::Answerer));
        assert_eq!(h.coordinator.connection_count().await, 1);
        let sent = h.sender.take();
        assert!(matches!(sent.as_slice(), [m] if matches!(m.signal, Signal::Answer { .. })));
    }

    #[tokio::test]
    async fn leave_and_removal_are_idempotent() {
        let h = harness("a");
        h.coordinator.create_connection_with("b").await.unwrap();
        h.coordinator.handle_signal(from("b", Signal::Leave)).await.unwrap();
        assert!(h.factory.latest("b").unwrap().is_closed());
        assert!(!h.coordinator.remove_connection("b").await);
        assert_eq!(h.coordinator.connection_count().await, 0);
    }

    #[tokio::test]
    async fn close_all_leaves_nothing_behind() {
        for n in [0usize, 1, 5] {
            let h = harness("a");
            for i in 0..n {
                let peer = format!("p{i}");
                h.coordinator.create_connection_with(&peer).await.unwrap();
                h.factory
                    .latest(&peer)
                    .unwrap()
                    .emit_track(MediaTrack::new(format!("{peer}-audio"), TrackKind::Audio));
            }
            assert_eq!(h.coordinator.close_all_connections().await, n);
            assert_eq!(h.coordinator.connection_count().await, 0);
            assert!(h.coordinator.remote_streams().await.is_empty());
            assert!(h.factory.links().iter().all(|link| link.is_closed()));
        }
    }

    #[tokio::test]
    async fn one_failing_connection_does_not_block_track_cleanup() {
        let h = harness("a");
        h.factory.fail_detach_for("p1");
        for peer in ["p0", "p1", "p2"] {
            h.coordinator.create_connection_with(peer).await.unwrap();
        }

        let cleanup = h.coordinator.remove_local_tracks().await;

        assert_eq!(cleanup, TrackCleanup { detached: 4, failed: 2 });
        assert!(h.factory.latest("p0").unwrap().attached_tracks().is_empty());
        assert!(h.factory.latest("p2").unwrap().attached_tracks().is_empty());
        assert_eq!(h.factory.latest("p1").unwrap().attached_tracks().len(), 2);
    }

    #[tokio::test]
    async fn remote_tracks_accumulate_in_one_stream() {
        let mut h = harness("a");
        h.coordinator.create_connection_with("b").await.unwrap();
        let link = h.factory.latest("b").unwrap();

        link.emit_track(MediaTrack::new("b-audio", TrackKind::Audio));
        link.emit_track(MediaTrack::new("b-video", TrackKind::Video));

        let mut streams = Vec::new();
        while streams.len() < 2 {
            if let Some(CoordinatorEvent::RemoteStream { peer_id, stream }) = h.events.recv().await {
                assert_eq!(peer_id, "b");
                streams.push(stream);
            }
        }
        assert!(streams[0].same_as(&streams[1]));
        assert_eq!(streams[1].track_count(), 2);
        let current = h.coordinator.remote_stream("b").await.unwrap();
        assert!(current.same_as(&streams[0]));
    }

    #[tokio::test]
    async fn local_candidates_and_state_are_forwarded() {
        let h = harness("a");
        h.coordinator.create_connection_with("b").await.unwrap();
        h.sender.take();
        let link = h.factory.latest("b").unwrap();

        link.emit_candidate(IceCandidate {
            candidate: "candidate:2 1 udp 1 10.0.0.1 5000 typ host".into(),
            ..Default::default()
        });
        link.emit_state(ConnectionState::Failed);

        let sender = &*h.sender;
        eventually(move || async move { !sender.sent().is_empty() }).await;
        let sent = h.sender.take();
        assert_eq!(sent[0].target_id.as_deref(), Some("b"));
        assert!(matches!(sent[0].signal, Signal::Ice { .. }));

        let coordinator = &h.coordinator;
        eventually(move || async move {
            coordinator
                .connection_status("b")
                .await
                .is_some_and(|status| status.state == ConnectionState::Failed)
        })
        .await;
        let status = h.coordinator.connection_status("b").await.unwrap();
        assert!(status.last_error.is_some());
    }
}
