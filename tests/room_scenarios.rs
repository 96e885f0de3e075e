use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use study_room_client::config::RoomSettings;
use study_room_client::peer::PeerConnectionCoordinator;
use study_room_client::recording::AUDIO_CONTENT_TYPE;
use study_room_client::room::{RoomPhase, RoomServices, RoomSessionController, UploadOutcome};
use study_room_client::rtc::Role;
use study_room_client::session_store::{MemorySessionStore, PersistedParticipant, SessionStore};
use study_room_client::signaling::{IceCandidate, Signal, SignalMessage};
use study_room_client::testing::{
    eventually, mock_transport, FakeDevices, FakeLinkFactory, MockServer, RecordingSender,
    RecordingUploader,
};

struct Fixture {
    room: RoomSessionController,
    server: MockServer,
    links: Arc<FakeLinkFactory>,
    store: Arc<MemorySessionStore>,
    uploader: Arc<RecordingUploader>,
}

fn fixture(self_id: &str, uploader: Arc<RecordingUploader>) -> Fixture {
    fixture_with_store(self_id, uploader, Arc::new(MemorySessionStore::new()))
}

fn fixture_with_store(
    self_id: &str,
    uploader: Arc<RecordingUploader>,
    store: Arc<MemorySessionStore>,
) -> Fixture {
    let (connector, server) = mock_transport();
    let links = FakeLinkFactory::new();
    let room = RoomSessionController::new(
        "r1",
        self_id,
        "ws://mock/ws",
        RoomSettings::default(),
        RoomServices {
            connector: Arc::new(connector),
            links: links.clone(),
            devices: FakeDevices::new(),
            store: store.clone(),
            uploader: uploader.clone(),
        },
    );
    Fixture {
        room,
        server,
        links,
        store,
        uploader,
    }
}

#[tokio::test]
async fn two_peers_negotiate_one_connection_each() {
    let a_out = RecordingSender::new();
    let b_out = RecordingSender::new();
    let a_links = FakeLinkFactory::new();
    let b_links = FakeLinkFactory::new();
    let (a, _a_events) = PeerConnectionCoordinator::new("a", a_out.clone(), a_links.clone());
    let (b, _b_events) = PeerConnectionCoordinator::new("b", b_out.clone(), b_links.clone());

    // a announces itself, b offers
    b.handle_signal(SignalMessage::broadcast("a", Signal::Join))
        .await
        .unwrap();
    let offers = b_out.take();
    assert!(matches!(offers.as_slice(), [m] if matches!(m.signal, Signal::Offer { .. })));

    for message in offers {
        a.handle_signal(message).await.unwrap();
    }
    let answers = a_out.take();
    assert!(matches!(answers.as_slice(), [m] if matches!(m.signal, Signal::Answer { .. })));

    for message in answers {
        b.handle_signal(message).await.unwrap();
    }

    assert_eq!(a.peer_ids().await, ["b"]);
    assert_eq!(b.peer_ids().await, ["a"]);
    assert_eq!(a.role_of("b").await, Some(Role::Answerer));
    assert_eq!(b.role_of("a").await, Some(Role::Offerer));
    assert_eq!(b_links.latest("a").unwrap().remote_descriptions().len(), 1);

    let ghost_ice = || {
        SignalMessage::broadcast(
            "ghost",
            Signal::Ice {
                candidate: IceCandidate {
                    candidate: "candidate:9 1 udp 1 10.9.9.9 9999 typ host".into(),
                    ..Default::default()
                },
            },
        )
    };
    a.handle_signal(ghost_ice()).await.unwrap();
    b.handle_signal(ghost_ice()).await.unwrap();
    assert_eq!(a.connection_count().await, 1);
    assert_eq!(b.connection_count().await, 1);
    assert!(a_links.links_to("ghost").is_empty());
    assert!(b_links.links_to("ghost").is_empty());
}

#[tokio::test(start_paused = true)]
async fn reload_reconnects_to_remembered_remote_peers_only() {
    let mut f = fixture("u1", RecordingUploader::new());
    f.store
        .save(
            "r1",
            &[
                PersistedParticipant {
                    id: "u1".into(),
                    is_local: true,
                },
                PersistedParticipant {
                    id: "u2".into(),
                    is_local: false,
                },
            ],
        )
        .unwrap();

    f.room.mount(None).await.unwrap();

    let links = &*f.links;
    eventually(move || async move { links.count("u2", Role::Offerer) == 1 }).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(f.links.links_to("u2").len(), 1);
    assert!(f.links.links_to("u1").is_empty());
    assert_eq!(f.room.coordinator().unwrap().peer_ids().await, ["u2"]);
}

fn saved_ids(store: &MemorySessionStore) -> Vec<String> {
    store
        .load("r1")
        .unwrap()
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.id)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn remembered_peers_survive_a_second_reload() {
    let store = Arc::new(MemorySessionStore::new());
    store
        .save(
            "r1",
            &[
                PersistedParticipant {
                    id: "u1".into(),
                    is_local: true,
                },
                PersistedParticipant {
                    id: "u2".into(),
                    is_local: false,
                },
            ],
        )
        .unwrap();

    let mut first = fixture_with_store("u1", RecordingUploader::new(), store.clone());
    first.room.mount(None).await.unwrap();
    assert_eq!(saved_ids(&store), ["u1", "u2"]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(first.room.coordinator().unwrap().peer_ids().await, ["u2"]);
    first.room.on_before_unload();
    assert_eq!(saved_ids(&store), ["u1", "u2"]);
    drop(first);

    let mut second = fixture_with_store("u1", RecordingUploader::new(), store.clone());
    second.room.mount(None).await.unwrap();
    let links = &*second.links;
    eventually(move || async move { links.count("u2", Role::Offerer) == 1 }).await;
    second.room.on_visibility_hidden();
    assert_eq!(saved_ids(&store), ["u1", "u2"]);
}

#[tokio::test(start_paused = true)]
async fn leave_uploads_once_and_releases_everything() {
    let mut f = fixture("u1", RecordingUploader::new());
    f.server.accept_connections();
    f.room.mount(None).await.unwrap();
    let coordinator = f.room.coordinator().unwrap();

    let mut socket = f.server.connection().await;
    assert_eq!(socket.recv().await.unwrap().signal, Signal::Join);

    socket.push(&SignalMessage::broadcast("u2", Signal::Join));
    let offer = socket.recv().await.unwrap();
    assert_eq!(offer.target_id.as_deref(), Some("u2"));
    assert!(matches!(offer.signal, Signal::Offer { .. }));
    assert_eq!(coordinator.connection_count().await, 1);

    let local = f.room.local_stream().unwrap();
    local.tracks()[0]
        .write_sample(Bytes::from_static(b"frame"), Duration::from_millis(20))
        .await
        .unwrap();
    assert!(f.store.contains("r1"));

    let report = f.room.leave().await.unwrap();

    assert_eq!(report.upload, UploadOutcome::Uploaded);
    assert_eq!(f.uploader.uploads(), [("r1".to_string(), AUDIO_CONTENT_TYPE)]);
    assert_eq!(report.connections_closed, 1);
    assert_eq!(report.tracks.failed, 0);
    assert_eq!(coordinator.connection_count().await, 0);
    assert!(f.links.latest("u2").unwrap().is_closed());
    assert!(!f.store.contains("r1"));
    assert!(local.tracks().iter().all(|t| t.is_stopped()));
    assert_eq!(f.room.phase(), RoomPhase::Idle);

    let mut leaves = 0;
    while let Some(message) = socket.recv().await {
        assert_eq!(message.sender_id, "u1");
        if message.signal == Signal::Leave {
            leaves += 1;
        }
    }
    assert_eq!(leaves, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_upload_does_not_block_leaving() {
    let mut f = fixture("u1", RecordingUploader::failing());
    f.server.accept_connections();
    f.room.mount(None).await.unwrap();

    let local = f.room.local_stream().unwrap();
    local.tracks()[0]
        .write_sample(Bytes::from_static(b"frame"), Duration::from_millis(20))
        .await
        .unwrap();

    let report = f.room.leave().await.unwrap();
    assert!(matches!(report.upload, UploadOutcome::Failed(_)));
    assert_eq!(f.uploader.uploads().len(), 1);
    assert!(!f.store.contains("r1"));
    assert_eq!(f.room.phase(), RoomPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn peer_leave_drops_participant_and_connection() {
    let mut f = fixture("u1", RecordingUploader::new());
    f.server.accept_connections();
    f.room.mount(None).await.unwrap();
    let coordinator = f.room.coordinator().unwrap();
    let participants = f.room.participants();

    let mut socket = f.server.connection().await;
    socket.recv().await.unwrap();
    socket.push(&SignalMessage::broadcast("u2", Signal::Join));
    socket.recv().await.unwrap();
    assert!(participants.borrow().contains("u2"));

    assert_eq!(saved_ids(&f.store), ["u1", "u2"]);

    socket.push(&SignalMessage::broadcast("u2", Signal::Leave));
    let c = &*coordinator;
    eventually(move || async move { c.connection_count().await == 0 }).await;

    assert!(!participants.borrow().contains("u2"));
    assert_eq!(saved_ids(&f.store), ["u1"]);
}
