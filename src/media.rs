use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;

const SAMPLE_FANOUT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 960,
            height: 540,
            frame_rate: 30,
        }
    }
}

/// Capture request passed to a [`crate::devices::MediaDevices`] backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

enum TrackSource {
    Detached,
    Local(Arc<TrackLocalStaticSample>),
    Remote(Arc<TrackRemote>),
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    source: TrackSource,
    samples: broadcast::Sender<EncodedSample>,
}

/// One encoded frame as it was written to a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// A single audio or video track, shared by reference between the capture
/// pump, the peer connections and the recorder.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    fn with_source(id: String, kind: TrackKind, source: TrackSource) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_FANOUT_CAPACITY);
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                source,
                samples,
            }),
        }
    }

    /// A track with no RTP binding; samples only reach local subscribers.
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::with_source(id.into(), kind, TrackSource::Detached)
    }

    pub fn local(track: Arc<TrackLocalStaticSample>, kind: TrackKind) -> Self {
        let id = track.id().to_owned();
        Self::with_source(id, kind, TrackSource::Local(track))
    }

    pub fn remote(track: Arc<TrackRemote>) -> Self {
        let kind = TrackKind::from(track.kind());
        let id = track.id();
        Self::with_source(id, kind, TrackSource::Remote(track))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.inner.source, TrackSource::Remote(_))
    }

    /// The RTP track to attach to outgoing peer connections, if any.
    pub fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        match &self.inner.source {
            TrackSource::Local(track) => Some(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>),
            _ => None,
        }
    }

    pub fn remote_track(&self) -> Option<Arc<TrackRemote>> {
        match &self.inner.source {
            TrackSource::Remote(track) => Some(Arc::clone(track)),
            _ => None,
        }
    }

    /// Encoded samples written to this track, for recording.
    pub fn subscribe(&self) -> broadcast::Receiver<EncodedSample> {
        self.inner.samples.subscribe()
    }

    /// Writes one encoded sample. Stopped or disabled tracks drop it.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(());
        }
        // No subscriber is not an error
        let _ = self.inner.samples.send(EncodedSample {
            data: data.clone(),
            duration,
        });
        if let TrackSource::Local(track) = &self.inner.source {
            track
                .write_sample(&Sample {
                    data,
                    duration,
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A mutable, shared collection of tracks. Clones observe the same tracks.
#[derive(Clone, Debug)]
pub struct MediaStream {
    id: String,
    tracks: Arc<RwLock<Vec<MediaTrack>>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        let stream = Self::new(id);
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds a track unless one with the same id is already present.
    pub fn add_track(&self, track: MediaTrack) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.read().clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop_all(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }

    pub fn same_as(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_deduplicates_tracks_by_id() {
        let stream = MediaStream::new("s");
        assert!(stream.add_track(MediaTrack::new("a", TrackKind::Audio)));
        assert!(!stream.add_track(MediaTrack::new("a", TrackKind::Audio)));
        assert!(stream.add_track(MediaTrack::new("v", TrackKind::Video)));
        assert_eq!(stream.track_count(), 2);
    }

    #[test]
    fn clones_share_the_same_tracks() {
        let stream = MediaStream::new("s");
        let view = stream.clone();
        stream.add_track(MediaTrack::new("a", TrackKind::Audio));
        assert_eq!(view.track_count(), 1);
        assert!(view.same_as(&stream));
        assert!(!view.same_as(&MediaStream::new("s")));
    }

    #[test]
    fn muting_only_touches_the_requested_kind() {
        let stream = MediaStream::with_tracks(
            "s",
            vec![
                MediaTrack::new("a", TrackKind::Audio),
                MediaTrack::new("v", TrackKind::Video),
            ],
        );
        stream.set_enabled(TrackKind::Audio, false);
        assert!(!stream.tracks_of(TrackKind::Audio)[0].is_enabled());
        assert!(stream.tracks_of(TrackKind::Video)[0].is_enabled());
    }

    #[tokio::test]
    async fn stopped_tracks_drop_samples() {
        let track = MediaTrack::new("a", TrackKind::Audio);
        let mut rx = track.subscribe();
        track
            .write_sample(Bytes::from_static(b"one"), Duration::from_millis(20))
            .await
            .unwrap();
        track.stop();
        track
            .write_sample(Bytes::from_static(b"two"), Duration::from_millis(20))
            .await
            .unwrap();
        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.data, Bytes::from_static(b"one"));
        assert_eq!(sample.duration, Duration::from_millis(20));
        assert!(rx.try_recv().is_err());
    }
}
