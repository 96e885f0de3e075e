use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::media::io::ivf_reader::IVFFileHeader;
use webrtc::media::io::ivf_writer::IVFWriter;
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::media::io::Writer;
use webrtc::rtp::codecs::vp8::Vp8Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Payloader;

use crate::devices::OPUS_SAMPLE_RATE;
use crate::error::Result;
use crate::media::{EncodedSample, MediaStream, MediaTrack, TrackKind, VideoConstraints};

pub const VIDEO_CONTENT_TYPE: &str = "video/x-ivf";
pub const AUDIO_CONTENT_TYPE: &str = "audio/ogg";

const VP8_CLOCK_RATE: u32 = 90_000;
const RTP_MTU: usize = 1200;
const RECORDING_SSRC: u32 = 0x5354_5544;

/// The flushed output of one recording session.
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub data: Bytes,
    pub kind: TrackKind,
    pub frame_count: usize,
    pub started_at: DateTime<Local>,
    pub file_name: String,
    pub content_type: &'static str,
    pub frame_rate: Option<u32>,
}

impl RecordingArtifact {
    /// Local wall-clock start time, as the upload endpoint expects it.
    pub fn video_start(&self) -> String {
        self.started_at.format("%Y-%m-%dT%H:%M:%S").to_string()
    }
}

/// In-memory file for the media writers; clones share the same bytes.
#[derive(Clone, Default)]
struct SharedFile(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SharedFile {
    fn take(&self) -> Vec<u8> {
        std::mem::take(self.0.lock().get_mut())
    }
}

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SharedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.lock().seek(pos)
    }
}

/// One track written into its container: Ogg/Opus for audio, IVF/VP8 for
/// video. Samples are re-packetized so the writers see an RTP stream.
struct TrackRecording {
    kind: TrackKind,
    clock_rate: u32,
    file: SharedFile,
    writer: Box<dyn Writer + Send>,
    payloader: Option<Vp8Payloader>,
    sequence_number: u16,
    timestamp: u32,
    frames: usize,
}

struct RecordedTrack {
    kind: TrackKind,
    data: Bytes,
    frames: usize,
}

impl TrackRecording {
    fn open(kind: TrackKind, video: Option<VideoConstraints>) -> Result<Self> {
        let file = SharedFile::default();
        let (writer, payloader, clock_rate) = match kind {
            TrackKind::Audio => (
                Box::new(OggWriter::new(file.clone(), OPUS_SAMPLE_RATE, 1)?) as Box<dyn Writer + Send>,
                None,
                OPUS_SAMPLE_RATE,
            ),
            TrackKind::Video => {
                let video = video.unwrap_or_default();
                let header = IVFFileHeader {
                    signature: *b"DKIF",
                    version: 0,
                    header_size: 32,
                    four_cc: *b"VP80",
                    width: u16::try_from(video.width).unwrap_or(u16::MAX),
                    height: u16::try_from(video.height).unwrap_or(u16::MAX),
                    timebase_denominator: video.frame_rate.max(1),
                    timebase_numerator: 1,
                    num_frames: 0,
                    unused: 0,
                };
                (
                    Box::new(IVFWriter::new(file.clone(), &header)?) as Box<dyn Writer + Send>,
                    Some(Vp8Payloader::default()),
                    VP8_CLOCK_RATE,
                )
            }
        };
        Ok(Self {
            kind,
            clock_rate,
            file,
            writer,
            payloader,
            sequence_number: 0,
            // Ogg granule positions count from the second packet on
            timestamp: 0,
            frames: 0,
        })
    }

    fn write(&mut self, sample: &EncodedSample) -> Result<()> {
        if sample.data.is_empty() {
            return Ok(());
        }
        let payloads = match self.payloader.as_mut() {
            Some(payloader) => payloader
                .payload(RTP_MTU, &sample.data)
                .map_err(webrtc::Error::from)?,
            None => vec![sample.data.clone()],
        };

        let last = payloads.len().saturating_sub(1);
        for (index, payload) in payloads.into_iter().enumerate() {
            let packet = Packet {
                header: Header {
                    version: 2,
                    marker: index == last,
                    sequence_number: self.sequence_number,
                    timestamp: self.timestamp,
                    ssrc: RECORDING_SSRC,
                    ..Default::default()
                },
                payload,
            };
            self.sequence_number = self.sequence_number.wrapping_add(1);
            self.writer.write_rtp(&packet)?;
        }

        self.timestamp = self
            .timestamp
            .wrapping_add(rtp_ticks(sample.duration, self.clock_rate));
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<Option<RecordedTrack>> {
        if self.frames == 0 {
            return Ok(None);
        }
        self.writer.close()?;
        Ok(Some(RecordedTrack {
            kind: self.kind,
            data: Bytes::from(self.file.take()),
            frames: self.frames,
        }))
    }
}

fn rtp_ticks(duration: Duration, clock_rate: u32) -> u32 {
    let ticks = duration.as_micros() * u128::from(clock_rate) / 1_000_000;
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

/// Records every track of one local stream into its own container. On stop
/// the video recording is kept when it captured frames, the audio one
/// otherwise.
pub struct Recorder {
    started_at: DateTime<Local>,
    frame_rate: Option<u32>,
    stop: watch::Sender<bool>,
    collectors: Vec<JoinHandle<Option<RecordedTrack>>>,
}

impl Recorder {
    pub fn start(stream: &MediaStream, video: Option<VideoConstraints>) -> Self {
        let (stop, stop_rx) = watch::channel(false);

        let collectors = stream
            .tracks()
            .into_iter()
            .filter_map(|track| match TrackRecording::open(track.kind(), video) {
                Ok(recording) => {
                    let samples = track.subscribe();
                    Some(tokio::spawn(collect(track, samples, recording, stop_rx.clone())))
                }
                Err(e) => {
                    warn!(track = track.id(), error = %e, "cannot record track");
                    None
                }
            })
            .collect();

        info!(stream = stream.id(), "recording started");
        Self {
            started_at: Local::now(),
            frame_rate: video.map(|v| v.frame_rate),
            stop,
            collectors,
        }
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Stops collection and closes the containers. `None` when nothing was
    /// recorded.
    pub async fn stop(self) -> Option<RecordingArtifact> {
        let _ = self.stop.send(true);
        let mut recorded = Vec::new();
        for collector in self.collectors {
            match collector.await {
                Ok(Some(track)) => recorded.push(track),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "recording collector failed"),
            }
        }

        let Some(track) = pick(recorded) else {
            info!("recording stopped without data");
            return None;
        };
        let (content_type, extension) = match track.kind {
            TrackKind::Video => (VIDEO_CONTENT_TYPE, "ivf"),
            TrackKind::Audio => (AUDIO_CONTENT_TYPE, "ogg"),
        };
        let artifact = RecordingArtifact {
            file_name: format!(
                "recorded_{}.{extension}",
                self.started_at.timestamp_millis()
            ),
            data: track.data,
            kind: track.kind,
            frame_count: track.frames,
            started_at: self.started_at,
            content_type,
            frame_rate: self.frame_rate,
        };
        info!(
            bytes = artifact.data.len(),
            frames = artifact.frame_count,
            content_type,
            "recording stopped"
        );
        Some(artifact)
    }
}

fn pick(mut recorded: Vec<RecordedTrack>) -> Option<RecordedTrack> {
    let index = recorded
        .iter()
        .position(|t| t.kind == TrackKind::Video)
        .or_else(|| recorded.iter().position(|t| t.kind == TrackKind::Audio))?;
    Some(recorded.swap_remove(index))
}

async fn collect(
    track: MediaTrack,
    mut samples: broadcast::Receiver<EncodedSample>,
    mut recording: TrackRecording,
    mut stop: watch::Receiver<bool>,
) -> Option<RecordedTrack> {
    loop {
        tokio::select! {
            biased;
            sample = samples.recv() => match sample {
                Ok(sample) => record(&track, &mut recording, &sample),
                Err(RecvError::Lagged(missed)) => {
                    warn!(track = track.id(), missed, "recorder fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    drain(&track, &mut samples, &mut recording);
                    break;
                }
            }
        }
    }
    debug!(track = track.id(), frames = recording.frames, "recording collector finished");

    match recording.finish() {
        Ok(recorded) => recorded,
        Err(e) => {
            warn!(track = track.id(), error = %e, "failed to close recording");
            None
        }
    }
}

fn record(track: &MediaTrack, recording: &mut TrackRecording, sample: &EncodedSample) {
    if let Err(e) = recording.write(sample) {
        warn!(track = track.id(), error = %e, "dropping unrecordable sample");
    }
}

fn drain(
    track: &MediaTrack,
    samples: &mut broadcast::Receiver<EncodedSample>,
    recording: &mut TrackRecording,
) {
    loop {
        match samples.try_recv() {
            Ok(sample) => record(track, recording, &sample),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}
