use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{AppError, Result};
use crate::media::{MediaConstraints, MediaStream, MediaTrack, TrackKind};

pub const OPUS_SAMPLE_RATE: u32 = 48_000;
pub const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);
/// Samples per channel in one 20 ms Opus frame.
pub const OPUS_FRAME_SAMPLES: usize = 960;
/// A complete 20 ms Opus frame that decodes to silence.
pub const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Source of local capture streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream>;
}

fn stream_label() -> String {
    format!("study-room-{}", Uuid::new_v4())
}

fn opus_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: OPUS_SAMPLE_RATE,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        stream_id.to_owned(),
    ))
}

fn vp8_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_owned(),
        stream_id.to_owned(),
    ))
}

fn ensure_requested(constraints: &MediaConstraints) -> Result<()> {
    if !constraints.audio && constraints.video.is_none() {
        return Err(AppError::Device("neither audio nor video requested".into()));
    }
    Ok(())
}

/// Headless capture: Opus silence on the audio track and an idle VP8 track
/// whose frames are written by an external encoder, if any.
#[derive(Debug, Default, Clone)]
pub struct SyntheticDevices;

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        ensure_requested(constraints)?;
        let label = stream_label();
        let stream = MediaStream::new(label.clone());

        if constraints.audio {
            let track = MediaTrack::local(opus_track(&label), TrackKind::Audio);
            stream.add_track(track.clone());
            tokio::spawn(pump_silence(track));
        }
        if let Some(video) = constraints.video {
            debug!(
                width = video.width,
                height = video.height,
                fps = video.frame_rate,
                "video track created without a capture source"
            );
            stream.add_track(MediaTrack::local(vp8_track(&label), TrackKind::Video));
        }

        info!(stream = %label, tracks = stream.track_count(), "synthetic media acquired");
        Ok(stream)
    }
}

async fn pump_silence(track: MediaTrack) {
    let frame = Bytes::from_static(&OPUS_SILENCE);
    let mut ticker = tokio::time::interval(OPUS_FRAME_DURATION);
    while !track.is_stopped() {
        ticker.tick().await;
        if let Err(e) = track.write_sample(frame.clone(), OPUS_FRAME_DURATION).await {
            warn!(error = %e, "failed to write silence frame");
        }
    }
    debug!(track = track.id(), "silence pump stopped");
}

#[cfg(feature = "capture")]
pub use self::cpal_capture::CpalDevices;

#[cfg(feature = "capture")]
mod cpal_capture {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, Sample, SampleFormat, SizedSample};
    use rubato::{FftFixedIn, Resampler};
    use std::sync::mpsc as std_mpsc;
    use tokio::sync::{mpsc, oneshot};

    const CAPTURE_QUEUE: usize = 64;
    const RESAMPLER_CHUNK: usize = 1024;
    const RESAMPLER_SUB_CHUNKS: usize = 2;
    const MAX_OPUS_PACKET: usize = 4000;
    const OPUS_BITRATE: i32 = 64_000;

    /// Downmixes captured PCM to mono, resamples it to 48 kHz and encodes
    /// 20 ms Opus frames.
    pub struct OpusFrameEncoder {
        channels: usize,
        resampler: Option<FftFixedIn<f32>>,
        captured: Vec<f32>,
        resampled: Vec<f32>,
        encoder: opus::Encoder,
    }

    impl OpusFrameEncoder {
        pub fn new(source_rate: u32, channels: u16) -> Result<Self> {
            let resampler = if source_rate == OPUS_SAMPLE_RATE {
                None
            } else {
                let resampler = FftFixedIn::<f32>::new(
                    source_rate as usize,
                    OPUS_SAMPLE_RATE as usize,
                    RESAMPLER_CHUNK,
                    RESAMPLER_SUB_CHUNKS,
                    1,
                )
                .map_err(|e| AppError::Device(format!("Failed to create resampler: {e}")))?;
                Some(resampler)
            };

            let mut encoder =
                opus::Encoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                    .map_err(|e| AppError::Device(format!("Failed to create Opus encoder: {e}")))?;
            encoder
                .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE))
                .map_err(|e| AppError::Device(format!("Failed to set bitrate: {e}")))?;

            Ok(Self {
                channels: usize::from(channels.max(1)),
                resampler,
                captured: Vec::new(),
                resampled: Vec::new(),
                encoder,
            })
        }

        /// Feeds interleaved samples and returns every frame completed by them.
        pub fn push(&mut self, interleaved: &[f32]) -> Result<Vec<Bytes>> {
            self.captured.extend(
                interleaved
                    .chunks(self.channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
            );

            match self.resampler.as_mut() {
                Some(resampler) => {
                    while self.captured.len() >= resampler.input_frames_next() {
                        let chunk: Vec<f32> =
                            self.captured.drain(..resampler.input_frames_next()).collect();
                        let mut output = resampler
                            .process(&[chunk], None)
                            .map_err(|e| AppError::Device(format!("Resampling failed: {e}")))?;
                        self.resampled.append(&mut output[0]);
                    }
                }
                None => self.resampled.append(&mut self.captured),
            }

            let mut frames = Vec::new();
            let mut packet = vec![0u8; MAX_OPUS_PACKET];
            while self.resampled.len() >= OPUS_FRAME_SAMPLES {
                let pcm: Vec<f32> = self.resampled.drain(..OPUS_FRAME_SAMPLES).collect();
                let len = self
                    .encoder
                    .encode_float(&pcm, &mut packet)
                    .map_err(|e| AppError::Device(format!("Opus encoding failed: {e}")))?;
                frames.push(Bytes::copy_from_slice(&packet[..len]));
            }
            Ok(frames)
        }
    }

    /// Microphone capture through the default cpal host.
    #[derive(Debug, Default, Clone)]
    pub struct CpalDevices;

    #[async_trait]
    impl MediaDevices for CpalDevices {
        async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
            ensure_requested(constraints)?;
            let label = stream_label();
            let stream = MediaStream::new(label.clone());

            if constraints.audio {
                let track = MediaTrack::local(opus_track(&label), TrackKind::Audio);
                let (frames_tx, frames_rx) = mpsc::channel(CAPTURE_QUEUE);
                let (ready_tx, ready_rx) = oneshot::channel();

                let capture_track = track.clone();
                std::thread::Builder::new()
                    .name("audio-capture".into())
                    .spawn(move || run_capture(capture_track, frames_tx, ready_tx))?;

                ready_rx
                    .await
                    .map_err(|_| AppError::Device("capture thread exited".into()))??;

                tokio::spawn(forward_frames(track.clone(), frames_rx));
                stream.add_track(track);
            }
            if constraints.video.is_some() {
                stream.add_track(MediaTrack::local(vp8_track(&label), TrackKind::Video));
            }

            info!(stream = %label, tracks = stream.track_count(), "capture devices acquired");
            Ok(stream)
        }
    }

    /// Owns the input stream and the encoder. The cpal callback only copies
    /// PCM out; encoding happens on this thread.
    fn run_capture(
        track: MediaTrack,
        frames: mpsc::Sender<Bytes>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let (pcm_tx, pcm_rx) = std_mpsc::sync_channel(CAPTURE_QUEUE);
        let opened = open_input(pcm_tx).and_then(|(input, config)| {
            OpusFrameEncoder::new(config.sample_rate.0, config.channels).map(|e| (input, e))
        });
        let (input, mut encoder) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        while !track.is_stopped() {
            match pcm_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(pcm) => match encoder.push(&pcm) {
                    Ok(encoded) => {
                        for frame in encoded {
                            if frames.try_send(frame).is_err() {
                                debug!("capture queue full, dropping frame");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode captured audio"),
                },
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        drop(input);
        debug!("audio capture released");
    }

    fn open_input(
        pcm: std_mpsc::SyncSender<Vec<f32>>,
    ) -> Result<(cpal::Stream, cpal::StreamConfig)> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| AppError::Device("No input device available".into()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| AppError::Device(e.to_string()))?;
        info!(config = ?supported, "input config");

        let config: cpal::StreamConfig = supported.config();
        let input = match supported.sample_format() {
            SampleFormat::F32 => build_input_stream::<f32>(&device, &config, pcm)?,
            SampleFormat::I16 => build_input_stream::<i16>(&device, &config, pcm)?,
            SampleFormat::U16 => build_input_stream::<u16>(&device, &config, pcm)?,
            other => {
                return Err(AppError::Device(format!("Unsupported sample format: {other:?}")))
            }
        };
        input.play().map_err(|e| AppError::Device(e.to_string()))?;
        Ok((input, config))
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        pcm: std_mpsc::SyncSender<Vec<f32>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let err_fn = |err: cpal::StreamError| warn!(error = %err, "input audio stream error");

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                    if pcm.try_send(samples).is_err() {
                        debug!("encoder behind, dropping captured buffer");
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| AppError::Device(e.to_string()))
    }

    async fn forward_frames(track: MediaTrack, mut frames: mpsc::Receiver<Bytes>) {
        while let Some(frame) = frames.recv().await {
            if track.is_stopped() {
                break;
            }
            if let Err(e) = track.write_sample(frame, OPUS_FRAME_DURATION).await {
                warn!(error = %e, "failed to write audio sample");
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::f32::consts::PI;

        fn tone(rate: u32, channels: usize, frames: usize) -> Vec<f32> {
            (0..frames * channels)
                .map(|i| {
                    let t = (i / channels) as f32 / rate as f32;
                    (2.0 * PI * 440.0 * t).sin() * 0.5
                })
                .collect()
        }

        #[test]
        fn one_frame_per_20ms_at_48k_stereo() {
            let mut encoder = OpusFrameEncoder::new(48_000, 2).unwrap();
            let frames = encoder.push(&tone(48_000, 2, 960)).unwrap();
            assert_eq!(frames.len(), 1);
            assert!(encoder.push(&tone(48_000, 2, 480)).unwrap().is_empty());
            assert_eq!(encoder.push(&tone(48_000, 2, 480)).unwrap().len(), 1);
        }

        #[test]
        fn resampled_tone_survives_encoding() {
            let mut encoder = OpusFrameEncoder::new(44_100, 1).unwrap();
            let frames = encoder.push(&tone(44_100, 1, 44_100)).unwrap();
            assert!((40..=50).contains(&frames.len()), "{} frames", frames.len());

            let mut decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono).unwrap();
            let mut pcm = vec![0f32; OPUS_FRAME_SAMPLES];
            let mut energy = 0.0;
            for frame in frames.iter().skip(10) {
                let n = decoder.decode_float(frame, &mut pcm, false).unwrap();
                energy += pcm[..n].iter().map(|s| s * s).sum::<f32>() / n as f32;
            }
            let rms = (energy / (frames.len() - 10) as f32).sqrt();
            assert!(rms > 0.1, "rms {rms}");
        }
    }
}
