use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::RoomSettings;
use crate::connection::ConnectionState;
use crate::error::{AppError, Result};
use crate::media::{MediaStream, MediaTrack};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

/// Which side of a negotiation this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// Asynchronous notifications raised by a [`PeerLink`].
#[derive(Debug)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(MediaTrack),
    StateChanged(ConnectionState),
}

/// One real-time media connection to a remote peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Generates a local offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Applies a remote offer and returns the local answer.
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Ids of the local tracks currently sent over this connection.
    async fn outgoing_tracks(&self) -> Vec<String>;

    /// Detaches one outgoing track and stops its sender.
    async fn detach_track(&self, track_id: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        role: Role,
        local: Option<&MediaStream>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        other => return Err(AppError::UnsupportedDescription(other.to_string())),
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

/// Builds `webrtc-rs` peer connections sharing one media engine.
pub struct RtcLinkFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcLinkFactory {
    pub fn new(settings: &RoomSettings) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: settings.ice_servers.clone(),
                ..Default::default()
            }],
            ice_candidate_pool_size: settings.ice_candidate_pool_size,
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn create(
        &self,
        peer_id: &str,
        role: Role,
        local: Option<&MediaStream>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(LinkEvent::LocalCandidate(IceCandidate::from(init)));
                    }
                    Err(e) => warn!(error = %e, "failed to serialize local candidate"),
                }
            })
        }));

        let tx = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(LinkEvent::RemoteTrack(MediaTrack::remote(track)));
                })
            },
        ));

        let tx = events;
        let peer = peer_id.to_owned();
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = tx.clone();
            let peer = peer.clone();
            Box::pin(async move {
                debug!(peer_id = %peer, state = %s, "peer connection state changed");
                let _ = tx.send(LinkEvent::StateChanged(ConnectionState::from(s)));
            })
        }));

        if let Some(stream) = local {
            for track in stream.tracks() {
                if let Some(rtc_track) = track.rtc_track() {
                    peer_connection.add_track(rtc_track).await?;
                }
            }
        }

        debug!(peer_id, ?role, "peer connection created");
        Ok(Arc::new(RtcLink { peer_connection }))
    }
}

pub struct RtcLink {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        from_rtc_description(&offer)
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.peer_connection
            .set_remote_description(to_rtc_description(offer)?)
            .await?;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;

        from_rtc_description(&answer)
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(answer)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await?;
        Ok(())
    }

    async fn outgoing_tracks(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for sender in self.peer_connection.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(track.id().to_owned());
            }
        }
        ids
    }

    async fn detach_track(&self, track_id: &str) -> Result<()> {
        for sender in self.peer_connection.get_senders().await {
            let matches = match sender.track().await {
                Some(track) => track.id() == track_id,
                None => false,
            };
            if matches {
                self.peer_connection.remove_track(&sender).await?;
                sender.stop().await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_convert_both_ways() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        let init = RTCIceCandidateInit::from(candidate.clone());
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[test]
    fn rollback_descriptions_are_rejected() {
        let mut description = RTCSessionDescription::default();
        description.sdp_type = RTCSdpType::Rollback;
        assert!(matches!(
            from_rtc_description(&description),
            Err(AppError::UnsupportedDescription(_))
        ));
    }
}
