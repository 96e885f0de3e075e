use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::config::SignalingSettings;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Join,
    Offer { offer: SessionDescription },
    Answer { answer: SessionDescription },
    Ice { candidate: IceCandidate },
    Leave,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Join => "join",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Ice { .. } => "ice",
            Signal::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(flatten)]
    pub signal: Signal,
}

impl SignalMessage {
    pub fn broadcast(sender_id: impl Into<String>, signal: Signal) -> Self {
        Self {
            sender_id: sender_id.into(),
            target_id: None,
            nickname: None,
            signal,
        }
    }

    pub fn to(sender_id: impl Into<String>, target_id: impl Into<String>, signal: Signal) -> Self {
        Self {
            sender_id: sender_id.into(),
            target_id: Some(target_id.into()),
            nickname: None,
            signal,
        }
    }

    pub fn is_addressed_to(&self, peer_id: &str) -> bool {
        self.target_id.as_deref().map_or(true, |target| target == peer_id)
    }
}

/// Outbound half of the signaling channel, as seen by the peer coordinator.
pub trait SignalSender: Send + Sync {
    fn send(&self, message: SignalMessage) -> Result<()>;
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = AppError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens the text-frame transport underneath a [`SignalingChannel`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)>;
}

pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        let (ws_stream, _) = connect_async(url).await?;
        let (write, read) = ws_stream.split();

        let sink = write.with(|text: String| future::ready(Ok::<_, AppError>(Message::Text(text))));
        let stream = read.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => String::from_utf8(data).ok().map(Ok),
                Ok(_) => None,
                Err(e) => Some(Err(AppError::from(e))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

enum Outbound {
    Frame(String),
    Close,
}

enum Session {
    Closed,
    Lost,
}

/// Persistent message channel to the rendezvous server.
///
/// Messages sent before the transport is open wait in FIFO order and are
/// flushed as soon as it opens. Inbound frames are decoded and forwarded to
/// the receiver returned by [`SignalingChannel::open`], except the ones this
/// peer sent itself.
pub struct SignalingChannel {
    self_id: String,
    outgoing: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
}

impl SignalingChannel {
    pub fn open(
        connector: Arc<dyn Connector>,
        url: impl Into<String>,
        self_id: impl Into<String>,
        settings: SignalingSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SignalMessage>) {
        let url = url.into();
        let self_id = self_id.into();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);

        let task = tokio::spawn(run_channel(
            connector,
            url,
            self_id.clone(),
            settings,
            outgoing_rx,
            inbound_tx,
            state_tx,
        ));

        let channel = Self {
            self_id,
            outgoing: outgoing_tx,
            state: state_rx,
            task,
        };
        (channel, inbound_rx)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Flushes everything queued so far, then closes the transport.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outbound::Close);
    }

    pub async fn closed(&self) {
        let mut state = self.state.clone();
        while *state.borrow() != ChannelState::Closed {
            if state.changed().await.is_err() {
                break;
            }
        }
    }
}

impl SignalSender for SignalingChannel {
    fn send(&self, message: SignalMessage) -> Result<()> {
        let json = serde_json::to_string(&message)?;
        self.outgoing
            .send(Outbound::Frame(json))
            .map_err(|_| AppError::ChannelClosed)?;
        trace!(kind = message.signal.name(), "signal queued");
        Ok(())
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Decodes one inbound frame. Returns `None` for this peer's own echoes.
pub fn decode_inbound(text: &str, self_id: &str) -> Result<Option<SignalMessage>> {
    let message: SignalMessage = serde_json::from_str(text)?;
    if message.sender_id == self_id {
        return Ok(None);
    }
    Ok(Some(message))
}

async fn run_channel(
    connector: Arc<dyn Connector>,
    url: String,
    self_id: String,
    settings: SignalingSettings,
    mut outgoing: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<SignalMessage>,
    state: watch::Sender<ChannelState>,
) {
    let mut attempt = 0u32;
    let mut unsent: Option<String> = None;

    loop {
        let (sink, stream) = match connector.connect(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, %url, "signaling connect failed");
                if !backoff(&mut attempt, &settings, &state).await {
                    break;
                }
                continue;
            }
        };

        attempt = 0;
        state.send_replace(ChannelState::Open);
        info!(%url, "signaling channel open");

        match drive(sink, stream, &self_id, &mut outgoing, &inbound, &mut unsent).await {
            Session::Closed => break,
            Session::Lost => {
                if !backoff(&mut attempt, &settings, &state).await {
                    break;
                }
            }
        }
    }

    state.send_replace(ChannelState::Closed);
    info!(%url, "signaling channel closed");
}

async fn drive(
    mut sink: FrameSink,
    mut stream: FrameStream,
    self_id: &str,
    outgoing: &mut mpsc::UnboundedReceiver<Outbound>,
    inbound: &mpsc::UnboundedSender<SignalMessage>,
    unsent: &mut Option<String>,
) -> Session {
    if let Some(frame) = unsent.take() {
        if let Err(e) = sink.send(frame.clone()).await {
            warn!(error = %e, "resending signal failed");
            *unsent = Some(frame);
            return Session::Lost;
        }
    }

    loop {
        tokio::select! {
            command = outgoing.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = sink.send(frame.clone()).await {
                        warn!(error = %e, "sending signal failed");
                        *unsent = Some(frame);
                        return Session::Lost;
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "closing signaling transport failed");
                    }
                    return Session::Closed;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(text)) => match decode_inbound(&text, self_id) {
                    Ok(Some(message)) => {
                        let _ = inbound.send(message);
                    }
                    Ok(None) => trace!("dropping own echo"),
                    Err(e) => warn!(error = %e, "discarding malformed signaling frame"),
                },
                Some(Err(e)) => {
                    warn!(error = %e, "signaling transport error");
                    return Session::Lost;
                }
                None => {
                    info!("signaling transport closed by server");
                    return Session::Closed;
                }
            },
        }
    }
}

async fn backoff(
    attempt: &mut u32,
    settings: &SignalingSettings,
    state: &watch::Sender<ChannelState>,
) -> bool {
    if *attempt >= settings.max_reconnect_attempts {
        warn!(attempts = *attempt, "giving up on signaling reconnect");
        return false;
    }
    *attempt += 1;
    let delay = settings.backoff(*attempt);
    state.send_replace(ChannelState::Reconnecting);
    info!(
        attempt = *attempt,
        max = settings.max_reconnect_attempts,
        delay_ms = delay.as_millis() as u64,
        "reconnecting signaling channel"
    );
    tokio::time::sleep(delay).await;
    true
}
