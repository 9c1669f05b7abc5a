//! Signaling channel: the always-on control connection to the server.
//!
//! The session bootstraps over this channel (session id assignment, speech
//! generation requests) and receives chunks over it whenever no peer channel
//! is active. The concrete transport is a WebSocket; sessions depend on the
//! [`ControlChannel`] trait so tests can script the server side.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{FablecastError, FablecastResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::protocol_constants::SIGNALING_EVENT_CAPACITY;

/// One observation from the control channel's read side.
#[derive(Debug)]
pub enum SignalingEvent {
    /// A parsed control message.
    Message(ServerMessage),
    /// The channel closed. `clean` is true for an orderly close handshake,
    /// false for abnormal loss mid-session.
    Closed { clean: bool, reason: String },
}

/// Bidirectional control connection.
///
/// `next_event` yields messages in arrival order and ends with exactly one
/// `Closed` event. `send` on a closed channel is a logged no-op; the close
/// itself is always reported through the read side.
#[async_trait]
pub trait ControlChannel: Send {
    /// Sends a control message.
    ///
    /// # Errors
    ///
    /// Fails on a transport write error. A channel already known to be
    /// closed swallows the message with a warning instead.
    async fn send(&mut self, message: ClientMessage) -> FablecastResult<()>;

    /// Waits for the next inbound event. Returns `None` after the `Closed`
    /// event has been consumed.
    async fn next_event(&mut self) -> Option<SignalingEvent>;

    /// Closes the channel and releases its resources.
    async fn close(&mut self);
}

/// Opens one control channel per session.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Connects a fresh channel.
    ///
    /// # Errors
    ///
    /// Fails if the channel cannot be established.
    async fn connect(&self) -> FablecastResult<Box<dyn ControlChannel>>;
}

/// [`ChannelFactory`] that dials a WebSocket signaling server.
pub struct WsChannelFactory {
    url: String,
    timeout: Duration,
}

impl WsChannelFactory {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ChannelFactory for WsChannelFactory {
    async fn connect(&self) -> FablecastResult<Box<dyn ControlChannel>> {
        let channel = WsControlChannel::connect(&self.url, self.timeout).await?;
        Ok(Box::new(channel))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket-backed [`ControlChannel`].
///
/// A reader task owns the read half and forwards parsed events over a
/// bounded channel; the write half stays with the struct for sends.
pub struct WsControlChannel {
    writer: Option<WsSink>,
    events: mpsc::Receiver<SignalingEvent>,
    reader: Option<JoinHandle<()>>,
}

impl WsControlChannel {
    /// Connects to the signaling server.
    ///
    /// # Errors
    ///
    /// Fails if the connection cannot be established within `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> FablecastResult<Self> {
        info!("[Signaling] connecting to {url}");
        let (stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| FablecastError::Connect(format!("timed out connecting to {url}")))?
            .map_err(|e| FablecastError::Connect(e.to_string()))?;

        let (writer, read) = stream.split();
        let (tx, events) = mpsc::channel(SIGNALING_EVENT_CAPACITY);
        let reader = tokio::spawn(read_loop(read, tx));

        Ok(Self {
            writer: Some(writer),
            events,
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl ControlChannel for WsControlChannel {
    async fn send(&mut self, message: ClientMessage) -> FablecastResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            warn!("[Signaling] send ignored, channel is closed");
            return Ok(());
        };
        let text =
            serde_json::to_string(&message).map_err(|e| FablecastError::Stream(e.to_string()))?;
        if let Err(e) = writer.send(Message::Text(text.into())).await {
            warn!("[Signaling] send failed: {e}");
            self.writer = None;
            return Err(FablecastError::ChannelLost(e.to_string()));
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<SignalingEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.send(Message::Close(None)).await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for WsControlChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Reads frames until the socket ends, forwarding parsed events.
async fn read_loop(
    mut read: futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    tx: mpsc::Sender<SignalingEvent>,
) {
    let closed = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => {
                    if tx.send(SignalingEvent::Message(message)).await.is_err() {
                        // Session is gone, stop reading.
                        return;
                    }
                }
                Err(e) => {
                    warn!("[Signaling] unrecognized message, skipping: {e}");
                }
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "server closed".to_string());
                info!("[Signaling] channel closed by server: {reason}");
                break SignalingEvent::Closed {
                    clean: true,
                    reason,
                };
            }
            Some(Ok(other)) => {
                debug!("[Signaling] ignoring non-text frame: {other:?}");
            }
            Some(Err(e)) => {
                warn!("[Signaling] read error: {e}");
                break SignalingEvent::Closed {
                    clean: false,
                    reason: e.to_string(),
                };
            }
            None => {
                break SignalingEvent::Closed {
                    clean: false,
                    reason: "connection dropped".to_string(),
                };
            }
        }
    };
    let _ = tx.send(closed).await;
}
