//! Optional secondary transport negotiation.
//!
//! A session always receives chunks over the signaling channel. When a peer
//! connector is available, the session additionally negotiates a direct peer
//! channel: it sends a local offer through the signaling relay, applies the
//! remote answer and network-path candidates relayed back, and switches to
//! the peer channel once it opens. Negotiation failure is never surfaced to
//! the caller; the session silently stays on the signaling path.
//!
//! Handshake payloads are opaque JSON to everything except the connector;
//! the negotiator only inspects the `type` tag to route them.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::protocol::ChunkFrame;

/// Transport capability for a session, chosen once at session start.
#[derive(Clone)]
pub enum TransportMode {
    /// Chunks arrive only over the signaling channel.
    SignalingOnly,
    /// Attempt a direct peer channel; fall back to signaling-only if the
    /// handshake fails or times out.
    SignalingWithPeer(Arc<dyn PeerConnectorFactory>),
}

impl std::fmt::Debug for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignalingOnly => f.write_str("SignalingOnly"),
            Self::SignalingWithPeer(_) => f.write_str("SignalingWithPeer"),
        }
    }
}

/// Creates one peer connector per session attempt.
pub trait PeerConnectorFactory: Send + Sync {
    fn create_connector(&self) -> Box<dyn PeerConnector>;
}

/// Platform peer-channel implementation.
///
/// The connector owns the actual peer connection; the negotiator drives it
/// through the handshake and relays payloads in both directions.
#[async_trait]
pub trait PeerConnector: Send {
    /// Produces the local offer payload to relay to the remote end.
    async fn create_offer(&mut self) -> Result<Value, NegotiationError>;

    /// Applies the remote answer payload.
    async fn accept_answer(&mut self, payload: Value) -> Result<(), NegotiationError>;

    /// Applies a remote network-path candidate.
    async fn add_candidate(&mut self, payload: Value) -> Result<(), NegotiationError>;

    /// Resolves once the chunk delivery channel opens.
    ///
    /// # Errors
    ///
    /// Fails if the connection reaches a state from which the channel can
    /// no longer open.
    async fn wait_channel(&mut self) -> Result<mpsc::Receiver<ChunkFrame>, NegotiationError>;

    /// Tears the connection down.
    async fn close(&mut self);
}

/// Handshake phase. Payloads that do not fit the current phase are
/// discarded without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationPhase {
    Idle,
    OfferSent,
    Connected,
}

/// Drives a [`PeerConnector`] through offer/answer/candidate exchange.
pub struct Negotiator {
    connector: Box<dyn PeerConnector>,
    phase: NegotiationPhase,
}

impl Negotiator {
    #[must_use]
    pub fn new(connector: Box<dyn PeerConnector>) -> Self {
        Self {
            connector,
            phase: NegotiationPhase::Idle,
        }
    }

    /// Creates the local offer and enters the offer-sent phase. The caller
    /// relays the returned payload through the signaling channel.
    ///
    /// # Errors
    ///
    /// Fails if the connector cannot produce an offer.
    pub async fn start(&mut self) -> Result<Value, NegotiationError> {
        let offer = self.connector.create_offer().await?;
        self.phase = NegotiationPhase::OfferSent;
        debug!("[Negotiator] offer created, awaiting answer");
        Ok(offer)
    }

    /// Routes one relayed handshake payload from the remote end.
    ///
    /// Answers are only accepted while an offer is outstanding; candidates
    /// are accepted from then on. Anything out of phase or unrecognized is
    /// logged and dropped.
    ///
    /// # Errors
    ///
    /// Propagates connector failures applying an in-phase payload.
    pub async fn handle_forward(&mut self, payload: Value) -> Result<(), NegotiationError> {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match (kind.as_str(), self.phase) {
            ("answer", NegotiationPhase::OfferSent) => {
                debug!("[Negotiator] applying remote answer");
                self.connector.accept_answer(payload).await
            }
            ("answer", phase) => {
                debug!("[Negotiator] discarding answer in phase {phase:?}");
                Ok(())
            }
            ("ice-candidate" | "candidate", NegotiationPhase::Idle) => {
                debug!("[Negotiator] discarding candidate before offer");
                Ok(())
            }
            ("ice-candidate" | "candidate", _) => self.connector.add_candidate(payload).await,
            (other, _) => {
                warn!("[Negotiator] unrecognized handshake payload type: {other:?}");
                Ok(())
            }
        }
    }

    /// Waits for the peer chunk channel to open.
    ///
    /// # Errors
    ///
    /// Fails if the connection can no longer produce a channel.
    pub async fn wait_channel(&mut self) -> Result<mpsc::Receiver<ChunkFrame>, NegotiationError> {
        let rx = self.connector.wait_channel().await?;
        self.phase = NegotiationPhase::Connected;
        info!("[Negotiator] peer chunk channel open");
        Ok(rx)
    }

    /// Tears down the underlying connection.
    pub async fn close(&mut self) {
        self.connector.close().await;
        self.phase = NegotiationPhase::Idle;
    }
}

// ─── Negotiation driver ──────────────────────────────────────────────────────

/// Endpoints of a running negotiation task.
///
/// The session relays signaling traffic through `inbound`/`outbound` and
/// receives the peer chunk channel on `opened` if the handshake succeeds
/// within the deadline. A dropped `opened` means the attempt degraded; the
/// session just stays on the signaling path.
pub struct NegotiationChannels {
    /// Handshake payloads relayed in from the remote end.
    pub inbound: mpsc::UnboundedSender<Value>,
    /// Handshake payloads to relay out to the remote end.
    pub outbound: mpsc::UnboundedReceiver<Value>,
    /// Resolves with the peer chunk receiver once the channel opens.
    pub opened: tokio::sync::oneshot::Receiver<mpsc::Receiver<ChunkFrame>>,
}

/// Runs the handshake on its own task so the session loop never blocks on
/// connector progress. The task holds the connector alive for as long as
/// the session keeps the `inbound` sender; dropping it tears the peer
/// connection down.
pub fn spawn_negotiation(
    connector: Box<dyn PeerConnector>,
    timeout: std::time::Duration,
) -> NegotiationChannels {
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Value>();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
    let (opened_tx, opened_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let mut negotiator = Negotiator::new(connector);

        let offer = match negotiator.start().await {
            Ok(offer) => offer,
            Err(e) => {
                info!("[Negotiator] offer failed, staying on signaling path: {e}");
                return;
            }
        };
        if out_tx.send(offer).is_err() {
            return;
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // Handshake phase: apply forwards until the channel opens or the
        // deadline passes.
        let chunk_rx = loop {
            tokio::select! {
                () = &mut deadline => {
                    info!("[Negotiator] handshake timed out, staying on signaling path");
                    negotiator.close().await;
                    return;
                }
                payload = in_rx.recv() => {
                    let Some(payload) = payload else {
                        negotiator.close().await;
                        return;
                    };
                    if let Err(e) = negotiator.handle_forward(payload).await {
                        info!("[Negotiator] handshake failed, staying on signaling path: {e}");
                        negotiator.close().await;
                        return;
                    }
                }
                result = negotiator.wait_channel() => {
                    match result {
                        Ok(rx) => break rx,
                        Err(e) => {
                            info!("[Negotiator] channel never opened, staying on signaling path: {e}");
                            negotiator.close().await;
                            return;
                        }
                    }
                }
            }
        };

        if opened_tx.send(chunk_rx).is_err() {
            negotiator.close().await;
            return;
        }

        // Keep the connection alive; late candidates still apply.
        while let Some(payload) = in_rx.recv().await {
            if let Err(e) = negotiator.handle_forward(payload).await {
                debug!("[Negotiator] ignoring late handshake payload: {e}");
            }
        }
        negotiator.close().await;
    });

    NegotiationChannels {
        inbound: in_tx,
        outbound: out_rx,
        opened: opened_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct CallLog {
        answers: Vec<Value>,
        candidates: Vec<Value>,
    }

    struct ScriptedConnector {
        log: Arc<Mutex<CallLog>>,
    }

    #[async_trait]
    impl PeerConnector for ScriptedConnector {
        async fn create_offer(&mut self) -> Result<Value, NegotiationError> {
            Ok(json!({"type": "offer", "sdp": "local"}))
        }

        async fn accept_answer(&mut self, payload: Value) -> Result<(), NegotiationError> {
            self.log.lock().answers.push(payload);
            Ok(())
        }

        async fn add_candidate(&mut self, payload: Value) -> Result<(), NegotiationError> {
            self.log.lock().candidates.push(payload);
            Ok(())
        }

        async fn wait_channel(&mut self) -> Result<mpsc::Receiver<ChunkFrame>, NegotiationError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn close(&mut self) {}
    }

    fn scripted() -> (Negotiator, Arc<Mutex<CallLog>>) {
        let log = Arc::new(Mutex::new(CallLog::default()));
        let negotiator = Negotiator::new(Box::new(ScriptedConnector {
            log: Arc::clone(&log),
        }));
        (negotiator, log)
    }

    #[tokio::test]
    async fn answer_before_offer_is_discarded() {
        let (mut negotiator, log) = scripted();
        negotiator
            .handle_forward(json!({"type": "answer", "sdp": "remote"}))
            .await
            .unwrap();
        assert!(log.lock().answers.is_empty());
    }

    #[tokio::test]
    async fn duplicate_answer_is_discarded_after_connect() {
        let (mut negotiator, log) = scripted();
        negotiator.start().await.unwrap();
        negotiator
            .handle_forward(json!({"type": "answer", "sdp": "remote"}))
            .await
            .unwrap();
        negotiator.wait_channel().await.unwrap();
        negotiator
            .handle_forward(json!({"type": "answer", "sdp": "remote-again"}))
            .await
            .unwrap();
        assert_eq!(log.lock().answers.len(), 1);
    }

    #[tokio::test]
    async fn candidates_apply_once_offer_is_out() {
        let (mut negotiator, log) = scripted();
        negotiator
            .handle_forward(json!({"type": "ice-candidate", "candidate": "early"}))
            .await
            .unwrap();
        negotiator.start().await.unwrap();
        negotiator
            .handle_forward(json!({"type": "ice-candidate", "candidate": "c1"}))
            .await
            .unwrap();
        let log = log.lock();
        assert_eq!(log.candidates.len(), 1);
        assert_eq!(log.candidates[0]["candidate"], "c1");
    }
}
