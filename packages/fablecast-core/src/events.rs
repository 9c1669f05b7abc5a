//! Playback state events and the observer channel they travel on.
//!
//! Sessions publish [`StateSnapshot`]s on a broadcast channel rather than
//! invoking caller-supplied callbacks, so observers can never re-enter the
//! playback pipeline. Slow subscribers lose the oldest snapshots; the latest
//! state always gets through.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::protocol_constants::STATE_EVENT_CAPACITY;

/// Coarse lifecycle states of a playback session.
///
/// Transitions follow the session lifecycle: `Idle` until the first chunk is
/// appended, `Speaking`/`Paused` while audio flows, and exactly one of
/// `Idle` (natural completion), `Stopped` (caller stop), or `Error`
/// (unrecoverable failure) as the terminal publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// No playback in progress.
    Idle,
    /// Audio is being appended and rendered.
    Speaking,
    /// Playback suspended (caller pause or buffer-health recovery).
    Paused,
    /// Playback cancelled by the caller.
    Stopped,
    /// Playback ended due to an unrecoverable failure.
    Error,
}

impl PlaybackState {
    /// Whether this state ends the session (no further transitions follow).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Error)
    }
}

/// One published observation of session state.
///
/// `char_index` is only populated while the local fallback engine is active;
/// streamed playback reports progress through `position_secs` instead.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    /// Coarse lifecycle state.
    pub state: PlaybackState,
    /// Whether audio is actively being rendered.
    pub is_speaking: bool,
    /// Whether playback is suspended.
    pub is_paused: bool,
    /// Playback position in seconds, if the sink reports one.
    pub position_secs: Option<f64>,
    /// Character offset into the source text (fallback engine only).
    pub char_index: Option<usize>,
    /// Human-readable detail for `Error` publications.
    pub reason: Option<String>,
    /// Machine-readable error code for `Error` publications, from
    /// [`ErrorCode`](crate::error::ErrorCode).
    pub code: Option<&'static str>,
}

impl StateSnapshot {
    /// Snapshot for a state change with no extra detail.
    #[must_use]
    pub fn of(state: PlaybackState) -> Self {
        Self {
            state,
            is_speaking: state == PlaybackState::Speaking,
            is_paused: state == PlaybackState::Paused,
            position_secs: None,
            char_index: None,
            reason: None,
            code: None,
        }
    }

    /// Attaches a human-readable reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a machine-readable error code.
    #[must_use]
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    /// Attaches the current playback position.
    #[must_use]
    pub fn at_position(mut self, position_secs: f64) -> Self {
        self.position_secs = Some(position_secs);
        self
    }
}

/// Publisher side of the session state channel.
///
/// Publishing never blocks and never fails: if no subscriber is listening
/// the snapshot is dropped, matching `broadcast::Sender` semantics.
#[derive(Debug, Clone)]
pub struct StateNotifier {
    tx: broadcast::Sender<StateSnapshot>,
}

impl StateNotifier {
    /// Creates a notifier with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribes a new observer. Each subscriber sees snapshots published
    /// after its subscription; lagged subscribers skip to the oldest retained.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.tx.subscribe()
    }

    /// Publishes a snapshot, best-effort.
    pub fn publish(&self, snapshot: StateSnapshot) {
        tracing::debug!(state = ?snapshot.state, reason = ?snapshot.reason, "state_snapshot");
        // Err here only means there are no subscribers right now.
        let _ = self.tx.send(snapshot);
    }
}

impl Default for StateNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(PlaybackState::Idle.is_terminal());
        assert!(PlaybackState::Stopped.is_terminal());
        assert!(PlaybackState::Error.is_terminal());
        assert!(!PlaybackState::Speaking.is_terminal());
        assert!(!PlaybackState::Paused.is_terminal());
    }

    #[test]
    fn snapshot_flags_follow_state() {
        let speaking = StateSnapshot::of(PlaybackState::Speaking);
        assert!(speaking.is_speaking);
        assert!(!speaking.is_paused);

        let paused = StateSnapshot::of(PlaybackState::Paused);
        assert!(!paused.is_speaking);
        assert!(paused.is_paused);
    }

    #[test]
    fn error_snapshot_carries_reason_and_code() {
        let snapshot = StateSnapshot::of(PlaybackState::Error)
            .with_reason("server refused the text")
            .with_code("server_error");
        assert_eq!(snapshot.reason.as_deref(), Some("server refused the text"));
        assert_eq!(snapshot.code, Some("server_error"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let notifier = StateNotifier::new();
        notifier.publish(StateSnapshot::of(PlaybackState::Idle));

        let mut rx = notifier.subscribe();
        notifier.publish(StateSnapshot::of(PlaybackState::Speaking));
        let seen = rx.recv().await.expect("snapshot delivered");
        assert_eq!(seen.state, PlaybackState::Speaking);
    }
}
