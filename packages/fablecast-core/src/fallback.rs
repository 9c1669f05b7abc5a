//! Local fallback speech adapter.
//!
//! When the remote stream fails, the remaining text is spoken by a local,
//! non-streaming utterance engine. The engine reports word/sentence boundary
//! events; the adapter tracks the absolute character offset so that a
//! pause/resume cycle re-synthesizes exactly the unspoken remainder. The
//! engine itself has no seek, so resume means cancel-and-respeak-from-offset.

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::error::FablecastResult;

/// Progress event from a running utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtteranceEvent {
    /// The engine reached a word or sentence boundary at this character
    /// offset into the text passed to `speak`.
    Boundary { char_index: usize },
    /// The utterance played to its natural end.
    Finished,
    /// The utterance failed mid-speech.
    Failed { message: String },
}

/// A platform speech synthesizer that can speak one utterance at a time.
///
/// `speak` starts the utterance and returns; progress arrives on the event
/// channel. Canceling via `stop` must not emit `Finished` for the canceled
/// utterance (dropping the event sender is sufficient).
#[async_trait]
pub trait LocalUtteranceEngine: Send {
    /// Starts speaking `text`, replacing any in-flight utterance.
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot start synthesis at all.
    async fn speak(
        &mut self,
        text: &str,
        events: mpsc::UnboundedSender<UtteranceEvent>,
    ) -> FablecastResult<()>;

    /// Cancels the in-flight utterance immediately, if any.
    async fn stop(&mut self);
}

/// Creates one engine per fallback engagement.
pub trait UtteranceEngineFactory: Send + Sync {
    fn create_engine(&self) -> Box<dyn LocalUtteranceEngine>;
}

/// Drives a [`LocalUtteranceEngine`] with pause/resume-by-offset semantics.
pub struct FallbackAdapter {
    engine: Box<dyn LocalUtteranceEngine>,
    full_text: String,
    /// Absolute character offset of the utterance currently in flight.
    base_offset: usize,
    /// Last observed absolute boundary offset.
    char_index: usize,
    speaking: bool,
    paused: bool,
    /// Receiver for the in-flight utterance. Replaced on every `speak`, so
    /// events from a canceled utterance can never be observed.
    events: Option<mpsc::UnboundedReceiver<UtteranceEvent>>,
}

impl FallbackAdapter {
    #[must_use]
    pub fn new(engine: Box<dyn LocalUtteranceEngine>) -> Self {
        Self {
            engine,
            full_text: String::new(),
            base_offset: 0,
            char_index: 0,
            speaking: false,
            paused: false,
            events: None,
        }
    }

    /// Starts speaking `text` from the beginning.
    ///
    /// # Errors
    ///
    /// Propagates engine start failures.
    pub async fn speak(&mut self, text: &str) -> FablecastResult<()> {
        self.full_text = text.to_string();
        self.base_offset = 0;
        self.char_index = 0;
        self.paused = false;
        self.start_utterance(0).await
    }

    /// Suspends speech at the last observed boundary.
    pub async fn pause(&mut self) {
        if !self.speaking {
            return;
        }
        debug!("[Fallback] pausing at char {}", self.char_index);
        self.engine.stop().await;
        self.events = None;
        self.speaking = false;
        self.paused = true;
    }

    /// Resumes by re-synthesizing the text from the last boundary.
    ///
    /// # Errors
    ///
    /// Propagates engine start failures.
    pub async fn resume(&mut self) -> FablecastResult<()> {
        if !self.paused {
            return Ok(());
        }
        debug!("[Fallback] resuming from char {}", self.char_index);
        self.paused = false;
        self.start_utterance(self.char_index).await
    }

    /// Cancels speech immediately.
    pub async fn stop(&mut self) {
        self.engine.stop().await;
        self.events = None;
        self.speaking = false;
        self.paused = false;
    }

    /// Waits for the next event from the in-flight utterance, rewritten to
    /// absolute character offsets. Returns `None` when nothing is in flight
    /// or the engine dropped its sender without finishing.
    pub async fn next_event(&mut self) -> Option<UtteranceEvent> {
        let rx = self.events.as_mut()?;
        let event = rx.recv().await?;
        match event {
            UtteranceEvent::Boundary { char_index } => {
                self.char_index = self.base_offset + char_index;
                Some(UtteranceEvent::Boundary {
                    char_index: self.char_index,
                })
            }
            UtteranceEvent::Finished => {
                self.speaking = false;
                self.events = None;
                Some(UtteranceEvent::Finished)
            }
            UtteranceEvent::Failed { message } => {
                self.speaking = false;
                self.events = None;
                Some(UtteranceEvent::Failed { message })
            }
        }
    }

    /// Last observed absolute boundary offset.
    #[must_use]
    pub fn char_index(&self) -> usize {
        self.char_index
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    async fn start_utterance(&mut self, from_char: usize) -> FablecastResult<()> {
        let remainder = &self.full_text[byte_offset(&self.full_text, from_char)..];
        if remainder.is_empty() {
            info!("[Fallback] nothing left to speak");
            self.speaking = false;
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.engine.speak(remainder, tx).await?;
        self.base_offset = from_char;
        self.events = Some(rx);
        self.speaking = true;
        Ok(())
    }
}

/// Converts a character offset to a byte offset, saturating at the end.
fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map_or(text.len(), |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Engine that records every `speak` call and hands the sender back to
    /// the test for manual event injection.
    struct RecordingEngine {
        spoken: Arc<Mutex<Vec<String>>>,
        sender: Arc<Mutex<Option<mpsc::UnboundedSender<UtteranceEvent>>>>,
        stops: Arc<Mutex<usize>>,
    }

    impl RecordingEngine {
        fn new() -> (
            Self,
            Arc<Mutex<Vec<String>>>,
            Arc<Mutex<Option<mpsc::UnboundedSender<UtteranceEvent>>>>,
        ) {
            let spoken = Arc::new(Mutex::new(Vec::new()));
            let sender = Arc::new(Mutex::new(None));
            let engine = Self {
                spoken: Arc::clone(&spoken),
                sender: Arc::clone(&sender),
                stops: Arc::new(Mutex::new(0)),
            };
            (engine, spoken, sender)
        }
    }

    #[async_trait]
    impl LocalUtteranceEngine for RecordingEngine {
        async fn speak(
            &mut self,
            text: &str,
            events: mpsc::UnboundedSender<UtteranceEvent>,
        ) -> FablecastResult<()> {
            self.spoken.lock().push(text.to_string());
            *self.sender.lock() = Some(events);
            Ok(())
        }

        async fn stop(&mut self) {
            *self.stops.lock() += 1;
        }
    }

    #[tokio::test]
    async fn resume_respeaks_only_the_remainder() {
        let (engine, spoken, sender) = RecordingEngine::new();
        let mut adapter = FallbackAdapter::new(Box::new(engine));

        adapter.speak("once upon a time").await.unwrap();
        assert_eq!(spoken.lock().as_slice(), ["once upon a time"]);

        // Engine reports a boundary at "upon" (char 5).
        sender
            .lock()
            .as_ref()
            .unwrap()
            .send(UtteranceEvent::Boundary { char_index: 5 })
            .unwrap();
        assert_eq!(
            adapter.next_event().await,
            Some(UtteranceEvent::Boundary { char_index: 5 })
        );

        adapter.pause().await;
        assert!(adapter.is_paused());
        adapter.resume().await.unwrap();

        assert_eq!(spoken.lock().as_slice(), ["once upon a time", "upon a time"]);
    }

    #[tokio::test]
    async fn boundaries_after_resume_are_absolute() {
        let (engine, _spoken, sender) = RecordingEngine::new();
        let mut adapter = FallbackAdapter::new(Box::new(engine));

        adapter.speak("one two three").await.unwrap();
        sender
            .lock()
            .as_ref()
            .unwrap()
            .send(UtteranceEvent::Boundary { char_index: 4 })
            .unwrap();
        adapter.next_event().await;

        adapter.pause().await;
        adapter.resume().await.unwrap();

        // Boundary at char 4 of the remainder "two three" = absolute char 8.
        sender
            .lock()
            .as_ref()
            .unwrap()
            .send(UtteranceEvent::Boundary { char_index: 4 })
            .unwrap();
        assert_eq!(
            adapter.next_event().await,
            Some(UtteranceEvent::Boundary { char_index: 8 })
        );
        assert_eq!(adapter.char_index(), 8);
    }

    #[tokio::test]
    async fn finished_clears_speaking_flag() {
        let (engine, _spoken, sender) = RecordingEngine::new();
        let mut adapter = FallbackAdapter::new(Box::new(engine));

        adapter.speak("hi").await.unwrap();
        assert!(adapter.is_speaking());

        sender
            .lock()
            .as_ref()
            .unwrap()
            .send(UtteranceEvent::Finished)
            .unwrap();
        assert_eq!(adapter.next_event().await, Some(UtteranceEvent::Finished));
        assert!(!adapter.is_speaking());
    }
}
