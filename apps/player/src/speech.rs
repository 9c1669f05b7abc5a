//! Console fallback engine.
//!
//! Stands in for a platform speech synthesizer: it prints the text to the
//! terminal word by word at a configured speaking rate, emitting a boundary
//! event per word so pause/resume lands on word boundaries like a real
//! engine would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fablecast_core::error::FablecastResult;
use fablecast_core::fallback::{LocalUtteranceEngine, UtteranceEngineFactory, UtteranceEvent};
use tokio::sync::mpsc;

/// Engine that "speaks" by printing words at a paced cadence.
pub struct ConsoleEngine {
    word_delay: Duration,
    /// Cancel flag of the in-flight utterance.
    cancel: Option<Arc<AtomicBool>>,
}

impl ConsoleEngine {
    fn new(words_per_min: u32) -> Self {
        let wpm = words_per_min.max(1);
        Self {
            word_delay: Duration::from_secs_f64(60.0 / f64::from(wpm)),
            cancel: None,
        }
    }
}

#[async_trait]
impl LocalUtteranceEngine for ConsoleEngine {
    async fn speak(
        &mut self,
        text: &str,
        events: mpsc::UnboundedSender<UtteranceEvent>,
    ) -> FablecastResult<()> {
        if let Some(previous) = self.cancel.take() {
            previous.store(true, Ordering::SeqCst);
        }
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel = Some(Arc::clone(&cancel));

        let words = words_with_offsets(text);
        let delay = self.word_delay;
        tokio::spawn(async move {
            for (char_index, word) in words {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                if events
                    .send(UtteranceEvent::Boundary { char_index })
                    .is_err()
                {
                    return;
                }
                print!("{word} ");
                let _ = std::io::Write::flush(&mut std::io::stdout());
                tokio::time::sleep(delay).await;
            }
            if !cancel.load(Ordering::SeqCst) {
                println!();
                let _ = events.send(UtteranceEvent::Finished);
            }
        });
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.store(true, Ordering::SeqCst);
        }
    }
}

/// Splits text into words paired with their character offsets.
fn words_with_offsets(text: &str) -> Vec<(usize, String)> {
    let mut words = Vec::new();
    let mut current: Option<(usize, String)> = None;
    for (char_index, ch) in text.chars().enumerate() {
        if ch.is_whitespace() {
            if let Some(word) = current.take() {
                words.push(word);
            }
        } else {
            match &mut current {
                Some((_, word)) => word.push(ch),
                None => current = Some((char_index, ch.to_string())),
            }
        }
    }
    if let Some(word) = current.take() {
        words.push(word);
    }
    words
}

/// Factory for console engines at a fixed speaking rate.
pub struct ConsoleEngineFactory {
    words_per_min: u32,
}

impl ConsoleEngineFactory {
    #[must_use]
    pub fn new(words_per_min: u32) -> Self {
        Self { words_per_min }
    }
}

impl UtteranceEngineFactory for ConsoleEngineFactory {
    fn create_engine(&self) -> Box<dyn LocalUtteranceEngine> {
        Box::new(ConsoleEngine::new(self.words_per_min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_offsets_are_character_based() {
        let words = words_with_offsets("once upon  a time");
        assert_eq!(
            words,
            vec![
                (0, "once".to_string()),
                (5, "upon".to_string()),
                (11, "a".to_string()),
                (13, "time".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn emits_boundaries_then_finished() {
        let mut engine = ConsoleEngine::new(60_000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.speak("hi there", tx).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(UtteranceEvent::Boundary { char_index: 0 })
        );
        assert_eq!(
            rx.recv().await,
            Some(UtteranceEvent::Boundary { char_index: 3 })
        );
        assert_eq!(rx.recv().await, Some(UtteranceEvent::Finished));
    }
}
