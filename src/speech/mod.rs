//! Speech output
//!
//! The [`SpeechCoordinator`] is the only way the daemon speaks. It cancels
//! whatever is playing before each new utterance, so the sink never plays
//! two texts at once, and its completion never fails.

mod sink;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

pub use sink::{CommandSink, ConsoleSink};

/// Errors raised by a speech sink
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("failed to launch speech program: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("speech program exited with status {0:?}")]
    Exit(Option<i32>),

    #[error("speech output io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can say a piece of text out loud
///
/// `speak` resolves when playback ends. Dropping the returned future must
/// stop playback.
#[async_trait]
pub trait SpeechSink: Send + Sync {
    async fn speak(&self, text: &str) -> Result<(), SpeechError>;
}

/// Serializes utterances onto a single sink
pub struct SpeechCoordinator {
    sink: Arc<dyn SpeechSink>,
    /// Bumped on every cancellation; in-flight utterances watch it
    cancel_tx: watch::Sender<u64>,
}

impl SpeechCoordinator {
    pub fn new(sink: Arc<dyn SpeechSink>) -> Self {
        let (cancel_tx, _) = watch::channel(0);
        Self { sink, cancel_tx }
    }

    /// Cancel everything queued or playing, then speak `text`
    ///
    /// The cancellation happens before this returns, so a later
    /// [`cancel_all`](Self::cancel_all) always reaches this utterance even if
    /// the returned future has not been polled yet.
    pub fn speak(&self, text: impl Into<String>) -> impl Future<Output = ()> + Send + 'static {
        self.cancel_all();

        let text = text.into();
        let mut cancelled = self.cancel_tx.subscribe();
        let sink = Arc::clone(&self.sink);

        async move {
            tokio::select! {
                result = sink.speak(&text) => {
                    if let Err(e) = result {
                        warn!(error = %e, "speech playback failed");
                    }
                }
                _ = cancelled.changed() => {
                    debug!("utterance cancelled");
                }
            }
        }
    }

    /// Cancel any queued or playing utterance
    pub fn cancel_all(&self) {
        self.cancel_tx.send_modify(|epoch| *epoch += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        spoken: Mutex<Vec<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl SpeechSink for Recording {
        async fn speak(&self, text: &str) -> Result<(), SpeechError> {
            self.spoken.lock().unwrap().push(text.to_string());
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl SpeechSink for Broken {
        async fn speak(&self, _text: &str) -> Result<(), SpeechError> {
            Err(SpeechError::Exit(Some(1)))
        }
    }

    #[tokio::test]
    async fn test_speak_completes() {
        let sink = Arc::new(Recording::default());
        let speech = SpeechCoordinator::new(sink.clone());

        speech.speak("Hi! What do you want?").await;
        assert_eq!(*sink.spoken.lock().unwrap(), vec!["Hi! What do you want?"]);
    }

    #[tokio::test]
    async fn test_errors_are_swallowed() {
        let speech = SpeechCoordinator::new(Arc::new(Broken));
        tokio::time::timeout(Duration::from_secs(1), speech.speak("hello"))
            .await
            .expect("failed playback must still complete");
    }

    #[tokio::test]
    async fn test_cancel_all_ends_long_utterance() {
        let sink = Arc::new(Recording {
            spoken: Mutex::new(Vec::new()),
            delay: Duration::from_secs(30),
        });
        let speech = SpeechCoordinator::new(sink);

        let playing = tokio::spawn(speech.speak("a very long answer"));
        speech.cancel_all();

        tokio::time::timeout(Duration::from_secs(1), playing)
            .await
            .expect("cancelled utterance should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_new_utterance_cancels_previous() {
        let sink = Arc::new(Recording {
            spoken: Mutex::new(Vec::new()),
            delay: Duration::from_millis(200),
        });
        let speech = SpeechCoordinator::new(sink.clone());

        let first = tokio::spawn(speech.speak("first"));
        let second = speech.speak("second");

        tokio::time::timeout(Duration::from_millis(100), first)
            .await
            .expect("first utterance should be cut off")
            .unwrap();
        second.await;
        assert_eq!(sink.spoken.lock().unwrap().last().map(String::as_str), Some("second"));
    }
}
