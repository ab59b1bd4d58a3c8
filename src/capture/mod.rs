//! Speech capture source
//!
//! A capture source turns microphone audio into transcript events. Each
//! started session is tagged with a [`Generation`]; every event it emits
//! carries that generation so the state machine can drop events from a
//! session it has already stopped.

mod console;

use serde::{Deserialize, Serialize};

pub use console::ConsoleCapture;

/// Identity of one capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One recognition result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    /// The recognizer will not revise this result
    pub is_final: bool,
    /// Recognizer confidence in `[0, 1]`, when reported
    pub confidence: Option<f32>,
}

impl TranscriptEvent {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence: None,
        }
    }

    #[cfg(test)]
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: None,
        }
    }
}

/// Kinds of capture errors reported by the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureErrorKind {
    /// Nothing was said before the recognizer gave up
    NoSpeech,
    /// The session was aborted, usually as a side effect of `stop()`
    Aborted,
    /// Anything else (device lost, network, not allowed, ...)
    Other(String),
}

impl std::fmt::Display for CaptureErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureErrorKind::NoSpeech => write!(f, "no-speech"),
            CaptureErrorKind::Aborted => write!(f, "aborted"),
            CaptureErrorKind::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// Events emitted by a capture session
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Started,
    Transcript(TranscriptEvent),
    Error(CaptureErrorKind),
    /// The session ended, whether asked to or not
    Ended,
}

/// Errors returned synchronously by a capture source
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture session {0} is still active")]
    AlreadyActive(Generation),
}

/// Contract for a continuous speech-to-text source
///
/// Calls are cheap and never block; results arrive later as
/// [`crate::state::Input::Capture`] messages on the machine's queue.
pub trait CaptureSource: Send {
    /// Begin a new session. Starting while a session is active is an error.
    fn start(&mut self, generation: Generation) -> Result<(), CaptureError>;

    /// Stop the session with the given generation, if it is still active
    fn stop(&mut self, generation: Generation);
}
