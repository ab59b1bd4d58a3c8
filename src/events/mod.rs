//! Events emitted by the interaction state machine
//!
//! These are the presentation state of the assistant: mode changes, what
//! was heard, what was answered. They are logged, broadcast to IPC
//! subscribers and folded into the status snapshot.

use serde::{Deserialize, Serialize};

use crate::capture::Generation;
use crate::state::Mode;

/// Events emitted by the state machine during transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// The machine moved between modes
    ModeChanged { from: Mode, to: Mode },

    /// Microphone access was granted or refused
    PermissionChanged { granted: bool },

    /// A capture session reported that it is listening
    CaptureStarted { generation: Generation },

    /// Something was heard; interim transcripts are for display only
    Transcript { text: String, is_final: bool },

    /// A final transcript was accepted as the question of a new turn
    QuestionAccepted { question: String },

    /// The text about to be spoken in reply; `fallback` marks the apology
    Answer { text: String, fallback: bool },

    /// Capture failed with an error that restarts wake listening
    CaptureFailed { reason: String },
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::ModeChanged { from, to } => write!(f, "MODE {} -> {}", from, to),
            StateEvent::PermissionChanged { granted } => {
                write!(f, "PERMISSION {}", if *granted { "GRANTED" } else { "DENIED" })
            }
            StateEvent::CaptureStarted { generation } => {
                write!(f, "CAPTURE_STARTED {}", generation)
            }
            StateEvent::Transcript { text, is_final } => {
                let kind = if *is_final { "FINAL" } else { "INTERIM" };
                write!(f, "TRANSCRIPT ({}) {:?}", kind, text)
            }
            StateEvent::QuestionAccepted { question } => write!(f, "QUESTION {:?}", question),
            StateEvent::Answer { text, fallback } => {
                if *fallback {
                    write!(f, "ANSWER (fallback) {:?}", text)
                } else {
                    write!(f, "ANSWER {:?}", text)
                }
            }
            StateEvent::CaptureFailed { reason } => write!(f, "CAPTURE_FAILED {}", reason),
        }
    }
}
