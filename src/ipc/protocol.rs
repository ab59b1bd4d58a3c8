//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::events::StateEvent;
use crate::state::Mode;

/// Requests from UI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current assistant status
    GetStatus,

    /// Start listening for the wake word
    Start,

    /// Stop listening and speaking
    Stop,

    /// Ping to check connectivity
    Ping,

    /// Subscribe to state event notifications
    Subscribe,
}

/// Responses from daemon to UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current assistant status
    Status(AssistantStatus),

    /// Start or stop was queued
    Ack,

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Pushed to subscribed clients for every state event
    Event { event: StateEvent },

    /// Error response
    Error { code: String, message: String },
}

/// Presentation state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantStatus {
    /// Daemon version
    pub version: String,

    /// Current mode
    pub mode: Mode,

    /// Human readable status line
    pub status: String,

    /// Whether microphone access was granted
    pub permission_granted: bool,

    /// Most recent transcript, interim or final
    pub last_transcript: Option<String>,

    /// Most recent spoken answer
    pub last_answer: Option<String>,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl Default for AssistantStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            mode: Mode::default(),
            status: Mode::default().status_text().to_string(),
            permission_granted: false,
            last_transcript: None,
            last_answer: None,
            uptime_secs: 0,
        }
    }
}

impl AssistantStatus {
    /// Fold a state event into the snapshot
    pub fn apply(&mut self, event: &StateEvent) {
        match event {
            StateEvent::ModeChanged { to, .. } => {
                self.mode = *to;
                self.status = to.status_text().to_string();
            }
            StateEvent::PermissionChanged { granted } => {
                self.permission_granted = *granted;
                self.status = if *granted {
                    self.mode.status_text().to_string()
                } else {
                    "Microphone permission denied. Please enable it in settings.".to_string()
                };
            }
            StateEvent::Transcript { text, .. } => {
                self.last_transcript = Some(text.clone());
            }
            StateEvent::Answer { text, .. } => {
                self.last_answer = Some(text.clone());
                self.status = "Speaking...".to_string();
            }
            StateEvent::CaptureStarted { .. }
            | StateEvent::QuestionAccepted { .. }
            | StateEvent::CaptureFailed { .. } => {}
        }
    }
}
