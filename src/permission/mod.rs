//! Microphone permission gate
//!
//! Access is requested once at startup. A denial leaves the assistant idle;
//! every later start request asks again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

/// Errors returned when microphone access is refused
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("microphone access denied: {0}")]
    Denied(String),
}

/// Platform hook that asks for microphone access
#[async_trait]
pub trait MicrophoneAccess: Send + Sync {
    async fn request(&self) -> Result<(), PermissionError>;
}

/// Asks the platform for microphone access
///
/// The outcome is not cached here; the state machine owns the granted flag.
pub struct PermissionGate {
    access: Arc<dyn MicrophoneAccess>,
}

impl PermissionGate {
    pub fn new(access: Arc<dyn MicrophoneAccess>) -> Self {
        Self { access }
    }

    /// Ask for access, logging the outcome
    pub async fn acquire(&self) -> bool {
        match self.access.request().await {
            Ok(()) => {
                info!("microphone permission granted");
                true
            }
            Err(e) => {
                warn!(error = %e, "microphone permission denied, enable it in settings");
                false
            }
        }
    }
}
