//! State machine module for the voice interaction loop
//!
//! Provides an explicit state machine with seven modes:
//! - Idle: Not started, or waiting for microphone permission
//! - WakeListening: Passive capture, waiting for the wake word
//! - Activating: Capture stopped, speaking the prompt
//! - Prompting: Short settle pause before listening for the question
//! - QuestionListening: Capturing one spoken question
//! - Answering: Asking the answer service and speaking the reply
//! - Stopped: Stopped by the user
//!
//! [`Machine`] holds the pure transition logic and [`Runtime`] executes
//! its commands against the capture, speech and answer collaborators.

mod machine;
mod runtime;

pub use machine::{Input, Machine, MachineConfig, Mode};
pub use runtime::Runtime;
