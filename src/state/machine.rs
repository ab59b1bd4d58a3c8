//! Core state machine implementation
//!
//! The machine never calls a collaborator. Each [`Input`] goes through
//! [`Machine::handle`], which updates the owned state and returns the
//! [`Command`]s the runtime has to carry out, in order.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::answer::AnswerError;
use crate::capture::{CaptureErrorKind, CaptureEvent, Generation, TranscriptEvent};
use crate::events::StateEvent;
use crate::wake::WakeMatcher;

/// The seven modes of the interaction loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Not started, or waiting for microphone permission
    Idle,
    /// Capturing, waiting for the wake word
    WakeListening,
    /// Wake word heard, speaking the prompt
    Activating,
    /// Prompt spoken, settling before question capture
    Prompting,
    /// Capturing the question
    QuestionListening,
    /// Waiting for and speaking the answer
    Answering,
    /// Stopped by the user
    Stopped,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Idle
    }
}

impl Mode {
    /// Whether a capture session belongs in this mode
    pub fn is_listening(self) -> bool {
        matches!(self, Mode::WakeListening | Mode::QuestionListening)
    }

    /// Whether the transition table allows moving from `self` to `next`
    pub fn can_transition_to(self, next: Mode) -> bool {
        use Mode::*;

        if next == Stopped {
            return true;
        }
        matches!(
            (self, next),
            (Idle, WakeListening)
                | (Stopped, WakeListening)
                | (WakeListening, Activating)
                | (Activating, Prompting)
                | (Prompting, QuestionListening)
                | (QuestionListening, Answering)
                | (QuestionListening, WakeListening)
                | (Answering, WakeListening)
        )
    }

    /// Short status line for display
    pub fn status_text(self) -> &'static str {
        match self {
            Mode::Idle => "Waiting to start",
            Mode::WakeListening => "Listening for the wake word...",
            Mode::Activating => "Speaking...",
            Mode::Prompting => "Get ready...",
            Mode::QuestionListening => "Listening for your question...",
            Mode::Answering => "Thinking...",
            Mode::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Idle => write!(f, "Idle"),
            Mode::WakeListening => write!(f, "WakeListening"),
            Mode::Activating => write!(f, "Activating"),
            Mode::Prompting => write!(f, "Prompting"),
            Mode::QuestionListening => write!(f, "QuestionListening"),
            Mode::Answering => write!(f, "Answering"),
            Mode::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Identity of one utterance handed to the speech coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UtteranceId(pub u64);

/// Identity of one question/answer turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(pub u64);

/// Identity of one scheduled delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// What a pending timer is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPurpose {
    /// Start capture again in the current listening mode
    RestartCapture,
    /// Leave Prompting for QuestionListening
    PromptSettle,
    /// Leave Answering for WakeListening
    ResumeWake,
}

/// One question and, once received, its answer
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub id: TurnId,
    pub question: String,
    pub answer: Option<String>,
}

/// Timings and utterances used by the machine
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Pause between stopping one capture session and starting the next
    pub settle_delay: Duration,
    pub no_speech_restart_delay: Duration,
    pub aborted_restart_delay: Duration,
    /// Delay before restarting after an unsolicited end of session
    pub ended_restart_delay: Duration,
    pub fatal_restart_delay: Duration,
    /// Final transcripts shorter than this are noise during question capture
    pub min_question_chars: usize,
    pub prompt_utterance: String,
    pub fallback_utterance: String,
    /// Enter wake listening as soon as permission is granted
    pub auto_start: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            no_speech_restart_delay: Duration::from_millis(1000),
            aborted_restart_delay: Duration::from_millis(250),
            ended_restart_delay: Duration::from_millis(1000),
            fatal_restart_delay: Duration::from_millis(1000),
            min_question_chars: 3,
            prompt_utterance: "Hi! What do you want?".to_string(),
            fallback_utterance: "Sorry, I had trouble connecting to my brain.".to_string(),
            auto_start: true,
        }
    }
}

/// Messages processed by the machine, one at a time
#[derive(Debug)]
pub enum Input {
    /// User asked to start listening
    Start,
    /// User asked to stop everything
    Stop,
    PermissionResolved { granted: bool },
    /// An event from the capture session with the given generation
    Capture {
        generation: Generation,
        event: CaptureEvent,
    },
    /// An utterance finished playing, failed, or was cancelled
    SpeechFinished { utterance: UtteranceId },
    AnswerReady {
        turn: TurnId,
        outcome: Result<String, AnswerError>,
    },
    TimerFired { timer: TimerId },
}

/// Side effects requested by the machine
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RequestPermission,
    StartCapture(Generation),
    StopCapture(Generation),
    Speak { utterance: UtteranceId, text: String },
    CancelSpeech,
    Ask { turn: TurnId, question: String },
    Schedule { timer: TimerId, delay: Duration },
    CancelTimer(TimerId),
    Emit(StateEvent),
}

/// The interaction state machine
pub struct Machine {
    config: MachineConfig,
    wake: WakeMatcher,
    mode: Mode,
    granted: bool,
    /// The only capture session whose events are acted upon
    session: Option<Generation>,
    last_generation: u64,
    speaking: Option<UtteranceId>,
    last_utterance: u64,
    timer: Option<(TimerId, TimerPurpose)>,
    last_timer: u64,
    turn: Option<ConversationTurn>,
    last_turn: u64,
}

impl Machine {
    /// Create a new machine in Idle mode
    pub fn new(config: MachineConfig, wake: WakeMatcher) -> Self {
        Self {
            config,
            wake,
            mode: Mode::Idle,
            granted: false,
            session: None,
            last_generation: 0,
            speaking: None,
            last_utterance: 0,
            timer: None,
            last_timer: 0,
            turn: None,
            last_turn: 0,
        }
    }

    /// Commands to run once at startup
    pub fn boot(&mut self) -> Vec<Command> {
        info!("state machine started in Idle mode");
        vec![Command::RequestPermission]
    }

    /// Process one input and return the commands it produces
    pub fn handle(&mut self, input: Input) -> Vec<Command> {
        let mut out = Vec::new();

        match input {
            Input::Start => self.on_start(&mut out),
            Input::Stop => self.on_stop(&mut out),
            Input::PermissionResolved { granted } => self.on_permission(granted, &mut out),
            Input::Capture { generation, event } => {
                if self.session != Some(generation) {
                    debug!(
                        %generation,
                        current = ?self.session,
                        ?event,
                        "discarding event from stale capture session"
                    );
                } else {
                    self.on_capture(event, &mut out);
                }
            }
            Input::SpeechFinished { utterance } => self.on_speech_finished(utterance, &mut out),
            Input::AnswerReady { turn, outcome } => self.on_answer(turn, outcome, &mut out),
            Input::TimerFired { timer } => self.on_timer(timer, &mut out),
        }

        out
    }

    fn on_start(&mut self, out: &mut Vec<Command>) {
        match self.mode {
            Mode::Idle | Mode::Stopped => {
                if !self.granted {
                    info!("microphone permission missing, requesting it");
                    out.push(Command::RequestPermission);
                    return;
                }
                self.enter_listening(Mode::WakeListening, out);
            }
            mode => debug!(%mode, "start ignored, already running"),
        }
    }

    fn on_stop(&mut self, out: &mut Vec<Command>) {
        self.stop_capture(out);
        if self.speaking.take().is_some() {
            out.push(Command::CancelSpeech);
        }
        self.cancel_timer(out);
        if let Some(turn) = self.turn.take() {
            debug!(turn = turn.id.0, "conversation turn discarded");
        }
        self.set_mode(Mode::Stopped, out);
    }

    fn on_permission(&mut self, granted: bool, out: &mut Vec<Command>) {
        // Every denial is reported, including repeats after a start retry
        out.push(Command::Emit(StateEvent::PermissionChanged { granted }));
        self.granted = granted;

        if !granted {
            warn!("microphone permission denied, staying idle");
            return;
        }

        if self.config.auto_start && self.mode == Mode::Idle {
            self.enter_listening(Mode::WakeListening, out);
        }
    }

    fn on_capture(&mut self, event: CaptureEvent, out: &mut Vec<Command>) {
        match event {
            CaptureEvent::Started => {
                if let Some(generation) = self.session {
                    debug!(%generation, mode = %self.mode, "capture listening");
                    out.push(Command::Emit(StateEvent::CaptureStarted { generation }));
                }
            }
            CaptureEvent::Transcript(transcript) => self.on_transcript(transcript, out),
            CaptureEvent::Error(kind) => self.on_capture_error(kind, out),
            CaptureEvent::Ended => {
                // Session is already gone; only restart it
                self.session = None;
                debug!(mode = %self.mode, "capture ended unexpectedly, scheduling restart");
                self.schedule(TimerPurpose::RestartCapture, self.config.ended_restart_delay, out);
            }
        }
    }

    fn on_transcript(&mut self, transcript: TranscriptEvent, out: &mut Vec<Command>) {
        let text = transcript.text.trim().to_lowercase();
        out.push(Command::Emit(StateEvent::Transcript {
            text: text.clone(),
            is_final: transcript.is_final,
        }));

        if !transcript.is_final {
            return;
        }

        match self.mode {
            Mode::WakeListening => {
                if !self.wake.matches(&text) {
                    debug!(transcript = %text, "no wake word");
                    return;
                }
                info!(transcript = %text, "wake word detected");
                self.stop_capture(out);
                self.cancel_timer(out);
                self.set_mode(Mode::Activating, out);
                let prompt = self.config.prompt_utterance.clone();
                self.speak(prompt, out);
            }
            Mode::QuestionListening => {
                if text.chars().count() < self.config.min_question_chars {
                    debug!(transcript = %text, "ignoring short utterance as noise");
                    self.stop_capture(out);
                    self.schedule(TimerPurpose::RestartCapture, self.config.settle_delay, out);
                    return;
                }

                self.stop_capture(out);
                self.cancel_timer(out);
                self.set_mode(Mode::Answering, out);

                self.last_turn += 1;
                let turn = TurnId(self.last_turn);
                info!(turn = turn.0, question = %text, "question accepted");
                self.turn = Some(ConversationTurn {
                    id: turn,
                    question: text.clone(),
                    answer: None,
                });
                out.push(Command::Emit(StateEvent::QuestionAccepted {
                    question: text.clone(),
                }));
                out.push(Command::Ask {
                    turn,
                    question: text,
                });
            }
            _ => {}
        }
    }

    fn on_capture_error(&mut self, kind: CaptureErrorKind, out: &mut Vec<Command>) {
        match kind {
            CaptureErrorKind::NoSpeech => {
                debug!(mode = %self.mode, "no speech, restarting capture");
                self.stop_capture(out);
                self.schedule(TimerPurpose::RestartCapture, self.config.no_speech_restart_delay, out);
            }
            CaptureErrorKind::Aborted => {
                debug!(mode = %self.mode, "capture aborted, restarting capture");
                self.stop_capture(out);
                self.schedule(TimerPurpose::RestartCapture, self.config.aborted_restart_delay, out);
            }
            CaptureErrorKind::Other(reason) => {
                warn!(mode = %self.mode, %reason, "capture failed, falling back to wake listening");
                self.stop_capture(out);
                out.push(Command::Emit(StateEvent::CaptureFailed { reason }));
                self.set_mode(Mode::WakeListening, out);
                self.schedule(TimerPurpose::RestartCapture, self.config.fatal_restart_delay, out);
            }
        }
    }

    fn on_speech_finished(&mut self, utterance: UtteranceId, out: &mut Vec<Command>) {
        if self.speaking != Some(utterance) {
            debug!(utterance = utterance.0, "ignoring completion of superseded utterance");
            return;
        }
        self.speaking = None;

        match self.mode {
            Mode::Activating => {
                self.set_mode(Mode::Prompting, out);
                self.schedule(TimerPurpose::PromptSettle, self.config.settle_delay, out);
            }
            Mode::Answering => {
                if let Some(turn) = self.turn.take() {
                    debug!(turn = turn.id.0, "conversation turn complete");
                }
                self.schedule(TimerPurpose::ResumeWake, self.config.settle_delay, out);
            }
            mode => debug!(%mode, "utterance finished"),
        }
    }

    fn on_answer(
        &mut self,
        turn: TurnId,
        outcome: Result<String, AnswerError>,
        out: &mut Vec<Command>,
    ) {
        let awaiting = self.mode == Mode::Answering
            && self
                .turn
                .as_ref()
                .map_or(false, |t| t.id == turn && t.answer.is_none())
            && self.speaking.is_none();
        if !awaiting {
            debug!(turn = turn.0, "ignoring answer for a turn no longer awaited");
            return;
        }

        match outcome {
            Ok(answer) => {
                info!(turn = turn.0, "answer received");
                if let Some(current) = self.turn.as_mut() {
                    current.answer = Some(answer.clone());
                }
                out.push(Command::Emit(StateEvent::Answer {
                    text: answer.clone(),
                    fallback: false,
                }));
                self.speak(answer, out);
            }
            Err(e) => {
                warn!(turn = turn.0, error = %e, "answer retrieval failed, speaking fallback");
                self.turn = None;
                let fallback = self.config.fallback_utterance.clone();
                out.push(Command::Emit(StateEvent::Answer {
                    text: fallback.clone(),
                    fallback: true,
                }));
                self.speak(fallback, out);
            }
        }
    }

    fn on_timer(&mut self, timer: TimerId, out: &mut Vec<Command>) {
        let purpose = match self.timer {
            Some((pending, purpose)) if pending == timer => purpose,
            _ => {
                debug!(timer = timer.0, "ignoring stale timer");
                return;
            }
        };
        self.timer = None;

        match purpose {
            TimerPurpose::RestartCapture => {
                if self.mode.is_listening() && self.session.is_none() {
                    debug!(mode = %self.mode, "restarting capture");
                    self.start_capture(out);
                } else {
                    debug!(mode = %self.mode, "restart no longer needed");
                }
            }
            TimerPurpose::PromptSettle => {
                if self.mode == Mode::Prompting {
                    self.enter_listening(Mode::QuestionListening, out);
                }
            }
            TimerPurpose::ResumeWake => {
                if self.mode == Mode::Answering {
                    self.enter_listening(Mode::WakeListening, out);
                }
            }
        }
    }

    /// Enter a listening mode and run its entry action
    fn enter_listening(&mut self, mode: Mode, out: &mut Vec<Command>) {
        self.set_mode(mode, out);
        self.start_capture(out);
    }

    fn start_capture(&mut self, out: &mut Vec<Command>) {
        // A new session always follows the stop of the previous one
        self.stop_capture(out);

        self.last_generation += 1;
        let generation = Generation(self.last_generation);
        self.session = Some(generation);
        out.push(Command::StartCapture(generation));
    }

    fn stop_capture(&mut self, out: &mut Vec<Command>) {
        if let Some(generation) = self.session.take() {
            out.push(Command::StopCapture(generation));
        }
    }

    fn speak(&mut self, text: String, out: &mut Vec<Command>) {
        if self.speaking.take().is_some() {
            out.push(Command::CancelSpeech);
        }

        self.last_utterance += 1;
        let utterance = UtteranceId(self.last_utterance);
        self.speaking = Some(utterance);
        out.push(Command::Speak { utterance, text });
    }

    /// Schedule a timer, replacing any pending one
    fn schedule(&mut self, purpose: TimerPurpose, delay: Duration, out: &mut Vec<Command>) {
        self.cancel_timer(out);

        self.last_timer += 1;
        let timer = TimerId(self.last_timer);
        self.timer = Some((timer, purpose));
        out.push(Command::Schedule { timer, delay });
    }

    fn cancel_timer(&mut self, out: &mut Vec<Command>) {
        if let Some((timer, _)) = self.timer.take() {
            out.push(Command::CancelTimer(timer));
        }
    }

    /// Perform a mode transition
    fn set_mode(&mut self, next: Mode, out: &mut Vec<Command>) {
        let from = self.mode;
        if from == next {
            return;
        }
        debug_assert!(from.can_transition_to(next), "illegal transition {from} -> {next}");

        info!(from = %from, to = %next, "mode transition");
        self.mode = next;
        out.push(Command::Emit(StateEvent::ModeChanged { from, to: next }));
    }
}

#[cfg(test)]
impl Machine {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Generation of the active capture session
    pub fn active_session(&self) -> Option<Generation> {
        self.session
    }

    /// Utterance currently in flight
    pub fn speaking(&self) -> Option<UtteranceId> {
        self.speaking
    }

    pub fn turn(&self) -> Option<&ConversationTurn> {
        self.turn.as_ref()
    }

    /// Timer the machine is waiting on
    pub fn pending_timer(&self) -> Option<TimerId> {
        self.timer.map(|(id, _)| id)
    }
}
