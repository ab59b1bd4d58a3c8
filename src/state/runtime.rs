//! Runtime that drives the state machine
//!
//! Owns the single input queue. Every input is fed to the [`Machine`] and
//! the resulting commands are executed against the collaborators.
//! Long-running work (speech, answer requests, delays) runs in tasks that
//! post their completion back onto the queue, so the machine itself only
//! ever sees one input at a time.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::answer::AnswerService;
use crate::capture::{CaptureErrorKind, CaptureEvent, CaptureSource};
use crate::events::StateEvent;
use crate::permission::PermissionGate;
use crate::speech::SpeechCoordinator;

use super::machine::{Command, Input, Machine, TimerId};

/// Executes machine commands against the capture, speech and answer collaborators
pub struct Runtime {
    machine: Machine,
    capture: Box<dyn CaptureSource>,
    speech: SpeechCoordinator,
    answers: Arc<dyn AnswerService>,
    permission: Arc<PermissionGate>,
    /// Sender side of the machine's own queue, for completions
    inputs: mpsc::Sender<Input>,
    events: broadcast::Sender<StateEvent>,
    timers: HashMap<TimerId, AbortHandle>,
}

impl Runtime {
    pub fn new(
        machine: Machine,
        capture: Box<dyn CaptureSource>,
        speech: SpeechCoordinator,
        answers: Arc<dyn AnswerService>,
        permission: Arc<PermissionGate>,
        inputs: mpsc::Sender<Input>,
        events: broadcast::Sender<StateEvent>,
    ) -> Self {
        Self {
            machine,
            capture,
            speech,
            answers,
            permission,
            inputs,
            events,
            timers: HashMap::new(),
        }
    }

    /// Run the interaction loop until the input queue closes
    pub async fn run(&mut self, mut input_rx: mpsc::Receiver<Input>) {
        let boot = self.machine.boot();
        self.execute(boot);

        while let Some(input) = input_rx.recv().await {
            self.dispatch(input);
        }

        info!("interaction loop stopped");
    }

    /// Feed one input to the machine and execute what it asks for
    pub fn dispatch(&mut self, input: Input) {
        if let Input::TimerFired { timer } = &input {
            self.timers.remove(timer);
        }

        let commands = self.machine.handle(input);
        self.execute(commands);
    }

    /// Stop listening and speaking, cancel timers
    pub fn shutdown(&mut self) {
        self.dispatch(Input::Stop);
    }

    fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            debug!(?command, "executing");

            match command {
                Command::RequestPermission => {
                    let permission = Arc::clone(&self.permission);
                    let inputs = self.inputs.clone();
                    tokio::spawn(async move {
                        let granted = permission.acquire().await;
                        let _ = inputs.send(Input::PermissionResolved { granted }).await;
                    });
                }
                Command::StartCapture(generation) => {
                    if let Err(e) = self.capture.start(generation) {
                        warn!(%generation, error = %e, "failed to start capture");
                        self.post(Input::Capture {
                            generation,
                            event: CaptureEvent::Error(CaptureErrorKind::Other(e.to_string())),
                        });
                    }
                }
                Command::StopCapture(generation) => self.capture.stop(generation),
                Command::Speak { utterance, text } => {
                    let playback = self.speech.speak(text);
                    let inputs = self.inputs.clone();
                    tokio::spawn(async move {
                        playback.await;
                        let _ = inputs.send(Input::SpeechFinished { utterance }).await;
                    });
                }
                Command::CancelSpeech => self.speech.cancel_all(),
                Command::Ask { turn, question } => {
                    let answers = Arc::clone(&self.answers);
                    let inputs = self.inputs.clone();
                    tokio::spawn(async move {
                        let outcome = answers.ask(&question).await;
                        let _ = inputs.send(Input::AnswerReady { turn, outcome }).await;
                    });
                }
                Command::Schedule { timer, delay } => {
                    let inputs = self.inputs.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = inputs.send(Input::TimerFired { timer }).await;
                    });
                    self.timers.insert(timer, task.abort_handle());
                }
                Command::CancelTimer(timer) => {
                    if let Some(task) = self.timers.remove(&timer) {
                        task.abort();
                    }
                }
                Command::Emit(event) => {
                    info!(%event, "state event");
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
            }
        }
    }

    /// Queue an input from inside the loop without waiting on the queue
    fn post(&self, input: Input) {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let _ = inputs.send(input).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::answer::AnswerError;
    use crate::capture::{CaptureError, Generation, TranscriptEvent};
    use crate::permission::{MicrophoneAccess, PermissionError};
    use crate::speech::{SpeechError, SpeechSink};
    use crate::state::{MachineConfig, Mode};
    use crate::wake::WakeMatcher;

    #[derive(Debug, Clone, PartialEq)]
    enum CaptureCall {
        Start(Generation),
        Stop(Generation),
    }

    #[derive(Clone, Default)]
    struct FakeCapture {
        calls: Arc<Mutex<Vec<CaptureCall>>>,
    }

    impl FakeCapture {
        fn last_started(&self) -> Option<Generation> {
            self.calls.lock().unwrap().iter().rev().find_map(|c| match c {
                CaptureCall::Start(g) => Some(*g),
                _ => None,
            })
        }

        fn active_count(&self) -> i32 {
            self.calls.lock().unwrap().iter().fold(0, |n, c| match c {
                CaptureCall::Start(_) => n + 1,
                CaptureCall::Stop(_) => n - 1,
            })
        }
    }

    impl CaptureSource for FakeCapture {
        fn start(&mut self, generation: Generation) -> Result<(), CaptureError> {
            self.calls.lock().unwrap().push(CaptureCall::Start(generation));
            Ok(())
        }

        fn stop(&mut self, generation: Generation) {
            self.calls.lock().unwrap().push(CaptureCall::Stop(generation));
        }
    }

    #[derive(Default)]
    struct FakeSink {
        spoken: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SpeechSink for FakeSink {
        async fn speak(&self, text: &str) -> Result<(), SpeechError> {
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Sink that plays utterances containing `endless` until cancelled
    struct StallingSink {
        endless: &'static str,
        spoken: Mutex<Vec<String>>,
        cancelled: Arc<AtomicBool>,
    }

    /// Flags the sink as cancelled when an unfinished utterance is dropped
    struct CancelGuard(Arc<AtomicBool>);

    impl Drop for CancelGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SpeechSink for StallingSink {
        async fn speak(&self, text: &str) -> Result<(), SpeechError> {
            self.spoken.lock().unwrap().push(text.to_string());
            if text.contains(self.endless) {
                let _guard = CancelGuard(Arc::clone(&self.cancelled));
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    struct FakeAnswers {
        questions: Mutex<Vec<String>>,
        reply: Option<String>,
    }

    impl FakeAnswers {
        fn replying(reply: Option<&str>) -> Self {
            Self {
                questions: Mutex::new(Vec::new()),
                reply: reply.map(str::to_string),
            }
        }
    }

    #[async_trait]
    impl AnswerService for FakeAnswers {
        async fn ask(&self, question: &str) -> Result<String, AnswerError> {
            self.questions.lock().unwrap().push(question.to_string());
            self.reply.clone().ok_or(AnswerError::Status(500))
        }
    }

    struct Granted;

    #[async_trait]
    impl MicrophoneAccess for Granted {
        async fn request(&self) -> Result<(), PermissionError> {
            Ok(())
        }
    }

    fn fast_config() -> MachineConfig {
        MachineConfig {
            settle_delay: Duration::from_millis(5),
            no_speech_restart_delay: Duration::from_millis(5),
            aborted_restart_delay: Duration::from_millis(5),
            ended_restart_delay: Duration::from_millis(5),
            fatal_restart_delay: Duration::from_millis(5),
            ..MachineConfig::default()
        }
    }

    struct Harness {
        inputs: mpsc::Sender<Input>,
        events: broadcast::Receiver<StateEvent>,
        capture: FakeCapture,
    }

    fn spawn_runtime(sink: Arc<dyn SpeechSink>, answers: Arc<dyn AnswerService>) -> Harness {
        let (input_tx, input_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = broadcast::channel(256);
        let capture = FakeCapture::default();

        let mut runtime = Runtime::new(
            Machine::new(fast_config(), WakeMatcher::default()),
            Box::new(capture.clone()),
            SpeechCoordinator::new(sink),
            answers,
            Arc::new(PermissionGate::new(Arc::new(Granted))),
            input_tx.clone(),
            event_tx,
        );

        tokio::spawn(async move {
            runtime.run(input_rx).await;
        });

        Harness {
            inputs: input_tx,
            events: event_rx,
            capture,
        }
    }

    impl Harness {
        async fn wait_for_mode(&mut self, mode: Mode) {
            let wait = async {
                loop {
                    match self.events.recv().await {
                        Ok(StateEvent::ModeChanged { to, .. }) if to == mode => return,
                        Ok(_) => {}
                        Err(e) => panic!("event stream failed: {e}"),
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(2), wait)
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {mode}"));
        }

        /// Generation of the session the runtime most recently started
        async fn active_session(&self) -> Generation {
            let wait = async {
                loop {
                    let last = self.capture.calls.lock().unwrap().last().cloned();
                    if let Some(CaptureCall::Start(generation)) = last {
                        return generation;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            };
            tokio::time::timeout(Duration::from_secs(2), wait)
                .await
                .expect("capture was not started")
        }

        async fn say(&self, text: &str) {
            let generation = self.active_session().await;
            self.inputs
                .send(Input::Capture {
                    generation,
                    event: CaptureEvent::Transcript(TranscriptEvent::final_text(text)),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_full_turn_answers_and_returns_to_wake_listening() {
        let sink = Arc::new(FakeSink::default());
        let answers = Arc::new(FakeAnswers::replying(Some("It is noon.")));
        let mut harness = spawn_runtime(sink.clone(), answers.clone());

        harness.wait_for_mode(Mode::WakeListening).await;
        harness.say("hey").await;
        harness.wait_for_mode(Mode::QuestionListening).await;
        harness.say("what time is it").await;
        harness.wait_for_mode(Mode::Answering).await;
        harness.wait_for_mode(Mode::WakeListening).await;
        harness.active_session().await;

        assert_eq!(*answers.questions.lock().unwrap(), vec!["what time is it"]);
        assert_eq!(
            *sink.spoken.lock().unwrap(),
            vec!["Hi! What do you want?", "It is noon."]
        );
        assert_eq!(harness.capture.active_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_answer_speaks_fallback_and_recovers() {
        let sink = Arc::new(FakeSink::default());
        let answers = Arc::new(FakeAnswers::replying(None));
        let mut harness = spawn_runtime(sink.clone(), answers.clone());

        harness.wait_for_mode(Mode::WakeListening).await;
        harness.say("yo").await;
        harness.wait_for_mode(Mode::QuestionListening).await;
        harness.say("what time is it").await;
        harness.wait_for_mode(Mode::WakeListening).await;

        assert_eq!(answers.questions.lock().unwrap().len(), 1);
        let spoken = sink.spoken.lock().unwrap();
        let fallbacks = spoken
            .iter()
            .filter(|s| s.as_str() == "Sorry, I had trouble connecting to my brain.")
            .count();
        assert_eq!(fallbacks, 1);
    }

    #[tokio::test]
    async fn test_no_speech_restarts_with_new_generation() {
        let sink = Arc::new(FakeSink::default());
        let answers = Arc::new(FakeAnswers::replying(Some("ok")));
        let mut harness = spawn_runtime(sink, answers);

        harness.wait_for_mode(Mode::WakeListening).await;
        let first = harness.active_session().await;
        harness
            .inputs
            .send(Input::Capture {
                generation: first,
                event: CaptureEvent::Error(CaptureErrorKind::NoSpeech),
            })
            .await
            .unwrap();

        let restarted = async {
            loop {
                match harness.capture.last_started() {
                    Some(generation) if generation != first => return generation,
                    _ => tokio::time::sleep(Duration::from_millis(1)).await,
                }
            }
        };
        let second = tokio::time::timeout(Duration::from_secs(2), restarted)
            .await
            .expect("capture was not restarted");
        assert!(second > first);
        assert_eq!(harness.capture.active_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_while_answering_cancels_everything() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(StallingSink {
            endless: "story",
            spoken: Mutex::new(Vec::new()),
            cancelled: Arc::clone(&cancelled),
        });
        let answers = Arc::new(FakeAnswers::replying(Some("a long story")));
        let mut harness = spawn_runtime(sink.clone(), answers);

        harness.wait_for_mode(Mode::WakeListening).await;
        harness.say("hey").await;
        harness.wait_for_mode(Mode::QuestionListening).await;
        harness.say("tell me something").await;
        harness.wait_for_mode(Mode::Answering).await;

        // Wait until the answer is playing
        let playing = async {
            while sink.spoken.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), playing)
            .await
            .expect("answer never played");

        harness.inputs.send(Input::Stop).await.unwrap();
        harness.wait_for_mode(Mode::Stopped).await;
        harness.inputs.send(Input::Stop).await.unwrap();

        // Long enough for any leftover restart timer to fire
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cancelled.load(Ordering::SeqCst), "answer playback was not cancelled");
        assert_eq!(harness.capture.active_count(), 0);
        while let Ok(event) = harness.events.try_recv() {
            assert!(
                !matches!(event, StateEvent::ModeChanged { .. }),
                "unexpected transition after stop: {event}"
            );
        }
    }
}
