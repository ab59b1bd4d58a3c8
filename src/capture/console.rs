//! Console-backed capture source
//!
//! Stands in for a speech recognizer: every non-empty line on standard input
//! is heard as one final transcript. A session that hears nothing for the
//! no-speech timeout reports `no-speech` and ends, and `stop()` reports
//! `Ended` asynchronously the way platform recognizers do. Once the input
//! stream is closed, microphone access is reported as denied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CaptureError, CaptureErrorKind, CaptureEvent, CaptureSource, Generation, TranscriptEvent};
use crate::permission::{MicrophoneAccess, PermissionError};
use crate::state::Input;

/// Capture source reading transcripts from a line stream
pub struct ConsoleCapture {
    inputs: mpsc::Sender<Input>,
    lines: Arc<Mutex<mpsc::Receiver<String>>>,
    /// Cleared once the line stream has ended
    input_open: Arc<AtomicBool>,
    no_speech_timeout: Duration,
    session: Option<(Generation, JoinHandle<()>)>,
}

impl ConsoleCapture {
    /// Create a capture source fed by standard input
    pub fn new(inputs: mpsc::Sender<Input>, no_speech_timeout: Duration) -> Self {
        let (line_tx, line_rx) = mpsc::channel(32);
        tokio::spawn(read_stdin(line_tx));
        Self::from_lines(inputs, line_rx, no_speech_timeout)
    }

    /// Create a capture source fed by an arbitrary line channel
    pub fn from_lines(
        inputs: mpsc::Sender<Input>,
        lines: mpsc::Receiver<String>,
        no_speech_timeout: Duration,
    ) -> Self {
        Self {
            inputs,
            lines: Arc::new(Mutex::new(lines)),
            input_open: Arc::new(AtomicBool::new(true)),
            no_speech_timeout,
            session: None,
        }
    }

    /// Permission hook tied to this source's input stream
    pub fn access(&self) -> ConsoleAccess {
        ConsoleAccess {
            input_open: Arc::clone(&self.input_open),
        }
    }
}

impl CaptureSource for ConsoleCapture {
    fn start(&mut self, generation: Generation) -> Result<(), CaptureError> {
        if let Some((active, task)) = &self.session {
            if !task.is_finished() {
                return Err(CaptureError::AlreadyActive(*active));
            }
        }

        debug!(%generation, "console capture session starting");
        let task = tokio::spawn(run_session(
            generation,
            self.inputs.clone(),
            Arc::clone(&self.lines),
            Arc::clone(&self.input_open),
            self.no_speech_timeout,
        ));
        self.session = Some((generation, task));
        Ok(())
    }

    fn stop(&mut self, generation: Generation) {
        match self.session.take() {
            Some((active, task)) if active == generation => {
                task.abort();
                debug!(%generation, "console capture session stopped");

                let inputs = self.inputs.clone();
                tokio::spawn(async move {
                    post(&inputs, generation, CaptureEvent::Ended).await;
                });
            }
            Some(other) => {
                debug!(%generation, active = %other.0, "stop ignored for inactive session");
                self.session = Some(other);
            }
            None => {}
        }
    }
}

/// Grants access while console input is still readable
pub struct ConsoleAccess {
    input_open: Arc<AtomicBool>,
}

#[async_trait]
impl MicrophoneAccess for ConsoleAccess {
    async fn request(&self) -> Result<(), PermissionError> {
        if self.input_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PermissionError::Denied("console input is closed".to_string()))
        }
    }
}

async fn read_stdin(line_tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line_tx.send(line.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("console input closed");
                break;
            }
            Err(e) => {
                warn!(?e, "failed to read console input");
                break;
            }
        }
    }
}

/// One continuous recognition session
async fn run_session(
    generation: Generation,
    inputs: mpsc::Sender<Input>,
    lines: Arc<Mutex<mpsc::Receiver<String>>>,
    input_open: Arc<AtomicBool>,
    no_speech_timeout: Duration,
) {
    if !post(&inputs, generation, CaptureEvent::Started).await {
        return;
    }

    loop {
        let next = {
            let mut lines = lines.lock().await;
            tokio::time::timeout(no_speech_timeout, lines.recv()).await
        };

        match next {
            Ok(Some(line)) => {
                let event = CaptureEvent::Transcript(TranscriptEvent::final_text(line));
                if !post(&inputs, generation, event).await {
                    return;
                }
            }
            Ok(None) => {
                // Input is gone for good; behave like a silent room
                input_open.store(false, Ordering::SeqCst);
                tokio::time::sleep(no_speech_timeout).await;
                post(&inputs, generation, CaptureEvent::Error(CaptureErrorKind::NoSpeech)).await;
                break;
            }
            Err(_) => {
                post(&inputs, generation, CaptureEvent::Error(CaptureErrorKind::NoSpeech)).await;
                break;
            }
        }
    }

    post(&inputs, generation, CaptureEvent::Ended).await;
}

async fn post(inputs: &mpsc::Sender<Input>, generation: Generation, event: CaptureEvent) -> bool {
    inputs
        .send(Input::Capture { generation, event })
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_capture(rx: &mut mpsc::Receiver<Input>) -> (Generation, CaptureEvent) {
        let input = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for capture event")
            .expect("input channel closed");
        match input {
            Input::Capture { generation, event } => (generation, event),
            other => panic!("unexpected input: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lines_become_final_transcripts() {
        let (input_tx, mut input_rx) = mpsc::channel(16);
        let (line_tx, line_rx) = mpsc::channel(16);
        let mut capture = ConsoleCapture::from_lines(input_tx, line_rx, Duration::from_secs(5));

        capture.start(Generation(1)).unwrap();
        assert_eq!(next_capture(&mut input_rx).await, (Generation(1), CaptureEvent::Started));

        line_tx.send("yo".to_string()).await.unwrap();
        let (generation, event) = next_capture(&mut input_rx).await;
        assert_eq!(generation, Generation(1));
        assert_eq!(event, CaptureEvent::Transcript(TranscriptEvent::final_text("yo")));
    }

    #[tokio::test]
    async fn test_silence_reports_no_speech_then_ends() {
        let (input_tx, mut input_rx) = mpsc::channel(16);
        let (_line_tx, line_rx) = mpsc::channel::<String>(16);
        let mut capture = ConsoleCapture::from_lines(input_tx, line_rx, Duration::from_millis(20));

        capture.start(Generation(3)).unwrap();
        assert_eq!(next_capture(&mut input_rx).await.1, CaptureEvent::Started);
        assert_eq!(
            next_capture(&mut input_rx).await,
            (Generation(3), CaptureEvent::Error(CaptureErrorKind::NoSpeech))
        );
        assert_eq!(next_capture(&mut input_rx).await, (Generation(3), CaptureEvent::Ended));
    }

    #[tokio::test]
    async fn test_stop_posts_ended_for_that_generation() {
        let (input_tx, mut input_rx) = mpsc::channel(16);
        let (_line_tx, line_rx) = mpsc::channel::<String>(16);
        let mut capture = ConsoleCapture::from_lines(input_tx, line_rx, Duration::from_secs(5));

        capture.start(Generation(7)).unwrap();
        assert_eq!(next_capture(&mut input_rx).await.1, CaptureEvent::Started);

        capture.stop(Generation(7));
        assert_eq!(next_capture(&mut input_rx).await, (Generation(7), CaptureEvent::Ended));
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let (input_tx, _input_rx) = mpsc::channel(16);
        let (_line_tx, line_rx) = mpsc::channel::<String>(16);
        let mut capture = ConsoleCapture::from_lines(input_tx, line_rx, Duration::from_secs(5));

        capture.start(Generation(1)).unwrap();
        let err = capture.start(Generation(2)).unwrap_err();
        assert!(matches!(err, CaptureError::AlreadyActive(Generation(1))));

        capture.stop(Generation(1));
        assert!(capture.start(Generation(2)).is_ok());
    }

    #[tokio::test]
    async fn test_access_denied_after_input_closes() {
        let (input_tx, mut input_rx) = mpsc::channel(16);
        let (line_tx, line_rx) = mpsc::channel::<String>(16);
        let mut capture = ConsoleCapture::from_lines(input_tx, line_rx, Duration::from_millis(20));
        let access = capture.access();

        tokio_test::assert_ok!(access.request().await);

        drop(line_tx);
        capture.start(Generation(1)).unwrap();
        assert_eq!(next_capture(&mut input_rx).await.1, CaptureEvent::Started);
        assert_eq!(
            next_capture(&mut input_rx).await.1,
            CaptureEvent::Error(CaptureErrorKind::NoSpeech)
        );

        let err = tokio_test::assert_err!(access.request().await);
        assert!(matches!(err, PermissionError::Denied(_)));
    }
}
