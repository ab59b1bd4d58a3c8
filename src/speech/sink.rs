//! Concrete speech sinks

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{SpeechError, SpeechSink};

/// Speaks by running an external text-to-speech program (`say`, `espeak`)
///
/// The utterance is passed as the last argument. Dropping an in-flight
/// `speak` future kills the child process.
pub struct CommandSink {
    program: String,
    args: Vec<String>,
}

impl CommandSink {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build a sink from a shell-style command line such as `"espeak -s 160"`
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// Parse a configured command line, keeping it only if its program is on `PATH`
    pub fn resolve(command: Option<&str>) -> Option<Self> {
        let sink = Self::from_command_line(command?)?;
        if let Err(e) = which::which(&sink.program) {
            warn!(program = %sink.program, error = %e, "speech program not found");
            return None;
        }
        Some(sink)
    }
}

#[async_trait]
impl SpeechSink for CommandSink {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        debug!(program = %self.program, chars = text.len(), "speaking");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SpeechError::Spawn)?;

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(SpeechError::Exit(status.code()))
        }
    }
}

/// Prints utterances to standard output, paced roughly like speech
pub struct ConsoleSink {
    per_word: Duration,
}

impl ConsoleSink {
    pub fn new(per_word: Duration) -> Self {
        Self { per_word }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new(Duration::from_millis(150))
    }
}

#[async_trait]
impl SpeechSink for ConsoleSink {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("assistant: {}\n", text).as_bytes()).await?;
        stdout.flush().await?;

        let words = text.split_whitespace().count() as u32;
        tokio::time::sleep(self.per_word * words).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_parsing() {
        let sink = CommandSink::from_command_line("espeak -s 160").unwrap();
        assert_eq!(sink.program, "espeak");
        assert_eq!(sink.args, vec!["-s", "160"]);

        assert!(CommandSink::from_command_line("   ").is_none());
    }

    #[test]
    fn test_resolve_drops_missing_program() {
        assert!(CommandSink::resolve(None).is_none());
        assert!(CommandSink::resolve(Some("")).is_none());
        assert!(CommandSink::resolve(Some("yohi-definitely-not-a-tts-program -v")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_keeps_installed_program() {
        let sink = CommandSink::resolve(Some("sh -c true")).unwrap();
        assert_eq!(sink.program, "sh");
        assert_eq!(sink.args, vec!["-c", "true"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let sink = CommandSink::new("yohi-definitely-not-a-tts-program", Vec::new());
        let err = sink.speak("hello").await.unwrap_err();
        assert!(matches!(err, SpeechError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_reports_exit_status() {
        let sink = CommandSink::new("false", Vec::new());
        let err = sink.speak("hello").await.unwrap_err();
        assert!(matches!(err, SpeechError::Exit(Some(1))));
    }

    #[tokio::test]
    async fn test_console_sink_completes() {
        let sink = ConsoleSink::new(Duration::from_millis(1));
        tokio_test::assert_ok!(sink.speak("short answer").await);
    }
}
