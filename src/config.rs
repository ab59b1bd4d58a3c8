//! Configuration loading and management
//!
//! Everything comes from environment variables with defaults; there are no
//! command line flags.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::answer::AnswerConfig;
use crate::state::MachineConfig;
use crate::wake::WakeConfig;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// State machine timings and utterances
    pub machine: MachineConfig,

    pub wake: WakeConfig,

    pub answer: AnswerConfig,

    /// How long a capture session waits for speech before giving up
    pub no_speech_timeout: Duration,

    /// Text-to-speech command line; `None` prints utterances instead
    pub speech_command: Option<String>,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = match lookup("YOHI_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = lookup("HOME").context("HOME is not set")?;
                PathBuf::from(home).join(".local").join("share").join("yohi")
            }
        };

        let socket_path = lookup("YOHI_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("daemon.sock"));

        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .with_context(|| format!("{key} must be a number of milliseconds, got {raw:?}")),
                None => Ok(default),
            }
        };

        let defaults = MachineConfig::default();
        let machine = MachineConfig {
            settle_delay: millis("YOHI_SETTLE_MS", defaults.settle_delay)?,
            no_speech_restart_delay: millis(
                "YOHI_NO_SPEECH_RESTART_MS",
                defaults.no_speech_restart_delay,
            )?,
            aborted_restart_delay: millis("YOHI_ABORT_RESTART_MS", defaults.aborted_restart_delay)?,
            ended_restart_delay: millis("YOHI_END_RESTART_MS", defaults.ended_restart_delay)?,
            fatal_restart_delay: millis("YOHI_FATAL_RESTART_MS", defaults.fatal_restart_delay)?,
            min_question_chars: match lookup("YOHI_MIN_QUESTION_CHARS") {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("YOHI_MIN_QUESTION_CHARS must be a number, got {raw:?}"))?,
                None => defaults.min_question_chars,
            },
            auto_start: match lookup("YOHI_AUTO_START") {
                Some(raw) => parse_bool(&raw)
                    .with_context(|| format!("YOHI_AUTO_START must be true or false, got {raw:?}"))?,
                None => defaults.auto_start,
            },
            ..defaults
        };

        let wake_defaults = WakeConfig::default();
        let wake = WakeConfig {
            wake_word: lookup("YOHI_WAKE_WORD").unwrap_or(wake_defaults.wake_word),
            variants: lookup("YOHI_WAKE_VARIANTS")
                .map(|raw| parse_list(&raw))
                .unwrap_or(wake_defaults.variants),
            prefix: lookup("YOHI_WAKE_PREFIX").unwrap_or(wake_defaults.prefix),
        };

        let answer_defaults = AnswerConfig::default();
        let answer = AnswerConfig {
            endpoint: lookup("YOHI_API_URL").unwrap_or(answer_defaults.endpoint),
            api_key: lookup("OPENROUTER_API_KEY").filter(|key| !key.trim().is_empty()),
            model: lookup("YOHI_MODEL").unwrap_or(answer_defaults.model),
            system_prompt: lookup("YOHI_SYSTEM_PROMPT").unwrap_or(answer_defaults.system_prompt),
            timeout: millis("YOHI_REQUEST_TIMEOUT_MS", answer_defaults.timeout)?,
            ..answer_defaults
        };

        let no_speech_timeout = millis("YOHI_NO_SPEECH_TIMEOUT_MS", Duration::from_secs(8))?;

        let speech_command = match lookup("YOHI_SPEECH_COMMAND") {
            Some(command) if command.trim().is_empty() => None,
            Some(command) => Some(command),
            None => Some(default_speech_command().to_string()),
        };

        Ok(Self {
            socket_path,
            data_dir,
            machine,
            wake,
            answer,
            no_speech_timeout,
            speech_command,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        Ok(())
    }
}

fn default_speech_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "say"
    } else {
        "espeak"
    }
}

/// Split a comma separated list, dropping empty entries
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
