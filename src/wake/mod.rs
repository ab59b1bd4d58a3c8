//! Wake word matching
//!
//! Decides whether a final transcript contains the wake word. The rule
//! over-accepts near-miss pronunciations on purpose: an exact variant, an
//! elongated form of the wake word, or the wake word as an isolated word
//! anywhere in the text all count as a match.

use serde::{Deserialize, Serialize};

/// Tunable wake word settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeConfig {
    /// The canonical wake word
    pub wake_word: String,
    /// Accepted spellings of the wake word as the recognizer tends to hear it
    pub variants: Vec<String>,
    /// Tokens starting with this prefix match (elongated wake word, "yooo")
    pub prefix: String,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            wake_word: "yo".to_string(),
            variants: ["yo", "yoh", "yow", "yeah", "hey"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            prefix: "yoo".to_string(),
        }
    }
}

/// Matches transcripts against the configured wake word
#[derive(Debug, Clone)]
pub struct WakeMatcher {
    wake_word: String,
    variants: Vec<String>,
    prefix: String,
}

impl WakeMatcher {
    /// Create a matcher, normalizing every configured word to lower case
    pub fn new(config: WakeConfig) -> Self {
        let normalize = |word: &str| letters_only(&word.trim().to_lowercase());

        Self {
            wake_word: normalize(&config.wake_word),
            variants: config
                .variants
                .iter()
                .map(|v| normalize(v))
                .filter(|v| !v.is_empty())
                .collect(),
            prefix: normalize(&config.prefix),
        }
    }

    /// The canonical wake word
    pub fn wake_word(&self) -> &str {
        &self.wake_word
    }

    /// Check whether `text` contains the wake word
    pub fn matches(&self, text: &str) -> bool {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return false;
        }

        let token_match = text.split_whitespace().any(|raw| {
            let token = letters_only(raw);
            !token.is_empty()
                && (self.variants.iter().any(|v| *v == token)
                    || (!self.prefix.is_empty() && token.starts_with(&self.prefix)))
        });

        token_match || self.contains_isolated_wake_word(&text)
    }

    /// Word-boundary search: "yo-yo" contains "yo", "bayou" does not
    fn contains_isolated_wake_word(&self, text: &str) -> bool {
        !self.wake_word.is_empty()
            && text
                .split(|c: char| !c.is_alphabetic())
                .any(|word| word == self.wake_word)
    }
}

impl Default for WakeMatcher {
    fn default() -> Self {
        Self::new(WakeConfig::default())
    }
}

fn letters_only(token: &str) -> String {
    token.chars().filter(|c| c.is_alphabetic()).collect()
}
