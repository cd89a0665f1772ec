//! Text signal detection for chat feedback
//!
//! Phrase sets cover English and Russian. Matching is case-insensitive and
//! anchored on word boundaries so "no" does not fire inside "know".

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Signal detected in a feedback message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSignal {
    Positive,
    Negative,
    Brevity,
    Detail,
    Formal,
    Casual,
    Forgetfulness,
}

const POSITIVE_PHRASES: &[&str] = &[
    "thanks",
    "thank you",
    "perfect",
    "exactly",
    "great",
    "awesome",
    "excellent",
    "спасибо",
    "отлично",
    "круто",
    "супер",
    "прекрасно",
];

const NEGATIVE_PHRASES: &[&str] = &[
    "wrong",
    "no",
    "not what",
    "try again",
    "incorrect",
    "нет",
    "не то",
    "неправильно",
    "ошибка",
    "не так",
    "плохо",
];

const BREVITY_PHRASES: &[&str] = &[
    "shorter",
    "brief",
    "too long",
    "verbose",
    "tl;dr",
    "короче",
    "кратко",
    "длинно",
];

const DETAIL_PHRASES: &[&str] = &[
    "more detail",
    "more details",
    "elaborate",
    "too short",
    "explain more",
    "подробнее",
    "коротко",
];

const FORMAL_PHRASES: &[&str] = &["formal", "professional", "официально", "формально"];

const CASUAL_PHRASES: &[&str] = &["casual", "relax", "friendly", "попроще", "неформально"];

const FORGETFULNESS_PHRASES: &[&str] = &[
    "you forgot",
    "forgot",
    "i already told you",
    "already said",
    "remember",
    "забыл",
    "я же говорил",
    "напоминаю",
];

fn phrase_regex(phrases: &[&str]) -> Regex {
    let alternation = phrases
        .iter()
        .map(|p| regex::escape(p))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).expect("Valid phrase regex")
}

static SIGNAL_PATTERNS: Lazy<Vec<(TextSignal, Regex)>> = Lazy::new(|| {
    vec![
        (TextSignal::Positive, phrase_regex(POSITIVE_PHRASES)),
        (TextSignal::Negative, phrase_regex(NEGATIVE_PHRASES)),
        (TextSignal::Brevity, phrase_regex(BREVITY_PHRASES)),
        (TextSignal::Detail, phrase_regex(DETAIL_PHRASES)),
        (TextSignal::Formal, phrase_regex(FORMAL_PHRASES)),
        (TextSignal::Casual, phrase_regex(CASUAL_PHRASES)),
        (TextSignal::Forgetfulness, phrase_regex(FORGETFULNESS_PHRASES)),
    ]
});

/// Detect every signal present in a message, in a stable order
pub fn detect(text: &str) -> Vec<TextSignal> {
    SIGNAL_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(signal, _)| *signal)
        .collect()
}

/// Phrases that matched for a given signal
pub fn matched_phrases(text: &str, signal: TextSignal) -> Vec<String> {
    SIGNAL_PATTERNS
        .iter()
        .filter(|(s, _)| *s == signal)
        .flat_map(|(_, re)| re.find_iter(text).map(|m| m.as_str().to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_english_and_russian() {
        assert_eq!(detect("Thanks, that was perfect"), vec![TextSignal::Positive]);
        assert_eq!(detect("Это неправильно"), vec![TextSignal::Negative]);
        assert!(detect("сделай короче").contains(&TextSignal::Brevity));
    }

    #[test]
    fn test_word_boundaries() {
        assert!(detect("I know the answer").is_empty());
        assert!(detect("no, not that one").contains(&TextSignal::Negative));
    }

    #[test]
    fn test_forgetfulness_and_matches() {
        let text = "You forgot my name again, I already told you";
        assert!(detect(text).contains(&TextSignal::Forgetfulness));
        let phrases = matched_phrases(text, TextSignal::Forgetfulness);
        assert!(phrases.contains(&"you forgot".to_string()));
        assert!(phrases.contains(&"i already told you".to_string()));
    }
}
