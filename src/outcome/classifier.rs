//! Response classification.
//!
//! Maps a completed HTTP exchange onto an [`OutcomeKind`]. Explicit status
//! codes win over body sniffing, and CAPTCHA phrases win over generic
//! blocking phrases.
//!
//! Body sniffing is a plain phrase heuristic. A page that legitimately talks
//! about CAPTCHAs (a paper on CAPTCHA research, say) will be reported as
//! `CaptchaRequired`, and non-English challenge pages are missed unless the
//! indicator lists are extended through [`ClassifierConfig`].

use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

use super::types::OutcomeKind;

const DEFAULT_CAPTCHA_INDICATORS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "security check",
    "verify you are human",
    "unusual traffic",
    "suspicious activity",
];

const DEFAULT_BLOCKING_INDICATORS: &[&str] = &[
    "access denied",
    "blocked",
    "banned",
    "too many requests",
    "rate limit",
];

const DEFAULT_CONTENT_MARKERS: &[&str] = &["search-results"];

/// Phrase lists driving body classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub captcha_indicators: Vec<String>,
    pub blocking_indicators: Vec<String>,
    /// Markers of a genuine results page. When present, blocking phrases are
    /// not sniffed (CAPTCHA phrases still are).
    pub content_markers: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            captcha_indicators: to_owned_list(DEFAULT_CAPTCHA_INDICATORS),
            blocking_indicators: to_owned_list(DEFAULT_BLOCKING_INDICATORS),
            content_markers: to_owned_list(DEFAULT_CONTENT_MARKERS),
        }
    }
}

fn to_owned_list(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Compiled phrase matcher.
#[derive(Debug, Clone)]
struct PhraseSet {
    phrases: Vec<String>,
    set: RegexSet,
}

impl PhraseSet {
    fn build(phrases: &[String]) -> Result<Self, regex::Error> {
        let phrases: Vec<String> = phrases
            .iter()
            .map(|phrase| phrase.trim().to_string())
            .filter(|phrase| !phrase.is_empty())
            .collect();
        let set = RegexSetBuilder::new(phrases.iter().map(|phrase| regex::escape(phrase)))
            .case_insensitive(true)
            .build()?;
        Ok(Self { phrases, set })
    }

    fn first_match(&self, body: &str) -> Option<&str> {
        self.set
            .matches(body)
            .iter()
            .next()
            .map(|index| self.phrases[index].as_str())
    }
}

/// Stateless classifier over status codes and body text.
#[derive(Debug, Clone)]
pub struct OutcomeClassifier {
    captcha: PhraseSet,
    blocking: PhraseSet,
    content: PhraseSet,
}

impl OutcomeClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            captcha: PhraseSet::build(&config.captcha_indicators)?,
            blocking: PhraseSet::build(&config.blocking_indicators)?,
            content: PhraseSet::build(&config.content_markers)?,
        })
    }

    pub fn classify(&self, status: u16, body: &str) -> OutcomeKind {
        match status {
            429 => return OutcomeKind::RateLimited,
            403 => return OutcomeKind::Blocked,
            s if s >= 400 => return OutcomeKind::NetworkError,
            _ => {}
        }

        if self.captcha.first_match(body).is_some() {
            return OutcomeKind::CaptchaRequired;
        }

        if self.content.first_match(body).is_none() && self.blocking.first_match(body).is_some() {
            return OutcomeKind::Blocked;
        }

        OutcomeKind::Success
    }

    /// The indicator phrase responsible for a body-based classification.
    pub fn matched_indicator<'a>(&'a self, body: &str) -> Option<&'a str> {
        if let Some(phrase) = self.captcha.first_match(body) {
            return Some(phrase);
        }
        if self.content.first_match(body).is_some() {
            return None;
        }
        self.blocking.first_match(body)
    }
}

impl Default for OutcomeClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default()).expect("default indicator phrases are valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> OutcomeClassifier {
        OutcomeClassifier::default()
    }

    #[test]
    fn status_code_beats_captcha_body() {
        let kind = classifier().classify(429, "<html>please solve this captcha</html>");
        assert_eq!(kind, OutcomeKind::RateLimited);
    }

    #[test]
    fn forbidden_is_blocked_and_other_errors_are_network_errors() {
        let c = classifier();
        assert_eq!(c.classify(403, ""), OutcomeKind::Blocked);
        assert_eq!(c.classify(404, "not found"), OutcomeKind::NetworkError);
        assert_eq!(c.classify(500, "captcha"), OutcomeKind::NetworkError);
    }

    #[test]
    fn captcha_phrases_are_case_insensitive_and_beat_blocking() {
        let c = classifier();
        assert_eq!(
            c.classify(200, "Our systems have detected Unusual Traffic. Access denied."),
            OutcomeKind::CaptchaRequired
        );
        assert_eq!(
            c.classify(200, "<div class=\"g-recaptcha\"></div>"),
            OutcomeKind::CaptchaRequired
        );
    }

    #[test]
    fn blocking_phrase_without_results_marker_is_blocked() {
        assert_eq!(
            classifier().classify(200, "<h1>Access Denied</h1>"),
            OutcomeKind::Blocked
        );
    }

    #[test]
    fn results_page_mentioning_blocked_is_success() {
        let body = "<div class='search-results'>...blocked text in an article title...</div>";
        assert_eq!(classifier().classify(200, body), OutcomeKind::Success);
        assert_eq!(classifier().matched_indicator(body), None);
    }

    #[test]
    fn paper_about_captcha_research_is_a_known_false_positive() {
        let body = "<div class='search-results'><h3>Breaking CAPTCHA schemes with deep learning</h3></div>";
        assert_eq!(classifier().classify(200, body), OutcomeKind::CaptchaRequired);
        assert_eq!(classifier().matched_indicator(body), Some("captcha"));
    }

    #[test]
    fn indicator_lists_are_configurable() {
        let config = ClassifierConfig {
            captcha_indicators: vec!["ungewöhnlichen datenverkehr".into()],
            blocking_indicators: vec![],
            content_markers: vec![],
        };
        let c = OutcomeClassifier::new(&config).unwrap();
        assert_eq!(
            c.classify(200, "Wir haben ungewöhnlichen Datenverkehr festgestellt"),
            OutcomeKind::CaptchaRequired
        );
        assert_eq!(c.classify(200, "captcha"), OutcomeKind::Success);
    }

    #[test]
    fn plain_page_is_success() {
        assert_eq!(classifier().classify(200, "<p>hello</p>"), OutcomeKind::Success);
        assert_eq!(classifier().classify(302, ""), OutcomeKind::Success);
    }
}
