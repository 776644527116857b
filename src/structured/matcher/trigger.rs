//! Trigger detection for lazy grammars.

use aho_corasick::{AhoCorasick, MatchKind};
use anyhow::{Context, Result};
use fancy_regex::Regex;
use rustc_hash::FxHashMap;

use crate::structured::grammar::GrammarTrigger;

/// Compiled form of a grammar's triggers.
pub(crate) struct TriggerScanner {
    words: Option<AhoCorasick>,
    patterns: Vec<Regex>,
    full_patterns: Vec<Regex>,
    tokens: FxHashMap<u32, String>,
}

impl TriggerScanner {
    pub(crate) fn new(triggers: &[GrammarTrigger]) -> Result<Self> {
        let mut words = Vec::new();
        let mut patterns = Vec::new();
        let mut full_patterns = Vec::new();
        let mut tokens = FxHashMap::default();

        for trigger in triggers {
            match trigger {
                GrammarTrigger::Word(w) => words.push(w.as_str()),
                GrammarTrigger::Pattern(p) => patterns.push(
                    Regex::new(p).with_context(|| format!("invalid trigger pattern: {}", p))?,
                ),
                GrammarTrigger::PatternFull(p) => full_patterns.push(
                    Regex::new(&format!("^(?:{})$", p))
                        .with_context(|| format!("invalid full trigger pattern: {}", p))?,
                ),
                GrammarTrigger::Token { token, text } => {
                    tokens.insert(*token, text.clone());
                }
            }
        }

        let words = if words.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .match_kind(MatchKind::LeftmostFirst)
                    .build(&words)
                    .context("failed to build trigger word matcher")?,
            )
        };

        Ok(Self {
            words,
            patterns,
            full_patterns,
            tokens,
        })
    }

    /// Text to feed when `token` fires a token trigger.
    pub(crate) fn token_trigger(&self, token: u32) -> Option<&str> {
        self.tokens.get(&token).map(String::as_str)
    }

    pub(crate) fn tokens(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.tokens.iter().map(|(&id, text)| (id, text.as_str()))
    }

    /// Earliest activation offset in `text`, if any trigger matches.
    pub(crate) fn scan(&self, text: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut consider = |start: usize| {
            best = Some(best.map_or(start, |b: usize| b.min(start)));
        };

        if let Some(m) = self.words.as_ref().and_then(|ac| ac.find(text)) {
            consider(m.start());
        }
        for re in self.patterns.iter().chain(&self.full_patterns) {
            match re.captures(text) {
                Ok(Some(caps)) => {
                    let start = caps.get(1).or_else(|| caps.get(0)).map_or(0, |m| m.start());
                    consider(start);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("trigger pattern {} failed: {}", re.as_str(), e),
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_trigger_starts_at_match() {
        let s = TriggerScanner::new(&[GrammarTrigger::Word("<tool_call>".into())]).unwrap();
        assert_eq!(s.scan("hello <tool_call>{"), Some(6));
        assert_eq!(s.scan("hello <tool_"), None);
    }

    #[test]
    fn test_pattern_trigger_uses_first_group() {
        let s = TriggerScanner::new(&[GrammarTrigger::Pattern(r"\s*(<function=)".into())]).unwrap();
        assert_eq!(s.scan("ok  <function=x>"), Some(4));
    }

    #[test]
    fn test_full_pattern_must_cover_text() {
        let s = TriggerScanner::new(&[GrammarTrigger::PatternFull(r"(?s)\s*(\{.*)".into())]).unwrap();
        assert_eq!(s.scan("  {\"a\""), Some(2));
        assert_eq!(s.scan("x {\"a\""), None);
    }

    #[test]
    fn test_earliest_trigger_wins() {
        let s = TriggerScanner::new(&[
            GrammarTrigger::Word("<b>".into()),
            GrammarTrigger::Pattern("(<a>)".into()),
        ])
        .unwrap();
        assert_eq!(s.scan("..<a>..<b>"), Some(2));
    }

    #[test]
    fn test_token_trigger_and_invalid_pattern() {
        let s = TriggerScanner::new(&[GrammarTrigger::Token { token: 7, text: "<x>".into() }]).unwrap();
        assert_eq!(s.token_trigger(7), Some("<x>"));
        assert_eq!(s.token_trigger(8), None);
        assert!(TriggerScanner::new(&[GrammarTrigger::Pattern("(".into())]).is_err());
    }
}
